//! Workflow model
//!
//! Shared types for a modlist workflow run: the workflow kinds, the
//! persistable run context, game-type inference from the modlist name,
//! and the per-phase elapsed timers.

mod orchestrator;
mod safety;

pub use orchestrator::{
    start_workflow, OrchestratorDeps, SteamControl, WorkflowCanceller, WorkflowEvent,
    WorkflowHandle, WorkflowProgressEvent, WorkflowResult, WorkflowState, WorkflowStatus,
};
pub use safety::{validate, validate_path, validate_with_override, InstallMarker, MARKER_FILE};

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// What the run is meant to accomplish.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowKind {
    /// Full pipeline: engine install, then configure and shortcut.
    InstallModlist,
    /// Configure and shortcut a list that was just installed elsewhere.
    ConfigureNew,
    /// Re-configure a list already on disk (includes path rewriting).
    ConfigureExisting,
    /// Install with automated post-install configuration.
    GuidedAuto,
}

impl WorkflowKind {
    /// Whether this kind drives the install engine.
    pub fn runs_engine(self) -> bool {
        matches!(self, WorkflowKind::InstallModlist | WorkflowKind::GuidedAuto)
    }
}

/// Game family a modlist targets, inferred from its name when the caller
/// does not say. Drives the engine's game filter and the shortcut name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameKind {
    SkyrimSE,
    Skyrim,
    Fallout4,
    FalloutNV,
    Oblivion,
    Starfield,
    Enderal,
}

impl GameKind {
    /// Keyword match over the modlist name, most specific first.
    pub fn infer_from_name(name: &str) -> Option<GameKind> {
        let lower = name.to_lowercase();
        let table: [(&[&str], GameKind); 7] = [
            (&["enderal"], GameKind::Enderal),
            (&["skyrim se", "skyrimse", "sse", "anniversary"], GameKind::SkyrimSE),
            (&["skyrim"], GameKind::Skyrim),
            (&["fallout 4", "fallout4", "fo4"], GameKind::Fallout4),
            (&["new vegas", "fnv", "falloutnv"], GameKind::FalloutNV),
            (&["oblivion"], GameKind::Oblivion),
            (&["starfield"], GameKind::Starfield),
        ];
        for (keywords, kind) in table {
            if keywords.iter().any(|k| lower.contains(k)) {
                return Some(kind);
            }
        }
        None
    }

    /// Value passed to the engine's game filter flag.
    pub fn engine_flag(self) -> &'static str {
        match self {
            GameKind::SkyrimSE => "skyrimse",
            GameKind::Skyrim => "skyrim",
            GameKind::Fallout4 => "fallout4",
            GameKind::FalloutNV => "falloutnv",
            GameKind::Oblivion => "oblivion",
            GameKind::Starfield => "starfield",
            GameKind::Enderal => "enderal",
        }
    }
}

/// Everything the caller supplies to start a run.
#[derive(Clone, Debug)]
pub struct WorkflowRequest {
    pub kind: WorkflowKind,
    pub modlist_name: String,
    pub game: Option<GameKind>,
    pub install_dir: PathBuf,
    pub download_dir: PathBuf,
    /// Reuse an install directory even if its marker is incompatible.
    /// Never bypasses the deny-list.
    pub force_reuse: bool,
}

impl WorkflowRequest {
    pub fn game_kind(&self) -> Option<GameKind> {
        self.game.or_else(|| GameKind::infer_from_name(&self.modlist_name))
    }
}

/// Run state persisted at suspend points so a workflow can resume after
/// the user places manual downloads, without redoing finished phases.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub kind: WorkflowKind,
    pub modlist_name: String,
    pub game: Option<GameKind>,
    pub install_dir: PathBuf,
    pub download_dir: PathBuf,
    /// True once the engine has written final paths into the install,
    /// which makes configure-time path rewriting redundant.
    pub engine_installed: bool,
}

impl WorkflowContext {
    pub fn from_request(request: &WorkflowRequest) -> Self {
        Self {
            kind: request.kind,
            modlist_name: request.modlist_name.clone(),
            game: request.game_kind(),
            install_dir: request.install_dir.clone(),
            download_dir: request.download_dir.clone(),
            engine_installed: false,
        }
    }
}

/// Elapsed timer for one phase. Reset at phase entry so a long install
/// never inflates the reported configure duration.
pub struct PhaseTimer {
    started: Instant,
}

impl PhaseTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        self.started = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn game_inference_prefers_specific_keywords() {
        assert_eq!(
            GameKind::infer_from_name("Lost Legacy (Skyrim SE)"),
            Some(GameKind::SkyrimSE)
        );
        assert_eq!(
            GameKind::infer_from_name("Begin Again FNV"),
            Some(GameKind::FalloutNV)
        );
        assert_eq!(
            GameKind::infer_from_name("Enderal Gateway"),
            Some(GameKind::Enderal)
        );
        assert_eq!(GameKind::infer_from_name("Mystery List"), None);
    }

    #[test]
    fn timers_reset_independently() {
        let mut install = PhaseTimer::start();
        std::thread::sleep(Duration::from_millis(20));
        assert!(install.elapsed() >= Duration::from_millis(20));
        install.reset();
        assert!(install.elapsed() < Duration::from_millis(20));
    }
}
