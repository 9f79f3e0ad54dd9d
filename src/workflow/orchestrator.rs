//! Workflow orchestrator
//!
//! One state machine per run. The transition core is a pure function over
//! `(state, event)` returning the next state plus the effects to execute,
//! so the whole machine is testable with synthetic events; a driver thread
//! executes the effects (engine runs, prefix configuration, Steam restart)
//! and streams progress back to the caller.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use regex::Regex;
use walkdir::WalkDir;

use super::safety;
use super::{PhaseTimer, WorkflowContext, WorkflowKind, WorkflowRequest};
use crate::engine::{EngineCommand, EngineEvent, EngineHandle, ManualDownload};
use crate::error::WorkflowError;
use crate::logging::{log_error, log_info, log_warning};
use crate::prefix::{self, PrefixLauncher, PrefixPaths};
use crate::settings::AppSettings;
use crate::steam::{self, ShortcutEntry};

/// How often the driver re-checks the cancellation flag while blocked.
const CANCEL_POLL: Duration = Duration::from_millis(250);

/// Suspended-run context file inside the install directory.
const CONTEXT_FILE: &str = ".modforge_resume.json";

// ============================================================================
// States, events, effects
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkflowState {
    Idle,
    ValidatingInputs,
    Installing,
    Configuring,
    CreatingShortcut,
    RestartingSteam,
    AwaitingManualSteps,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }
}

/// Input to the transition core.
#[derive(Clone, Debug)]
pub enum WorkflowEvent {
    Start,
    InputsValidated,
    Engine(EngineEvent),
    /// Caller signals that manually placed files are now present.
    ManualFilesReady,
    Configured,
    ShortcutCreated,
    /// `None` = restart succeeded, `Some(reason)` = it did not.
    SteamRestarted(Option<String>),
    CancelRequested,
    Fault(String),
}

/// Work the driver performs after a transition.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Effect {
    ValidateInputs,
    RunEngine,
    PersistContext,
    RemoveArtifact(PathBuf),
    ConfigureInstall,
    CreateShortcut,
    RestartSteam,
    Finish(WorkflowStatus, String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkflowStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct WorkflowResult {
    pub status: WorkflowStatus,
    pub detail: String,
}

/// Progress stream delivered to the caller while a run is live.
#[derive(Clone, Debug)]
pub enum WorkflowProgressEvent {
    PhaseChanged(WorkflowState),
    EngineProgress {
        phase: String,
        current: u64,
        total: u64,
        item: String,
    },
    EngineLog(String),
    ManualStepsRequired(Vec<ManualDownload>),
    ArtifactRemoved(PathBuf),
    Info(String),
}

/// The pure transition core. Unknown `(state, event)` pairs are ignored
/// (no state change, no effects); terminal states accept nothing.
fn transition(
    kind: WorkflowKind,
    state: WorkflowState,
    event: &WorkflowEvent,
) -> (WorkflowState, Vec<Effect>) {
    if state.is_terminal() {
        return (state, Vec::new());
    }

    match event {
        WorkflowEvent::CancelRequested => (
            WorkflowState::Cancelled,
            vec![Effect::Finish(
                WorkflowStatus::Cancelled,
                "cancelled by request".to_string(),
            )],
        ),
        WorkflowEvent::Fault(reason) => (
            WorkflowState::Failed,
            vec![Effect::Finish(WorkflowStatus::Failed, reason.clone())],
        ),

        WorkflowEvent::Start if state == WorkflowState::Idle => {
            (WorkflowState::ValidatingInputs, vec![Effect::ValidateInputs])
        }

        WorkflowEvent::InputsValidated if state == WorkflowState::ValidatingInputs => {
            if kind.runs_engine() {
                (WorkflowState::Installing, vec![Effect::RunEngine])
            } else {
                (WorkflowState::Configuring, vec![Effect::ConfigureInstall])
            }
        }

        WorkflowEvent::Engine(engine_event) if state == WorkflowState::Installing => {
            match engine_event {
                EngineEvent::ManualDownloadRequired(_) => {
                    (WorkflowState::AwaitingManualSteps, vec![Effect::PersistContext])
                }
                EngineEvent::CorruptedFile(path) => (
                    WorkflowState::Installing,
                    vec![Effect::RemoveArtifact(path.clone())],
                ),
                EngineEvent::FatalError(message) => (
                    WorkflowState::Failed,
                    vec![Effect::Finish(
                        WorkflowStatus::Failed,
                        format!("engine reported a fatal error: {}", message),
                    )],
                ),
                EngineEvent::Exit(0) => {
                    (WorkflowState::Configuring, vec![Effect::ConfigureInstall])
                }
                EngineEvent::Exit(code) => (
                    WorkflowState::Failed,
                    vec![Effect::Finish(
                        WorkflowStatus::Failed,
                        format!("engine exited with code {}", code),
                    )],
                ),
                // Progress, PhaseComplete and Log are reported, not acted on.
                _ => (WorkflowState::Installing, Vec::new()),
            }
        }

        WorkflowEvent::ManualFilesReady if state == WorkflowState::AwaitingManualSteps => {
            (WorkflowState::Installing, vec![Effect::RunEngine])
        }

        WorkflowEvent::Configured if state == WorkflowState::Configuring => {
            (WorkflowState::CreatingShortcut, vec![Effect::CreateShortcut])
        }

        WorkflowEvent::ShortcutCreated if state == WorkflowState::CreatingShortcut => {
            (WorkflowState::RestartingSteam, vec![Effect::RestartSteam])
        }

        WorkflowEvent::SteamRestarted(outcome) if state == WorkflowState::RestartingSteam => {
            let detail = match outcome {
                None => "workflow completed".to_string(),
                // Partial success, not a failed run.
                Some(reason) => format!(
                    "workflow completed, but Steam could not be restarted ({}); restart it manually",
                    reason
                ),
            };
            (
                WorkflowState::Completed,
                vec![Effect::Finish(WorkflowStatus::Completed, detail)],
            )
        }

        _ => (state, Vec::new()),
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Restarting the Steam client, split out so runs are testable without
/// touching a real client.
pub trait SteamControl: Send {
    fn restart(&self) -> Result<(), String>;
}

/// Terminate-then-relaunch against the real client.
pub struct RealSteamControl;

impl SteamControl for RealSteamControl {
    fn restart(&self) -> Result<(), String> {
        steam::restart_steam().map_err(|e| e.to_string())
    }
}

/// External collaborators for one run.
pub struct OrchestratorDeps {
    pub settings: AppSettings,
    pub prefix_paths: PrefixPaths,
    pub launcher: Box<dyn PrefixLauncher + Send>,
    pub steam: Box<dyn SteamControl>,
}

impl OrchestratorDeps {
    /// Wire up against the detected Steam installation.
    pub fn detect(settings: AppSettings) -> Result<Self, WorkflowError> {
        let steam_root = steam::detect_steam_path_checked().ok_or(WorkflowError::SteamNotFound)?;
        let shortcuts_vdf = steam::shortcuts_vdf_path().ok_or(WorkflowError::SteamNotFound)?;
        let compat_tool_store =
            steam::compat_tool_store_path().ok_or(WorkflowError::SteamNotFound)?;
        Ok(Self {
            settings,
            prefix_paths: PrefixPaths {
                steam_root,
                shortcuts_vdf,
                compat_tool_store,
            },
            launcher: Box::new(prefix::SteamLauncher),
            steam: Box::new(RealSteamControl),
        })
    }
}

// ============================================================================
// Handle
// ============================================================================

struct Shared {
    state: Mutex<WorkflowState>,
    cancel: AtomicBool,
    resume_requested: Mutex<bool>,
    wakeup: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(WorkflowState::Idle),
            cancel: AtomicBool::new(false),
            resume_requested: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    fn set_state(&self, state: WorkflowState) {
        *self.state.lock() = state;
    }

    fn state(&self) -> WorkflowState {
        *self.state.lock()
    }
}

/// A live workflow run.
pub struct WorkflowHandle {
    progress: Receiver<WorkflowProgressEvent>,
    shared: Arc<Shared>,
    driver: Option<JoinHandle<WorkflowResult>>,
}

impl WorkflowHandle {
    /// Progress stream; closed once the run reaches a terminal state.
    pub fn events(&self) -> &Receiver<WorkflowProgressEvent> {
        &self.progress
    }

    pub fn state(&self) -> WorkflowState {
        self.shared.state()
    }

    /// Request cancellation. Honored at the next event, not only at phase
    /// boundaries; the engine process group is torn down on the way out.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
        self.shared.wakeup.notify_all();
    }

    /// Signal that manually placed files are now present, resuming a run
    /// suspended in `AwaitingManualSteps`.
    pub fn resume_after_manual_steps(&self) -> Result<(), WorkflowError> {
        if self.state() != WorkflowState::AwaitingManualSteps {
            return Err(WorkflowError::NotAwaitingManualSteps);
        }
        *self.shared.resume_requested.lock() = true;
        self.shared.wakeup.notify_all();
        Ok(())
    }

    /// Detached cancellation token, usable from a signal handler after the
    /// handle itself has been consumed by `wait`.
    pub fn canceller(&self) -> WorkflowCanceller {
        WorkflowCanceller {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Block until the run finishes.
    pub fn wait(mut self) -> WorkflowResult {
        match self.driver.take() {
            Some(driver) => driver.join().unwrap_or(WorkflowResult {
                status: WorkflowStatus::Failed,
                detail: "workflow driver panicked".to_string(),
            }),
            None => WorkflowResult {
                status: WorkflowStatus::Failed,
                detail: "workflow already waited on".to_string(),
            },
        }
    }
}

/// Cancellation token detached from the handle's lifetime.
#[derive(Clone)]
pub struct WorkflowCanceller {
    shared: Arc<Shared>,
}

impl WorkflowCanceller {
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
        self.shared.wakeup.notify_all();
    }
}

/// Start a workflow run on its own control thread.
pub fn start_workflow(
    request: WorkflowRequest,
    deps: OrchestratorDeps,
) -> Result<WorkflowHandle, WorkflowError> {
    let shared = Arc::new(Shared::new());
    let (tx, rx) = channel();

    let driver = {
        let shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("workflow-driver".to_string())
            .spawn(move || Driver::new(request, deps, shared, tx).run())?
    };

    Ok(WorkflowHandle {
        progress: rx,
        shared,
        driver: Some(driver),
    })
}

// ============================================================================
// Driver
// ============================================================================

struct Driver {
    request: WorkflowRequest,
    deps: OrchestratorDeps,
    shared: Arc<Shared>,
    tx: Sender<WorkflowProgressEvent>,
    context: WorkflowContext,
    engine: Option<EngineHandle>,
    phase_timer: PhaseTimer,
}

impl Driver {
    fn new(
        request: WorkflowRequest,
        deps: OrchestratorDeps,
        shared: Arc<Shared>,
        tx: Sender<WorkflowProgressEvent>,
    ) -> Self {
        let context = WorkflowContext::from_request(&request);
        Self {
            request,
            deps,
            shared,
            tx,
            context,
            engine: None,
            phase_timer: PhaseTimer::start(),
        }
    }

    fn emit(&self, event: WorkflowProgressEvent) {
        let _ = self.tx.send(event);
    }

    fn cancelled(&self) -> bool {
        self.shared.cancel.load(Ordering::SeqCst)
    }

    fn run(mut self) -> WorkflowResult {
        let mut state = WorkflowState::Idle;
        let mut queue: VecDeque<WorkflowEvent> = VecDeque::from([WorkflowEvent::Start]);
        let mut result: Option<WorkflowResult> = None;

        while result.is_none() {
            // Cancellation is checked before every transition.
            let event = if self.cancelled() {
                WorkflowEvent::CancelRequested
            } else if let Some(event) = queue.pop_front() {
                event
            } else {
                self.next_external_event(state)
            };

            self.note_event(state, &event);
            let (next, effects) = transition(self.request.kind, state, &event);
            let entered_new_phase = next != state;
            if entered_new_phase {
                log_info(&format!("Workflow {:?} -> {:?}", state, next));
                self.phase_timer.reset();
                self.shared.set_state(next);
            }
            state = next;

            for effect in effects {
                self.execute(effect, &mut queue, &mut result);
            }

            // Phase changes are announced only after their entry effects
            // have run: a suspend notification implies the resume context
            // is already on disk.
            if entered_new_phase {
                self.emit(WorkflowProgressEvent::PhaseChanged(next));
            }
        }

        let result = result.unwrap_or(WorkflowResult {
            status: WorkflowStatus::Failed,
            detail: "workflow ended without a result".to_string(),
        });
        match result.status {
            WorkflowStatus::Completed => log_info(&result.detail),
            WorkflowStatus::Cancelled => log_info("Workflow cancelled"),
            WorkflowStatus::Failed => log_error(&result.detail),
        }
        result
    }

    /// Driver-side bookkeeping for events, before the pure transition.
    fn note_event(&mut self, state: WorkflowState, event: &WorkflowEvent) {
        if state != WorkflowState::Installing {
            return;
        }
        match event {
            WorkflowEvent::Engine(EngineEvent::Progress {
                phase,
                current,
                total,
                item,
            }) => self.emit(WorkflowProgressEvent::EngineProgress {
                phase: phase.clone(),
                current: *current,
                total: *total,
                item: item.clone(),
            }),
            WorkflowEvent::Engine(EngineEvent::Log(line)) => {
                self.emit(WorkflowProgressEvent::EngineLog(line.clone()));
            }
            WorkflowEvent::Engine(EngineEvent::PhaseComplete(phase)) => {
                self.emit(WorkflowProgressEvent::Info(format!(
                    "{} finished after {:?}",
                    phase,
                    self.phase_timer.elapsed()
                )));
            }
            WorkflowEvent::Engine(EngineEvent::ManualDownloadRequired(list)) => {
                self.emit(WorkflowProgressEvent::ManualStepsRequired(list.clone()));
                self.stop_engine();
            }
            WorkflowEvent::Engine(EngineEvent::Exit(0)) => {
                self.context.engine_installed = true;
                self.engine = None;
            }
            WorkflowEvent::Engine(EngineEvent::Exit(_)) => {
                if let Some(engine) = &self.engine {
                    for line in engine.log_tail() {
                        log_error(&format!("engine: {}", line));
                    }
                }
                self.engine = None;
            }
            _ => {}
        }
    }

    /// Block for the next event from outside the driver: an engine event
    /// while `Installing`, a resume signal while `AwaitingManualSteps`.
    fn next_external_event(&mut self, state: WorkflowState) -> WorkflowEvent {
        match state {
            WorkflowState::Installing => loop {
                let Some(engine) = &self.engine else {
                    return WorkflowEvent::Fault("engine is not running".to_string());
                };
                match engine.events().recv_timeout(CANCEL_POLL) {
                    Ok(event) => return WorkflowEvent::Engine(event),
                    Err(RecvTimeoutError::Timeout) => {
                        if self.cancelled() {
                            return WorkflowEvent::CancelRequested;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        return if self.cancelled() {
                            WorkflowEvent::CancelRequested
                        } else {
                            WorkflowEvent::Fault(
                                "engine event stream ended unexpectedly".to_string(),
                            )
                        };
                    }
                }
            },
            WorkflowState::AwaitingManualSteps => {
                let mut flag = self.shared.resume_requested.lock();
                loop {
                    if self.cancelled() {
                        return WorkflowEvent::CancelRequested;
                    }
                    if *flag {
                        *flag = false;
                        return WorkflowEvent::ManualFilesReady;
                    }
                    self.shared.wakeup.wait_for(&mut flag, CANCEL_POLL);
                }
            }
            other => WorkflowEvent::Fault(format!("workflow stalled in {:?}", other)),
        }
    }

    fn execute(
        &mut self,
        effect: Effect,
        queue: &mut VecDeque<WorkflowEvent>,
        result: &mut Option<WorkflowResult>,
    ) {
        match effect {
            Effect::ValidateInputs => queue.push_back(self.validate_inputs()),
            Effect::RunEngine => queue.push_back(self.spawn_engine()),
            Effect::PersistContext => {
                if let Err(e) = self.persist_context() {
                    log_warning(&format!("Could not persist resume context: {}", e));
                }
            }
            Effect::RemoveArtifact(path) => self.remove_artifact(&path),
            Effect::ConfigureInstall => queue.push_back(self.configure_install()),
            Effect::CreateShortcut => queue.push_back(self.create_shortcut()),
            Effect::RestartSteam => {
                let outcome = self.deps.steam.restart().err();
                if let Some(reason) = &outcome {
                    log_warning(&format!("Steam restart failed: {}", reason));
                }
                queue.push_back(WorkflowEvent::SteamRestarted(outcome));
            }
            Effect::Finish(status, detail) => {
                self.stop_engine();
                let _ = fs::remove_file(self.context.install_dir.join(CONTEXT_FILE));
                *result = Some(WorkflowResult { status, detail });
            }
        }
    }

    fn stop_engine(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.cancel();
        }
    }

    fn validate_inputs(&mut self) -> WorkflowEvent {
        let validated = if self.request.force_reuse {
            safety::validate_with_override(&self.request.install_dir, self.request.kind)
        } else {
            safety::validate(&self.request.install_dir, self.request.kind)
        };
        if let Err(e) = validated {
            return WorkflowEvent::Fault(e.to_string());
        }
        if let Err(e) = safety::validate_path(&self.request.download_dir) {
            return WorkflowEvent::Fault(e.to_string());
        }
        // A run suspended in `AwaitingManualSteps` leaves its context in
        // the install directory; a restart with the same request adopts
        // it instead of starting from scratch.
        if let Some(saved) = load_context(&self.request.install_dir) {
            if saved.kind == self.request.kind && saved.modlist_name == self.request.modlist_name
            {
                log_info("Found a suspended run for this modlist, adopting its context");
                self.context = saved;
            }
        }
        WorkflowEvent::InputsValidated
    }

    fn spawn_engine(&mut self) -> WorkflowEvent {
        let settings = &self.deps.settings;
        let mut command = EngineCommand::new(settings.engine_program())
            .arg("install")
            .arg("--modlist")
            .arg(&self.context.modlist_name)
            .arg("--install-dir")
            .arg(self.context.install_dir.display().to_string())
            .arg("--download-dir")
            .arg(self.context.download_dir.display().to_string())
            .scratch_dir(self.context.install_dir.join(".modforge_scratch"))
            .kill_grace(Duration::from_secs(settings.kill_grace_secs));
        if let Some(game) = self.context.game {
            command = command.arg("--game").arg(game.engine_flag());
        }
        if let Some(key_ref) = &settings.api_key_ref {
            command = command.arg("--api-key-ref").arg(key_ref);
        }
        for (key, value) in &settings.engine_flags {
            command = command.arg("--flag").arg(format!("{}={}", key, value));
        }

        match command.spawn() {
            Ok(handle) => {
                self.engine = Some(handle);
                // The driver now blocks on the event stream.
                WorkflowEvent::Engine(EngineEvent::Log("engine started".to_string()))
            }
            Err(e) => WorkflowEvent::Fault(e.to_string()),
        }
    }

    fn persist_context(&self) -> Result<(), WorkflowError> {
        let content =
            serde_json::to_string_pretty(&self.context).map_err(std::io::Error::other)?;
        fs::create_dir_all(&self.context.install_dir)?;
        fs::write(self.context.install_dir.join(CONTEXT_FILE), content)?;
        log_info("Suspended: waiting for manual downloads to be placed");
        Ok(())
    }

    fn remove_artifact(&self, path: &Path) {
        let target = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.context.download_dir.join(path)
        };
        match fs::remove_file(&target) {
            Ok(()) => log_info(&format!("Removed corrupted artifact {}", target.display())),
            Err(e) => log_warning(&format!(
                "Could not remove corrupted artifact {}: {}",
                target.display(),
                e
            )),
        }
        self.emit(WorkflowProgressEvent::ArtifactRemoved(target.clone()));
        self.emit(WorkflowProgressEvent::Info(format!(
            "{} was corrupted and has been removed; re-run the phase to fetch it again",
            target.display()
        )));
    }

    fn configure_install(&mut self) -> WorkflowEvent {
        if self.context.engine_installed {
            // The engine already wrote final paths; rewriting them again
            // is redundant.
            log_info("Skipping path rewrite, engine emitted final paths");
        } else {
            match rewrite_mod_organizer_paths(&self.context.install_dir) {
                Ok(true) => self.emit(WorkflowProgressEvent::Info(
                    "Rewrote mod manager paths for this install".to_string(),
                )),
                Ok(false) => {}
                Err(e) => return WorkflowEvent::Fault(format!("path rewrite failed: {}", e)),
            }
        }
        WorkflowEvent::Configured
    }

    fn create_shortcut(&mut self) -> WorkflowEvent {
        let exe = find_mod_manager_exe(&self.context.install_dir);
        let start_dir = exe
            .parent()
            .unwrap_or(&self.context.install_dir)
            .to_path_buf();

        let app_id = match prefix::resolve_app_id(
            &format!("\"{}\"", exe.display()),
            &self.context.modlist_name,
        ) {
            Ok(id) => id,
            Err(e) => return WorkflowEvent::Fault(e.to_string()),
        };
        let entry = ShortcutEntry::new(
            app_id,
            &self.context.modlist_name,
            &exe.display().to_string(),
            &start_dir.display().to_string(),
        );

        if let Err(e) =
            steam::update_store_file(&self.deps.prefix_paths.shortcuts_vdf, |store| {
                store.upsert(&entry)
            })
        {
            return WorkflowEvent::Fault(e.to_string());
        }

        let route = prefix::detect_special_game(&self.context.install_dir);
        match prefix::configure(
            &self.deps.prefix_paths,
            self.deps.launcher.as_ref(),
            &entry,
            &self.deps.settings.compat_tool,
            route,
            Duration::from_secs(self.deps.settings.prefix_timeout_secs),
        ) {
            Ok(config) => {
                self.emit(WorkflowProgressEvent::Info(format!(
                    "Shortcut ready (AppID {}, tool {})",
                    config.app_id, config.compat_tool
                )));
                WorkflowEvent::ShortcutCreated
            }
            Err(e) => WorkflowEvent::Fault(e.to_string()),
        }
    }
}

/// Context left behind by a run suspended in `AwaitingManualSteps`.
fn load_context(install_dir: &Path) -> Option<WorkflowContext> {
    let content = fs::read_to_string(install_dir.join(CONTEXT_FILE)).ok()?;
    serde_json::from_str(&content).ok()
}

/// The mod manager executable the shortcut should point at.
fn find_mod_manager_exe(install_dir: &Path) -> PathBuf {
    for entry in WalkDir::new(install_dir).max_depth(3).into_iter().flatten() {
        if entry.file_type().is_file()
            && entry
                .file_name()
                .to_string_lossy()
                .eq_ignore_ascii_case("ModOrganizer.exe")
        {
            return entry.into_path();
        }
    }
    install_dir.join("ModOrganizer.exe")
}

/// Rewrite Windows-style paths in ModOrganizer.ini to this install's real
/// location. Returns whether anything changed.
fn rewrite_mod_organizer_paths(install_dir: &Path) -> std::io::Result<bool> {
    let ini = install_dir.join("ModOrganizer.ini");
    if !ini.exists() {
        return Ok(false);
    }

    let drive_path = Regex::new(r"[A-Za-z]:[\\/][^\r\n)]*").unwrap();
    let content = fs::read_to_string(&ini)?;
    let mut changed = false;

    let rewritten: Vec<String> = content
        .lines()
        .map(|line| {
            if !line.contains('=') || !drive_path.is_match(line) {
                return line.to_string();
            }
            changed = true;
            drive_path
                .replace_all(line, |caps: &regex::Captures| {
                    // Z:\home\user\x -> /home/user/x
                    let path = &caps[0];
                    path[2..].replace('\\', "/")
                })
                .into_owned()
        })
        .collect();

    if changed {
        fs::write(&ini, rewritten.join("\n") + "\n")?;
        log_info(&format!("Rewrote paths in {}", ini.display()));
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigureError;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::AtomicU32;

    // ------------------------------------------------------------------
    // Pure transition core
    // ------------------------------------------------------------------

    #[test]
    fn cancellation_wins_from_every_live_state() {
        for state in [
            WorkflowState::Idle,
            WorkflowState::ValidatingInputs,
            WorkflowState::Installing,
            WorkflowState::Configuring,
            WorkflowState::CreatingShortcut,
            WorkflowState::RestartingSteam,
            WorkflowState::AwaitingManualSteps,
        ] {
            let (next, effects) = transition(
                WorkflowKind::InstallModlist,
                state,
                &WorkflowEvent::CancelRequested,
            );
            assert_eq!(next, WorkflowState::Cancelled);
            assert!(matches!(
                effects[0],
                Effect::Finish(WorkflowStatus::Cancelled, _)
            ));
        }
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for state in [
            WorkflowState::Completed,
            WorkflowState::Failed,
            WorkflowState::Cancelled,
        ] {
            let (next, effects) =
                transition(WorkflowKind::InstallModlist, state, &WorkflowEvent::Start);
            assert_eq!(next, state);
            assert!(effects.is_empty());
        }
    }

    #[test]
    fn manual_downloads_suspend_and_resume_reenters_installing() {
        let event = WorkflowEvent::Engine(EngineEvent::ManualDownloadRequired(vec![
            ManualDownload {
                url: "https://ex.com/a".to_string(),
                target: PathBuf::from("a.7z"),
                reason: String::new(),
            },
        ]));
        let (next, effects) =
            transition(WorkflowKind::InstallModlist, WorkflowState::Installing, &event);
        assert_eq!(next, WorkflowState::AwaitingManualSteps);
        assert_eq!(effects, vec![Effect::PersistContext]);

        let (next, effects) = transition(
            WorkflowKind::InstallModlist,
            WorkflowState::AwaitingManualSteps,
            &WorkflowEvent::ManualFilesReady,
        );
        assert_eq!(next, WorkflowState::Installing);
        assert_eq!(effects, vec![Effect::RunEngine]);
    }

    #[test]
    fn configure_only_kinds_skip_installing() {
        let (next, _) = transition(
            WorkflowKind::ConfigureExisting,
            WorkflowState::ValidatingInputs,
            &WorkflowEvent::InputsValidated,
        );
        assert_eq!(next, WorkflowState::Configuring);

        let (next, _) = transition(
            WorkflowKind::InstallModlist,
            WorkflowState::ValidatingInputs,
            &WorkflowEvent::InputsValidated,
        );
        assert_eq!(next, WorkflowState::Installing);
    }

    #[test]
    fn steam_restart_failure_degrades_to_partial_success() {
        let (next, effects) = transition(
            WorkflowKind::InstallModlist,
            WorkflowState::RestartingSteam,
            &WorkflowEvent::SteamRestarted(Some("pkill missing".to_string())),
        );
        assert_eq!(next, WorkflowState::Completed);
        match &effects[0] {
            Effect::Finish(WorkflowStatus::Completed, detail) => {
                assert!(detail.contains("restart it manually"));
            }
            other => panic!("expected completed finish, got {:?}", other),
        }
    }

    #[test]
    fn corrupted_file_removes_artifact_and_stays_in_installing() {
        let event = WorkflowEvent::Engine(EngineEvent::CorruptedFile(PathBuf::from("bad.7z")));
        let (next, effects) =
            transition(WorkflowKind::InstallModlist, WorkflowState::Installing, &event);
        assert_eq!(next, WorkflowState::Installing);
        assert_eq!(effects, vec![Effect::RemoveArtifact(PathBuf::from("bad.7z"))]);
    }

    // ------------------------------------------------------------------
    // End-to-end with a scripted engine
    // ------------------------------------------------------------------

    struct FakeLauncher {
        create: PathBuf,
        calls: AtomicU32,
    }

    impl PrefixLauncher for FakeLauncher {
        fn launch(&self, _app_id: u32) -> Result<(), ConfigureError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            fs::create_dir_all(&self.create).unwrap();
            Ok(())
        }
    }

    struct FakeSteam;

    impl SteamControl for FakeSteam {
        fn restart(&self) -> Result<(), String> {
            Ok(())
        }
    }

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-engine.sh");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn harness(root: &Path, engine_script: &str) -> (WorkflowRequest, OrchestratorDeps, PathBuf) {
        let install_dir = root.join("Games/List1");
        fs::create_dir_all(&install_dir).unwrap();
        let download_dir = root.join("Games/Downloads");
        fs::create_dir_all(&download_dir).unwrap();

        let request = WorkflowRequest {
            kind: WorkflowKind::InstallModlist,
            modlist_name: "Test List SSE".to_string(),
            game: None,
            install_dir: install_dir.clone(),
            download_dir,
            force_reuse: false,
        };

        let mut settings = AppSettings::default();
        settings.engine_binary = Some(write_script(root, engine_script));
        settings.kill_grace_secs = 1;
        settings.prefix_timeout_secs = 5;

        let shortcuts_vdf = root.join("userdata/1001/config/shortcuts.vdf");
        let prefix_paths = PrefixPaths {
            steam_root: root.join("steam"),
            shortcuts_vdf,
            compat_tool_store: root.join("userdata/1001/config/compat_tools.cfg"),
        };
        // The AppID is derived from the exe + name this harness uses, so
        // precompute where its compatdata would land.
        let exe = install_dir.join("ModOrganizer.exe");
        let app_id = prefix::resolve_app_id(
            &format!("\"{}\"", exe.display()),
            "Test List SSE",
        )
        .unwrap();
        let compat_data = prefix_paths.compat_data_path(app_id);

        let deps = OrchestratorDeps {
            settings,
            prefix_paths,
            launcher: Box::new(FakeLauncher {
                create: compat_data,
                calls: AtomicU32::new(0),
            }),
            steam: Box::new(FakeSteam),
        };
        (request, deps, install_dir)
    }

    #[test]
    fn scripted_install_completes_and_writes_one_shortcut() {
        let dir = tempfile::tempdir().unwrap();
        let (request, deps, install_dir) = harness(
            dir.path(),
            "echo 'Installing: [1/1] done'\necho 'Installing complete'",
        );
        let shortcuts_vdf = deps.prefix_paths.shortcuts_vdf.clone();

        let handle = start_workflow(request, deps).unwrap();
        let result = handle.wait();
        assert_eq!(result.status, WorkflowStatus::Completed, "{}", result.detail);

        let store = steam::load_store(&shortcuts_vdf).unwrap();
        assert_eq!(store.len(), 1);
        let entry = store.entry(0).unwrap();
        assert_eq!(entry.get_str("AppName"), Some("Test List SSE"));
        assert!(entry
            .get_str("Exe")
            .unwrap()
            .contains(install_dir.to_str().unwrap()));
    }

    #[test]
    fn engine_crash_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let (request, deps, _) = harness(dir.path(), "echo 'partway'\nexit 7");

        let result = start_workflow(request, deps).unwrap().wait();
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.detail.contains("code 7"));
    }

    #[test]
    fn fatal_engine_line_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let (request, deps, _) = harness(dir.path(), "echo 'FATAL: disk full'\nsleep 30");

        let result = start_workflow(request, deps).unwrap().wait();
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.detail.contains("disk full"));
    }

    #[test]
    fn dangerous_install_dir_is_rejected_before_anything_runs() {
        let dir = tempfile::tempdir().unwrap();
        let (mut request, deps, _) = harness(dir.path(), "echo unused");
        request.install_dir = PathBuf::from("/usr");

        let result = start_workflow(request, deps).unwrap().wait();
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.detail.contains("protected"));
    }

    #[test]
    fn cancel_during_install_yields_cancelled_not_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (request, deps, _) = harness(dir.path(), "sleep 300");

        let handle = start_workflow(request, deps).unwrap();
        // Let the engine spawn first.
        thread::sleep(Duration::from_millis(300));
        handle.cancel();
        let result = handle.wait();
        assert_eq!(result.status, WorkflowStatus::Cancelled);
    }

    #[test]
    fn manual_downloads_suspend_then_resume_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let go_file = dir.path().join("downloads-placed");
        let script = format!(
            "if [ -f {go} ]; then\n\
             echo 'Installing: [1/1] done'\n\
             echo 'Installing complete'\n\
             else\n\
             echo 'MANUAL DOWNLOAD REQUIRED: https://ex.com/a -> downloads/a.7z (requires login)'\n\
             echo 'Downloading complete'\n\
             sleep 30\n\
             fi",
            go = go_file.display()
        );
        let (request, deps, install_dir) = harness(dir.path(), &script);

        let handle = start_workflow(request, deps).unwrap();

        // Wait for the suspend, collecting the manual list on the way.
        let mut manual_seen = false;
        for event in handle.events().iter() {
            match event {
                WorkflowProgressEvent::ManualStepsRequired(list) => {
                    assert_eq!(list.len(), 1);
                    assert_eq!(list[0].url, "https://ex.com/a");
                    manual_seen = true;
                }
                WorkflowProgressEvent::PhaseChanged(WorkflowState::AwaitingManualSteps) => break,
                _ => {}
            }
        }
        assert!(manual_seen);
        // Suspend persisted the resume context.
        assert!(install_dir.join(CONTEXT_FILE).exists());

        fs::write(&go_file, b"").unwrap();
        handle.resume_after_manual_steps().unwrap();
        let result = handle.wait();
        assert_eq!(result.status, WorkflowStatus::Completed, "{}", result.detail);
    }

    #[test]
    fn suspended_context_is_adopted_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        let install_dir = dir.path().join("Games/ListR");
        let download_dir = dir.path().join("Games/Downloads");
        fs::create_dir_all(&install_dir).unwrap();
        fs::create_dir_all(&download_dir).unwrap();
        fs::write(
            install_dir.join("ModOrganizer.ini"),
            "gamePath=@ByteArray(Z:\\games\\skyrim)\n",
        )
        .unwrap();

        let request = WorkflowRequest {
            kind: WorkflowKind::ConfigureExisting,
            modlist_name: "Resume List".to_string(),
            game: None,
            install_dir: install_dir.clone(),
            download_dir: download_dir.clone(),
            force_reuse: false,
        };

        // A previous run suspended after the engine already wrote final
        // paths; the restart must pick that flag up from disk.
        let saved = WorkflowContext {
            kind: WorkflowKind::ConfigureExisting,
            modlist_name: "Resume List".to_string(),
            game: None,
            install_dir: install_dir.clone(),
            download_dir,
            engine_installed: true,
        };
        fs::write(
            install_dir.join(CONTEXT_FILE),
            serde_json::to_string(&saved).unwrap(),
        )
        .unwrap();

        let prefix_paths = PrefixPaths {
            steam_root: dir.path().join("steam"),
            shortcuts_vdf: dir.path().join("userdata/1001/config/shortcuts.vdf"),
            compat_tool_store: dir.path().join("userdata/1001/config/compat_tools.cfg"),
        };
        let exe = install_dir.join("ModOrganizer.exe");
        let app_id = prefix::resolve_app_id(
            &format!("\"{}\"", exe.display()),
            "Resume List",
        )
        .unwrap();
        let deps = OrchestratorDeps {
            settings: AppSettings::default(),
            launcher: Box::new(FakeLauncher {
                create: prefix_paths.compat_data_path(app_id),
                calls: AtomicU32::new(0),
            }),
            prefix_paths,
            steam: Box::new(FakeSteam),
        };

        let result = start_workflow(request, deps).unwrap().wait();
        assert_eq!(result.status, WorkflowStatus::Completed, "{}", result.detail);

        // The adopted `engine_installed` flag suppressed path rewriting.
        let ini = fs::read_to_string(install_dir.join("ModOrganizer.ini")).unwrap();
        assert!(ini.contains("Z:\\games\\skyrim"));
        // The suspend context is consumed by the finished run.
        assert!(!install_dir.join(CONTEXT_FILE).exists());
    }

    #[test]
    fn resume_is_rejected_while_not_suspended() {
        let dir = tempfile::tempdir().unwrap();
        let (request, deps, _) = harness(dir.path(), "sleep 300");

        let handle = start_workflow(request, deps).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(matches!(
            handle.resume_after_manual_steps(),
            Err(WorkflowError::NotAwaitingManualSteps)
        ));
        handle.cancel();
        handle.wait();
    }

    // ------------------------------------------------------------------
    // Path rewriting
    // ------------------------------------------------------------------

    #[test]
    fn mod_organizer_paths_are_rewritten_once() {
        let dir = tempfile::tempdir().unwrap();
        let ini = dir.path().join("ModOrganizer.ini");
        fs::write(
            &ini,
            "[General]\n\
             gamePath=@ByteArray(Z:\\home\\alice\\Games\\Skyrim)\n\
             download_directory=D:/lists/downloads\n\
             selected_profile=Default\n",
        )
        .unwrap();

        assert!(rewrite_mod_organizer_paths(dir.path()).unwrap());
        let content = fs::read_to_string(&ini).unwrap();
        assert!(content.contains("gamePath=@ByteArray(/home/alice/Games/Skyrim)"));
        assert!(content.contains("download_directory=/lists/downloads"));
        assert!(content.contains("selected_profile=Default"));

        // Second pass finds nothing left to rewrite.
        assert!(!rewrite_mod_organizer_paths(dir.path()).unwrap());
    }

    #[test]
    fn missing_ini_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!rewrite_mod_organizer_paths(dir.path()).unwrap());
    }
}
