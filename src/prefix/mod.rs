//! Proton prefix configuration
//!
//! Resolves the deterministic AppID for a shortcut, records its
//! compatibility-tool selection, and makes sure a compatibility prefix
//! exists for it. Some modded games must run against the vanilla game's
//! existing prefix instead of a fresh one; those are detected by a marker
//! executable in the install tree and routed with a
//! `STEAM_COMPAT_DATA_PATH` launch-options override.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use walkdir::WalkDir;

use crate::error::ConfigureError;
use crate::logging::{log_info, log_warning};
use crate::steam::{self, ShortcutEntry};

/// How often the compatdata poll re-checks the directory.
const PREFIX_POLL_INTERVAL: Duration = Duration::from_millis(500);

// ============================================================================
// AppID resolution
// ============================================================================

/// Bitwise CRC-32 (IEEE, reflected, poly 0xEDB88320).
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// Derive the shortcut AppID the way Steam itself does for non-Steam
/// games: CRC-32 over the quoted exe path concatenated with the app name,
/// high bit forced. The same install always maps to the same AppID.
pub fn resolve_app_id(exe: &str, app_name: &str) -> Result<u32, ConfigureError> {
    if exe.trim_matches('"').is_empty() {
        return Err(ConfigureError::AppIdResolution(format!(
            "shortcut {:?} has no executable path",
            app_name
        )));
    }
    let mut input = Vec::with_capacity(exe.len() + app_name.len());
    input.extend_from_slice(exe.as_bytes());
    input.extend_from_slice(app_name.as_bytes());
    Ok(crc32(&input) | 0x8000_0000)
}

/// The 64-bit form used in `steam://rungameid/` URLs for shortcuts.
pub fn shortcut_game_id(app_id: u32) -> u64 {
    ((app_id as u64) << 32) | 0x0200_0000
}

// ============================================================================
// Special-game routing
// ============================================================================

/// Games whose modlists must run inside the vanilla game's existing
/// prefix rather than a fresh one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecialGame {
    FalloutNewVegas,
    Enderal,
}

impl SpecialGame {
    /// Executable whose presence in the install tree identifies the family.
    pub fn marker(self) -> &'static str {
        match self {
            SpecialGame::FalloutNewVegas => "nvse_loader.exe",
            SpecialGame::Enderal => "Enderal Launcher.exe",
        }
    }

    /// AppID of the vanilla game whose compat data is reused.
    pub fn vanilla_app_id(self) -> u32 {
        match self {
            SpecialGame::FalloutNewVegas => 22380,
            SpecialGame::Enderal => 933480,
        }
    }

    const ALL: [SpecialGame; 2] = [SpecialGame::FalloutNewVegas, SpecialGame::Enderal];
}

/// Scan the install tree once for a special-game marker executable.
/// Case-insensitive, first match wins; `None` means standard routing.
pub fn detect_special_game(install_dir: &Path) -> Option<SpecialGame> {
    for entry in WalkDir::new(install_dir).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        for game in SpecialGame::ALL {
            if name.eq_ignore_ascii_case(game.marker()) {
                log_info(&format!(
                    "Special-game marker {} found at {}",
                    game.marker(),
                    entry.path().display()
                ));
                return Some(game);
            }
        }
    }
    None
}

// ============================================================================
// Prefix configuration
// ============================================================================

/// Launches a shortcut so Steam/Proton materializes its prefix. Split out
/// so the configure flow is testable without a running Steam client.
pub trait PrefixLauncher {
    fn launch(&self, app_id: u32) -> Result<(), ConfigureError>;
}

/// Real launcher: asks the running Steam client to start the shortcut.
pub struct SteamLauncher;

impl PrefixLauncher for SteamLauncher {
    fn launch(&self, app_id: u32) -> Result<(), ConfigureError> {
        let url = format!("steam://rungameid/{}", shortcut_game_id(app_id));
        Command::new("steam")
            .arg(&url)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ConfigureError::CompatToolWrite(format!("steam launch failed: {}", e)))?;
        Ok(())
    }
}

/// Where the relevant Steam files live for this run.
pub struct PrefixPaths {
    pub steam_root: PathBuf,
    pub shortcuts_vdf: PathBuf,
    pub compat_tool_store: PathBuf,
}

impl PrefixPaths {
    pub fn compat_data_path(&self, app_id: u32) -> PathBuf {
        self.steam_root
            .join("steamapps")
            .join("compatdata")
            .join(app_id.to_string())
    }
}

/// The configured prefix, returned to the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrefixConfig {
    pub app_id: u32,
    pub compat_tool: String,
    pub compat_data_path: PathBuf,
    pub launch_options: Option<String>,
    pub special: Option<SpecialGame>,
}

/// Configure the prefix for a shortcut.
///
/// Standard games get a `dxvk.conf` beside the executable and a brief
/// launch followed by a bounded poll for the compatdata directory.
/// Special games reuse the vanilla game's prefix via a launch-options
/// override and skip both of those steps.
pub fn configure(
    paths: &PrefixPaths,
    launcher: &dyn PrefixLauncher,
    shortcut: &ShortcutEntry,
    desired_tool: &str,
    route: Option<SpecialGame>,
    prefix_timeout: Duration,
) -> Result<PrefixConfig, ConfigureError> {
    let app_id = if shortcut.app_id != 0 {
        shortcut.app_id
    } else {
        resolve_app_id(&shortcut.exe, &shortcut.app_name)?
    };

    set_compat_tool_with_retry(&paths.compat_tool_store, app_id, desired_tool)?;

    let (compat_data_path, launch_options) = match route {
        Some(game) => {
            let vanilla = paths.compat_data_path(game.vanilla_app_id());
            let options = format!("STEAM_COMPAT_DATA_PATH={} %command%", vanilla.display());
            log_info(&format!(
                "Routing {:?} into vanilla prefix {}",
                game,
                vanilla.display()
            ));
            (vanilla, Some(options))
        }
        None => {
            write_dxvk_conf(shortcut)?;
            let compat_data = paths.compat_data_path(app_id);
            if !compat_data.exists() {
                launcher.launch(app_id)?;
                wait_for_prefix(&compat_data, app_id, prefix_timeout)?;
            }
            (compat_data, None)
        }
    };

    if let Some(options) = &launch_options {
        let entry = shortcut.clone().with_launch_options(options);
        steam::update_store_file(&paths.shortcuts_vdf, |store| store.upsert(&entry))
            .map_err(|e| ConfigureError::Store(e.to_string()))?;
    }

    Ok(PrefixConfig {
        app_id,
        compat_tool: desired_tool.to_string(),
        compat_data_path,
        launch_options,
        special: route,
    })
}

/// Compat-tool writes touch shared Steam config; one retry before the
/// failure surfaces.
fn set_compat_tool_with_retry(
    store_path: &Path,
    app_id: u32,
    tool: &str,
) -> Result<(), ConfigureError> {
    match steam::set_compat_tool(store_path, app_id, tool) {
        Ok(()) => Ok(()),
        Err(e @ ConfigureError::InvalidToolName(_)) => Err(e),
        Err(first) => {
            log_warning(&format!(
                "Compatibility-tool write failed ({}), retrying once",
                first
            ));
            steam::set_compat_tool(store_path, app_id, tool)
        }
    }
}

/// Render-API tuning for standalone prefixes. Skipped entirely for
/// special-routed games, which inherit the vanilla game's config.
fn write_dxvk_conf(shortcut: &ShortcutEntry) -> Result<(), ConfigureError> {
    let start_dir = shortcut.start_dir.trim_matches('"');
    if start_dir.is_empty() || !Path::new(start_dir).is_dir() {
        return Ok(());
    }
    let conf = Path::new(start_dir).join("dxvk.conf");
    if conf.exists() {
        return Ok(());
    }
    fs::write(&conf, "dxvk.enableGraphicsPipelineLibrary = True\n")?;
    log_info(&format!("Wrote {}", conf.display()));
    Ok(())
}

/// Poll for the compatdata directory Proton creates on first launch.
fn wait_for_prefix(
    compat_data: &Path,
    app_id: u32,
    timeout: Duration,
) -> Result<(), ConfigureError> {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if compat_data.is_dir() {
            log_info(&format!(
                "Prefix for AppID {} appeared after {:?}",
                app_id,
                started.elapsed()
            ));
            return Ok(());
        }
        thread::sleep(PREFIX_POLL_INTERVAL);
    }
    Err(ConfigureError::PrefixCreationTimeout {
        app_id,
        seconds: timeout.as_secs(),
    })
}
