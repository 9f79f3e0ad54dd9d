//! Steam integration module
//!
//! Handles the shortcut store codec, compatibility-tool assignment, Steam
//! path discovery, and restarting the Steam client.

mod config;
mod paths;
mod shortcuts;

pub use config::{get_compat_tool, set_compat_tool};
pub use paths::{
    compat_tool_store_path, detect_steam_path_checked, find_steam_path, find_userdata_path,
    shortcuts_vdf_path,
};
pub use shortcuts::{
    load_store, update_store_file, ShortcutEntry, ShortcutStore, VdfMap, VdfValue,
};

use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use crate::error::WorkflowError;
use crate::logging::log_steam;

/// Kill Steam. The client's own graceful `-shutdown` request is unreliable
/// while it is mid-write, so we ask once and then force the issue.
pub fn kill_steam() -> Result<(), WorkflowError> {
    let _ = Command::new("steam").arg("-shutdown").status();

    thread::sleep(Duration::from_secs(2));

    let _ = Command::new("pkill").arg("-9").arg("steam").status();

    // Brief wait for Steam to fully exit
    thread::sleep(Duration::from_secs(2));

    Ok(())
}

/// Start Steam in the background, detached from our process.
pub fn start_steam() -> Result<(), WorkflowError> {
    // setsid detaches Steam from us, -silent keeps the main window closed
    Command::new("setsid")
        .arg("steam")
        .arg("-silent")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| WorkflowError::SteamRestartFailure(e.to_string()))?;

    Ok(())
}

/// Restart Steam so it re-reads the shortcut store and compatibility-tool
/// assignments (terminate-then-relaunch; see `kill_steam`).
pub fn restart_steam() -> Result<(), WorkflowError> {
    log_steam("Restarting Steam to pick up shortcut changes");
    kill_steam()?;
    start_steam()?;
    Ok(())
}
