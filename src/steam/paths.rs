//! Steam path detection utilities
//!
//! Locates the Steam installation, the active user's config directory, and
//! the files this tool is allowed to touch.

use std::fs;
use std::path::PathBuf;

use crate::logging::{log_info, log_warning};

// ============================================================================
// Core Path Detection
// ============================================================================

/// Find the Steam installation path.
///
/// Checks common locations for native, Flatpak, and Snap Steam installs.
/// Returns `None` if Steam is not found.
#[must_use]
pub fn find_steam_path() -> Option<PathBuf> {
    let home = dirs::home_dir()?;

    let steam_paths = [
        home.join(".steam/steam"),
        home.join(".local/share/Steam"),
        home.join(".var/app/com.valvesoftware.Steam/.steam/steam"),
        home.join("snap/steam/common/.steam/steam"),
    ];

    steam_paths.into_iter().find(|p| p.exists())
}

/// Find the Steam userdata directory (most recently used user).
///
/// Returns the path to the most recently modified user's directory, which is
/// typically the active Steam user. User `0` is a system account and never
/// valid for shortcuts.
#[must_use]
pub fn find_userdata_path() -> Option<PathBuf> {
    let steam_path = find_steam_path()?;
    let userdata = steam_path.join("userdata");

    if !userdata.exists() {
        return None;
    }

    let mut user_dirs: Vec<PathBuf> = Vec::new();

    if let Ok(entries) = fs::read_dir(&userdata) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if let Some(name) = path.file_name() {
                    let name = name.to_string_lossy();
                    if name.chars().all(|c| c.is_ascii_digit()) && name != "0" {
                        user_dirs.push(path);
                    }
                }
            }
        }
    }

    // Sort by modification time (most recent first)
    user_dirs.sort_by(|a, b| {
        let a_time = fs::metadata(a).and_then(|m| m.modified()).ok();
        let b_time = fs::metadata(b).and_then(|m| m.modified()).ok();
        b_time.cmp(&a_time)
    });

    user_dirs.into_iter().next()
}

/// Path to shortcuts.vdf for the active user.
#[must_use]
pub fn shortcuts_vdf_path() -> Option<PathBuf> {
    let userdata = find_userdata_path()?;
    Some(userdata.join("config/shortcuts.vdf"))
}

/// Path to the compatibility-tool assignment store for the active user.
#[must_use]
pub fn compat_tool_store_path() -> Option<PathBuf> {
    let userdata = find_userdata_path()?;
    Some(userdata.join("config/modforge_compat_tools.cfg"))
}

// ============================================================================
// Convenience Wrappers
// ============================================================================

/// Detect the Steam installation path with logging.
///
/// Use this at startup to log whether Steam was found.
#[must_use]
pub fn detect_steam_path_checked() -> Option<PathBuf> {
    match find_steam_path() {
        Some(path) => {
            log_info(&format!("Steam detected at: {}", path.display()));
            Some(path)
        }
        None => {
            log_warning("Steam installation not detected! Modforge requires Steam to be installed.");
            None
        }
    }
}
