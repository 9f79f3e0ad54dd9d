//! Compatibility-tool assignment store
//!
//! Records which compatibility tool (Proton version) each shortcut AppID
//! runs under, as a plain text store with one `app_id=tool_name` line.
//! Steam must be restarted for changes to take effect.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::ConfigureError;
use crate::logging::log_steam;

/// Reject tool names that would corrupt the line-oriented store.
fn validate_tool_name(tool: &str) -> Result<(), ConfigureError> {
    if tool.is_empty() || tool.contains('=') || tool.contains('\n') || tool.contains('\r') {
        return Err(ConfigureError::InvalidToolName(tool.to_string()));
    }
    Ok(())
}

/// Set the compatibility tool for an AppID, replacing any existing
/// assignment. The store is rewritten through a temp file and an atomic
/// rename so a crash never leaves it half-written.
pub fn set_compat_tool(store_path: &Path, app_id: u32, tool: &str) -> Result<(), ConfigureError> {
    validate_tool_name(tool)?;

    let mut lines: Vec<String> = Vec::new();
    if store_path.exists() {
        let content = fs::read_to_string(store_path)?;
        lines = content
            .lines()
            .filter(|line| {
                !line.trim().is_empty()
                    && line.split('=').next().map(str::trim) != Some(&app_id.to_string())
            })
            .map(str::to_string)
            .collect();
    }
    lines.push(format!("{}={}", app_id, tool));

    if let Some(parent) = store_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = store_path.with_extension(format!("cfg.tmp.{}", std::process::id()));
    {
        let mut file = fs::File::create(&tmp)?;
        for line in &lines {
            writeln!(file, "{}", line)?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, store_path)?;

    log_steam(&format!("Set compatibility tool for AppID {}: {}", app_id, tool));
    Ok(())
}

/// Look up the assigned compatibility tool for an AppID.
pub fn get_compat_tool(store_path: &Path, app_id: u32) -> Option<String> {
    let content = fs::read_to_string(store_path).ok()?;
    for line in content.lines() {
        let mut parts = line.splitn(2, '=');
        if parts.next().map(str::trim) == Some(&app_id.to_string()) {
            return parts.next().map(|t| t.trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("compat_tools.cfg");

        set_compat_tool(&store, 2147483649, "GE-Proton9-20").unwrap();
        assert_eq!(
            get_compat_tool(&store, 2147483649).as_deref(),
            Some("GE-Proton9-20")
        );
    }

    #[test]
    fn reassignment_replaces_not_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("compat_tools.cfg");

        set_compat_tool(&store, 42, "proton_experimental").unwrap();
        set_compat_tool(&store, 43, "GE-Proton9-20").unwrap();
        set_compat_tool(&store, 42, "proton_9").unwrap();

        let content = fs::read_to_string(&store).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert_eq!(get_compat_tool(&store, 42).as_deref(), Some("proton_9"));
        assert_eq!(get_compat_tool(&store, 43).as_deref(), Some("GE-Proton9-20"));
    }

    #[test]
    fn bad_tool_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("compat_tools.cfg");

        assert!(set_compat_tool(&store, 1, "").is_err());
        assert!(set_compat_tool(&store, 1, "a=b").is_err());
        assert!(set_compat_tool(&store, 1, "a\nb").is_err());
        assert!(!store.exists());
    }
}
