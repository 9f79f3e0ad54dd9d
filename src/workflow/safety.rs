//! Directory safety validation
//!
//! A mistyped install directory must never point a bulk file operation at
//! the filesystem root or a system directory. Accepted fresh directories
//! get an install marker so later runs can tell a managed install from an
//! arbitrary folder, and refuse to reuse one created by an incompatible
//! workflow or tool version.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::WorkflowKind;
use crate::error::WorkflowError;
use crate::logging::{log_info, log_warning};

/// Marker file written into every managed install directory.
pub const MARKER_FILE: &str = ".modforge_install.json";

/// Roots that must never be install or download directories. A requested
/// path is also rejected when it is an ancestor of one of these (so `/`
/// falls to the `/home` entry).
const DENY_LIST: [&str; 10] = [
    "/", "/home", "/usr", "/etc", "/var", "/boot", "/bin", "/lib", "/opt", "/root",
];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallMarker {
    pub tool_version: String,
    pub created_at: String,
    pub workflow: WorkflowKind,
}

impl InstallMarker {
    fn current(workflow: WorkflowKind) -> Self {
        Self {
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: chrono::Local::now().to_rfc3339(),
            workflow,
        }
    }

    fn major(version: &str) -> &str {
        version.split('.').next().unwrap_or(version)
    }

    fn compatible_with(&self, workflow: WorkflowKind) -> Option<String> {
        if self.workflow != workflow {
            return Some(format!(
                "directory was set up by a {:?} workflow, this run is {:?}",
                self.workflow, workflow
            ));
        }
        let current = env!("CARGO_PKG_VERSION");
        if Self::major(&self.tool_version) != Self::major(current) {
            return Some(format!(
                "directory was set up by tool version {}, this is {}",
                self.tool_version, current
            ));
        }
        None
    }
}

fn normalized(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}

/// The deny check alone: equal to a denied root, an ancestor of one, or
/// the user's home directory itself.
fn deny_reason(path: &Path) -> Option<String> {
    let path = normalized(path);

    if !path.is_absolute() {
        return Some("install directory must be an absolute path".to_string());
    }

    for denied in DENY_LIST {
        let denied = Path::new(denied);
        if path == denied {
            return Some(format!("{} is a protected system path", path.display()));
        }
        if denied.starts_with(&path) {
            return Some(format!(
                "{} contains the protected path {}",
                path.display(),
                denied.display()
            ));
        }
    }

    if let Some(home) = dirs::home_dir() {
        if path == normalized(&home) {
            return Some("refusing to install directly into the home directory".to_string());
        }
    }

    None
}

fn marker_path(dir: &Path) -> PathBuf {
    dir.join(MARKER_FILE)
}

fn read_marker(dir: &Path) -> Option<InstallMarker> {
    let content = fs::read_to_string(marker_path(dir)).ok()?;
    serde_json::from_str(&content).ok()
}

fn write_marker(dir: &Path, workflow: WorkflowKind) -> Result<(), WorkflowError> {
    fs::create_dir_all(dir)?;
    let marker = InstallMarker::current(workflow);
    let content = serde_json::to_string_pretty(&marker).map_err(std::io::Error::other)?;
    fs::write(marker_path(dir), content)?;
    log_info(&format!("Marked {} as a managed install", dir.display()));
    Ok(())
}

/// Deny-list check only, for directories that carry no install marker
/// (download directories).
pub fn validate_path(dir: &Path) -> Result<(), WorkflowError> {
    match deny_reason(dir) {
        Some(reason) => Err(WorkflowError::DirectorySafetyViolation {
            path: dir.to_path_buf(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Validate an install directory for a workflow run.
///
/// Rejects dangerous paths outright. A fresh directory is created and
/// marked; an already-marked directory is only accepted when its marker
/// is compatible with this run.
pub fn validate(dir: &Path, workflow: WorkflowKind) -> Result<(), WorkflowError> {
    validate_inner(dir, workflow, false)
}

/// Like `validate`, but accepts an incompatible install marker. The
/// deny-list is still enforced; no override makes `/usr` an install dir.
pub fn validate_with_override(dir: &Path, workflow: WorkflowKind) -> Result<(), WorkflowError> {
    validate_inner(dir, workflow, true)
}

fn validate_inner(
    dir: &Path,
    workflow: WorkflowKind,
    override_marker: bool,
) -> Result<(), WorkflowError> {
    if let Some(reason) = deny_reason(dir) {
        return Err(WorkflowError::DirectorySafetyViolation {
            path: dir.to_path_buf(),
            reason,
        });
    }

    match read_marker(dir) {
        Some(marker) => {
            if let Some(reason) = marker.compatible_with(workflow) {
                if override_marker {
                    log_warning(&format!(
                        "Overriding install marker check for {}: {}",
                        dir.display(),
                        reason
                    ));
                } else {
                    return Err(WorkflowError::DirectorySafetyViolation {
                        path: dir.to_path_buf(),
                        reason,
                    });
                }
            }
            Ok(())
        }
        None => write_marker(dir, workflow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_roots_are_rejected() {
        for path in ["/", "/home", "/usr", "/etc", "/var/"] {
            let err = validate(Path::new(path), WorkflowKind::InstallModlist).unwrap_err();
            assert!(
                matches!(err, WorkflowError::DirectorySafetyViolation { .. }),
                "{} should be rejected",
                path
            );
        }
    }

    #[test]
    fn home_directory_itself_is_rejected() {
        let home = dirs::home_dir().unwrap();
        assert!(validate(&home, WorkflowKind::InstallModlist).is_err());
    }

    #[test]
    fn fresh_directory_is_accepted_and_marked() {
        let dir = tempfile::tempdir().unwrap();
        let install = dir.path().join("Games/MyList");

        validate(&install, WorkflowKind::InstallModlist).unwrap();
        let marker = read_marker(&install).unwrap();
        assert_eq!(marker.workflow, WorkflowKind::InstallModlist);
        assert_eq!(marker.tool_version, env!("CARGO_PKG_VERSION"));

        // Re-validation with the same kind keeps working.
        validate(&install, WorkflowKind::InstallModlist).unwrap();
    }

    #[test]
    fn incompatible_marker_needs_the_override() {
        let dir = tempfile::tempdir().unwrap();
        let install = dir.path().join("List");

        validate(&install, WorkflowKind::InstallModlist).unwrap();
        assert!(validate(&install, WorkflowKind::ConfigureExisting).is_err());
        validate_with_override(&install, WorkflowKind::ConfigureExisting).unwrap();
    }

    #[test]
    fn override_never_bypasses_the_deny_list() {
        assert!(validate_with_override(Path::new("/usr"), WorkflowKind::InstallModlist).is_err());
    }

    #[test]
    fn marker_from_other_major_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let install = dir.path().join("List");
        fs::create_dir_all(&install).unwrap();
        let marker = InstallMarker {
            tool_version: "99.0.0".to_string(),
            created_at: chrono::Local::now().to_rfc3339(),
            workflow: WorkflowKind::InstallModlist,
        };
        fs::write(
            marker_path(&install),
            serde_json::to_string(&marker).unwrap(),
        )
        .unwrap();

        assert!(validate(&install, WorkflowKind::InstallModlist).is_err());
        validate_with_override(&install, WorkflowKind::InstallModlist).unwrap();
    }
}
