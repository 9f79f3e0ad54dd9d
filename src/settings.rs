//! Persisted application settings.
//!
//! One immutable `AppSettings` value is loaded at startup and passed by
//! reference into the orchestrator and supervisor constructors. The
//! `engine_flags` map is opaque to us: recognized keys are forwarded to the
//! engine invocation unchanged, nothing here interprets their semantics.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AppSettings {
    /// Path to the install engine binary. `None` means look up
    /// `modforge-engine` on `PATH`.
    pub engine_binary: Option<PathBuf>,
    /// Compatibility-tool version to assign to new shortcuts
    /// (e.g. "proton_experimental", "GE-Proton9-20").
    pub compat_tool: String,
    /// Where the credentials for the download service live (a file path or
    /// environment variable name, resolved by the engine). Never the key
    /// itself.
    pub api_key_ref: Option<String>,
    /// Optional engine feature toggles (e.g. multi-threaded extraction),
    /// forwarded verbatim as `--flag key=value` arguments.
    #[serde(default)]
    pub engine_flags: BTreeMap<String, String>,
    /// Grace period in seconds between SIGTERM and SIGKILL on cancellation.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,
    /// How long to wait for Steam/Proton to materialize a fresh
    /// compatibility-data directory before reporting a timeout.
    #[serde(default = "default_prefix_timeout")]
    pub prefix_timeout_secs: u64,
}

fn default_kill_grace() -> u64 {
    5
}

fn default_prefix_timeout() -> u64 {
    60
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            engine_binary: None,
            compat_tool: "proton_experimental".to_string(),
            api_key_ref: None,
            engine_flags: BTreeMap::new(),
            kill_grace_secs: default_kill_grace(),
            prefix_timeout_secs: default_prefix_timeout(),
        }
    }
}

impl AppSettings {
    fn get_path() -> PathBuf {
        crate::modforge_path!("settings.json")
    }

    pub fn load() -> Self {
        let path = Self::get_path();
        if path.exists() {
            if let Ok(content) = fs::read_to_string(&path) {
                if let Ok(settings) = serde_json::from_str(&content) {
                    return settings;
                }
            }
        }
        Self::default()
    }

    pub fn save(&self) {
        let path = Self::get_path();
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(json) = serde_json::to_string_pretty(self) {
            let _ = fs::write(path, json);
        }
    }

    /// Engine binary to invoke, falling back to PATH lookup.
    pub fn engine_program(&self) -> PathBuf {
        self.engine_binary
            .clone()
            .unwrap_or_else(|| PathBuf::from("modforge-engine"))
    }
}
