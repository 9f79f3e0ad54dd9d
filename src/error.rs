//! Error taxonomy for the orchestration core.
//!
//! Anything touching shared persisted state (shortcuts store, compat-tool
//! config) fails closed: these errors are raised before a single byte is
//! written back.

use std::path::PathBuf;

use thiserror::Error;

/// Malformed shortcut store. Fatal: callers must abort without writing.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("shortcut store truncated at byte {0}")]
    Truncated(usize),
    #[error("unknown tag byte 0x{tag:02x} at byte {offset}")]
    BadTag { tag: u8, offset: usize },
    #[error("unbalanced map nesting (depth {depth} at end of input)")]
    UnbalancedMap { depth: usize },
    #[error("non-UTF-8 key or value at byte {offset}")]
    InvalidUtf8 { offset: usize },
    #[error("document root is not a \"shortcuts\" map")]
    BadRoot,
}

/// Failure while reading or rewriting the shortcut store file.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Prefix configuration failure. Mechanical sub-steps are retried once
/// internally before one of these surfaces.
#[derive(Debug, Error)]
pub enum ConfigureError {
    #[error("could not resolve an AppID for {0}")]
    AppIdResolution(String),
    #[error("failed to update compatibility-tool config: {0}")]
    CompatToolWrite(String),
    #[error("invalid compatibility-tool name: {0:?}")]
    InvalidToolName(String),
    #[error("compatibility data for AppID {app_id} did not appear within {seconds}s")]
    PrefixCreationTimeout { app_id: u32, seconds: u64 },
    #[error("shortcut store error: {0}")]
    Store(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConfigureError {
    /// Timeouts are worth retrying with backoff; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConfigureError::PrefixCreationTimeout { .. })
    }
}

/// Supervisor-level failure around the engine process itself.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn engine {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("engine exited with code {code}")]
    EngineCrash { code: i32, log_tail: Vec<String> },
}

/// Terminal workflow failure, carried inside `WorkflowResult::Failed`.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("directory rejected: {path}: {reason}")]
    DirectorySafetyViolation { path: PathBuf, reason: String },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Configure(#[from] ConfigureError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("engine reported a fatal error: {0}")]
    EngineFatal(String),
    #[error("could not locate a Steam installation")]
    SteamNotFound,
    #[error("Steam restart failed: {0}")]
    SteamRestartFailure(String),
    #[error("workflow is not suspended awaiting manual steps")]
    NotAwaitingManualSteps,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
