//! Modforge - Linux Modlist Installation Orchestrator
//!
//! Core library for installing Wabbajack-style modlists on Linux: drives
//! the external install engine, manages Steam's shortcut store, and
//! configures Proton prefixes. Shared between the CLI binary and any GUI
//! front end.

pub mod engine;
pub mod error;
pub mod logging;
pub mod paths;
pub mod prefix;
pub mod settings;
pub mod steam;
pub mod workflow;
