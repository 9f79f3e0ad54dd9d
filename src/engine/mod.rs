//! Install engine integration
//!
//! The engine is an external binary that does the heavy lifting of a
//! modlist install (downloads, extraction, BSA building). This module
//! owns its lifecycle: `events` decodes the output stream into typed
//! events, `supervisor` runs the process and guarantees teardown.

mod events;
mod supervisor;

pub use events::{EngineEvent, EventAssembler, LineClassifier, ManualDownload};
pub use supervisor::{EngineCommand, EngineHandle};
