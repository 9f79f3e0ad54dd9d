//! Typed events decoded from the install engine's output stream.
//!
//! The engine prints newline-delimited status text, one logical event per
//! line, optionally prefixed with an elapsed-time stamp:
//!
//! ```text
//! [00:03:12] Installing: [37/812] SkyUI_5_2_SE.7z
//! [00:04:01] Installing complete
//! MANUAL DOWNLOAD REQUIRED: https://example.com/f/123 -> downloads/mod.7z (requires login)
//! Corrupted file: downloads/broken_archive.7z
//! FATAL: disk full
//! ```
//!
//! Classification is a pure function over a single line; the only stateful
//! part is the aggregation of manual-download lines, which are batched and
//! flushed as one event at the next phase boundary so the consumer gets a
//! single consolidated list instead of one event per file.

use std::path::PathBuf;

use regex::Regex;

/// A file the engine cannot fetch unattended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManualDownload {
    pub url: String,
    pub target: PathBuf,
    pub reason: String,
}

/// One decoded event from the engine's output stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// In-place status for a phase: consumers overwrite the previous
    /// progress for the same phase rather than appending.
    Progress {
        phase: String,
        current: u64,
        total: u64,
        item: String,
    },
    /// Consolidated list of files needing manual placement. A suspend
    /// condition, not an error.
    ManualDownloadRequired(Vec<ManualDownload>),
    /// The engine found an artifact with a bad hash.
    CorruptedFile(PathBuf),
    PhaseComplete(String),
    FatalError(String),
    /// Any line that is not a control event, passed through raw.
    Log(String),
    /// Always the final event of a run.
    Exit(i32),
}

/// Per-line classification result, before manual-download aggregation.
#[derive(Clone, Debug, PartialEq, Eq)]
enum LineClass {
    Progress {
        phase: String,
        current: u64,
        total: u64,
        item: String,
    },
    Manual(ManualDownload),
    Corrupted(PathBuf),
    PhaseComplete(String),
    Fatal(String),
    Other,
}

pub struct LineClassifier {
    timestamp: Regex,
    progress: Regex,
    phase_done: Regex,
    manual: Regex,
    corrupted: Regex,
    fatal: Regex,
}

impl LineClassifier {
    pub fn new() -> Self {
        // All of these are literal patterns; construction cannot fail.
        Self {
            timestamp: Regex::new(r"^\[\d{2}:\d{2}:\d{2}\]\s*").unwrap(),
            progress: Regex::new(r"^(?P<phase>[A-Za-z][A-Za-z ]*?):\s*\[(?P<cur>\d+)/(?P<total>\d+)\]\s*(?P<item>.*)$").unwrap(),
            phase_done: Regex::new(r"^(?P<phase>[A-Za-z][A-Za-z ]*?) complete\.?$").unwrap(),
            manual: Regex::new(r"(?i)^manual download required:\s*(?P<url>\S+)\s*->\s*(?P<target>.+?)(?:\s*\((?P<reason>[^)]*)\))?$").unwrap(),
            corrupted: Regex::new(r"(?i)^(?:corrupted file|hash mismatch):\s*(?P<path>.+)$").unwrap(),
            fatal: Regex::new(r"^FATAL(?: ERROR)?:\s*(?P<msg>.+)$").unwrap(),
        }
    }

    fn classify(&self, raw: &str) -> LineClass {
        let line = self.timestamp.replace(raw.trim_end(), "");
        let line = line.trim();

        if let Some(c) = self.progress.captures(line) {
            return LineClass::Progress {
                phase: c["phase"].trim().to_string(),
                current: c["cur"].parse().unwrap_or(0),
                total: c["total"].parse().unwrap_or(0),
                item: c["item"].trim().to_string(),
            };
        }
        if let Some(c) = self.phase_done.captures(line) {
            return LineClass::PhaseComplete(c["phase"].trim().to_string());
        }
        if let Some(c) = self.manual.captures(line) {
            return LineClass::Manual(ManualDownload {
                url: c["url"].to_string(),
                target: PathBuf::from(c["target"].trim()),
                reason: c
                    .name("reason")
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default(),
            });
        }
        if let Some(c) = self.corrupted.captures(line) {
            return LineClass::Corrupted(PathBuf::from(c["path"].trim()));
        }
        if let Some(c) = self.fatal.captures(line) {
            return LineClass::Fatal(c["msg"].to_string());
        }
        LineClass::Other
    }
}

impl Default for LineClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns raw lines into `EngineEvent`s, batching manual-download lines
/// until the next phase boundary.
pub struct EventAssembler {
    classifier: LineClassifier,
    pending_manual: Vec<ManualDownload>,
}

impl EventAssembler {
    pub fn new() -> Self {
        Self {
            classifier: LineClassifier::new(),
            pending_manual: Vec::new(),
        }
    }

    /// Process one output line. Returns zero, one, or two events (a phase
    /// boundary first flushes any batched manual downloads).
    pub fn push_line(&mut self, line: &str) -> Vec<EngineEvent> {
        match self.classifier.classify(line) {
            LineClass::Progress {
                phase,
                current,
                total,
                item,
            } => vec![EngineEvent::Progress {
                phase,
                current,
                total,
                item,
            }],
            LineClass::Manual(dl) => {
                self.pending_manual.push(dl);
                Vec::new()
            }
            LineClass::PhaseComplete(phase) => {
                let mut events = self.flush_manual();
                events.push(EngineEvent::PhaseComplete(phase));
                events
            }
            LineClass::Corrupted(path) => vec![EngineEvent::CorruptedFile(path)],
            LineClass::Fatal(msg) => vec![EngineEvent::FatalError(msg)],
            LineClass::Other => vec![EngineEvent::Log(line.trim_end().to_string())],
        }
    }

    /// Flush any batched manual downloads (also called before the exit
    /// event, so nothing is lost when the engine stops mid-phase).
    pub fn flush_manual(&mut self) -> Vec<EngineEvent> {
        if self.pending_manual.is_empty() {
            Vec::new()
        } else {
            vec![EngineEvent::ManualDownloadRequired(std::mem::take(
                &mut self.pending_manual,
            ))]
        }
    }
}

impl Default for EventAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines_parse_with_and_without_timestamp() {
        let mut a = EventAssembler::new();
        let events = a.push_line("[00:03:12] Installing: [37/812] SkyUI_5_2_SE.7z");
        assert_eq!(
            events,
            vec![EngineEvent::Progress {
                phase: "Installing".to_string(),
                current: 37,
                total: 812,
                item: "SkyUI_5_2_SE.7z".to_string(),
            }]
        );

        let events = a.push_line("Downloading: [1/3] mod.7z");
        assert!(matches!(
            &events[0],
            EngineEvent::Progress { phase, current: 1, total: 3, .. } if phase == "Downloading"
        ));
    }

    #[test]
    fn manual_downloads_aggregate_until_phase_boundary() {
        let mut a = EventAssembler::new();
        assert!(a
            .push_line("MANUAL DOWNLOAD REQUIRED: https://ex.com/a -> downloads/a.7z (requires login)")
            .is_empty());
        assert!(a
            .push_line("MANUAL DOWNLOAD REQUIRED: https://ex.com/b -> downloads/b.7z")
            .is_empty());

        let events = a.push_line("Downloading complete");
        assert_eq!(events.len(), 2);
        match &events[0] {
            EngineEvent::ManualDownloadRequired(list) => {
                assert_eq!(list.len(), 2);
                assert_eq!(list[0].url, "https://ex.com/a");
                assert_eq!(list[0].reason, "requires login");
                assert_eq!(list[1].target, PathBuf::from("downloads/b.7z"));
                assert!(list[1].reason.is_empty());
            }
            other => panic!("expected manual list first, got {:?}", other),
        }
        assert_eq!(
            events[1],
            EngineEvent::PhaseComplete("Downloading".to_string())
        );
    }

    #[test]
    fn corruption_and_fatal_lines() {
        let mut a = EventAssembler::new();
        assert_eq!(
            a.push_line("Corrupted file: downloads/broken.7z"),
            vec![EngineEvent::CorruptedFile(PathBuf::from(
                "downloads/broken.7z"
            ))]
        );
        assert_eq!(
            a.push_line("Hash mismatch: downloads/other.7z"),
            vec![EngineEvent::CorruptedFile(PathBuf::from(
                "downloads/other.7z"
            ))]
        );
        assert_eq!(
            a.push_line("FATAL: disk full"),
            vec![EngineEvent::FatalError("disk full".to_string())]
        );
    }

    #[test]
    fn unrecognized_lines_pass_through_as_log() {
        let mut a = EventAssembler::new();
        assert_eq!(
            a.push_line("jackhammer noises from the extraction pool"),
            vec![EngineEvent::Log(
                "jackhammer noises from the extraction pool".to_string()
            )]
        );
    }

    #[test]
    fn flush_recovers_manual_list_without_boundary() {
        let mut a = EventAssembler::new();
        a.push_line("MANUAL DOWNLOAD REQUIRED: https://ex.com/a -> downloads/a.7z");
        let events = a.flush_manual();
        assert_eq!(events.len(), 1);
        assert!(a.flush_manual().is_empty());
    }
}
