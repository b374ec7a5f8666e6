use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Severity classes of the build log. `Muted` is only ever produced by the
/// runtime demoting `Error`/`Warning`/`Overwrite` entries inside an active
/// error-suppression window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogState {
    Success,
    Info,
    Warning,
    Overwrite,
    Error,
    CriticalError,
    Muted,
    Ignore,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub state: LogState,
    pub message: String,
    /// Scope-stack depth active when the entry was produced.
    pub depth: usize,
    /// Source line index within the owning section, when tied to a command.
    pub line_idx: Option<usize>,
    /// Raw source text of the originating command, when tied to one.
    pub command: Option<String>,
}

impl LogEntry {
    pub fn new(state: LogState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            depth: 0,
            line_idx: None,
            command: None,
        }
    }

    pub fn at_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_command(mut self, raw: impl Into<String>, line_idx: usize) -> Self {
        self.command = Some(raw.into());
        self.line_idx = Some(line_idx);
        self
    }
}

/// Destination of structured build-log entries. The persistent sink itself is
/// an external collaborator; the runtime only guarantees the contract.
pub trait LogSink: Send + Sync {
    fn write(&self, entry: LogEntry);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn write(&self, _entry: LogEntry) {}
}

/// Records entries in memory. Used by tests and by deferred log export.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn count_state(&self, state: LogState) -> usize {
        self.snapshot()
            .iter()
            .filter(|entry| entry.state == state)
            .count()
    }
}

impl LogSink for MemoryLogSink {
    fn write(&self, entry: LogEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}
