//! Progress records and the session log.

use std::fmt;
use std::time::SystemTime;

/// Progress of one file in a flash operation.
///
/// Built fresh after every acknowledged block and handed to the callback by
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Index of the file being written.
    pub file_index: usize,
    /// Image bytes written so far.
    pub written: usize,
    /// Size of the image.
    pub total: usize,
}

impl Progress {
    /// Completion in percent, `0.0..=100.0`.
    ///
    /// Exactly `100.0` once `written == total`, and for empty images.
    #[must_use]
    pub fn percentage(&self) -> f32 {
        if self.total == 0 || self.written >= self.total {
            return 100.0;
        }
        (self.written as f64 * 100.0 / self.total as f64) as f32
    }

    /// Whether the file is fully written.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.written >= self.total
    }
}

/// Severity of a session log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Severity {
    /// Informational.
    Info,
    /// An operation completed.
    Success,
    /// An operation failed.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One line of the session log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// When the entry was written.
    pub timestamp: SystemTime,
    /// Entry severity.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
}

impl LogEntry {
    /// Create an entry stamped with the current time.
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            severity,
            message: message.into(),
        }
    }
}

/// Receiver of user-facing session log entries.
pub trait LogSink: Send {
    /// Record one entry.
    fn log(&mut self, entry: LogEntry);
}

impl<F> LogSink for F
where
    F: FnMut(LogEntry) + Send,
{
    fn log(&mut self, entry: LogEntry) {
        self(entry);
    }
}

/// Append-only in-memory log.
#[derive(Debug, Clone, Default)]
pub struct LogBook {
    entries: Vec<LogEntry>,
}

impl LogBook {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries in the order they were written.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl LogSink for LogBook {
    fn log(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_reaches_exactly_100() {
        let p = Progress {
            file_index: 0,
            written: 3,
            total: 3,
        };
        assert_eq!(p.percentage(), 100.0);
        assert!(p.is_complete());
    }

    #[test]
    fn test_percentage_quarters() {
        let total = 64 * 1024;
        let values: Vec<f32> = (1..=4)
            .map(|i| {
                Progress {
                    file_index: 0,
                    written: i * 16 * 1024,
                    total,
                }
                .percentage()
            })
            .collect();
        assert_eq!(values, vec![25.0, 50.0, 75.0, 100.0]);
    }

    #[test]
    fn test_empty_total_is_complete() {
        let p = Progress {
            file_index: 1,
            written: 0,
            total: 0,
        };
        assert_eq!(p.percentage(), 100.0);
    }

    #[test]
    fn test_logbook_append_and_clear() {
        let mut book = LogBook::new();
        book.log(LogEntry::new(Severity::Info, "Connecting"));
        book.log(LogEntry::new(Severity::Success, "Connected"));
        assert_eq!(book.len(), 2);
        assert_eq!(book.entries()[1].severity, Severity::Success);
        assert!(book.entries()[0].timestamp <= book.entries()[1].timestamp);

        book.clear();
        assert!(book.is_empty());
    }

    #[test]
    fn test_closure_sink() {
        let mut seen = Vec::new();
        {
            let mut sink = |entry: LogEntry| seen.push(entry.message);
            sink.log(LogEntry::new(Severity::Error, "boom"));
        }
        assert_eq!(seen, vec!["boom".to_string()]);
    }
}
