//! Bounded log of received output, with filtering and export.

use crate::protocol::{LogLevel, OutputMessage};
use chrono::SecondsFormat;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write;

/// Entries kept by default.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// A received message with a view-local id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub id: u64,
    #[serde(flatten)]
    pub message: OutputMessage,
}

impl LogEntry {
    #[must_use]
    pub fn level(&self) -> LogLevel {
        self.message.level()
    }

    /// `[timestamp] [LEVEL] data`
    #[must_use]
    pub fn to_text(&self) -> String {
        format!(
            "[{}] [{}] {}",
            self.message
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            self.level().as_str().to_uppercase(),
            self.message.data
        )
    }
}

/// Level and text criteria for output lines.
///
/// An empty level set matches every level; the query is matched
/// case-insensitively against the data with ANSI codes removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    levels: Vec<LogLevel>,
    query: Option<String>,
}

impl LogFilter {
    #[must_use]
    pub fn new(levels: Vec<LogLevel>, query: Option<&str>) -> Self {
        Self {
            levels,
            query: query.map(str::to_lowercase),
        }
    }

    #[must_use]
    pub fn matches(&self, message: &OutputMessage) -> bool {
        if !self.levels.is_empty() && !self.levels.contains(&message.level()) {
            return false;
        }
        self.query.as_ref().is_none_or(|query| {
            strip_ansi_escapes::strip_str(&message.data)
                .to_lowercase()
                .contains(query)
        })
    }
}

/// Retains the most recent `max_entries` messages, dropping the oldest.
#[derive(Debug, Clone)]
pub struct LogView {
    entries: VecDeque<LogEntry>,
    max_entries: usize,
    next_id: u64,
}

impl Default for LogView {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl LogView {
    #[must_use]
    pub const fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries,
            next_id: 0,
        }
    }

    /// Append a message. Returns its entry id.
    pub fn push(&mut self, message: OutputMessage) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(LogEntry { id, message });
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
        id
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = OutputMessage>) {
        for message in messages {
            self.push(message);
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entries matching `filter`, oldest first.
    #[must_use]
    pub fn filtered(&self, filter: &LogFilter) -> Vec<&LogEntry> {
        self.entries
            .iter()
            .filter(|entry| filter.matches(&entry.message))
            .collect()
    }

    /// Entries whose level is in `levels`. An empty set matches everything.
    #[must_use]
    pub fn filter_by_levels(&self, levels: &[LogLevel]) -> Vec<&LogEntry> {
        self.filtered(&LogFilter::new(levels.to_vec(), None))
    }

    /// Entries containing `query`, case-insensitive, ignoring ANSI codes.
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<&LogEntry> {
        self.filtered(&LogFilter::new(Vec::new(), Some(query)))
    }

    /// One `[timestamp] [LEVEL] data` line per entry.
    #[must_use]
    pub fn export_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            // Writing into a String cannot fail.
            let _ = writeln!(out, "{}", entry.to_text());
        }
        out
    }

    /// All entries as a pretty-printed JSON array.
    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.entries)
    }
}
