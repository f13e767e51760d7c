// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded in-memory log of plugin lifecycle and runtime events.
//!
//! Entries are appended to a fixed-capacity ring; once full, the oldest entry
//! is evicted. Every entry is also emitted through `tracing`, so the buffer is
//! a convenience view for the admin API rather than the system of record.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use plugdesk_core::LogLevel;
use serde::Serialize;

/// Default number of entries retained.
pub const DEFAULT_CAPACITY: usize = 1000;

/// One diagnostic event.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub plugin: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Filter for [`LogBuffer::query`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub plugin: Option<String>,
    /// Minimum severity.
    pub level: Option<LogLevel>,
    pub limit: Option<usize>,
}

/// Thread-safe ring buffer of [`LogEntry`].
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogBuffer {
    /// Create a buffer holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append an entry, evicting the oldest one when full.
    pub fn log(
        &self,
        plugin: &str,
        level: LogLevel,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!(plugin = %plugin, "{message}"),
            LogLevel::Info => tracing::info!(plugin = %plugin, "{message}"),
            LogLevel::Warn => tracing::warn!(plugin = %plugin, "{message}"),
            LogLevel::Error => tracing::error!(plugin = %plugin, "{message}"),
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            plugin: plugin.to_string(),
            level,
            message,
            data,
        };

        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Most recent entries, newest first. `limit = 0` returns everything.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.query(&LogQuery {
            limit: Some(limit),
            ..LogQuery::default()
        })
    }

    /// All entries for one plugin, newest first.
    pub fn by_plugin(&self, plugin: &str) -> Vec<LogEntry> {
        self.query(&LogQuery {
            plugin: Some(plugin.to_string()),
            ..LogQuery::default()
        })
    }

    /// All entries at or above `level`, newest first.
    pub fn by_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.query(&LogQuery {
            level: Some(level),
            ..LogQuery::default()
        })
    }

    /// Filtered entries, newest first.
    pub fn query(&self, query: &LogQuery) -> Vec<LogEntry> {
        let limit = match query.limit {
            Some(0) | None => usize::MAX,
            Some(n) => n,
        };
        self.lock()
            .iter()
            .rev()
            .filter(|e| query.plugin.as_deref().is_none_or(|p| e.plugin == p))
            .filter(|e| query.level.is_none_or(|l| e.level >= l))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Number of retained entries.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Maximum number of retained entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<LogEntry>> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn evicts_oldest_when_full() {
        let buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.log("p", LogLevel::Info, format!("m{i}"), None);
        }
        assert_eq!(buffer.count(), 3);
        let messages: Vec<_> = buffer.recent(0).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["m4", "m3", "m2"]);
    }

    #[test]
    fn recent_respects_limit() {
        let buffer = LogBuffer::new(10);
        for i in 0..4 {
            buffer.log("p", LogLevel::Info, format!("m{i}"), None);
        }
        let recent = buffer.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "m3");
    }

    #[test]
    fn filters_by_plugin_and_level() {
        let buffer = LogBuffer::new(10);
        buffer.log("a", LogLevel::Info, "loaded", None);
        buffer.log("b", LogLevel::Error, "trap", None);
        buffer.log("a", LogLevel::Warn, "slow", None);

        assert_eq!(buffer.by_plugin("a").len(), 2);
        let severe = buffer.by_level(LogLevel::Warn);
        assert_eq!(severe.len(), 2);
        assert_eq!(severe[0].message, "slow");

        let combined = buffer.query(&LogQuery {
            plugin: Some("a".into()),
            level: Some(LogLevel::Warn),
            limit: None,
        });
        assert_eq!(combined.len(), 1);
    }

    #[test]
    fn clear_empties_buffer() {
        let buffer = LogBuffer::default();
        assert_eq!(buffer.capacity(), DEFAULT_CAPACITY);
        buffer.log("p", LogLevel::Debug, "x", Some(serde_json::json!({"k": 1})));
        buffer.clear();
        assert_eq!(buffer.count(), 0);
    }

    #[test]
    #[traced_test]
    fn entries_are_mirrored_to_tracing() {
        let buffer = LogBuffer::new(4);
        buffer.log("mailer", LogLevel::Warn, "smtp relay unreachable", None);
        assert!(logs_contain("smtp relay unreachable"));
        assert!(logs_contain("mailer"));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let buffer = LogBuffer::new(0);
        buffer.log("p", LogLevel::Info, "one", None);
        buffer.log("p", LogLevel::Info, "two", None);
        assert_eq!(buffer.count(), 1);
    }

    #[test]
    fn concurrent_writers_do_not_lose_capacity_bound() {
        let buffer = std::sync::Arc::new(LogBuffer::new(50));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        buffer.log(&format!("p{t}"), LogLevel::Info, format!("{i}"), None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(buffer.count(), 50);
    }
}
