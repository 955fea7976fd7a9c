//! Bounded in-process log ring with per-entry read flags.
//!
//! This is the user-facing log surface (TUI footer badge, `/api/logs`);
//! operator logging goes through `tracing` separately.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_LOG_CAPACITY: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub read: bool,
}

/// Query filter for `entries()`. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub level: Option<LogLevel>,
    pub source: Option<String>,
    pub pane_id: Option<String>,
    pub unread_only: bool,
}

#[derive(Debug)]
pub struct LogRing {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_id: u64,
}

impl Default for LogRing {
    fn default() -> Self {
        LogRing::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        LogRing {
            entries: VecDeque::with_capacity(capacity.min(256)),
            capacity: capacity.max(1),
            next_id: 1,
        }
    }

    pub fn push(
        &mut self,
        level: LogLevel,
        source: impl Into<String>,
        message: impl Into<String>,
        pane_id: Option<String>,
        now: DateTime<Utc>,
    ) -> u64 {
        self.push_with_stack(level, source, message, pane_id, None, now)
    }

    pub fn push_with_stack(
        &mut self,
        level: LogLevel,
        source: impl Into<String>,
        message: impl Into<String>,
        pane_id: Option<String>,
        stack: Option<String>,
        now: DateTime<Utc>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            id,
            timestamp: now,
            level,
            source: source.into(),
            message: message.into(),
            pane_id,
            stack,
            read: false,
        });
        id
    }

    pub fn entries(&self, filter: &LogFilter) -> Vec<&LogEntry> {
        self.entries
            .iter()
            .filter(|e| filter.level.is_none_or(|l| e.level == l))
            .filter(|e| {
                filter
                    .source
                    .as_deref()
                    .is_none_or(|s| e.source == s)
            })
            .filter(|e| {
                filter
                    .pane_id
                    .as_deref()
                    .is_none_or(|p| e.pane_id.as_deref() == Some(p))
            })
            .filter(|e| !filter.unread_only || !e.read)
            .collect()
    }

    pub fn unread_count(&self, level: LogLevel) -> usize {
        self.entries
            .iter()
            .filter(|e| e.level == level && !e.read)
            .count()
    }

    /// Unread errors + warnings, the TUI footer badge number.
    pub fn unread_attention_count(&self) -> usize {
        self.unread_count(LogLevel::Error) + self.unread_count(LogLevel::Warn)
    }

    pub fn mark_as_read(&mut self, ids: &[u64]) {
        for entry in self.entries.iter_mut() {
            if ids.contains(&entry.id) {
                entry.read = true;
            }
        }
    }

    pub fn mark_level_as_read(&mut self, level: LogLevel) {
        for entry in self.entries.iter_mut() {
            if entry.level == level {
                entry.read = true;
            }
        }
    }

    pub fn mark_all_as_read(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.read = true;
        }
    }

    pub fn clear_for_pane(&mut self, pane_id: &str) {
        self.entries
            .retain(|e| e.pane_id.as_deref() != Some(pane_id));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> LogRing {
        LogRing::new(4)
    }

    #[test]
    fn ring_is_bounded() {
        let mut r = ring();
        for i in 0..10 {
            r.push(LogLevel::Info, "test", format!("m{i}"), None, Utc::now());
        }
        assert_eq!(r.len(), 4);
        let all = r.entries(&LogFilter::default());
        assert_eq!(all.first().unwrap().message, "m6");
        assert_eq!(all.last().unwrap().message, "m9");
    }

    #[test]
    fn ids_are_monotonic_across_eviction() {
        let mut r = ring();
        let mut last = 0;
        for _ in 0..10 {
            let id = r.push(LogLevel::Debug, "t", "m", None, Utc::now());
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn unread_counts_track_reads() {
        let mut r = ring();
        let a = r.push(LogLevel::Error, "t", "boom", None, Utc::now());
        r.push(LogLevel::Warn, "t", "hmm", None, Utc::now());
        assert_eq!(r.unread_attention_count(), 2);

        r.mark_as_read(&[a]);
        assert_eq!(r.unread_count(LogLevel::Error), 0);
        assert_eq!(r.unread_attention_count(), 1);

        r.mark_level_as_read(LogLevel::Warn);
        assert_eq!(r.unread_attention_count(), 0);
    }

    #[test]
    fn filters_are_conjunctive() {
        let mut r = LogRing::new(16);
        r.push(LogLevel::Info, "merge", "a", Some("p1".into()), Utc::now());
        r.push(LogLevel::Error, "merge", "b", Some("p1".into()), Utc::now());
        r.push(LogLevel::Error, "analyzer", "c", Some("p2".into()), Utc::now());

        let got = r.entries(&LogFilter {
            level: Some(LogLevel::Error),
            pane_id: Some("p1".into()),
            ..LogFilter::default()
        });
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message, "b");
    }

    #[test]
    fn clear_for_pane_drops_only_that_pane() {
        let mut r = LogRing::new(16);
        r.push(LogLevel::Info, "t", "a", Some("p1".into()), Utc::now());
        r.push(LogLevel::Info, "t", "b", Some("p2".into()), Utc::now());
        r.push(LogLevel::Info, "t", "c", None, Utc::now());
        r.clear_for_pane("p1");
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn unread_only_filter() {
        let mut r = LogRing::new(16);
        let a = r.push(LogLevel::Info, "t", "a", None, Utc::now());
        r.push(LogLevel::Info, "t", "b", None, Utc::now());
        r.mark_as_read(&[a]);
        let unread = r.entries(&LogFilter {
            unread_only: true,
            ..LogFilter::default()
        });
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].message, "b");
    }
}
