//! A bounded, queryable record of what happened in the scheduler.
//!
//! Every entry is also emitted as a `tracing` event, so the log book is only needed
//! by callers who want to inspect diagnostics after the fact (tests, debug overlays...).

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::sync::{lock, Mutex};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Info => "Info",
            Level::Warning => "Warning",
            Level::Error => "Error",
        })
    }
}

#[derive(Clone, Debug)]
pub struct Entry {
    pub level: Level,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} @ {}", self.level, self.message, self.timestamp.to_rfc3339())
    }
}

#[derive(Clone, Debug, Default)]
pub struct SearchResults {
    pub total: usize,
    pub results: Vec<Entry>,
}

pub struct LogBook {
    entries: Mutex<VecDeque<Entry>>,
    capacity: usize,
}

impl LogBook {
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Once `capacity` entries are stored, the oldest ones are dropped.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        LogBook {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(Self::DEFAULT_CAPACITY))),
            capacity,
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.record(Level::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.record(Level::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{}", message);
        self.record(Level::Error, message);
    }

    fn record(&self, level: Level, message: String) {
        let mut entries = lock(&self.entries);
        if entries.len() == self.capacity {
            entries.pop_front();
        }

        entries.push_back(Entry {
            level,
            message,
            timestamp: Utc::now(),
        });
    }

    /// The stored entries, oldest first, optionally restricted to one level.
    pub fn entries(&self, level: Option<Level>) -> Vec<Entry> {
        lock(&self.entries)
            .iter()
            .filter(|entry| level.map_or(true, |level| entry.level == level))
            .cloned()
            .collect()
    }

    /// Entries whose message contains `needle`, optionally restricted to one level.
    pub fn search(&self, needle: &str, level: Option<Level>) -> SearchResults {
        let results: Vec<Entry> = lock(&self.entries)
            .iter()
            .filter(|entry| level.map_or(true, |level| entry.level == level))
            .filter(|entry| entry.message.contains(needle))
            .cloned()
            .collect();

        SearchResults {
            total: results.len(),
            results,
        }
    }

    pub fn len(&self) -> usize { lock(&self.entries).len() }

    pub fn is_empty(&self) -> bool { lock(&self.entries).is_empty() }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

impl Default for LogBook {
    fn default() -> Self {
        LogBook::with_capacity(Self::DEFAULT_CAPACITY)
    }
}

impl fmt::Debug for LogBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogBook")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[test]
fn log_book_search() {
    let log = LogBook::default();
    log.info("initialized using up to 4 workers");
    log.warning("task#3 already resolved, discarding span #1");
    log.error("task#3 rejected: span #0 failed: boom");

    assert_eq!(log.len(), 3);
    assert_eq!(log.entries(Some(Level::Warning)).len(), 1);

    let found = log.search("task#3", None);
    assert_eq!(found.total, 2);
    assert_eq!(found.results[0].level, Level::Warning);

    let found = log.search("task#3", Some(Level::Error));
    assert_eq!(found.total, 1);
    assert!(found.results[0].to_string().starts_with("Error: task#3 rejected"));

    assert_eq!(log.search("nothing like this", None).total, 0);

    log.clear();
    assert!(log.is_empty());
}

#[test]
fn log_book_drops_oldest() {
    let log = LogBook::with_capacity(2);
    log.info("one");
    log.info("two");
    log.info("three");

    let messages: Vec<String> = log.entries(None).into_iter().map(|e| e.message).collect();
    assert_eq!(messages, vec!["two".to_string(), "three".to_string()]);
}
