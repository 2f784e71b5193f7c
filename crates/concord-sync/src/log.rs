//! Concord Replicated Log
//!
//! The Raft log: a contiguous run of entries after an optional snapshot
//! prefix. Indexes are 1-based; index 0 is the empty-log sentinel with term 0.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

// =============================================================================
// Log Index
// =============================================================================

/// Index in the replicated log.
pub type LogIndex = u64;

/// Term number for Raft consensus.
pub type Term = u64;

// =============================================================================
// Log Entry
// =============================================================================

/// An entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub command: String,
    pub data: Value,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: impl Into<String>, data: Value) -> Self {
        Self {
            term,
            index,
            command: command.into(),
            data,
        }
    }
}

// =============================================================================
// Replicated Log
// =============================================================================

/// The replicated log for Raft consensus.
#[derive(Debug, Clone, Default)]
pub struct ReplicatedLog {
    entries: VecDeque<LogEntry>,
    snapshot_index: LogIndex,
    snapshot_term: Term,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log that continues after a snapshot prefix.
    pub fn from_parts(snapshot_index: LogIndex, snapshot_term: Term, entries: Vec<LogEntry>) -> Self {
        let entries = entries
            .into_iter()
            .skip_while(|e| e.index <= snapshot_index)
            .collect();
        Self {
            entries,
            snapshot_index,
            snapshot_term,
        }
    }

    /// Index of the first entry still held in memory.
    pub fn first_index(&self) -> LogIndex {
        self.snapshot_index + 1
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    /// Append a new entry at the next index with the given term.
    pub fn append_command(&mut self, term: Term, command: impl Into<String>, data: Value) -> LogIndex {
        let index = self.last_index() + 1;
        self.entries.push_back(LogEntry::new(term, index, command, data));
        index
    }

    /// Append an entry that must directly follow the current last index.
    pub fn append(&mut self, entry: LogEntry) -> LogIndex {
        debug_assert_eq!(entry.index, self.last_index() + 1, "log entries must be contiguous");
        let index = entry.index;
        self.entries.push_back(entry);
        index
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.first_index()) as usize)
    }

    /// Up to `max` entries starting at `start`.
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Vec<LogEntry> {
        let start = start.max(self.first_index());
        let offset = (start - self.first_index()) as usize;
        self.entries.iter().skip(offset).take(max).cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries
            .back()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Term at `index`: 0 for the sentinel, the snapshot term at the snapshot
    /// boundary, `None` when compacted away or beyond the end.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Drop `index` and everything after it.
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index <= self.snapshot_index {
            self.entries.clear();
            return;
        }
        self.entries.truncate((index - self.first_index()) as usize);
    }

    /// Discard entries up to and including `up_to`, recording it as the
    /// snapshot boundary.
    pub fn compact(&mut self, up_to: LogIndex, term: Term) {
        if up_to <= self.snapshot_index {
            return;
        }
        let remove = ((up_to - self.snapshot_index) as usize).min(self.entries.len());
        self.entries.drain(..remove);
        self.snapshot_index = up_to;
        self.snapshot_term = term;
    }

    /// Discard the whole log in favour of a snapshot boundary.
    pub fn reset_to_snapshot(&mut self, index: LogIndex, term: Term) {
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Number of entries held in memory.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a candidate log ending at `(last_log_index, last_log_term)` is
    /// at least as up-to-date as this one.
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let our_term = self.last_term();
        last_log_term > our_term
            || (last_log_term == our_term && last_log_index >= self.last_index())
    }

    /// First incoming entry whose index is held locally with a different term.
    pub fn find_conflict(&self, entries: &[LogEntry]) -> Option<LogIndex> {
        entries.iter().find_map(|entry| match self.term_at(entry.index) {
            Some(term) if term != entry.term => Some(entry.index),
            _ => None,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
