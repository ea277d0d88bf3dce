use serde::{Deserialize, Serialize};

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, command: impl Into<Vec<u8>>) -> Self {
        Self {
            term,
            index,
            command: command.into(),
        }
    }

    fn sentinel() -> Self {
        Self {
            term: 0,
            index: 0,
            command: Vec::new(),
        }
    }
}

/// The replicated log.
///
/// Slot 0 always holds a sentinel (term 0, no command) so that
/// `prev_log_index = 0` has a well-defined term. Real entries are 1-indexed
/// and an entry's `index` always equals its position.
#[derive(Debug, Clone)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: vec![LogEntry::sentinel()],
        }
    }

    /// Rebuild a log from persisted entries (sentinel excluded).
    ///
    /// Returns `None` if the entries are not a gapless run starting at 1.
    pub fn from_entries(entries: Vec<LogEntry>) -> Option<Self> {
        let mut log = Self::new();
        for (pos, entry) in entries.into_iter().enumerate() {
            if entry.index != pos as u64 + 1 {
                return None;
            }
            log.entries.push(entry);
        }
        Some(log)
    }

    pub fn last_index(&self) -> u64 {
        (self.entries.len() - 1) as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Number of real entries (sentinel excluded)
    pub fn len(&self) -> usize {
        self.entries.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Term of the entry at `index`; the sentinel answers for index 0.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.entries.get(index as usize).map(|e| e.term)
    }

    /// Get log entry at index (1-indexed)
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize)
    }

    /// Entries from `start` (inclusive) through the end of the log
    pub fn entries_from(&self, start: u64) -> Vec<LogEntry> {
        let start = start.max(1) as usize;
        if start >= self.entries.len() {
            return Vec::new();
        }
        self.entries[start..].to_vec()
    }

    /// Entries in `start..=end`, clamped to the log
    pub fn slice(&self, start: u64, end: u64) -> Vec<LogEntry> {
        let start = start.max(1) as usize;
        let end = (end as usize).min(self.entries.len() - 1);
        if start > end {
            return Vec::new();
        }
        self.entries[start..=end].to_vec()
    }

    /// Append a new command at the tail, returning its index
    pub fn append(&mut self, term: u64, command: Vec<u8>) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            term,
            index,
            command,
        });
        index
    }

    /// Place `entries` after `prev_index`, assuming the caller has already
    /// verified the entry at `prev_index`.
    ///
    /// Existing entries that agree with the incoming ones are left alone; the
    /// log is truncated only at the first index whose term differs. A
    /// duplicated or reordered request therefore never shortens the log.
    /// Returns true if the log changed.
    pub fn merge(&mut self, prev_index: u64, entries: &[LogEntry]) -> bool {
        let mut changed = false;
        for (offset, entry) in entries.iter().enumerate() {
            let index = prev_index + 1 + offset as u64;
            match self.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.entries.truncate(index as usize);
                    changed = true;
                }
                None => {}
            }
            self.entries.push(LogEntry {
                term: entry.term,
                index,
                command: entry.command.clone(),
            });
            changed = true;
        }
        changed
    }

    /// First index of the run of entries that share the term found at
    /// `index`, scanning back no further than index 1.
    ///
    /// A leader that resends from here skips a whole mismatched term in one
    /// round trip.
    pub fn first_index_of_term_run(&self, index: u64) -> u64 {
        let Some(term) = self.term_at(index) else {
            return self.last_index() + 1;
        };
        let mut first = index;
        while first > 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first.max(1)
    }

    /// Entries without the sentinel, in index order
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries[1..]
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}
