//! Term-tagged replicated log with snapshot-based prefix truncation.

use super::command::ClusterCommand;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    /// 1-based log index.
    pub index: u64,
    pub command: ClusterCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSnapshot {
    /// Last log index the snapshot covers.
    pub last_index: u64,
    pub last_term: u64,
    /// Serialized FSM state at `last_index`.
    pub state: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedLog {
    entries: Vec<LogEntry>,
    pub snapshot: Option<LogSnapshot>,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.index)
            .or_else(|| self.snapshot.as_ref().map(|s| s.last_index))
            .unwrap_or(0)
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .or_else(|| self.snapshot.as_ref().map(|s| s.last_term))
            .unwrap_or(0)
    }

    pub fn append(&mut self, term: u64, command: ClusterCommand) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            term,
            index,
            command,
        });
        index
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        let first = self.entries.first()?.index;
        if index < first {
            return None;
        }
        self.entries.get((index - first) as usize)
    }

    /// Entries after `from`, exclusive.
    pub fn entries_after(&self, from: u64) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |e| e.index > from)
    }

    /// Number of live (untruncated) entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rough byte size of the live entries.
    pub fn byte_size(&self) -> u64 {
        bincode::serialized_size(&self.entries).unwrap_or(0)
    }

    /// Install a snapshot and drop the log prefix it covers.
    pub fn install_snapshot(&mut self, snapshot: LogSnapshot) {
        let covered = snapshot.last_index;
        self.entries.retain(|e| e.index > covered);
        self.snapshot = Some(snapshot);
    }
}
