//! Durable storage for term, vote and log.
//!
//! The node calls `save_state` synchronously, while still holding its lock,
//! every time one of the persistent fields changes and before any reply that
//! depends on the change leaves the peer.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::raft::log::{LogEntry, RaftLog};
use crate::raft::state::RaftState;

/// Byte-blob store for a peer's persistent state
pub trait Persister: Send + Sync {
    fn save_state(&self, state: Vec<u8>) -> Result<()>;

    /// Previously saved blob; empty means "no prior state"
    fn load_state(&self) -> Result<Vec<u8>>;
}

/// The fields that must survive a crash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    /// Real entries only; the sentinel is implied
    pub log: Vec<LogEntry>,
}

impl PersistentState {
    pub fn capture(state: &RaftState) -> Self {
        Self {
            current_term: state.current_term,
            voted_for: state.voted_for,
            log: state.log.entries().to_vec(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a saved blob. An empty blob yields `None`.
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(data)?))
    }

    pub fn into_state(self) -> Result<RaftState> {
        let log = RaftLog::from_entries(self.log)
            .ok_or_else(|| RaftError::CorruptState("log indices are not contiguous".to_string()))?;
        if log.last_term() > self.current_term {
            return Err(RaftError::CorruptState(format!(
                "log term {} ahead of current term {}",
                log.last_term(),
                self.current_term
            )));
        }
        Ok(RaftState::restore(self.current_term, self.voted_for, log))
    }
}

/// Load a peer record from `persister`, falling back to a fresh follower.
pub fn restore_state(persister: &dyn Persister) -> Result<RaftState> {
    match PersistentState::decode(&persister.load_state()?)? {
        Some(saved) => saved.into_state(),
        None => Ok(RaftState::new()),
    }
}

/// In-memory persister. Clones share the same blob, so a test can "crash" a
/// peer and hand the clone to its replacement.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersister {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the saved blob in bytes
    pub fn state_size(&self) -> usize {
        self.data.lock().map(|d| d.len()).unwrap_or(0)
    }
}

impl Persister for MemoryPersister {
    fn save_state(&self, state: Vec<u8>) -> Result<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| RaftError::CorruptState("persister lock poisoned".to_string()))?;
        *data = state;
        Ok(())
    }

    fn load_state(&self) -> Result<Vec<u8>> {
        let data = self
            .data
            .lock()
            .map_err(|_| RaftError::CorruptState("persister lock poisoned".to_string()))?;
        Ok(data.clone())
    }
}

/// File-backed persister.
///
/// Keeps the whole blob in `raft-state.json` inside a directory; each save is
/// written to a temp file, synced, then renamed over the old one.
#[derive(Debug)]
pub struct FilePersister {
    dir: PathBuf,
}

impl FilePersister {
    /// Creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("raft-state.json")
    }
}

impl Persister for FilePersister {
    fn save_state(&self, state: Vec<u8>) -> Result<()> {
        let temp_path = self.dir.join("raft-state.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&state)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;
        Ok(())
    }

    fn load_state(&self) -> Result<Vec<u8>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(fs::read(path)?)
    }
}
