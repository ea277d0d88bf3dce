use std::collections::HashSet;
use std::time::Duration;

use crate::error::{RaftError, Result};

/// Tuning for a single Raft peer.
///
/// The election timeout is a base value `T`; each peer draws its actual
/// timeout from `[T, 2T)`. The heartbeat interval must stay strictly below
/// `T` or followers will start spurious elections between heartbeats.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    /// Ids of every other peer in the (fixed) cluster.
    pub peers: Vec<u64>,
    pub election_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Capacity of each event queue (heartbeat, vote granted, leader elected).
    pub event_buffer: usize,
    /// Seed for the election timeout source. `None` seeds from OS entropy.
    pub rng_seed: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            peers: Vec::new(),
            election_timeout_ms: 400,
            heartbeat_interval_ms: 100,
            event_buffer: 16,
            rng_seed: None,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u64) -> Self {
        self.peers.push(node_id);
        self
    }

    pub fn with_peers(mut self, peers: impl IntoIterator<Item = u64>) -> Self {
        self.peers.extend(peers);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Total number of peers, including this one.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Smallest number of peers (self included) that forms a strict majority.
    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(RaftError::InvalidConfig(
                "timeouts must be non-zero".to_string(),
            ));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_ms {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat interval {}ms must be below election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_ms
            )));
        }
        if self.event_buffer == 0 {
            return Err(RaftError::InvalidConfig(
                "event buffer must hold at least one signal".to_string(),
            ));
        }
        if self.peers.contains(&self.node_id) {
            return Err(RaftError::InvalidConfig(format!(
                "node {} lists itself as a peer",
                self.node_id
            )));
        }
        let unique: HashSet<_> = self.peers.iter().collect();
        if unique.len() != self.peers.len() {
            return Err(RaftError::InvalidConfig("duplicate peer ids".to_string()));
        }
        Ok(())
    }
}

/// Behaviour of the in-process network used to connect peers.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// When false, requests and replies may be delayed or dropped.
    pub reliable: bool,
    /// Probability of losing a request (and, separately, its reply).
    pub drop_rate: f64,
    /// Upper bound on the random delivery delay in unreliable mode.
    pub max_delay_ms: u64,
    /// Upper bound on how long a call to a disconnected peer takes to fail.
    pub unreachable_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            reliable: true,
            drop_rate: 0.1,
            max_delay_ms: 27,
            unreachable_delay_ms: 100,
        }
    }
}

impl NetworkConfig {
    pub fn unreliable() -> Self {
        Self {
            reliable: false,
            ..Default::default()
        }
    }
}
