use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::raft::apply::{apply_loop, ApplyMsg};
use crate::raft::election::{self, VoteOutcome};
use crate::raft::persist::{restore_state, PersistentState, Persister};
use crate::raft::replication::{self, AppendOutcome};
use crate::raft::rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::timer::ElectionTimer;
use crate::raft::transport::Transport;

/// Where a submitted command will land if it is ever committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub index: u64,
    pub term: u64,
}

/// Receiving ends of the signals that drive the role loop.
///
/// Each carries the term it was raised in. Senders use `try_send`, so a full
/// queue drops the signal; the loop only needs to know that one arrived.
#[derive(Debug)]
pub struct RaftEvents {
    heartbeat_rx: mpsc::Receiver<u64>,
    vote_granted_rx: mpsc::Receiver<u64>,
    leader_elected_rx: mpsc::Receiver<u64>,
}

/// A single Raft peer.
///
/// All consensus state lives in `state` behind one exclusive lock. RPC I/O is
/// always performed with the lock released; replies are checked for
/// staleness when they come back.
pub struct RaftNode {
    pub id: u64,
    pub state: Mutex<RaftState>,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    persister: Arc<dyn Persister>,
    heartbeat_tx: mpsc::Sender<u64>,
    vote_granted_tx: mpsc::Sender<u64>,
    leader_elected_tx: mpsc::Sender<u64>,
    commit_tx: watch::Sender<u64>,
    shutdown: CancellationToken,
}

impl RaftNode {
    /// Build a peer, restoring term, vote and log from `persister`.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        persister: Arc<dyn Persister>,
    ) -> Result<(Self, RaftEvents)> {
        config.validate()?;
        let state = restore_state(persister.as_ref())?;
        if state.current_term > 0 || !state.log.is_empty() {
            tracing::info!(
                node_id = config.node_id,
                term = state.current_term,
                log_len = state.log.len(),
                "Restored persisted state"
            );
        }

        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(config.event_buffer);
        let (vote_granted_tx, vote_granted_rx) = mpsc::channel(config.event_buffer);
        let (leader_elected_tx, leader_elected_rx) = mpsc::channel(config.event_buffer);
        let (commit_tx, _) = watch::channel(0);

        let node = Self {
            id: config.node_id,
            state: Mutex::new(state),
            config,
            transport,
            persister,
            heartbeat_tx,
            vote_granted_tx,
            leader_elected_tx,
            commit_tx,
            shutdown: CancellationToken::new(),
        };
        let events = RaftEvents {
            heartbeat_rx,
            vote_granted_rx,
            leader_elected_rx,
        };
        Ok((node, events))
    }

    /// Build a peer and spawn its role loop and applier. Committed commands
    /// are delivered on `apply_tx`.
    pub fn launch(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        persister: Arc<dyn Persister>,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Result<Arc<Self>> {
        let (node, events) = Self::new(config, transport, persister)?;
        let node = Arc::new(node);
        tokio::spawn(Arc::clone(&node).run(events));
        tokio::spawn(apply_loop(Arc::clone(&node), apply_tx));
        Ok(node)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Watch the commit index. The value is the latest commit index.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Best-effort shutdown. In-flight RPC tasks finish on their own and
    /// their replies are discarded.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(node_id = self.id, "Stopping node");
        }
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run the role state machine until `stop()` is called.
    pub async fn run(self: Arc<Self>, mut events: RaftEvents) {
        let mut timer = ElectionTimer::new(self.config.election_timeout_ms, self.config.rng_seed);
        let mut last_role = RaftRole::Follower;

        loop {
            if self.is_stopped() {
                break;
            }
            let (role, term) = {
                let state = self.state.lock().await;
                (state.role, state.current_term)
            };
            if role != last_role {
                tracing::debug!(node_id = self.id, from = %last_role, to = %role, term, "Role changed");
                last_role = role;
            }

            match role {
                RaftRole::Follower => {
                    let election_timeout = timer.next_timeout();
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        Some(_) = events.heartbeat_rx.recv() => {}
                        Some(_) = events.vote_granted_rx.recv() => {}
                        _ = tokio::time::sleep(election_timeout) => {
                            tracing::info!(
                                node_id = self.id,
                                timeout_ms = election_timeout.as_millis() as u64,
                                "Election timeout, starting election"
                            );
                            self.start_election().await;
                        }
                    }
                }
                RaftRole::Candidate => {
                    let deadline = Instant::now() + timer.next_timeout();
                    if !self.await_election(&mut events, deadline).await {
                        break;
                    }
                }
                RaftRole::Leader => {
                    self.broadcast_append_entries().await;
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.heartbeat_interval()) => {}
                    }
                }
            }
        }

        tracing::debug!(node_id = self.id, "Role loop exited");
    }

    /// Wait out one election round as candidate. Returns false on shutdown.
    async fn await_election(self: &Arc<Self>, events: &mut RaftEvents, deadline: Instant) -> bool {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => {
                    // A newer term seen in a vote reply demotes us silently
                    if self.state.lock().await.role == RaftRole::Candidate {
                        tracing::debug!(node_id = self.id, "Election round timed out");
                        self.start_election().await;
                    }
                    return true;
                }
                Some(_) = events.heartbeat_rx.recv() => {
                    // A current leader has already demoted us in its handler;
                    // a stale one has not, and the round keeps running.
                    if self.state.lock().await.role != RaftRole::Candidate {
                        return true;
                    }
                }
                Some(_) = events.vote_granted_rx.recv() => {
                    if self.state.lock().await.role != RaftRole::Candidate {
                        return true;
                    }
                }
                Some(term) = events.leader_elected_rx.recv() => {
                    let mut state = self.state.lock().await;
                    if state.current_term != term {
                        continue;
                    }
                    if state.become_leader(self.id, &self.config.peers) {
                        tracing::info!(
                            node_id = self.id,
                            term,
                            votes = state.votes_received,
                            "Became leader"
                        );
                    }
                    return true;
                }
            }
        }
    }

    /// Start a new election: bump the term, vote for self and ask every peer.
    async fn start_election(self: &Arc<Self>) {
        let req = {
            let mut state = self.state.lock().await;
            state.become_candidate(self.id);
            if self.persist(&mut state).is_err() {
                return;
            }
            if state.votes_received as usize >= self.config.majority() {
                // Single-peer cluster: our own vote is a majority
                signal(&self.leader_elected_tx, state.current_term);
            }
            election::vote_request(&state, self.id)
        };

        tracing::info!(node_id = self.id, term = req.term, "Starting election");

        for &peer_id in &self.config.peers {
            let node = Arc::clone(self);
            let req = req.clone();
            tokio::spawn(async move {
                node.request_vote_from(peer_id, req).await;
            });
        }
    }

    async fn request_vote_from(&self, peer_id: u64, req: VoteRequest) {
        let sent_term = req.term;
        let resp = match self.transport.request_vote(peer_id, req).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::trace!(node_id = self.id, peer_id, error = %e, "RequestVote failed");
                return;
            }
        };

        let mut state = self.state.lock().await;
        let outcome = election::handle_vote_response(
            &mut state,
            peer_id,
            sent_term,
            &resp,
            self.config.cluster_size(),
        );
        match outcome {
            VoteOutcome::SteppedDown => {
                if self.persist(&mut state).is_err() {
                    return;
                }
                tracing::info!(
                    node_id = self.id,
                    peer_id,
                    term = state.current_term,
                    "Saw newer term in vote reply, stepping down"
                );
            }
            VoteOutcome::Elected => {
                signal(&self.leader_elected_tx, sent_term);
            }
            VoteOutcome::Counted => {
                tracing::debug!(
                    node_id = self.id,
                    peer_id,
                    votes = state.votes_received,
                    "Received vote"
                );
            }
            VoteOutcome::Stale | VoteOutcome::Rejected => {}
        }
    }

    /// One replication round: a single AppendEntries per peer, sent
    /// concurrently. Also serves as the heartbeat.
    async fn broadcast_append_entries(self: &Arc<Self>) {
        let requests: Vec<(u64, AppendEntriesRequest)> = {
            let mut state = self.state.lock().await;
            if state.role != RaftRole::Leader {
                return;
            }
            if state.advance_leader_commit(self.config.cluster_size()) {
                self.commit_tx.send_replace(state.commit_index);
            }
            self.config
                .peers
                .iter()
                .filter_map(|&peer_id| {
                    replication::append_request_for(&state, peer_id, self.id)
                        .map(|req| (peer_id, req))
                })
                .collect()
        };

        for (peer_id, req) in requests {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                node.replicate_to(peer_id, req).await;
            });
        }
    }

    async fn replicate_to(&self, peer_id: u64, req: AppendEntriesRequest) {
        let resp = match self.transport.append_entries(peer_id, req.clone()).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::trace!(node_id = self.id, peer_id, error = %e, "AppendEntries failed");
                return;
            }
        };

        let mut state = self.state.lock().await;
        let outcome = replication::handle_append_response(
            &mut state,
            peer_id,
            &req,
            &resp,
            self.config.cluster_size(),
        );
        match outcome {
            AppendOutcome::SteppedDown => {
                if self.persist(&mut state).is_err() {
                    return;
                }
                tracing::info!(
                    node_id = self.id,
                    peer_id,
                    term = state.current_term,
                    "Saw newer term in AppendEntries reply, stepping down"
                );
            }
            AppendOutcome::Replicated {
                commit_advanced: true,
                ..
            } => {
                tracing::debug!(
                    node_id = self.id,
                    commit_index = state.commit_index,
                    "Updated commit index"
                );
                self.commit_tx.send_replace(state.commit_index);
            }
            AppendOutcome::Rejected { next_index } => {
                tracing::debug!(node_id = self.id, peer_id, next_index, "Follower rejected entries");
            }
            AppendOutcome::Replicated { .. } | AppendOutcome::Acknowledged | AppendOutcome::Stale => {}
        }
    }

    /// Submit a command. Only the leader accepts it; there is no guarantee it
    /// ever commits.
    pub async fn start(&self, command: Vec<u8>) -> Result<Proposal> {
        let mut state = self.state.lock().await;
        if self.is_stopped() {
            return Err(RaftError::Shutdown);
        }

        if state.role != RaftRole::Leader {
            return Err(RaftError::NotLeader {
                term: state.current_term,
                leader_id: state.leader_id,
            });
        }

        let index = state.append_command(command);
        let term = state.current_term;
        self.persist(&mut state)?;
        tracing::debug!(node_id = self.id, index, term, "Appended command to log");

        if state.advance_leader_commit(self.config.cluster_size()) {
            self.commit_tx.send_replace(state.commit_index);
        }

        Ok(Proposal { index, term })
    }

    /// Current term and whether this peer believes it is leader
    pub async fn get_state(&self) -> (u64, bool) {
        let state = self.state.lock().await;
        (state.current_term, state.role == RaftRole::Leader)
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == RaftRole::Leader
    }

    pub async fn leader_id(&self) -> Option<u64> {
        self.state.lock().await.leader_id
    }

    pub async fn commit_index(&self) -> u64 {
        self.state.lock().await.commit_index
    }

    pub async fn last_applied(&self) -> u64 {
        self.state.lock().await.last_applied
    }

    /// Handle incoming RequestVote RPC. A stopped peer refuses to answer.
    pub async fn handle_request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        let mut state = self.state.lock().await;
        if self.is_stopped() {
            return Err(RaftError::Shutdown);
        }
        let response = election::handle_request_vote(&mut state, &req, self.id);
        self.persist(&mut state)?;
        drop(state);

        if response.vote_granted {
            signal(&self.vote_granted_tx, response.term);
        }

        Ok(response)
    }

    /// Handle incoming AppendEntries RPC
    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        // Reset the election timer before validating, as any contact counts
        signal(&self.heartbeat_tx, req.term);

        let mut state = self.state.lock().await;
        if self.is_stopped() {
            return Err(RaftError::Shutdown);
        }
        let commit_before = state.commit_index;
        let response = replication::handle_append_entries(&mut state, &req, self.id);
        self.persist(&mut state)?;

        if state.commit_index > commit_before {
            self.commit_tx.send_replace(state.commit_index);
        }

        Ok(response)
    }

    /// Save term, vote and log if they changed. Must be called with the lock
    /// held and before any reply depending on the change is released.
    ///
    /// A peer that cannot persist can no longer keep its promises. On failure
    /// the change stays owed and the peer stops: handlers refuse to reply and
    /// the role loop and applier exit.
    fn persist(&self, state: &mut RaftState) -> Result<()> {
        if !state.take_dirty() {
            return Ok(());
        }
        let saved = PersistentState::capture(state)
            .encode()
            .and_then(|blob| self.persister.save_state(blob));
        if let Err(e) = saved {
            state.mark_log_changed();
            tracing::error!(node_id = self.id, error = %e, "Failed to persist raft state, stopping node");
            self.stop();
            return Err(e);
        }
        Ok(())
    }
}

fn signal(tx: &mpsc::Sender<u64>, term: u64) {
    // Full queue: a signal is already pending, which is all the loop needs
    let _ = tx.try_send(term);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::NetworkConfig;
    use crate::raft::persist::MemoryPersister;
    use crate::raft::transport::LocalNetwork;

    /// Persister whose disk is full
    struct FullDisk;

    impl Persister for FullDisk {
        fn save_state(&self, _state: Vec<u8>) -> Result<()> {
            Err(RaftError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no space left on device",
            )))
        }

        fn load_state(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn solo_node(persister: MemoryPersister) -> RaftNode {
        let network = LocalNetwork::new(NetworkConfig::default());
        let config = NodeConfig {
            election_timeout_ms: 50,
            heartbeat_interval_ms: 10,
            ..NodeConfig::new(0)
        };
        let (node, _events) =
            RaftNode::new(config, network.transport(0), Arc::new(persister)).unwrap();
        node
    }

    #[tokio::test]
    async fn start_on_follower_is_rejected() {
        let node = solo_node(MemoryPersister::new());
        let err = node.start(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { term: 0, leader_id: None }));
        assert!(node.state.lock().await.log.is_empty());
    }

    #[tokio::test]
    async fn vote_grant_is_persisted_before_reply() {
        let persister = MemoryPersister::new();
        let node = solo_node(persister.clone());

        let resp = node
            .handle_request_vote(VoteRequest {
                term: 3,
                candidate_id: 4,
                last_log_index: 0,
                last_log_term: 0,
            })
            .await
            .unwrap();
        assert!(resp.vote_granted);

        let saved = PersistentState::decode(&persister.load_state().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(saved.current_term, 3);
        assert_eq!(saved.voted_for, Some(4));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let node = solo_node(MemoryPersister::new());
        assert!(!node.is_stopped());
        node.stop();
        node.stop();
        assert!(node.is_stopped());
    }

    #[tokio::test]
    async fn start_after_stop_is_rejected() {
        let node = solo_node(MemoryPersister::new());
        node.stop();
        let err = node.start(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, RaftError::Shutdown));
    }

    #[tokio::test]
    async fn failed_save_in_start_stops_leader() {
        let network = LocalNetwork::new(NetworkConfig::default());
        let (node, _events) =
            RaftNode::new(NodeConfig::new(0), network.transport(0), Arc::new(FullDisk)).unwrap();
        {
            let mut state = node.state.lock().await;
            state.become_candidate(0);
            state.become_leader(0, &[]);
        }

        let err = node.start(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, RaftError::Io(_)));
        assert!(node.is_stopped());
        assert!(matches!(node.start(b"y".to_vec()).await, Err(RaftError::Shutdown)));
    }

    #[tokio::test]
    async fn failed_save_during_election_ends_role_loop() {
        let network = LocalNetwork::new(NetworkConfig::default());
        let config = NodeConfig {
            election_timeout_ms: 20,
            heartbeat_interval_ms: 5,
            ..NodeConfig::new(0).with_peers([1, 2])
        };
        let (node, events) =
            RaftNode::new(config, network.transport(0), Arc::new(FullDisk)).unwrap();
        let node = Arc::new(node);

        let run = tokio::spawn(Arc::clone(&node).run(events));
        let exited = tokio::time::timeout(Duration::from_secs(2), run).await;

        assert!(exited.is_ok(), "Role loop should exit once the node stops");
        assert!(node.is_stopped());
        // The unsaved term bump is still owed
        assert_eq!(node.state.lock().await.current_term, 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let network = LocalNetwork::new(NetworkConfig::default());
        let config = NodeConfig::new(0).with_peer(0);
        let result = RaftNode::new(config, network.transport(0), Arc::new(MemoryPersister::new()));
        assert!(matches!(result, Err(RaftError::InvalidConfig(_))));
    }
}
