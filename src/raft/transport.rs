//! Outbound RPC capability and an in-process network implementing it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;

use crate::config::NetworkConfig;
use crate::error::{RaftError, Result};
use crate::raft::node::RaftNode;
use crate::raft::rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};

/// Delivers requests to other peers.
///
/// `Err` means the outcome is unknown: the request, the peer, or the reply
/// may have been lost. Implementations must eventually return.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(&self, peer_id: u64, req: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(
        &self,
        peer_id: u64,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}

/// Connects peers living in the same process.
///
/// Peers are held weakly. A call fails when either end is disconnected, the
/// target is missing or stopped, or (in unreliable mode) the request or the
/// reply is randomly dropped.
pub struct LocalNetwork {
    nodes: RwLock<HashMap<u64, Weak<RaftNode>>>,
    disconnected: RwLock<HashSet<u64>>,
    // Directed links that drop everything
    cut_links: RwLock<HashSet<(u64, u64)>>,
    config: RwLock<NetworkConfig>,
    rpc_count: AtomicU64,
}

impl LocalNetwork {
    pub fn new(config: NetworkConfig) -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            disconnected: RwLock::new(HashSet::new()),
            cut_links: RwLock::new(HashSet::new()),
            config: RwLock::new(config),
            rpc_count: AtomicU64::new(0),
        })
    }

    /// Transport handle for the peer `from`
    pub fn transport(self: &Arc<Self>, from: u64) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            from,
            network: Arc::clone(self),
        })
    }

    /// Route calls for `node.id` to this node, replacing any previous one.
    pub async fn register(&self, node: &Arc<RaftNode>) {
        self.nodes.write().await.insert(node.id, Arc::downgrade(node));
    }

    pub async fn remove(&self, node_id: u64) {
        self.nodes.write().await.remove(&node_id);
    }

    pub async fn connect(&self, node_id: u64) {
        self.disconnected.write().await.remove(&node_id);
        tracing::debug!(node_id, "Peer connected");
    }

    pub async fn disconnect(&self, node_id: u64) {
        self.disconnected.write().await.insert(node_id);
        tracing::debug!(node_id, "Peer disconnected");
    }

    pub async fn is_connected(&self, node_id: u64) -> bool {
        !self.disconnected.read().await.contains(&node_id)
    }

    /// Cut every link between the two groups, in both directions
    pub async fn partition(&self, group_a: &[u64], group_b: &[u64]) {
        let mut cut = self.cut_links.write().await;
        for &a in group_a {
            for &b in group_b {
                cut.insert((a, b));
                cut.insert((b, a));
            }
        }
        tracing::debug!(?group_a, ?group_b, "Network partitioned");
    }

    /// Restore every link and reconnect every peer
    pub async fn heal(&self) {
        self.cut_links.write().await.clear();
        self.disconnected.write().await.clear();
        tracing::debug!("Network healed");
    }

    /// Whether a message from `from` can currently reach `to`
    pub async fn is_linked(&self, from: u64, to: u64) -> bool {
        self.is_connected(from).await
            && self.is_connected(to).await
            && !self.cut_links.read().await.contains(&(from, to))
    }

    pub async fn set_reliable(&self, reliable: bool) {
        self.config.write().await.reliable = reliable;
    }

    /// Number of requests that reached a handler
    pub fn rpc_count(&self) -> u64 {
        self.rpc_count.load(Ordering::Relaxed)
    }

    /// Resolve the target for a call, applying link failures and delays.
    async fn route(&self, from: u64, to: u64) -> Result<Arc<RaftNode>> {
        let config = self.config.read().await.clone();
        let linked = self.is_linked(from, to).await;
        let target = self
            .nodes
            .read()
            .await
            .get(&to)
            .and_then(Weak::upgrade)
            .filter(|node| !node.is_stopped());

        let node = match target {
            Some(node) if linked => node,
            _ => {
                tokio::time::sleep(jitter(config.unreachable_delay_ms)).await;
                return Err(RaftError::Unreachable(to));
            }
        };

        if !config.reliable {
            tokio::time::sleep(jitter(config.max_delay_ms)).await;
            if lost(config.drop_rate) {
                return Err(RaftError::Unreachable(to));
            }
        }

        self.rpc_count.fetch_add(1, Ordering::Relaxed);
        Ok(node)
    }

    /// Decide whether a reply makes it back to `from`.
    async fn deliver_reply(&self, from: u64, to: u64) -> Result<()> {
        if !self.is_linked(to, from).await {
            return Err(RaftError::Unreachable(to));
        }
        let config = self.config.read().await;
        if !config.reliable && lost(config.drop_rate) {
            return Err(RaftError::Unreachable(to));
        }
        Ok(())
    }
}

fn jitter(max_ms: u64) -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

fn lost(drop_rate: f64) -> bool {
    rand::thread_rng().gen_bool(drop_rate.clamp(0.0, 1.0))
}

/// One peer's view of a `LocalNetwork`
pub struct LocalTransport {
    from: u64,
    network: Arc<LocalNetwork>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(&self, peer_id: u64, req: VoteRequest) -> Result<VoteResponse> {
        let node = self.network.route(self.from, peer_id).await?;
        let resp = node.handle_request_vote(req).await?;
        self.network.deliver_reply(self.from, peer_id).await?;
        Ok(resp)
    }

    async fn append_entries(
        &self,
        peer_id: u64,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let node = self.network.route(self.from, peer_id).await?;
        let resp = node.handle_append_entries(req).await?;
        self.network.deliver_reply(self.from, peer_id).await?;
        Ok(resp)
    }
}
