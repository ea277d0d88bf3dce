use std::sync::Arc;

use tokio::sync::mpsc;

use crate::raft::node::RaftNode;

/// A committed command handed to the consuming service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg {
    pub index: u64,
    pub command: Vec<u8>,
}

/// Deliver committed entries to `apply_tx` in index order, each exactly once.
///
/// Wakes on every commit notification. The node lock is held only to copy the
/// pending batch and to record `last_applied`; the sends happen unlocked, so a
/// slow consumer never blocks RPC handling. This task is the only writer of
/// `last_applied`.
pub async fn apply_loop(node: Arc<RaftNode>, apply_tx: mpsc::Sender<ApplyMsg>) {
    let mut commit_rx = node.subscribe_commits();
    let shutdown = node.shutdown_token();

    loop {
        loop {
            let batch = {
                let state = node.state.lock().await;
                state.log.slice(state.last_applied + 1, state.commit_index)
            };
            let Some(last) = batch.last().map(|e| e.index) else {
                break;
            };

            for entry in batch {
                let msg = ApplyMsg {
                    index: entry.index,
                    command: entry.command,
                };
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    sent = apply_tx.send(msg) => {
                        if sent.is_err() {
                            tracing::debug!(node_id = node.id, "Apply receiver dropped, stopping applier");
                            return;
                        }
                    }
                }
            }

            node.state.lock().await.last_applied = last;
            tracing::trace!(node_id = node.id, last_applied = last, "Applied entries");
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            changed = commit_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
