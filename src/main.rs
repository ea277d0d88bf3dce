use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use raft_peer::config::{NetworkConfig, NodeConfig};
use raft_peer::raft::{ApplyMsg, FilePersister, LocalNetwork, MemoryPersister, Persister, RaftNode};
use raft_peer::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "raft-peer")]
#[command(version)]
#[command(about = "Run an in-process Raft cluster and replicate a few commands")]
struct Args {
    /// Number of peers in the cluster
    #[arg(long, default_value = "3")]
    nodes: u64,

    /// Number of commands to submit once a leader is elected
    #[arg(long, default_value = "5")]
    commands: u64,

    /// Randomly delay and drop RPCs
    #[arg(long)]
    unreliable: bool,

    /// Persist each peer's state under this directory (one subdirectory per peer)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Election base timeout; actual timeouts are drawn from [T, 2T)
    #[arg(long, default_value = "400")]
    election_timeout_ms: u64,

    /// Leader heartbeat / replication interval
    #[arg(long, default_value = "100")]
    heartbeat_interval_ms: u64,

    /// Stop after this many seconds (Ctrl-C stops earlier)
    #[arg(long, default_value = "10")]
    run_secs: u64,
}

fn persister_for(args: &Args, node_id: u64) -> Result<Arc<dyn Persister>, Box<dyn std::error::Error>> {
    match &args.data_dir {
        Some(dir) => {
            let persister = FilePersister::new(dir.join(format!("node-{}", node_id)))?;
            tracing::info!(node_id, dir = %persister.dir().display(), "Persisting to disk");
            Ok(Arc::new(persister))
        }
        None => Ok(Arc::new(MemoryPersister::new())),
    }
}

async fn wait_for_leader(nodes: &[Arc<RaftNode>], timeout: Duration) -> Option<Arc<RaftNode>> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        for node in nodes {
            if node.is_leader().await {
                return Some(Arc::clone(node));
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let shutdown = install_shutdown_handler()?;

    let network_config = if args.unreliable {
        NetworkConfig::unreliable()
    } else {
        NetworkConfig::default()
    };
    let network = LocalNetwork::new(network_config);

    let ids: Vec<u64> = (0..args.nodes).collect();
    let mut nodes = Vec::new();
    let (apply_tx, mut apply_rx) = mpsc::channel::<(u64, ApplyMsg)>(1024);

    for &id in &ids {
        let config = NodeConfig {
            election_timeout_ms: args.election_timeout_ms,
            heartbeat_interval_ms: args.heartbeat_interval_ms,
            ..NodeConfig::new(id).with_peers(ids.iter().copied().filter(|&p| p != id))
        };

        // Tag each peer's applied stream with its id
        let (node_tx, mut node_rx) = mpsc::channel::<ApplyMsg>(256);
        let tagged = apply_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = node_rx.recv().await {
                if tagged.send((id, msg)).await.is_err() {
                    break;
                }
            }
        });

        let node = RaftNode::launch(config, network.transport(id), persister_for(&args, id)?, node_tx)?;
        network.register(&node).await;
        nodes.push(node);
    }
    drop(apply_tx);

    tokio::spawn(async move {
        while let Some((node_id, msg)) = apply_rx.recv().await {
            tracing::info!(
                node_id,
                index = msg.index,
                command = %String::from_utf8_lossy(&msg.command),
                "Applied"
            );
        }
    });

    match wait_for_leader(&nodes, Duration::from_secs(5)).await {
        Some(leader) => {
            let (term, _) = leader.get_state().await;
            tracing::info!(
                leader = leader.id,
                term,
                heartbeat_interval_ms = leader.config().heartbeat_interval_ms,
                "Leader elected"
            );
            for i in 0..args.commands {
                match leader.start(format!("cmd-{}", i).into_bytes()).await {
                    Ok(proposal) => {
                        tracing::info!(index = proposal.index, term = proposal.term, "Submitted command");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Command rejected");
                        break;
                    }
                }
            }
        }
        None => tracing::warn!("No leader elected within 5s"),
    }

    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(Duration::from_secs(args.run_secs)) => {}
    }

    for node in &nodes {
        let role = node.state.lock().await.role;
        tracing::info!(
            node_id = node.id,
            role = %role,
            commit_index = node.commit_index().await,
            last_applied = node.last_applied().await,
            "Final state"
        );
        node.stop();
    }

    Ok(())
}
