use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not the leader (term {term}), last known leader is node {leader_id:?}")]
    NotLeader { term: u64, leader_id: Option<u64> },

    #[error("Peer {0} unreachable")]
    Unreachable(u64),

    #[error("Node is shut down")]
    Shutdown,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Corrupt persisted state: {0}")]
    CorruptState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RaftError>;
