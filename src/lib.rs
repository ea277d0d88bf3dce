pub mod config;
pub mod error;
pub mod raft;
pub mod shutdown;

pub use config::{NetworkConfig, NodeConfig};
pub use error::{RaftError, Result};
pub use raft::{ApplyMsg, RaftNode};
