pub mod apply;
pub mod election;
pub mod log;
pub mod node;
pub mod persist;
pub mod replication;
pub mod rpc;
pub mod state;
pub mod timer;
pub mod transport;

pub use apply::ApplyMsg;
pub use log::{LogEntry, RaftLog};
pub use node::{Proposal, RaftEvents, RaftNode};
pub use persist::{FilePersister, MemoryPersister, Persister};
pub use state::{RaftRole, RaftState};
pub use transport::{LocalNetwork, Transport};
