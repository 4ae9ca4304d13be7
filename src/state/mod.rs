//! Node State Tracking
//!
//! Per-node heartbeat bookkeeping, the transition state machine and the
//! disk-mediated master election.

pub mod election;
mod node_info;
mod tracker;

pub use election::{MasterElection, MasterScan, Role, VoteOutcome};
pub use node_info::NodeInfo;
pub use tracker::{Eviction, NodeTracker, Transitions};
