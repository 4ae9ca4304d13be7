//! qdiskd - Disk-Based Quorum Daemon
//!
//! A tiebreaker for shared-storage high-availability clusters. Every node
//! heartbeats into its own slot on a shared block device, reads everyone
//! else's slot each cycle, and the nodes elect a master among themselves
//! using messages carried in those slots. The master tells the cluster
//! manager which nodes it can see so the quorum disk vote only counts for
//! nodes that can reach the storage.
//!
//! # Architecture
//!
//! - `protocol`: on-disk records (header, status blocks, membership masks)
//! - `disk`: framed slot I/O, device discovery and initialization
//! - `state`: heartbeat tracking and master election
//! - `heuristic`: fitness scoring through external check programs
//! - `cluster`: the cluster manager interface
//! - `daemon`: the quorum loop tying it all together

pub mod cluster;
pub mod config;
pub mod daemon;
pub mod disk;
pub mod error;
pub mod failsafe;
pub mod heuristic;
pub mod protocol;
pub mod state;
pub mod sys;

pub use config::QuorumdConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{ClusterEvent, ClusterManager, ClusterMember};
    pub use crate::config::QuorumdConfig;
    pub use crate::daemon::QuorumDaemon;
    pub use crate::disk::{BlockDevice, QuorumDisk};
    pub use crate::error::{Error, Result};
    pub use crate::failsafe::{FailSafe, FailSafeReason};
    pub use crate::heuristic::{Score, ScoreCell};
    pub use crate::protocol::{MemberMask, NodeState, QuorumHeader, StatusBlock};
    pub use crate::state::{MasterElection, NodeTracker};
}
