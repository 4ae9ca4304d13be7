//! Cluster Manager Bridge
//!
//! The quorum daemon does not own cluster membership. It asks the cluster
//! manager who is a member, registers the quorum disk as a voting device,
//! reports whether the vote should count, and asks it to fence nodes.

pub mod socket;

pub use socket::SocketClusterManager;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A node as seen by the cluster manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub node_id: u32,
    /// Currently part of the cluster membership
    pub member: bool,
}

/// Asynchronous notifications delivered by `dispatch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    /// The cluster manager wants to shut down; the daemon should stop
    TryShutdown,
    /// Configuration changed; reload the dynamic settings
    ConfigUpdate,
    /// Membership changed
    StateChange,
}

/// Interface to the cluster membership manager
pub trait ClusterManager: Send {
    /// Manager is reachable and the local node is part of a cluster
    fn is_active(&mut self) -> Result<bool>;

    /// Node id of the local node
    fn local_node_id(&mut self) -> Result<u32>;

    /// Every known node and whether it is a member
    fn members(&mut self) -> Result<Vec<ClusterMember>>;

    /// Register the quorum disk as a device worth `votes`
    fn register_quorum_device(&mut self, name: &str, votes: u32) -> Result<()>;

    fn unregister_quorum_device(&mut self) -> Result<()>;

    /// Advertise (or withdraw) the quorum device vote for this cycle
    fn poll_quorum_device(&mut self, available: bool) -> Result<()>;

    /// Fence a node
    fn kill_node(&mut self, node_id: u32) -> Result<()>;

    /// Leave the cluster cleanly
    fn leave_cluster(&mut self) -> Result<()>;

    /// Process pending notifications, waiting at most `timeout`
    fn dispatch(&mut self, timeout: Duration) -> Result<Vec<ClusterEvent>>;
}
