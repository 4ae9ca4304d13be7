//! Node Tracker
//!
//! Reads every slot each cycle, keeps the heartbeat counters and decides
//! when nodes join, time out, shut down or come back from the dead.
//! Every node runs the same machine over the same disk contents, so the
//! views converge without any message passing.

use tracing::{debug, error, info, warn};

use super::node_info::NodeInfo;
use crate::disk::QuorumDisk;
use crate::error::{Error, Result};
use crate::protocol::{MemberMask, NodeState, StatusBlock, MAX_NODES_DISK};

/// A node that must be sent an eviction notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    pub node_id: u32,
    /// The node kept writing with an incarnation we already declared dead
    pub undead: bool,
}

/// Result of one transition pass
#[derive(Debug, Clone, Default)]
pub struct Transitions {
    /// Nodes we consider alive
    pub mask: MemberMask,
    /// Eviction notices to write
    pub evictions: Vec<Eviction>,
}

/// Heartbeat state machine over all slots
pub struct NodeTracker {
    my_id: u32,
    tko: u32,
    tko_up: u32,
    nodes: Vec<NodeInfo>,
}

impl NodeTracker {
    /// Create a tracker for the local node `my_id`
    pub fn new(my_id: u32, tko: u32, tko_up: u32) -> Self {
        Self {
            my_id,
            tko,
            tko_up,
            nodes: (1..=MAX_NODES_DISK as u32).map(NodeInfo::new).collect(),
        }
    }

    pub fn my_id(&self) -> u32 {
        self.my_id
    }

    /// All slots, ordered by node id
    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    /// Info for a node id
    pub fn node(&self, node_id: u32) -> Option<&NodeInfo> {
        node_id
            .checked_sub(1)
            .and_then(|idx| self.nodes.get(idx as usize))
    }

    fn node_mut(&mut self, node_id: u32) -> Option<&mut NodeInfo> {
        node_id
            .checked_sub(1)
            .and_then(move |idx| self.nodes.get_mut(idx as usize))
    }

    /// Read every slot and update the heartbeat counters
    ///
    /// Returns the number of slots that could not be read. A foreign write
    /// into our own slot is returned as `Error::SlotHijacked`.
    pub fn read_node_blocks(&mut self, disk: &QuorumDisk) -> Result<u32> {
        let mut errors = 0;

        for node_id in 1..=MAX_NODES_DISK as u32 {
            match disk.read_status(node_id) {
                Ok((block, _)) if block.node_id == node_id => self.observe(block)?,
                Ok((block, _)) => {
                    warn!(
                        "Slot {} carries a block for node {}",
                        node_id, block.node_id
                    );
                    errors += 1;
                    self.record_read_failure(node_id);
                }
                Err(e) => {
                    warn!("Error reading node ID block {}: {}", node_id, e);
                    errors += 1;
                    self.record_read_failure(node_id);
                }
            }
        }

        Ok(errors)
    }

    /// Feed one freshly read block into the tracker
    pub fn observe(&mut self, block: StatusBlock) -> Result<()> {
        let my_id = self.my_id;
        let tko = self.tko;
        let node_id = block.node_id;
        let Some(info) = self.node_mut(node_id) else {
            warn!("Ignoring block for out-of-range node {}", node_id);
            return Ok(());
        };

        if node_id == my_id {
            let result = check_self(my_id, &block);
            info.status = block;
            return result;
        }

        info.last_msg = info.msg;
        info.msg = block.message;
        info.status = block;

        if !info.status.state.is_live() {
            return Ok(());
        }

        if info.status.timestamp == info.last_seen {
            info.misses += 1;
            if info.misses > 1 {
                debug!(
                    "Node {} missed an update ({}/{})",
                    node_id, info.misses, tko
                );
            }
            return Ok(());
        }

        info.misses = 0;
        info.seen += 1;
        info.last_seen = info.status.timestamp;
        Ok(())
    }

    /// An unreadable slot counts as a missed update for a live node
    fn record_read_failure(&mut self, node_id: u32) {
        if node_id == self.my_id {
            return;
        }
        if let Some(info) = self.node_mut(node_id) {
            if info.status.state.is_live() {
                info.misses += 1;
            }
        }
    }

    /// Evaluate node transitions and build our membership view
    pub fn check_transitions(&mut self, is_master: bool) -> Transitions {
        let mut out = Transitions::default();

        for info in self.nodes.iter_mut() {
            let node_id = info.node_id();
            if node_id == self.my_id {
                continue;
            }

            // Evicted by the master, cleanly shut down, or restarted
            if (info.state >= NodeState::Evict && info.status.state <= NodeState::Evict)
                || (info.incarnation != 0 && info.incarnation != info.status.incarnation)
            {
                if info.status.state == NodeState::Evict {
                    info!("Node {} evicted", node_id);
                } else {
                    info!("Node {} shutdown", node_id);
                    info.evil_incarnation = 0;
                }
                info.reset();
                out.mask.clear(node_id);
                continue;
            }

            // Heartbeat timeout
            if info.misses > self.tko && info.status.state.is_live() {
                if info.status.state.is_running() && info.seen > 0 {
                    debug!("Node {} DOWN", node_id);
                    info.seen = 0;
                }

                info.state = NodeState::Evict;
                info.status.state = NodeState::Evict;
                info.evil_incarnation = info.status.incarnation;

                if is_master {
                    info!("Writing eviction notice for node {}", node_id);
                    out.evictions.push(Eviction {
                        node_id,
                        undead: false,
                    });
                }
                out.mask.clear(node_id);
                continue;
            }

            // Declared dead, still writing with the same incarnation
            if info.evil_incarnation != 0 && info.evil_incarnation == info.status.incarnation {
                error!("Node {} is undead", node_id);
                warn!("Writing eviction notice for node {}", node_id);
                info.status.state = NodeState::Evict;
                out.evictions.push(Eviction {
                    node_id,
                    undead: true,
                });
                continue;
            }

            // Seen long enough to join
            if info.seen > self.tko_up && !info.state.is_live() {
                info.state = NodeState::Run;
                debug!("Node {} is UP", node_id);
                info.incarnation = info.status.incarnation;
                out.mask.set(node_id);
                continue;
            }

            if info.state == NodeState::Run && info.status.state == NodeState::Master {
                info!("Node {} is the master", node_id);
                info.state = NodeState::Master;
                out.mask.set(node_id);
                continue;
            }

            // Believe the node's reported state
            if info.state.is_live() {
                info.state = info.status.state;
                out.mask.set(node_id);
            }
        }

        out
    }
}

/// Our slot may only be written by us or by `init`
fn check_self(my_id: u32, block: &StatusBlock) -> Result<()> {
    if block.update_node == 0 || block.update_node == my_id {
        return Ok(());
    }

    if block.state == NodeState::Evict {
        error!("Node {} evicted us", block.update_node);
    } else {
        error!(
            "Node {} wrote unhandled state {} into our block",
            block.update_node, block.state
        );
    }

    Err(Error::SlotHijacked {
        writer: block.update_node,
        state: block.state as u8,
    })
}
