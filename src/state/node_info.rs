//! Per-Node Bookkeeping

use serde::Serialize;

use crate::protocol::{Message, NodeState, StatusBlock};

/// What we know about one slot on the disk
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    /// Last block read from the slot (locally amended on eviction)
    pub status: StatusBlock,
    /// Our reconciled view of the node's state
    pub state: NodeState,
    /// Consecutive reads with an unchanged timestamp
    pub misses: u32,
    /// Reads with an advancing timestamp since the last reset
    pub seen: u32,
    /// Timestamp of the last advancing read
    pub last_seen: u64,
    /// Incarnation adopted when the node joined (0 = none)
    pub incarnation: u64,
    /// Incarnation the node had when we declared it dead (0 = none)
    pub evil_incarnation: u64,
    pub msg: Message,
    pub last_msg: Message,
}

impl NodeInfo {
    pub fn new(node_id: u32) -> Self {
        Self {
            status: StatusBlock::empty(node_id),
            state: NodeState::None,
            misses: 0,
            seen: 0,
            last_seen: 0,
            incarnation: 0,
            evil_incarnation: 0,
            msg: Message::default(),
            last_msg: Message::default(),
        }
    }

    pub fn node_id(&self) -> u32 {
        self.status.node_id
    }

    /// Forget everything learned about the node's current run
    pub(crate) fn reset(&mut self) {
        self.incarnation = 0;
        self.seen = 0;
        self.misses = 0;
        self.state = NodeState::None;
    }
}

impl std::fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "node_info [node {}] {{", self.node_id())?;
        writeln!(f, "    incarnation = 0x{:016x}", self.incarnation)?;
        writeln!(f, "    evil_incarnation = 0x{:016x}", self.evil_incarnation)?;
        writeln!(f, "    last_seen = {}", self.last_seen)?;
        writeln!(f, "    misses = {}", self.misses)?;
        writeln!(f, "    seen = {}", self.seen)?;
        writeln!(
            f,
            "    msg = {{ {:?} arg={} seq={} }}",
            self.msg.id, self.msg.arg, self.msg.seq
        )?;
        writeln!(
            f,
            "    last_msg = {{ {:?} arg={} seq={} }}",
            self.last_msg.id, self.last_msg.arg, self.last_msg.seq
        )?;
        writeln!(f, "    state = {} ({})", self.state as u8, self.state)?;
        write!(f, "}}")
    }
}
