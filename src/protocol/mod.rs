//! On-Disk Protocol
//!
//! Defines the quorum header and per-node status block records that
//! nodes exchange through the shared disk, along with the node states,
//! election messages and membership bitmasks carried inside them.

pub mod block;
pub mod header;

pub use block::StatusBlock;
pub use header::QuorumHeader;

use serde::Serialize;

use crate::error::{Error, Result};

/// Maximum number of node slots on the disk
pub const MAX_NODES_DISK: usize = 16;

/// Length of an on-disk membership bitmask in bytes
pub const MEMB_MASK_LEN: usize = ((MAX_NODES_DISK / 8) + (MAX_NODES_DISK % 8 != 0) as usize + 7) & !7;

/// Current partition header magic
pub const HEADER_MAGIC: u32 = 0xeb7a_62c2;

/// Current status block magic
pub const STATE_MAGIC: u32 = 0x47ba_cef8;

/// RHCM 1.2.x partition header magic
pub const HEADER_MAGIC_OLD: u32 = 0x3911_9fcd;

/// RHCM 1.2.x status block magic
pub const STATE_MAGIC_OLD: u32 = 0xf184_0dce;

/// Header version written by `init`
pub const VERSION_MAGIC_V2: u32 = 0x389f_abc4;

/// Byte order a record was found in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Endian {
    /// Canonical on-disk order
    Big,
    /// Written by a host that did not normalize
    Little,
}

/// Node state as published in a status block
///
/// Ordering matters: anything at or below `Evict` may be fenced safely,
/// anything at or above `Init` is a live block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum NodeState {
    /// Shut down, not quorate, or not running
    None = 0x0,
    /// Voted out, about to be fenced
    Evict = 0x1,
    /// Initializing; hold your fire
    Init = 0x2,
    /// Running
    Run = 0x5,
    /// Running and advertising the disk vote for its partition
    Master = 0x6,
}

impl NodeState {
    /// Convert from the raw on-disk value
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0x0 => Ok(NodeState::None),
            0x1 => Ok(NodeState::Evict),
            0x2 => Ok(NodeState::Init),
            0x5 => Ok(NodeState::Run),
            0x6 => Ok(NodeState::Master),
            other => Err(Error::UnknownState(other)),
        }
    }

    /// Block is live (initializing or better)
    pub fn is_live(self) -> bool {
        self >= NodeState::Init
    }

    /// Node is considered running
    pub fn is_running(self) -> bool {
        self >= NodeState::Run
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::None => write!(f, "None"),
            NodeState::Evict => write!(f, "Evicted"),
            NodeState::Init => write!(f, "Initializing"),
            NodeState::Run => write!(f, "Running"),
            NodeState::Master => write!(f, "Master"),
        }
    }
}

/// Election message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[repr(u16)]
pub enum MessageId {
    #[default]
    None = 0x0,
    Bid = 0x1,
    Ack = 0x2,
    Nack = 0x3,
    Mask = 0x4,
}

impl MessageId {
    /// Convert from the raw on-disk value; unknown ids read as `None`
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0x1 => MessageId::Bid,
            0x2 => MessageId::Ack,
            0x3 => MessageId::Nack,
            0x4 => MessageId::Mask,
            _ => MessageId::None,
        }
    }
}

/// Election message embedded in a status block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub arg: u32,
    pub seq: u16,
}

impl Message {
    /// A bid for mastership
    pub fn bid(seq: u16) -> Self {
        Self { id: MessageId::Bid, arg: 0, seq }
    }

    /// A vote for `node_id`'s bid with sequence `seq`
    pub fn ack(node_id: u32, seq: u16) -> Self {
        Self { id: MessageId::Ack, arg: node_id, seq }
    }
}

/// One bit per node id, set when the owner considers the node alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MemberMask([u8; MEMB_MASK_LEN]);

impl MemberMask {
    /// Build a mask from raw on-disk bytes
    pub fn from_bytes(bytes: [u8; MEMB_MASK_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes for the on-disk record
    pub fn as_bytes(&self) -> &[u8; MEMB_MASK_LEN] {
        &self.0
    }

    fn index(node_id: u32) -> Option<(usize, u8)> {
        if node_id == 0 || node_id as usize > MEMB_MASK_LEN * 8 {
            return None;
        }
        let bit = (node_id - 1) as usize;
        Some((bit / 8, 1u8 << (bit % 8)))
    }

    pub fn set(&mut self, node_id: u32) {
        if let Some((byte, bit)) = Self::index(node_id) {
            self.0[byte] |= bit;
        }
    }

    pub fn clear(&mut self, node_id: u32) {
        if let Some((byte, bit)) = Self::index(node_id) {
            self.0[byte] &= !bit;
        }
    }

    pub fn is_set(&self, node_id: u32) -> bool {
        Self::index(node_id)
            .map(|(byte, bit)| self.0[byte] & bit != 0)
            .unwrap_or(false)
    }

    pub fn reset(&mut self) {
        self.0 = [0; MEMB_MASK_LEN];
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Node ids with their bit set, in ascending order
    pub fn node_ids(&self) -> impl Iterator<Item = u32> + '_ {
        (1..=MAX_NODES_DISK as u32).filter(move |id| self.is_set(*id))
    }
}

impl std::fmt::Display for MemberMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for id in self.node_ids() {
            write!(f, " {}", id)?;
        }
        write!(f, " }}")
    }
}
