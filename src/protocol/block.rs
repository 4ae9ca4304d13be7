//! Status Block Codec
//!
//! Each node owns one status block slot on the disk and rewrites it every
//! cycle. Blocks are stored big-endian; a block written by a host that did
//! not normalize is detected by its byte-swapped magic and decoded in
//! that order instead.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::Serialize;

use super::{
    Endian, MemberMask, Message, MessageId, NodeState, MEMB_MASK_LEN, STATE_MAGIC,
    STATE_MAGIC_OLD,
};
use crate::error::{Error, Result};

/// Encoded size of a status block in bytes
pub const STATUS_BLOCK_SIZE: usize = 80;

/// Per-node status block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusBlock {
    /// Node that last wrote this block (0 = never written by a daemon)
    pub update_node: u32,
    /// Writer's clock in microseconds; only compared against itself
    pub timestamp: u64,
    pub node_id: u32,
    pub state: NodeState,
    pub flags: u16,
    pub score: u16,
    pub score_max: u16,
    /// Average cycle time
    pub average_cycle: Duration,
    /// Last cycle time
    pub last_cycle: Duration,
    /// Token identifying one run of the owning daemon
    pub incarnation: u64,
    pub message: Message,
    pub mask: MemberMask,
    pub master_mask: MemberMask,
}

impl StatusBlock {
    /// Blank block for a slot, as written by `init`
    pub fn empty(node_id: u32) -> Self {
        Self {
            update_node: 0,
            timestamp: 0,
            node_id,
            state: NodeState::None,
            flags: 0,
            score: 0,
            score_max: 0,
            average_cycle: Duration::ZERO,
            last_cycle: Duration::ZERO,
            incarnation: 0,
            message: Message::default(),
            mask: MemberMask::default(),
            master_mask: MemberMask::default(),
        }
    }

    /// Notice written by `writer` into `node_id`'s slot to evict it
    ///
    /// Carries incarnation 0 so the evicted run is never mistaken for an
    /// undead one.
    pub fn eviction_notice(node_id: u32, writer: u32, timestamp: u64) -> Self {
        Self {
            update_node: writer,
            timestamp,
            state: NodeState::Evict,
            ..Self::empty(node_id)
        }
    }

    /// Encode in canonical (big-endian) order
    pub fn encode(&self) -> [u8; STATUS_BLOCK_SIZE] {
        self.encode_with(Endian::Big)
    }

    /// Encode in the given byte order
    pub fn encode_with(&self, order: Endian) -> [u8; STATUS_BLOCK_SIZE] {
        let mut buf = [0u8; STATUS_BLOCK_SIZE];
        match order {
            Endian::Big => self.write_fields::<BigEndian>(&mut buf),
            Endian::Little => self.write_fields::<LittleEndian>(&mut buf),
        }
        buf
    }

    /// Decode a block, sniffing its byte order from the magic number
    pub fn decode(buf: &[u8]) -> Result<(Self, Endian)> {
        if buf.len() < STATUS_BLOCK_SIZE {
            return Err(Error::ShortBuffer {
                got: buf.len(),
                need: STATUS_BLOCK_SIZE,
            });
        }

        let magic_be = BigEndian::read_u32(&buf[0..4]);
        let magic_le = LittleEndian::read_u32(&buf[0..4]);

        if magic_be == STATE_MAGIC {
            Ok((Self::read_fields::<BigEndian>(buf)?, Endian::Big))
        } else if magic_le == STATE_MAGIC {
            Ok((Self::read_fields::<LittleEndian>(buf)?, Endian::Little))
        } else if magic_be == STATE_MAGIC_OLD || magic_le == STATE_MAGIC_OLD {
            Err(Error::LegacyFormat(STATE_MAGIC_OLD))
        } else {
            Err(Error::BadMagic(magic_be))
        }
    }

    fn write_fields<B: ByteOrder>(&self, buf: &mut [u8; STATUS_BLOCK_SIZE]) {
        B::write_u32(&mut buf[0..4], STATE_MAGIC);
        B::write_u32(&mut buf[4..8], self.update_node);
        B::write_u64(&mut buf[8..16], self.timestamp);
        B::write_u32(&mut buf[16..20], self.node_id);
        // 20..24 pad
        buf[24] = self.state as u8;
        // 25 pad
        B::write_u16(&mut buf[26..28], self.flags);
        B::write_u16(&mut buf[28..30], self.score);
        B::write_u16(&mut buf[30..32], self.score_max);
        write_duration::<B>(&mut buf[32..40], self.average_cycle);
        write_duration::<B>(&mut buf[40..48], self.last_cycle);
        B::write_u64(&mut buf[48..56], self.incarnation);
        B::write_u16(&mut buf[56..58], self.message.id as u16);
        B::write_u16(&mut buf[58..60], self.message.seq);
        B::write_u32(&mut buf[60..64], self.message.arg);
        buf[64..64 + MEMB_MASK_LEN].copy_from_slice(self.mask.as_bytes());
        buf[72..72 + MEMB_MASK_LEN].copy_from_slice(self.master_mask.as_bytes());
    }

    fn read_fields<B: ByteOrder>(buf: &[u8]) -> Result<Self> {
        let mut mask = [0u8; MEMB_MASK_LEN];
        mask.copy_from_slice(&buf[64..64 + MEMB_MASK_LEN]);
        let mut master_mask = [0u8; MEMB_MASK_LEN];
        master_mask.copy_from_slice(&buf[72..72 + MEMB_MASK_LEN]);

        Ok(Self {
            update_node: B::read_u32(&buf[4..8]),
            timestamp: B::read_u64(&buf[8..16]),
            node_id: B::read_u32(&buf[16..20]),
            state: NodeState::from_raw(buf[24])?,
            flags: B::read_u16(&buf[26..28]),
            score: B::read_u16(&buf[28..30]),
            score_max: B::read_u16(&buf[30..32]),
            average_cycle: read_duration::<B>(&buf[32..40]),
            last_cycle: read_duration::<B>(&buf[40..48]),
            incarnation: B::read_u64(&buf[48..56]),
            message: Message {
                id: MessageId::from_raw(B::read_u16(&buf[56..58])),
                seq: B::read_u16(&buf[58..60]),
                arg: B::read_u32(&buf[60..64]),
            },
            mask: MemberMask::from_bytes(mask),
            master_mask: MemberMask::from_bytes(master_mask),
        })
    }
}

fn write_duration<B: ByteOrder>(buf: &mut [u8], d: Duration) {
    let secs = d.as_secs().min(u32::MAX as u64) as u32;
    B::write_u32(&mut buf[0..4], secs);
    B::write_u32(&mut buf[4..8], d.subsec_micros());
}

fn read_duration<B: ByteOrder>(buf: &[u8]) -> Duration {
    let secs = B::read_u32(&buf[0..4]) as u64;
    // Clamp garbage microsecond values so Duration never panics
    let micros = B::read_u32(&buf[4..8]).min(999_999);
    Duration::from_secs(secs) + Duration::from_micros(micros as u64)
}
