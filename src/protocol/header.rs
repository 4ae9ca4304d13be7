//! Quorum Disk Header
//!
//! Written once when the disk is initialized. Identifies the partition
//! as a quorum disk and carries the cluster label used to find it.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::Serialize;

use super::{Endian, HEADER_MAGIC, HEADER_MAGIC_OLD, VERSION_MAGIC_V2};
use crate::error::{Error, Result};

/// Encoded size of the header in bytes
pub const QUORUM_HEADER_SIZE: usize = 272;

const HOST_LEN: usize = 128;
const CLUSTER_LEN: usize = 120;

/// Quorum disk header
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuorumHeader {
    pub version: u32,
    /// Seconds since the epoch when the disk was initialized
    pub timestamp: u64,
    /// Host that initialized the disk
    pub update_host: String,
    /// Cluster name or label
    pub cluster: String,
    /// Block size known at creation
    pub block_size: u32,
    /// Kernel-reported block size at creation
    pub kernel_block_size: u32,
}

impl QuorumHeader {
    /// Create a header for a freshly initialized disk
    pub fn new(update_host: &str, label: &str, block_size: u32) -> Self {
        Self {
            version: VERSION_MAGIC_V2,
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
            update_host: truncate(update_host, HOST_LEN - 1),
            cluster: truncate(label, CLUSTER_LEN - 1),
            block_size,
            kernel_block_size: block_size,
        }
    }

    /// Encode in canonical (big-endian) order
    pub fn encode(&self) -> [u8; QUORUM_HEADER_SIZE] {
        self.encode_with(Endian::Big)
    }

    /// Encode in the given byte order
    pub fn encode_with(&self, order: Endian) -> [u8; QUORUM_HEADER_SIZE] {
        let mut buf = [0u8; QUORUM_HEADER_SIZE];
        match order {
            Endian::Big => self.write_fields::<BigEndian>(&mut buf),
            Endian::Little => self.write_fields::<LittleEndian>(&mut buf),
        }
        buf
    }

    /// Decode a header, sniffing its byte order from the magic number
    pub fn decode(buf: &[u8]) -> Result<(Self, Endian)> {
        if buf.len() < QUORUM_HEADER_SIZE {
            return Err(Error::ShortBuffer {
                got: buf.len(),
                need: QUORUM_HEADER_SIZE,
            });
        }

        let magic_be = BigEndian::read_u32(&buf[0..4]);
        let magic_le = LittleEndian::read_u32(&buf[0..4]);

        if magic_be == HEADER_MAGIC {
            Ok((Self::read_fields::<BigEndian>(buf), Endian::Big))
        } else if magic_le == HEADER_MAGIC {
            Ok((Self::read_fields::<LittleEndian>(buf), Endian::Little))
        } else if magic_be == HEADER_MAGIC_OLD || magic_le == HEADER_MAGIC_OLD {
            Err(Error::LegacyFormat(HEADER_MAGIC_OLD))
        } else {
            Err(Error::BadMagic(magic_be))
        }
    }

    fn write_fields<B: ByteOrder>(&self, buf: &mut [u8; QUORUM_HEADER_SIZE]) {
        B::write_u32(&mut buf[0..4], HEADER_MAGIC);
        B::write_u32(&mut buf[4..8], self.version);
        B::write_u64(&mut buf[8..16], self.timestamp);
        write_str(&mut buf[16..16 + HOST_LEN], &self.update_host);
        write_str(&mut buf[144..144 + CLUSTER_LEN], &self.cluster);
        B::write_u32(&mut buf[264..268], self.block_size);
        B::write_u32(&mut buf[268..272], self.kernel_block_size);
    }

    fn read_fields<B: ByteOrder>(buf: &[u8]) -> Self {
        Self {
            version: B::read_u32(&buf[4..8]),
            timestamp: B::read_u64(&buf[8..16]),
            update_host: read_str(&buf[16..16 + HOST_LEN]),
            cluster: read_str(&buf[144..144 + CLUSTER_LEN]),
            block_size: B::read_u32(&buf[264..268]),
            kernel_block_size: B::read_u32(&buf[268..272]),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn write_str(dst: &mut [u8], s: &str) {
    let len = s.len().min(dst.len() - 1);
    dst[..len].copy_from_slice(&s.as_bytes()[..len]);
}

fn read_str(src: &[u8]) -> String {
    let end = src.iter().position(|b| *b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}
