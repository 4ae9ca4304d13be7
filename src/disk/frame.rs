//! Disk Frame
//!
//! Every record on the quorum disk is wrapped in a fixed-size frame with a
//! CRC-protected header, so torn or stale writes are caught on read.

use byteorder::{BigEndian, ByteOrder};
use crc32fast::Hasher;

use crate::error::{Error, Result};

/// Magic number of the frame header
pub const FRAME_MAGIC: u32 = 0x00de_bb1e;

/// Size of one frame on disk
pub const FRAME_SIZE: usize = 512;

/// Size of the frame header
pub const FRAME_HEADER_SIZE: usize = 32;

/// Largest payload a frame can carry
pub const MAX_PAYLOAD: usize = FRAME_SIZE - FRAME_HEADER_SIZE;

/// Frame header, always stored big-endian
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub header_crc: u32,
    pub data_crc: u32,
    pub length: u32,
    pub view: u64,
    /// Writer's wall clock in seconds
    pub timestamp: u64,
}

impl FrameHeader {
    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut bytes = [0u8; FRAME_HEADER_SIZE];
        BigEndian::write_u32(&mut bytes[0..4], FRAME_MAGIC);
        BigEndian::write_u32(&mut bytes[4..8], self.header_crc);
        BigEndian::write_u32(&mut bytes[8..12], self.data_crc);
        BigEndian::write_u32(&mut bytes[12..16], self.length);
        BigEndian::write_u64(&mut bytes[16..24], self.view);
        BigEndian::write_u64(&mut bytes[24..32], self.timestamp);
        bytes
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(Error::ShortBuffer {
                got: bytes.len(),
                need: FRAME_HEADER_SIZE,
            });
        }

        if BigEndian::read_u32(&bytes[0..4]) != FRAME_MAGIC {
            return Err(Error::FrameCorrupted("bad frame magic"));
        }

        Ok(Self {
            header_crc: BigEndian::read_u32(&bytes[4..8]),
            data_crc: BigEndian::read_u32(&bytes[8..12]),
            length: BigEndian::read_u32(&bytes[12..16]),
            view: BigEndian::read_u64(&bytes[16..24]),
            timestamp: BigEndian::read_u64(&bytes[24..32]),
        })
    }

    /// CRC over the encoded header with the CRC field zeroed
    fn compute_crc(&self) -> u32 {
        let mut zeroed = self.clone();
        zeroed.header_crc = 0;
        let mut hasher = Hasher::new();
        hasher.update(&zeroed.to_bytes());
        hasher.finalize()
    }
}

/// Wrap a payload into a full frame
pub fn encode(payload: &[u8], view: u64, timestamp: u64) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::PayloadTooLarge(payload.len()));
    }

    let mut header = FrameHeader {
        header_crc: 0,
        data_crc: crc32fast::hash(payload),
        length: payload.len() as u32,
        view,
        timestamp,
    };
    header.header_crc = header.compute_crc();

    let mut frame = vec![0u8; FRAME_SIZE];
    frame[..FRAME_HEADER_SIZE].copy_from_slice(&header.to_bytes());
    frame[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    Ok(frame)
}

/// Verify a frame and return its header and payload
pub fn decode(frame: &[u8]) -> Result<(FrameHeader, &[u8])> {
    let header = FrameHeader::from_bytes(frame)?;

    if header.compute_crc() != header.header_crc {
        return Err(Error::FrameCorrupted("header checksum mismatch"));
    }

    let length = header.length as usize;
    if length > MAX_PAYLOAD {
        return Err(Error::FrameCorrupted("payload length out of range"));
    }
    if frame.len() < FRAME_HEADER_SIZE + length {
        return Err(Error::ShortBuffer {
            got: frame.len(),
            need: FRAME_HEADER_SIZE + length,
        });
    }

    let payload = &frame[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + length];
    if crc32fast::hash(payload) != header.data_crc {
        return Err(Error::FrameCorrupted("data checksum mismatch"));
    }

    Ok((header, payload))
}
