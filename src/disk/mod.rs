//! Quorum Disk Access
//!
//! Raw block I/O behind the `BlockDevice` trait, the on-disk layout, and
//! framed reads and writes of the quorum header and status blocks.

pub mod device;
pub mod frame;
pub mod scan;

pub use device::{FileDevice, MemoryDevice};

use crate::error::{Error, Result};
use crate::protocol::{Endian, QuorumHeader, StatusBlock, MAX_NODES_DISK};

/// Minimum space reserved for the header and each slot
const MIN_SLOT_SPACE: u64 = 4096;

/// Byte-addressed storage holding a quorum disk
pub trait BlockDevice: Send {
    /// Read `len` bytes starting at `offset`
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Write `data` at `offset`; returns once the data is durable
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Logical block size of the device
    fn block_size(&self) -> u32;

    /// Name used in logs and cluster manager registration
    fn name(&self) -> &str;
}

/// Space taken by the header and by each status block slot
pub fn slot_space(block_size: u32) -> u64 {
    (block_size as u64).max(MIN_SLOT_SPACE)
}

/// Reject node ids without a slot on disk
pub fn check_node_id(node_id: u32) -> Result<()> {
    if node_id == 0 || node_id as usize > MAX_NODES_DISK {
        return Err(Error::InvalidNodeId {
            node_id,
            max: MAX_NODES_DISK as u32,
        });
    }
    Ok(())
}

/// Byte offset of the slot owned by `node_id` (1-based)
pub fn slot_offset(node_id: u32, block_size: u32) -> Result<u64> {
    check_node_id(node_id)?;
    let space = slot_space(block_size);
    Ok(space + (node_id as u64 - 1) * space)
}

/// Smallest device size that holds the header and every slot
pub fn end_of_disk(block_size: u32) -> u64 {
    slot_space(block_size) * (MAX_NODES_DISK as u64 + 2)
}

/// Framed record access on top of a block device
pub struct QuorumDisk {
    device: Box<dyn BlockDevice>,
    view: u64,
}

impl QuorumDisk {
    /// Wrap a device
    pub fn new(device: Box<dyn BlockDevice>) -> Self {
        Self { device, view: 1 }
    }

    /// Device name
    pub fn name(&self) -> &str {
        self.device.name()
    }

    /// Logical block size of the underlying device
    pub fn block_size(&self) -> u32 {
        self.device.block_size()
    }

    /// Read and verify the quorum header
    pub fn read_header(&self) -> Result<(QuorumHeader, Endian)> {
        let payload = self.read_frame(0)?;
        QuorumHeader::decode(&payload)
    }

    /// Write the quorum header
    pub fn write_header(&self, header: &QuorumHeader) -> Result<()> {
        self.write_frame(0, &header.encode())
    }

    /// Read and verify the status block in `node_id`'s slot
    pub fn read_status(&self, node_id: u32) -> Result<(StatusBlock, Endian)> {
        let payload = self.read_frame(slot_offset(node_id, self.block_size())?)?;
        StatusBlock::decode(&payload)
    }

    /// Write a status block into the slot named by its `node_id`
    pub fn write_status(&self, block: &StatusBlock) -> Result<()> {
        let offset = slot_offset(block.node_id, self.block_size())?;
        self.write_frame(offset, &block.encode())
    }

    fn read_frame(&self, offset: u64) -> Result<Vec<u8>> {
        let raw = self.device.read_at(offset, frame::FRAME_SIZE)?;
        let (_, payload) = frame::decode(&raw)?;
        Ok(payload.to_vec())
    }

    fn write_frame(&self, offset: u64, payload: &[u8]) -> Result<()> {
        let timestamp = chrono::Utc::now().timestamp().max(0) as u64;
        let data = frame::encode(payload, self.view, timestamp)?;
        self.device.write_at(offset, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NodeState;

    #[test]
    fn test_layout() {
        assert_eq!(slot_space(512), 4096);
        assert_eq!(slot_space(8192), 8192);
        assert_eq!(slot_offset(1, 512).unwrap(), 4096);
        assert_eq!(slot_offset(16, 512).unwrap(), 4096 * 16);
        assert_eq!(end_of_disk(512), 4096 * 18);
    }

    #[test]
    fn test_node_ids_outside_slot_range_are_rejected() {
        assert!(matches!(
            slot_offset(0, 512),
            Err(Error::InvalidNodeId { node_id: 0, max: 16 })
        ));
        assert!(matches!(
            slot_offset(17, 512),
            Err(Error::InvalidNodeId { node_id: 17, .. })
        ));

        let device = MemoryDevice::new(512);
        let disk = QuorumDisk::new(Box::new(device.clone()));
        let mut neighbour = StatusBlock::empty(1);
        neighbour.update_node = 1;
        neighbour.state = NodeState::Run;
        disk.write_status(&neighbour).unwrap();

        let mut stray = StatusBlock::empty(0);
        stray.state = NodeState::Init;
        assert!(matches!(
            disk.write_status(&stray),
            Err(Error::InvalidNodeId { node_id: 0, .. })
        ));
        assert!(disk.read_status(0).is_err());

        // Slot 1 still belongs to node 1
        let (read, _) = disk.read_status(1).unwrap();
        assert_eq!(read, neighbour);
    }

    #[test]
    fn test_framed_status_roundtrip() {
        let device = MemoryDevice::new(512);
        let disk = QuorumDisk::new(Box::new(device.clone()));

        let mut block = StatusBlock::empty(4);
        block.update_node = 4;
        block.state = NodeState::Run;
        block.timestamp = 99;
        disk.write_status(&block).unwrap();

        let (read, order) = disk.read_status(4).unwrap();
        assert_eq!(order, Endian::Big);
        assert_eq!(read, block);

        // Neighbouring slots stay untouched
        assert!(matches!(
            disk.read_status(3),
            Err(Error::FrameCorrupted(_))
        ));
    }

    #[test]
    fn test_torn_write_detected() {
        let device = MemoryDevice::new(512);
        let disk = QuorumDisk::new(Box::new(device.clone()));
        disk.write_status(&StatusBlock::empty(2)).unwrap();

        device.corrupt(slot_offset(2, 512).unwrap() + 40);
        assert!(matches!(
            disk.read_status(2),
            Err(Error::FrameCorrupted(_))
        ));
    }
}
