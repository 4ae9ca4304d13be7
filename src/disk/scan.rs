//! Quorum Disk Discovery and Initialization
//!
//! Finds quorum disks by label through /proc/partitions, validates a
//! configured device, and writes a fresh layout for `qdiskd init`.

use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{FileDevice, QuorumDisk};
use crate::error::{Error, Result};
use crate::protocol::{QuorumHeader, StatusBlock, MAX_NODES_DISK, VERSION_MAGIC_V2};

/// Partition table exported by the kernel
pub const PROC_PARTITIONS: &str = "/proc/partitions";

/// A device carrying a valid quorum header
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDisk {
    pub path: String,
    pub header: QuorumHeader,
}

/// Parse the device names out of a /proc/partitions listing
pub fn parse_partitions(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // major minor #blocks name
            if fields.len() != 4 || fields[0].parse::<u32>().is_err() {
                return None;
            }
            Some(format!("/dev/{}", fields[3]))
        })
        .collect()
}

/// Probe every partition for a quorum header
pub fn scan() -> Result<Vec<DiscoveredDisk>> {
    let content = fs::read_to_string(PROC_PARTITIONS)?;
    let mut found = Vec::new();

    for path in parse_partitions(&content) {
        let device = match FileDevice::open(&path) {
            Ok(device) => device,
            Err(e) => {
                debug!("Skipping {}: {}", path, e);
                continue;
            }
        };

        match QuorumDisk::new(Box::new(device)).read_header() {
            Ok((header, _)) => found.push(DiscoveredDisk { path, header }),
            Err(e) => debug!("{} is not a quorum disk: {}", path, e),
        }
    }

    Ok(found)
}

/// Find the device whose header carries `label`
pub fn find_by_label(label: &str) -> Result<String> {
    scan()?
        .into_iter()
        .find(|disk| disk.header.cluster == label)
        .map(|disk| {
            info!("Quorum partition {} matches label '{}'", disk.path, label);
            disk.path
        })
        .ok_or_else(|| Error::LabelNotFound(label.to_string()))
}

/// Verify a disk carries a usable quorum header
pub fn check_device(disk: &QuorumDisk) -> Result<QuorumHeader> {
    let (header, _) = disk
        .read_header()
        .map_err(|e| match e {
            Error::LegacyFormat(_) => e,
            _ => Error::NoQuorumHeader(disk.name().to_string()),
        })?;

    if header.version == VERSION_MAGIC_V2 && header.kernel_block_size != disk.block_size() {
        return Err(Error::BlockSizeMismatch {
            device: disk.name().to_string(),
            header: header.kernel_block_size,
            kernel: disk.block_size(),
        });
    }

    Ok(header)
}

/// Open a device path and validate its header
pub fn open_device<P: AsRef<Path>>(path: P) -> Result<(QuorumDisk, QuorumHeader)> {
    let disk = QuorumDisk::new(Box::new(FileDevice::open(path)?));
    let header = check_device(&disk)?;
    Ok((disk, header))
}

/// Write a fresh header and blank status blocks for every node
pub fn initialize(disk: &QuorumDisk, host: &str, label: &str) -> Result<()> {
    match disk.read_header() {
        Ok((old, _)) => warn!(
            "Overwriting quorum disk {} (label '{}')",
            disk.name(),
            old.cluster
        ),
        Err(Error::LegacyFormat(_)) => warn!("Overwriting legacy quorum disk {}", disk.name()),
        Err(_) => {}
    }

    let header = QuorumHeader::new(host, label, disk.block_size());
    disk.write_header(&header)?;
    info!("Initialized quorum header on {} with label '{}'", disk.name(), label);

    for node_id in 1..=MAX_NODES_DISK as u32 {
        disk.write_status(&StatusBlock::empty(node_id))?;
    }
    info!("Initialized {} status blocks", MAX_NODES_DISK);

    Ok(())
}

/// Initialize the device at `path`
pub fn init_disk<P: AsRef<Path>>(path: P, label: &str) -> Result<()> {
    let disk = QuorumDisk::new(Box::new(FileDevice::open(path)?));
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    initialize(&disk, &host, label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{end_of_disk, MemoryDevice};
    use crate::protocol::NodeState;

    #[test]
    fn test_parse_partitions() {
        let content = "major minor  #blocks  name\n\n   8        0  976762584 sda\n   8        1     102400 sda1\n 253        0   10485760 dm-0\n";
        assert_eq!(
            parse_partitions(content),
            vec!["/dev/sda", "/dev/sda1", "/dev/dm-0"]
        );
    }

    #[test]
    fn test_initialize_and_check() {
        let disk = QuorumDisk::new(Box::new(MemoryDevice::new(512)));
        assert!(matches!(
            check_device(&disk),
            Err(Error::NoQuorumHeader(_))
        ));

        initialize(&disk, "node-a", "testqdisk").unwrap();
        let header = check_device(&disk).unwrap();
        assert_eq!(header.cluster, "testqdisk");
        assert_eq!(header.update_host, "node-a");

        for node_id in 1..=MAX_NODES_DISK as u32 {
            let (block, _) = disk.read_status(node_id).unwrap();
            assert_eq!(block.node_id, node_id);
            assert_eq!(block.update_node, 0);
            assert_eq!(block.state, NodeState::None);
        }
    }

    #[test]
    fn test_block_size_mismatch() {
        let device = MemoryDevice::new(512);
        let disk = QuorumDisk::new(Box::new(device.clone()));
        let mut header = QuorumHeader::new("node-a", "qdisk", 512);
        header.kernel_block_size = 4096;
        disk.write_header(&header).unwrap();

        assert!(matches!(
            check_device(&disk),
            Err(Error::BlockSizeMismatch { header: 4096, kernel: 512, .. })
        ));
    }

    #[test]
    fn test_init_file_device() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(end_of_disk(512)).unwrap();

        init_disk(file.path(), "fileqdisk").unwrap();
        let (_, header) = open_device(file.path()).unwrap();
        assert_eq!(header.cluster, "fileqdisk");
    }
}
