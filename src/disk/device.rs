//! Block Device Backends
//!
//! `FileDevice` opens a real partition (or a plain file) with synchronous
//! writes. `MemoryDevice` is a shared in-memory disk several simulated
//! nodes can attach to.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use super::{end_of_disk, BlockDevice};
use crate::error::{Error, Result};

/// Logical sector size ioctl
const BLKSSZGET: libc::c_ulong = 0x1268;

/// Block size assumed for regular files
const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Quorum disk on a block device or file
pub struct FileDevice {
    file: File,
    name: String,
    block_size: u32,
}

impl FileDevice {
    /// Open a device for synchronous I/O and check it is large enough
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = path.display().to_string();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|e| Error::Device(format!("Failed to open {}: {}", name, e)))?;

        let is_block = file.metadata()?.file_type().is_block_device();
        if !is_block {
            warn!("{} is not a block device", name);
        }

        let block_size = if is_block {
            sector_size(&file)?
        } else {
            DEFAULT_BLOCK_SIZE
        };

        let size = file.seek(SeekFrom::End(0))?;
        let required = end_of_disk(block_size);
        if size < required {
            return Err(Error::DeviceTooSmall {
                device: name,
                size,
                required,
            });
        }

        Ok(Self {
            file,
            name,
            block_size,
        })
    }
}

fn sector_size(file: &File) -> Result<u32> {
    let mut size: libc::c_int = 0;
    // SAFETY: BLKSSZGET writes a single int through the pointer
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKSSZGET as _, &mut size) };
    if ret < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(size.max(1) as u32)
}

impl BlockDevice for FileDevice {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// In-memory quorum disk
///
/// Clones share the data and the failure switches. Use `attach` to get a
/// handle that shares only the data, so one simulated node can fail I/O
/// without affecting the others.
#[derive(Clone)]
pub struct MemoryDevice {
    data: Arc<Mutex<Vec<u8>>>,
    block_size: u32,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryDevice {
    /// Create a zeroed disk of the minimum size
    pub fn new(block_size: u32) -> Self {
        let size = end_of_disk(block_size) as usize;
        Self {
            data: Arc::new(Mutex::new(vec![0u8; size])),
            block_size,
            fail_reads: Arc::new(AtomicBool::new(false)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// New handle on the same data with its own failure switches
    pub fn attach(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            block_size: self.block_size,
            fail_reads: Arc::new(AtomicBool::new(false)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every read through this handle fail
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every write through this handle fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Flip every bit of the byte at `offset`
    pub fn corrupt(&self, offset: u64) {
        if let Ok(mut data) = self.data.lock() {
            if let Some(byte) = data.get_mut(offset as usize) {
                *byte ^= 0xff;
            }
        }
    }

    fn check_range(len: usize, offset: u64, size: usize) -> Result<usize> {
        let start = offset as usize;
        if start.checked_add(size).map_or(true, |end| end > len) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "access past end of device",
            )));
        }
        Ok(start)
    }
}

impl BlockDevice for MemoryDevice {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("injected read failure")));
        }
        let data = self
            .data
            .lock()
            .map_err(|_| Error::Device("memory device lock poisoned".into()))?;
        let start = Self::check_range(data.len(), offset, len)?;
        Ok(data[start..start + len].to_vec())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("injected write failure")));
        }
        let mut data = self
            .data
            .lock()
            .map_err(|_| Error::Device("memory device lock poisoned".into()))?;
        let start = Self::check_range(data.len(), offset, buf.len())?;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn name(&self) -> &str {
        "memory"
    }
}
