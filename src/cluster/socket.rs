//! Unix Socket Cluster Manager Client
//!
//! Each call sends one request frame and reads one response frame. A frame
//! is an 8-byte header (length and CRC32, little-endian) followed by a
//! bincode body.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ClusterEvent, ClusterManager, ClusterMember};
use crate::error::{Error, Result};

/// Largest frame body accepted from the cluster manager
const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Bound on every socket read and write
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests sent to the cluster manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    IsActive,
    LocalNodeId,
    Members,
    RegisterQuorumDevice { name: String, votes: u32 },
    UnregisterQuorumDevice,
    PollQuorumDevice { available: bool },
    KillNode { node_id: u32 },
    LeaveCluster,
    Dispatch { timeout_ms: u64 },
}

/// Responses from the cluster manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Active(bool),
    NodeId(u32),
    Members(Vec<ClusterMember>),
    Events(Vec<ClusterEvent>),
    Error(String),
}

/// Frame header for the control socket
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a header for a body
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut length = [0u8; 4];
        let mut checksum = [0u8; 4];
        length.copy_from_slice(&bytes[0..4]);
        checksum.copy_from_slice(&bytes[4..8]);
        Self {
            length: u32::from_le_bytes(length),
            checksum: u32::from_le_bytes(checksum),
        }
    }
}

/// Write a framed message
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let body = bincode::serialize(message)?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;

    Ok(())
}

/// Read a framed message
pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<T> {
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes)?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME_LEN {
        return Err(Error::ClusterProtocol(format!(
            "Frame of {} bytes exceeds limit",
            header.length
        )));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body)?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::ClusterProtocol("Message checksum mismatch".into()));
    }

    Ok(bincode::deserialize(&body)?)
}

/// Cluster manager reached over a Unix socket
pub struct SocketClusterManager {
    path: PathBuf,
    stream: Option<UnixStream>,
}

impl SocketClusterManager {
    /// Create a client; the connection is made lazily
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            stream: None,
        }
    }

    fn connect(&mut self) -> Result<&mut UnixStream> {
        if self.stream.is_none() {
            let stream = UnixStream::connect(&self.path).map_err(|e| {
                Error::ClusterUnavailable(format!("{}: {}", self.path.display(), e))
            })?;
            stream.set_read_timeout(Some(IO_TIMEOUT))?;
            stream.set_write_timeout(Some(IO_TIMEOUT))?;
            debug!("Connected to cluster manager at {}", self.path.display());
            self.stream = Some(stream);
        }

        self.stream
            .as_mut()
            .ok_or_else(|| Error::ClusterUnavailable(self.path.display().to_string()))
    }

    fn call(&mut self, request: Request) -> Result<Response> {
        let result = self.exchange(&request);
        if result.is_err() {
            // Reconnect on the next call
            self.stream = None;
        }

        match result? {
            Response::Error(msg) => Err(Error::ClusterRequest(msg)),
            response => Ok(response),
        }
    }

    fn exchange(&mut self, request: &Request) -> Result<Response> {
        let stream = self.connect()?;
        write_frame(stream, request)?;
        read_frame(stream)
    }

    fn expect_ok(&mut self, request: Request) -> Result<()> {
        match self.call(request)? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> Error {
    warn!("Unexpected cluster manager response: {:?}", response);
    Error::ClusterProtocol(format!("Unexpected response: {:?}", response))
}

impl ClusterManager for SocketClusterManager {
    fn is_active(&mut self) -> Result<bool> {
        match self.call(Request::IsActive)? {
            Response::Active(active) => Ok(active),
            other => Err(unexpected(other)),
        }
    }

    fn local_node_id(&mut self) -> Result<u32> {
        match self.call(Request::LocalNodeId)? {
            Response::NodeId(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    fn members(&mut self) -> Result<Vec<ClusterMember>> {
        match self.call(Request::Members)? {
            Response::Members(members) => Ok(members),
            other => Err(unexpected(other)),
        }
    }

    fn register_quorum_device(&mut self, name: &str, votes: u32) -> Result<()> {
        self.expect_ok(Request::RegisterQuorumDevice {
            name: name.to_string(),
            votes,
        })
    }

    fn unregister_quorum_device(&mut self) -> Result<()> {
        self.expect_ok(Request::UnregisterQuorumDevice)
    }

    fn poll_quorum_device(&mut self, available: bool) -> Result<()> {
        self.expect_ok(Request::PollQuorumDevice { available })
    }

    fn kill_node(&mut self, node_id: u32) -> Result<()> {
        self.expect_ok(Request::KillNode { node_id })
    }

    fn leave_cluster(&mut self) -> Result<()> {
        self.expect_ok(Request::LeaveCluster)
    }

    fn dispatch(&mut self, timeout: Duration) -> Result<Vec<ClusterEvent>> {
        let request = Request::Dispatch {
            timeout_ms: timeout.as_millis() as u64,
        };
        match self.call(request)? {
            Response::Events(events) => Ok(events),
            other => Err(unexpected(other)),
        }
    }
}
