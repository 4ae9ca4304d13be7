//! qdiskd Error Types

use thiserror::Error;

use crate::failsafe::FailSafeReason;

/// Result type alias for qdiskd operations
pub type Result<T> = std::result::Result<T, Error>;

/// qdiskd error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Device errors
    #[error("Device error: {0}")]
    Device(String),

    #[error("Device {device} too small: {size} bytes, need {required}")]
    DeviceTooSmall {
        device: String,
        size: u64,
        required: u64,
    },

    #[error("Device {0} does not carry a quorum disk header")]
    NoQuorumHeader(String),

    #[error("Device {device} block size mismatch: header says {header}, kernel says {kernel}")]
    BlockSizeMismatch {
        device: String,
        header: u32,
        kernel: u32,
    },

    #[error("Node ID {node_id} has no status slot (valid range 1..={max})")]
    InvalidNodeId { node_id: u32, max: u32 },

    #[error("No device matches label '{0}'")]
    LabelNotFound(String),

    // Codec errors
    #[error("Bad magic number 0x{0:08x}")]
    BadMagic(u32),

    #[error("Legacy on-disk format (magic 0x{0:08x}) is not supported")]
    LegacyFormat(u32),

    #[error("Unknown node state 0x{0:02x}")]
    UnknownState(u8),

    #[error("Frame corrupted: {0}")]
    FrameCorrupted(&'static str),

    #[error("Payload of {0} bytes does not fit in a disk frame")]
    PayloadTooLarge(usize),

    #[error("Short buffer: got {got} bytes, need {need}")]
    ShortBuffer { got: usize, need: usize },

    // Cluster manager errors
    #[error("Cluster manager unavailable: {0}")]
    ClusterUnavailable(String),

    #[error("Cluster manager protocol error: {0}")]
    ClusterProtocol(String),

    #[error("Cluster manager request failed: {0}")]
    ClusterRequest(String),

    #[error("Cluster manager serialization error: {0}")]
    ClusterSerialization(#[from] bincode::Error),

    // Protocol anomalies
    #[error("Node {writer} wrote state {state} into our status block")]
    SlotHijacked { writer: u32, state: u8 },

    #[error("Score insufficient at startup ({score}; required={required})")]
    ScoreInsufficient { score: u32, required: u32 },

    #[error("Fail-safe shutdown triggered: {0}")]
    FailSafe(FailSafeReason),

    #[error("Too many I/O errors ({0} consecutive cycles)")]
    TooManyErrors(u32),

    // Heuristics
    #[error("Failed to spawn heuristic '{program}': {reason}")]
    HeuristicSpawn { program: String, reason: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error was raised by the fail-safe path
    pub fn is_fail_safe(&self) -> bool {
        matches!(self, Error::FailSafe(_))
    }
}
