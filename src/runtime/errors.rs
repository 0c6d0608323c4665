//! Error types for the runtime system

use crate::driver::DriverError;
use std::path::PathBuf;

/// Errors while discovering blocks and building the wiring plan
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Topology is missing blocks: {0}")]
    MissingBlocks(String),

    #[error("Driver error during discovery: {0}")]
    Driver(#[from] DriverError),
}

/// Errors while creating, wiring, or committing streamers
#[derive(Debug, thiserror::Error)]
pub enum StreamerError {
    #[error("Driver rejected {direction} streamer with {channels} channels: {source}")]
    StreamerCreateError {
        direction: &'static str,
        channels: usize,
        source: DriverError,
    },

    #[error("Failed to connect {from} -> {to}: {source}")]
    Connect {
        from: String,
        to: String,
        source: DriverError,
    },

    #[error("Failed to commit graph: {0}")]
    Commit(DriverError),
}

/// Errors while aligning device clocks
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Devices did not align to a common time")]
    SyncFailure,

    #[error("Failed to set {kind} source '{source_name}' on motherboard {mboard}: {source}")]
    Source {
        kind: &'static str,
        source_name: String,
        mboard: usize,
        source: DriverError,
    },
}

/// Errors while loading replay memory
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("Failed to read replay file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Replay file {0} holds less than one replay word")]
    EmptyFile(PathBuf),

    #[error("Replay write incomplete: sent {sent} of {expected} samples")]
    IncompleteWrite { sent: usize, expected: usize },

    #[error("Record buffer on {block} port {port} still holds {fullness} bytes after {attempts} drain attempts")]
    DrainTimeout {
        block: String,
        port: usize,
        fullness: u64,
        attempts: usize,
    },

    #[error("Record buffer on {block} port {port} reached {fullness} of {expected} bytes")]
    RecordTimeout {
        block: String,
        port: usize,
        fullness: u64,
        expected: u64,
    },

    #[error("Topology has no replay blocks")]
    NoReplayEndpoint,

    #[error("Sample size {sample} does not divide replay word size {word}")]
    UnalignedSample { sample: usize, word: usize },

    #[error("Replay command failed: {0}")]
    Driver(#[from] DriverError),
}

/// Errors while mapping channels to output paths
#[derive(Debug, thiserror::Error)]
pub enum NamingError {
    #[error("{channels} channel lists but {locations} file locations")]
    ConfigMismatch { channels: usize, locations: usize },

    #[error("Channel {0} was never assigned an output location")]
    UnmappedChannel(usize),

    #[error("Invalid channel list '{0}'")]
    InvalidChannelList(String),
}

/// Error type for a worker's streaming loop
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("Receiver error: {0}")]
    ReceiverError(String),

    #[error("Timeout while streaming")]
    Timeout,

    #[error("Overflow, stream out of sequence")]
    Overflow,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Naming error: {0}")]
    Naming(#[from] NamingError),
}

/// Result type for worker loops
pub type WorkResult<T = ()> = Result<T, WorkError>;
