//! Synchronized multi-channel capture and playback for clock-shared radio
//! front-ends
//!
//! A run discovers the device graph, opens streamers for the selected
//! channels, aligns every device clock and then starts one worker thread per
//! streamer against a shared start time. Transmit comes either from a host
//! file or from on-device replay memory loaded before the run.
//!
//! # Architecture
//!
//! - **Topology**: radio, converter and replay blocks found on the graph
//! - **Streamers**: rx and tx endpoints grouped per channel, device or run
//! - **Timing**: clock source selection, device sync and start times
//! - **Workers**: thread-per-worker pool joined at an rx-then-tx barrier
//! - **Replay**: loading a sample file into replay memory
//! - **Output**: per-channel capture file naming and writers
//!
//! # Example
//!
//! ```no_run
//! use lockstep::config::{RunConfig, RunMode};
//! use lockstep::driver::sim::{SimConfig, SimDriver};
//! use lockstep::runtime::StopFlag;
//!
//! let config = RunConfig {
//!     mode: RunMode::ReplayFullDuplex,
//!     nsamps: 16000,
//!     ..RunConfig::default()
//! };
//! let driver = SimDriver::new(SimConfig::default());
//! let summary = lockstep::modes::run(&config, &driver, &StopFlag::new())?;
//! println!("{} worker failures", summary.report.failures());
//! # Ok::<(), lockstep::ArchError>(())
//! ```

use thiserror::Error;

pub mod config;
pub mod driver;
pub mod modes;
pub mod runtime;
pub mod workers;

pub use config::{DeviceArgs, RunConfig, RunMode, SampleFormat};
pub use modes::{ModeStrategy, RunSummary, run, run_on};
pub use runtime::{
    NamingError, ReplayError, StopFlag, StreamerError, SyncError, TopologyError, WorkError, WorkResult,
    Watchdog, WorkerPool,
};

#[derive(Error, Debug)]
pub enum ArchError {
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Streamer error: {0}")]
    Streamer(#[from] StreamerError),

    #[error("Synchronization error: {0}")]
    Sync(#[from] SyncError),

    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),

    #[error("Output naming error: {0}")]
    Naming(#[from] NamingError),

    #[error("Worker error: {0}")]
    Work(#[from] WorkError),

    #[error("Failed to tune {direction} channel {chan} to {freq} Hz: {source}")]
    Tune {
        direction: &'static str,
        chan: usize,
        freq: f64,
        source: driver::DriverError,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, ArchError>;
