//! Hardware driver interface
//!
//! The orchestration engine never talks to hardware directly. Everything it
//! needs from the radio driver (device discovery, block enumeration, graph
//! wiring, streamer creation, the blocking transfer primitive, the device
//! clock, and timed stream/record/playback commands) is expressed by the
//! traits in this module.
//!
//! [`sim`] provides an in-process implementation used by the tests and by the
//! command-line tool when no hardware is attached.

pub mod sim;

use crate::config::{DeviceArgs, SampleFormat};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::sync::Arc;
use std::time::Duration;

/// Error reported by the driver collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("no device matches '{0}'")]
    NotFound(String),

    #[error("driver rejected request: {0}")]
    Rejected(String),

    #[error("command failed: {0}")]
    Command(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Identifier of a processing block, e.g. `0/Radio#1`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub device: usize,
    pub name: String,
    pub index: usize,
}

impl BlockId {
    pub fn new(device: usize, name: impl Into<String>, index: usize) -> Self {
        Self {
            device,
            name: name.into(),
            index,
        }
    }

    /// Block-type match on the block name (`"DDC"` matches `0/DDC#1`)
    pub fn matches(&self, block_type: &str) -> bool {
        self.name == block_type
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}#{}", self.device, self.name, self.index)
    }
}

/// Static connection between two block ports, as compiled into the device image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub src_block: BlockId,
    pub src_port: usize,
    pub dst_block: BlockId,
    pub dst_port: usize,
}

/// Handle number the driver assigns to a created streamer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamerId(pub usize);

impl fmt::Display for StreamerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Streamer#{}", self.0)
    }
}

/// Anything that can sit at either end of a graph connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Node {
    Block(BlockId),
    RxStreamer(StreamerId),
    TxStreamer(StreamerId),
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Node::Block(id) => write!(f, "{}", id),
            Node::RxStreamer(id) => write!(f, "Rx{}", id),
            Node::TxStreamer(id) => write!(f, "Tx{}", id),
        }
    }
}

/// A specific port on a [`Node`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub node: Node,
    pub port: usize,
}

impl PortRef {
    pub fn block(id: BlockId, port: usize) -> Self {
        Self {
            node: Node::Block(id),
            port,
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.port)
    }
}

/// Absolute device time in nanoseconds since the last synchronization edge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeSpec(u64);

impl TimeSpec {
    pub const ZERO: TimeSpec = TimeSpec(0);

    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self::from(Duration::from_secs_f64(secs.max(0.0)))
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Time remaining until `self`, or zero if already passed
    pub fn saturating_since(&self, earlier: TimeSpec) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl From<Duration> for TimeSpec {
    fn from(d: Duration) -> Self {
        Self(d.as_nanos().min(u64::MAX as u128) as u64)
    }
}

impl Add<Duration> for TimeSpec {
    type Output = TimeSpec;

    fn add(self, rhs: Duration) -> TimeSpec {
        TimeSpec(self.0.saturating_add(TimeSpec::from(rhs).0))
    }
}

impl AddAssign<Duration> for TimeSpec {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub for TimeSpec {
    type Output = Duration;

    fn sub(self, rhs: TimeSpec) -> Duration {
        self.saturating_since(rhs)
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

/// Stream command mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    StartContinuous,
    NumSampsAndDone,
    StopContinuous,
}

/// Timed start/stop command for an rx streamer or a replay port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCmd {
    pub mode: StreamMode,
    pub num_samps: u64,
    pub stream_now: bool,
    pub time_spec: TimeSpec,
}

impl StreamCmd {
    /// Timed start: finite when `num_samps > 0`, continuous otherwise
    pub fn start_at(num_samps: u64, time_spec: TimeSpec) -> Self {
        let mode = if num_samps == 0 {
            StreamMode::StartContinuous
        } else {
            StreamMode::NumSampsAndDone
        };
        Self {
            mode,
            num_samps,
            stream_now: false,
            time_spec,
        }
    }

    pub fn stop() -> Self {
        Self {
            mode: StreamMode::StopContinuous,
            num_samps: 0,
            stream_now: true,
            time_spec: TimeSpec::ZERO,
        }
    }
}

/// Status of one call to [`RxStream::recv`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxErrorCode {
    Ok,
    Timeout,
    Overflow,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxMetadata {
    pub error_code: RxErrorCode,
    /// Overflow reported as an out-of-sequence packet rather than dropped samples
    pub out_of_sequence: bool,
    pub time_spec: Option<TimeSpec>,
}

impl RxMetadata {
    pub fn ok(time_spec: TimeSpec) -> Self {
        Self {
            error_code: RxErrorCode::Ok,
            out_of_sequence: false,
            time_spec: Some(time_spec),
        }
    }

    pub fn error(error_code: RxErrorCode) -> Self {
        Self {
            error_code,
            out_of_sequence: false,
            time_spec: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxMetadata {
    pub start_of_burst: bool,
    pub end_of_burst: bool,
    pub time_spec: Option<TimeSpec>,
}

/// Arguments for streamer creation
#[derive(Debug, Clone, PartialEq)]
pub struct StreamArgs {
    pub cpu_format: SampleFormat,
    pub otw_format: String,
    /// Samples per packet override
    pub spp: Option<usize>,
    /// Destination block for tx streamers that feed a specific block
    pub block_id: Option<BlockId>,
    pub block_port: Option<usize>,
    /// Free-form driver arguments passed through unchanged
    pub extra: String,
}

impl StreamArgs {
    pub fn new(cpu_format: SampleFormat, otw_format: impl Into<String>) -> Self {
        Self {
            cpu_format,
            otw_format: otw_format.into(),
            spp: None,
            block_id: None,
            block_port: None,
            extra: String::new(),
        }
    }
}

/// Receive streamer. `recv` is the blocking transfer primitive.
pub trait RxStream: Send + Sync {
    fn id(&self) -> StreamerId;

    fn num_channels(&self) -> usize;

    /// Maximum number of samples per channel a single `recv` can return
    fn max_num_samps(&self) -> usize;

    fn issue_stream_cmd(&self, cmd: &StreamCmd) -> DriverResult<()>;

    /// Fill one buffer per channel with up to `nsamps` samples, blocking at
    /// most `timeout`. Returns the samples received per channel.
    fn recv(&self, buffs: &mut [Vec<u8>], nsamps: usize, timeout: Duration) -> (usize, RxMetadata);
}

/// Transmit streamer
pub trait TxStream: Send + Sync {
    fn id(&self) -> StreamerId;

    fn num_channels(&self) -> usize;

    fn max_num_samps(&self) -> usize;

    /// Send `nsamps` samples from each channel buffer; returns samples sent
    fn send(&self, buffs: &[&[u8]], nsamps: usize, md: &TxMetadata, timeout: Duration) -> DriverResult<usize>;
}

/// On-device replay memory with two ports
pub trait ReplayBlock: Send + Sync {
    fn block_id(&self) -> &BlockId;

    fn record(&self, offset: u64, size: u64, port: usize) -> DriverResult<()>;

    fn record_restart(&self, port: usize) -> DriverResult<()>;

    /// Bytes currently stored in the record buffer
    fn record_fullness(&self, port: usize) -> u64;

    fn config_play(&self, offset: u64, size: u64, port: usize) -> DriverResult<()>;

    fn issue_stream_cmd(&self, cmd: &StreamCmd, port: usize) -> DriverResult<()>;

    fn stop(&self, port: usize) -> DriverResult<()>;
}

/// One connected session spanning every attached device
pub trait Graph: Send + Sync {
    fn num_mboards(&self) -> usize;

    /// Blocks whose type name equals `block_type`, in driver order
    fn find_blocks(&self, block_type: &str) -> Vec<BlockId>;

    fn static_connections(&self) -> Vec<GraphEdge>;

    fn replay_block(&self, id: &BlockId) -> DriverResult<Arc<dyn ReplayBlock>>;

    fn create_rx_streamer(&self, num_channels: usize, args: &StreamArgs) -> DriverResult<Arc<dyn RxStream>>;

    fn create_tx_streamer(&self, num_channels: usize, args: &StreamArgs) -> DriverResult<Arc<dyn TxStream>>;

    fn connect(&self, src: &PortRef, dst: &PortRef) -> DriverResult<()>;

    fn commit(&self) -> DriverResult<()>;

    fn set_clock_source(&self, mboard: usize, source: &str) -> DriverResult<()>;

    fn set_time_source(&self, mboard: usize, source: &str) -> DriverResult<()>;

    /// Tune the receive path of radio channel `chan` to `freq` Hz
    fn set_rx_freq(&self, chan: usize, freq: f64) -> DriverResult<()>;

    /// Tune the transmit path of radio channel `chan` to `freq` Hz
    fn set_tx_freq(&self, chan: usize, freq: f64) -> DriverResult<()>;

    /// Set `time` on every device at the next reference edge
    fn synchronize_devices(&self, time: TimeSpec) -> bool;

    /// Device-synchronized clock of motherboard `mboard`
    fn time_now(&self, mboard: usize) -> TimeSpec;
}

/// Entry point of the driver: connects to hardware described by `args`
pub trait Driver {
    fn open(&self, args: &DeviceArgs) -> DriverResult<Arc<dyn Graph>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_ordering_is_device_then_type_then_index() {
        let mut ids = vec![
            BlockId::new(1, "Radio", 0),
            BlockId::new(0, "Radio", 1),
            BlockId::new(0, "Radio", 0),
        ];
        ids.sort();
        assert_eq!(ids[0].to_string(), "0/Radio#0");
        assert_eq!(ids[1].to_string(), "0/Radio#1");
        assert_eq!(ids[2].to_string(), "1/Radio#0");
    }

    #[test]
    fn test_timespec_add_is_exact() {
        let now = TimeSpec::from_nanos(1_234_567_891);
        let later = now + Duration::from_secs(2);
        assert_eq!(later.as_nanos(), 3_234_567_891);
        assert_eq!(later - now, Duration::from_secs(2));
        assert_eq!(now - later, Duration::ZERO);
    }

    #[test]
    fn test_stream_cmd_mode_follows_sample_count() {
        assert_eq!(StreamCmd::start_at(0, TimeSpec::ZERO).mode, StreamMode::StartContinuous);
        assert_eq!(StreamCmd::start_at(10, TimeSpec::ZERO).mode, StreamMode::NumSampsAndDone);
    }
}
