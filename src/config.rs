//! Run configuration
//!
//! Plain values handed to [`crate::modes::run`]. Parsing them from a command
//! line lives in the binary; parsing configuration files is left to callers.

use crate::ArchError;
use crate::runtime::streamers::ChannelGrouping;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Host-side sample format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Complex signed 16-bit
    Sc16,
    /// Complex 32-bit float
    Fc32,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::Sc16 => 4,
            SampleFormat::Fc32 => 8,
        }
    }
}

impl FromStr for SampleFormat {
    type Err = ArchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sc16" => Ok(SampleFormat::Sc16),
            "fc32" => Ok(SampleFormat::Fc32),
            other => Err(ArchError::InvalidConfig(format!("unknown sample format '{}'", other))),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SampleFormat::Sc16 => write!(f, "sc16"),
            SampleFormat::Fc32 => write!(f, "fc32"),
        }
    }
}

/// Opaque device-connection descriptor, `key=value` pairs separated by commas
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceArgs(String);

impl DeviceArgs {
    pub fn new(args: impl Into<String>) -> Self {
        Self(args.into())
    }

    /// Append per-device addresses, e.g. `addr0=192.168.10.2`
    pub fn with_addresses(mut self, addresses: &[String]) -> Self {
        for addr in addresses {
            if self.0.is_empty() {
                self.0 = addr.clone();
            } else {
                self.0 = format!("{}, {}", self.0, addr);
            }
        }
        self
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value of `key`, if present
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| k.trim() == key)
            .map(|(_, v)| v.trim())
    }
}

impl fmt::Display for DeviceArgs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which acquisition/playback arrangement to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One replay tx channel into every rx channel (or one rx) on a single streamer
    SingleLoopback,
    /// Each tx channel in turn, all rx channels recorded per tx channel
    IterativeLoopback,
    /// Host streams a file to every tx channel while all rx channels record
    HostFullDuplex,
    /// Replay memory plays to tx channels while all rx channels record
    ReplayFullDuplex,
    /// Replay loopback repeated at each step of a frequency sweep
    MultiFreqLoopback,
}

impl FromStr for RunMode {
    type Err = ArchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single-loopback" => Ok(RunMode::SingleLoopback),
            "iterative-loopback" => Ok(RunMode::IterativeLoopback),
            "host-full-duplex" => Ok(RunMode::HostFullDuplex),
            "replay-full-duplex" => Ok(RunMode::ReplayFullDuplex),
            "multifreq-loopback" => Ok(RunMode::MultiFreqLoopback),
            other => Err(ArchError::InvalidConfig(format!("unknown run mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: RunMode,
    pub device: DeviceArgs,
    /// Clock/time reference applied to every motherboard before syncing
    pub clock_ref: Option<String>,
    pub stream_args: String,

    /// Base name of the per-channel output files
    pub rx_file: String,
    /// Sample file sent by tx workers or loaded into replay memory
    pub tx_file: PathBuf,
    pub format: SampleFormat,
    pub otw: String,
    /// Samples per transfer, 0 selects the endpoint default
    pub spb: usize,
    /// Samples per channel to capture/replay, 0 streams continuously
    pub nsamps: u64,
    /// Bounded timeout of every transfer call
    pub rx_timeout: Duration,
    pub rx_grouping: ChannelGrouping,
    /// Grouping of host tx streamers; replay loading always uses one per replay block
    pub tx_grouping: ChannelGrouping,
    /// Wall-clock limit measured on the device clock, zero disables it
    pub time_requested: Duration,

    pub lead_time: Duration,
    pub settle_interval: Duration,
    pub nruns: usize,
    pub repeat_delay: Duration,
    pub time_adjust: Duration,

    pub single_txrx_loopback: bool,
    pub single_tx: usize,
    pub single_rx: usize,
    pub tx_all_channels: bool,

    pub rx_rate: f64,
    pub tx_freq: f64,
    /// Sweep bounds and step in Hz, both bounds inclusive
    pub freq_start: f64,
    pub freq_stop: f64,
    pub freq_step: f64,
    pub folder_name: String,
    /// Parallel lists: channel indices per entry, and the directory they share
    pub rx_file_channels: Vec<String>,
    pub rx_file_locations: Vec<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::ReplayFullDuplex,
            device: DeviceArgs::default(),
            clock_ref: Some("external".to_string()),
            stream_args: String::new(),
            rx_file: "test.dat".to_string(),
            tx_file: PathBuf::from("usrp_samples.dat"),
            format: SampleFormat::Sc16,
            otw: "sc16".to_string(),
            spb: 0,
            nsamps: 16000,
            rx_timeout: Duration::from_secs(3),
            rx_grouping: ChannelGrouping::PerDevice,
            tx_grouping: ChannelGrouping::PerDevice,
            time_requested: Duration::ZERO,
            lead_time: Duration::from_secs(2),
            settle_interval: Duration::from_secs(1),
            nruns: 1,
            repeat_delay: Duration::ZERO,
            time_adjust: Duration::from_secs(2),
            single_txrx_loopback: false,
            single_tx: 0,
            single_rx: 0,
            tx_all_channels: true,
            rx_rate: 0.0,
            tx_freq: 0.0,
            freq_start: 1e9,
            freq_stop: 5.5e9,
            freq_step: 100e6,
            folder_name: String::new(),
            rx_file_channels: Vec::new(),
            rx_file_locations: Vec::new(),
        }
    }
}

impl RunConfig {
    /// Folder stamp `MMDDYYYY_HHMMSS_<rx_file>` from the local clock
    pub fn timestamped_folder(rx_file: &str) -> String {
        let now = chrono::Local::now();
        format!("{}_{}", now.format("%m%d%Y_%H%M%S"), rx_file)
    }

    /// Checks that do not need hardware. Channel bounds are checked again
    /// once the topology is known.
    pub fn validate(&self) -> Result<(), ArchError> {
        if self.nruns == 0 {
            return Err(ArchError::InvalidConfig("nruns must be at least 1".to_string()));
        }
        if self.rx_timeout.is_zero() {
            return Err(ArchError::InvalidConfig(
                "rx_timeout must be positive, an unbounded transfer call cannot observe the stop flag".to_string(),
            ));
        }
        if self.rx_file.is_empty() {
            return Err(ArchError::InvalidConfig("rx_file must not be empty".to_string()));
        }
        let stepped = matches!(self.mode, RunMode::IterativeLoopback | RunMode::MultiFreqLoopback);
        if stepped && self.nsamps == 0 && self.time_requested.is_zero() {
            return Err(ArchError::InvalidConfig(
                "iterative and sweep modes need a finite nsamps or a time limit".to_string(),
            ));
        }
        if self.mode == RunMode::MultiFreqLoopback {
            let valid = |f: f64| f.is_finite() && f > 0.0;
            if !valid(self.freq_start) || !valid(self.freq_step) || !valid(self.freq_stop) {
                return Err(ArchError::InvalidConfig(
                    "sweep start, stop and step must be positive frequencies".to_string(),
                ));
            }
            if self.freq_stop < self.freq_start {
                return Err(ArchError::InvalidConfig(format!(
                    "sweep stop {} Hz is below start {} Hz",
                    self.freq_stop, self.freq_start
                )));
            }
        }
        if self.rx_file_channels.len() != self.rx_file_locations.len() {
            return Err(ArchError::InvalidConfig(format!(
                "{} channel lists but {} file locations",
                self.rx_file_channels.len(),
                self.rx_file_locations.len()
            )));
        }
        Ok(())
    }

    /// Sweep frequencies from `freq_start` up to `freq_stop`. Steps are
    /// computed from an index so rounding never accumulates.
    pub fn sweep_frequencies(&self) -> Vec<f64> {
        if self.freq_step <= 0.0 || self.freq_stop < self.freq_start {
            return Vec::new();
        }
        let steps = ((self.freq_stop - self.freq_start) / self.freq_step + 1e-9).floor() as usize;
        (0..=steps).map(|i| self.freq_start + i as f64 * self.freq_step).collect()
    }

    pub fn validate_channels(&self, num_channels: usize) -> Result<(), ArchError> {
        if num_channels == 0 {
            return Err(ArchError::InvalidConfig("topology has no radio channels".to_string()));
        }
        if self.single_tx >= num_channels {
            return Err(ArchError::InvalidConfig(format!(
                "single_tx {} out of range for {} channels",
                self.single_tx, num_channels
            )));
        }
        if self.single_rx >= num_channels {
            return Err(ArchError::InvalidConfig(format!(
                "single_rx {} out of range for {} channels",
                self.single_rx, num_channels
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.nsamps, 16000);
        assert_eq!(cfg.lead_time, Duration::from_secs(2));
        assert_eq!(cfg.time_adjust, Duration::from_secs(2));
        assert_eq!(cfg.format.bytes_per_sample(), 4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_sample_format_parse() {
        assert_eq!("sc16".parse::<SampleFormat>().unwrap(), SampleFormat::Sc16);
        assert_eq!("fc32".parse::<SampleFormat>().unwrap().bytes_per_sample(), 8);
        assert!("fc64".parse::<SampleFormat>().is_err());
    }

    #[test]
    fn test_device_args_lookup() {
        let args = DeviceArgs::new("type=sim,devices=2").with_addresses(&["addr0=10.0.0.2".to_string()]);
        assert_eq!(args.get("type"), Some("sim"));
        assert_eq!(args.get("devices"), Some("2"));
        assert_eq!(args.get("addr0"), Some("10.0.0.2"));
        assert_eq!(args.get("missing"), None);
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let cfg = RunConfig {
            rx_timeout: Duration::ZERO,
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_iterative_needs_an_end() {
        let cfg = RunConfig {
            mode: RunMode::IterativeLoopback,
            nsamps: 0,
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = RunConfig {
            time_requested: Duration::from_secs(1),
            ..cfg
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_sweep_frequencies_include_both_bounds() {
        let cfg = RunConfig {
            mode: RunMode::MultiFreqLoopback,
            freq_start: 1e9,
            freq_stop: 1.3e9,
            freq_step: 1e8,
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_ok());
        let freqs = cfg.sweep_frequencies();
        assert_eq!(freqs.len(), 4);
        assert_eq!(freqs[0], 1e9);
        assert_eq!(freqs[3], 1.3e9);

        assert_eq!(RunConfig::default().sweep_frequencies().len(), 46);
        assert_eq!("multifreq-loopback".parse::<RunMode>().unwrap(), RunMode::MultiFreqLoopback);
    }

    #[test]
    fn test_sweep_bounds_are_validated() {
        let cfg = RunConfig {
            mode: RunMode::MultiFreqLoopback,
            freq_step: 0.0,
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(cfg.sweep_frequencies().is_empty());

        let reversed = RunConfig {
            freq_start: 2e9,
            freq_stop: 1e9,
            freq_step: 1e8,
            ..cfg.clone()
        };
        assert!(reversed.validate().is_err());

        let endless = RunConfig {
            freq_step: 1e8,
            nsamps: 0,
            ..cfg
        };
        assert!(endless.validate().is_err());
    }

    #[test]
    fn test_validate_channels() {
        let cfg = RunConfig {
            single_tx: 3,
            ..RunConfig::default()
        };
        assert!(cfg.validate_channels(4).is_ok());
        assert!(cfg.validate_channels(2).is_err());
        assert!(cfg.validate_channels(0).is_err());
    }

    #[test]
    fn test_timestamped_folder_suffix() {
        let name = RunConfig::timestamped_folder("test.dat");
        assert!(name.ends_with("_test.dat"));
        assert_eq!(name.len(), "MMDDYYYY_HHMMSS_test.dat".len());
    }
}
