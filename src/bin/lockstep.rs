//! Synchronized capture/replay runner
//!
//! Usage:
//!   lockstep --mode replay-full-duplex --tx-file usrp_samples.dat \
//!       --nsamps 16000 --rx-file-channels "0 1" --rx-file-channels "2 3" \
//!       --rx-file-locations /data/a --rx-file-locations /data/b
//!
//! Runs against the built-in simulated device graph; `--devices` sets how
//! many devices it exposes.

use clap::Parser;
use lockstep::config::{DeviceArgs, RunConfig, RunMode, SampleFormat};
use lockstep::driver::sim::{SimConfig, SimDriver};
use lockstep::runtime::streamers::ChannelGrouping;
use lockstep::runtime::{StopFlag, install_interrupt_handler};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run mode: single-loopback, iterative-loopback, host-full-duplex, replay-full-duplex or multifreq-loopback
    #[arg(long, default_value = "replay-full-duplex")]
    mode: RunMode,

    /// Device address arguments, e.g. "type=sim,devices=2"
    #[arg(long, default_value = "")]
    args: String,

    /// Additional per-device addresses appended to --args
    #[arg(long)]
    addr: Vec<String>,

    /// Number of simulated devices
    #[arg(long, default_value = "1")]
    devices: usize,

    /// Clock and time reference (internal, external, gpsdo)
    #[arg(long = "ref", default_value = "external")]
    clock_ref: String,

    /// Skip clock/time source selection
    #[arg(long)]
    no_ref: bool,

    /// Extra streamer arguments
    #[arg(long, default_value = "")]
    stream_args: String,

    /// Base name of the capture files
    #[arg(long, default_value = "test.dat")]
    rx_file: String,

    /// Sample file to transmit or load into replay memory
    #[arg(long, default_value = "usrp_samples.dat")]
    tx_file: PathBuf,

    /// Host sample format: sc16 or fc32
    #[arg(long, default_value = "sc16")]
    format: SampleFormat,

    /// Over-the-wire format
    #[arg(long, default_value = "sc16")]
    otw: String,

    /// Samples per transfer (0 = streamer default)
    #[arg(long, default_value = "0")]
    spb: usize,

    /// Samples per channel (0 = continuous)
    #[arg(long, default_value = "16000")]
    nsamps: u64,

    /// Transfer timeout in seconds
    #[arg(long, default_value = "3")]
    timeout: f64,

    /// Capture duration limit in seconds on the device clock (0 = none)
    #[arg(long, default_value = "0")]
    duration: f64,

    /// Rx streamer grouping: single, per-device or per-channel
    #[arg(long, default_value = "per-device")]
    rx_grouping: ChannelGrouping,

    /// Host tx streamer grouping: single, per-device or per-channel
    #[arg(long, default_value = "per-device")]
    tx_grouping: ChannelGrouping,

    /// Seconds between clock sync and the first start time
    #[arg(long, default_value = "2")]
    lead_time: f64,

    /// Seconds to wait after synchronizing device clocks
    #[arg(long, default_value = "1")]
    settle: f64,

    /// Number of repeated runs
    #[arg(long, default_value = "1")]
    nruns: usize,

    /// Seconds between runs (0 = lead time)
    #[arg(long, default_value = "0")]
    repeat_delay: f64,

    /// Seconds between consecutive tx channels in iterative loopback
    #[arg(long, default_value = "2")]
    time_adjust: f64,

    /// Loop a single tx channel to a single rx channel
    #[arg(long)]
    single_txrx_loopback: bool,

    #[arg(long, default_value = "0")]
    single_tx: usize,

    #[arg(long, default_value = "0")]
    single_rx: usize,

    /// Transmit on --single-tx only
    #[arg(long)]
    single_tx_only: bool,

    /// Rx sample rate in samples/s (0 = leave unset)
    #[arg(long, default_value = "0")]
    rx_rate: f64,

    /// Tx frequency in Hz, used in capture file names
    #[arg(long, default_value = "0")]
    tx_freq: f64,

    /// First sweep frequency in Hz (multifreq-loopback)
    #[arg(long, default_value = "1e9")]
    freq_start: f64,

    /// Last sweep frequency in Hz, inclusive (multifreq-loopback)
    #[arg(long, default_value = "5.5e9")]
    freq_stop: f64,

    /// Sweep step in Hz (multifreq-loopback)
    #[arg(long, default_value = "100e6")]
    freq_step: f64,

    /// Output folder name (default: timestamped)
    #[arg(long, default_value = "")]
    folder_name: String,

    /// Channel list per output location, e.g. "0 1"
    #[arg(long)]
    rx_file_channels: Vec<String>,

    /// Output directory per channel list
    #[arg(long)]
    rx_file_locations: Vec<PathBuf>,
}

fn seconds(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

impl Args {
    fn into_config(self) -> RunConfig {
        let mut device = DeviceArgs::new(self.args).with_addresses(&self.addr);
        if device.get("devices").is_none() {
            device = DeviceArgs::new(if device.as_str().is_empty() {
                format!("devices={}", self.devices)
            } else {
                format!("{},devices={}", device, self.devices)
            });
        }
        RunConfig {
            mode: self.mode,
            device,
            clock_ref: (!self.no_ref).then_some(self.clock_ref),
            stream_args: self.stream_args,
            rx_file: self.rx_file,
            tx_file: self.tx_file,
            format: self.format,
            otw: self.otw,
            spb: self.spb,
            nsamps: self.nsamps,
            rx_timeout: seconds(self.timeout),
            rx_grouping: self.rx_grouping,
            tx_grouping: self.tx_grouping,
            time_requested: seconds(self.duration),
            lead_time: seconds(self.lead_time),
            settle_interval: seconds(self.settle),
            nruns: self.nruns,
            repeat_delay: seconds(self.repeat_delay),
            time_adjust: seconds(self.time_adjust),
            single_txrx_loopback: self.single_txrx_loopback,
            single_tx: self.single_tx,
            single_rx: self.single_rx,
            tx_all_channels: !self.single_tx_only,
            rx_rate: self.rx_rate,
            tx_freq: self.tx_freq,
            freq_start: self.freq_start,
            freq_stop: self.freq_stop,
            freq_step: self.freq_step,
            folder_name: self.folder_name,
            rx_file_channels: self.rx_file_channels,
            rx_file_locations: self.rx_file_locations,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Args::parse().into_config();
    info!("Device args: {}", config.device);

    let stop = StopFlag::new();
    if let Err(e) = install_interrupt_handler(&stop) {
        warn!("Could not install the Ctrl-C handler: {}", e);
    }

    let driver = SimDriver::new(SimConfig::default());
    match lockstep::run(&config, &driver, &stop) {
        Ok(summary) => {
            info!(
                "{} finished in folder {}: {} worker failures",
                summary.mode,
                summary.folder_name,
                summary.report.failures()
            );
            ExitCode::from(summary.exit_status() as u8)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
