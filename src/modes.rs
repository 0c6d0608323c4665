//! Run modes
//!
//! Each mode is a [`ModeStrategy`]: it decides which streamers a run needs
//! and which workers to spawn against a prepared [`Session`]. [`run`] does the
//! shared setup (topology, streamers, clock sync, replay loading) in order,
//! then hands over to the strategy.

use crate::config::{RunConfig, RunMode};
use crate::driver::{Driver, Graph};
use crate::runtime::errors::ReplayError;
use crate::runtime::output::{ChannelWriters, LocationTable, OutputNaming};
use crate::runtime::replay::{LoadOptions, ReplayDescriptor, load_replay_buffer, stop_replay, stop_targets};
use crate::runtime::scheduler::{PoolReport, WorkerPool};
use crate::runtime::stop::StopFlag;
use crate::runtime::streamers::{ChannelGrouping, StreamerRequest, Streamers, TxRequest, create_streamers};
use crate::runtime::timing::{Schedule, set_sources, synchronize_clocks};
use crate::runtime::topology::{BlockPort, Topology, discover};
use crate::runtime::watchdog::Watchdog;
use crate::runtime::worker::{Side, Worker, WorkerContext};
use crate::workers::{RecvOptions, RecvWorker, TxFileWorker, TxReplayWorker};
use crate::{ArchError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything a strategy needs once setup is done
pub struct Session<'a> {
    pub config: &'a RunConfig,
    pub graph: Arc<dyn Graph>,
    pub topology: Topology,
    pub streamers: Streamers,
    pub naming: OutputNaming,
    pub replay: Option<ReplayDescriptor>,
    pub stop: StopFlag,
    pub watchdog: Watchdog,
}

impl Session<'_> {
    fn context(&self, schedule: Schedule) -> WorkerContext {
        WorkerContext::new(Arc::clone(&self.graph), schedule, self.stop.clone(), self.watchdog.clone())
    }

    fn schedule_for_run(&self, run: usize, time_adjust: std::time::Duration) -> Schedule {
        Schedule::for_run(
            self.graph.time_now(0),
            run,
            self.config.lead_time,
            self.config.repeat_delay,
            time_adjust,
        )
    }

    fn recv_options(&self, slot: usize) -> RecvOptions {
        RecvOptions {
            nsamps: self.config.nsamps,
            spb: self.config.spb,
            timeout: self.config.rx_timeout,
            time_requested: self.config.time_requested,
            format: self.config.format,
            rate: self.config.rx_rate,
            slot,
        }
    }

    /// One recv worker per rx endpoint, files tagged with `tx_channel` and `run`.
    /// Built before anything is spawned so naming errors leave no stray threads.
    fn receivers(&self, naming: &OutputNaming, tx_channel: usize, run: usize, slot: usize) -> Result<Vec<Box<dyn Worker>>> {
        self.streamers
            .rx
            .iter()
            .enumerate()
            .map(|(index, endpoint)| -> Result<Box<dyn Worker>> {
                let writers = ChannelWriters::new(naming, &endpoint.channels, tx_channel, run)?;
                Ok(Box::new(RecvWorker::new(
                    format!("rx-{}", index),
                    endpoint.clone(),
                    writers,
                    self.recv_options(slot),
                )))
            })
            .collect()
    }

    fn replay_targets(&self, channels: &[usize]) -> Result<Vec<BlockPort>> {
        channels
            .iter()
            .map(|&ch| {
                self.topology
                    .replay_for(ch)
                    .cloned()
                    .ok_or(ArchError::Replay(ReplayError::NoReplayEndpoint))
            })
            .collect()
    }

    fn replay_descriptor(&self) -> Result<ReplayDescriptor> {
        self.replay.ok_or(ArchError::Replay(ReplayError::NoReplayEndpoint))
    }

    fn tune(&self, freq: f64, rx_channels: &[usize], tx_channels: &[usize]) -> Result<()> {
        for &chan in rx_channels {
            self.graph.set_rx_freq(chan, freq).map_err(|source| ArchError::Tune {
                direction: "rx",
                chan,
                freq,
                source,
            })?;
        }
        for &chan in tx_channels {
            self.graph.set_tx_freq(chan, freq).map_err(|source| ArchError::Tune {
                direction: "tx",
                chan,
                freq,
                source,
            })?;
        }
        Ok(())
    }

    /// Stop `targets` once their slot is over. Continuous playback would
    /// otherwise keep transmitting under the next slot.
    fn end_playback(&self, targets: &[BlockPort]) {
        if let Err(e) = stop_targets(self.graph.as_ref(), targets) {
            warn!("Failed to stop replay after slot: {}", e);
        }
    }
}

/// Behavior that varies per run mode
pub trait ModeStrategy {
    fn name(&self) -> &'static str;

    /// Radio channels the tx side drives
    fn tx_channels(&self, config: &RunConfig, topology: &Topology) -> Vec<usize> {
        if config.single_txrx_loopback || !config.tx_all_channels {
            vec![config.single_tx]
        } else {
            (0..topology.num_channels()).collect()
        }
    }

    /// Radio channels the rx side records
    fn rx_channels(&self, config: &RunConfig, topology: &Topology) -> Vec<usize> {
        if config.single_txrx_loopback {
            vec![config.single_rx]
        } else {
            (0..topology.num_channels()).collect()
        }
    }

    fn streamer_request(&self, config: &RunConfig, topology: &Topology) -> StreamerRequest;

    fn uses_replay(&self) -> bool {
        true
    }

    /// Spawn and join the workers of every run
    fn execute(&self, session: &Session) -> Result<PoolReport>;
}

fn base_request(config: &RunConfig, rx_grouping: ChannelGrouping, rx_channels: Vec<usize>, tx: TxRequest) -> StreamerRequest {
    StreamerRequest {
        rx_grouping,
        rx_channels,
        tx,
        format: config.format,
        otw: config.otw.clone(),
        extra_args: config.stream_args.clone(),
    }
}

/// All selected channels start together; replay plays while every rx records
fn execute_simultaneous_replay(session: &Session, tx_channels: &[usize]) -> Result<PoolReport> {
    let descriptor = session.replay_descriptor()?;
    let targets = session.replay_targets(tx_channels)?;
    let tx_channel = tx_channels.first().copied().unwrap_or(0);
    let mut report = PoolReport::default();

    for run in 0..session.config.nruns {
        if session.stop.is_set() {
            warn!("Stop requested, skipping remaining runs");
            break;
        }
        let schedule = session.schedule_for_run(run, std::time::Duration::ZERO);
        info!("Run {}: starting at {}", run, schedule.start);

        let receivers = session.receivers(&session.naming, tx_channel, run, 0)?;
        let mut pool = WorkerPool::new(session.context(schedule));
        pool.spawn(Box::new(TxReplayWorker::new(
            "tx-replay",
            targets.clone(),
            descriptor,
            session.config.nsamps,
        )));
        receivers.into_iter().for_each(|worker| pool.spawn(worker));
        report.merge(pool.join());
    }
    Ok(report)
}

/// One replay channel into a single rx streamer
pub struct SingleLoopback;

impl ModeStrategy for SingleLoopback {
    fn name(&self) -> &'static str {
        "single-loopback"
    }

    fn tx_channels(&self, config: &RunConfig, _topology: &Topology) -> Vec<usize> {
        vec![config.single_tx]
    }

    fn streamer_request(&self, config: &RunConfig, topology: &Topology) -> StreamerRequest {
        base_request(
            config,
            ChannelGrouping::Single,
            self.rx_channels(config, topology),
            TxRequest::Replay {
                channels: self.tx_channels(config, topology),
            },
        )
    }

    fn execute(&self, session: &Session) -> Result<PoolReport> {
        execute_simultaneous_replay(session, &self.tx_channels(session.config, &session.topology))
    }
}

/// Each tx channel in turn, separated by the time adjustment, with every rx
/// channel recorded for each
pub struct IterativeLoopback;

impl ModeStrategy for IterativeLoopback {
    fn name(&self) -> &'static str {
        "iterative-loopback"
    }

    fn streamer_request(&self, config: &RunConfig, topology: &Topology) -> StreamerRequest {
        base_request(
            config,
            config.rx_grouping,
            self.rx_channels(config, topology),
            TxRequest::Replay {
                channels: self.tx_channels(config, topology),
            },
        )
    }

    fn execute(&self, session: &Session) -> Result<PoolReport> {
        let descriptor = session.replay_descriptor()?;
        let tx_channels = self.tx_channels(session.config, &session.topology);
        let mut report = PoolReport::default();

        'runs: for run in 0..session.config.nruns {
            let schedule = session.schedule_for_run(run, session.config.time_adjust);
            for (slot, &tx_channel) in tx_channels.iter().enumerate() {
                if session.stop.is_set() {
                    warn!("Stop requested, skipping remaining transmissions");
                    break 'runs;
                }
                info!(
                    "Run {}: tx channel {} starting at {}",
                    run,
                    tx_channel,
                    schedule.start_for(slot)
                );
                let targets = session.replay_targets(&[tx_channel])?;
                let receivers = session.receivers(&session.naming, tx_channel, run, slot)?;
                let mut pool = WorkerPool::new(session.context(schedule));
                let playback = TxReplayWorker::new(
                    format!("tx-replay-{}", tx_channel),
                    targets.clone(),
                    descriptor,
                    session.config.nsamps,
                );
                pool.spawn(Box::new(playback.with_slot(slot)));
                receivers.into_iter().for_each(|worker| pool.spawn(worker));
                report.merge(pool.join());
                session.end_playback(&targets);
            }
        }
        Ok(report)
    }
}

/// Host streams a file to the tx channels while every rx channel records
pub struct HostFullDuplex;

impl ModeStrategy for HostFullDuplex {
    fn name(&self) -> &'static str {
        "host-full-duplex"
    }

    fn streamer_request(&self, config: &RunConfig, topology: &Topology) -> StreamerRequest {
        base_request(
            config,
            config.rx_grouping,
            self.rx_channels(config, topology),
            TxRequest::Host {
                grouping: config.tx_grouping,
                channels: self.tx_channels(config, topology),
            },
        )
    }

    fn uses_replay(&self) -> bool {
        false
    }

    fn execute(&self, session: &Session) -> Result<PoolReport> {
        let tx_channel = self
            .tx_channels(session.config, &session.topology)
            .first()
            .copied()
            .unwrap_or(0);
        let mut report = PoolReport::default();

        for run in 0..session.config.nruns {
            if session.stop.is_set() {
                warn!("Stop requested, skipping remaining runs");
                break;
            }
            let schedule = session.schedule_for_run(run, std::time::Duration::ZERO);
            info!("Run {}: starting at {}", run, schedule.start);

            let receivers = session.receivers(&session.naming, tx_channel, run, 0)?;
            let mut pool = WorkerPool::new(session.context(schedule));
            for (index, endpoint) in session.streamers.tx.iter().enumerate() {
                pool.spawn(Box::new(TxFileWorker::new(
                    format!("tx-{}", index),
                    endpoint.clone(),
                    &session.config.tx_file,
                    session.config.format,
                    session.config.spb,
                    session.config.rx_timeout,
                )));
            }
            receivers.into_iter().for_each(|worker| pool.spawn(worker));
            report.merge(pool.join());
        }
        Ok(report)
    }
}

/// Replay memory plays to the tx channels while every rx channel records
pub struct ReplayFullDuplex;

impl ModeStrategy for ReplayFullDuplex {
    fn name(&self) -> &'static str {
        "replay-full-duplex"
    }

    fn streamer_request(&self, config: &RunConfig, topology: &Topology) -> StreamerRequest {
        base_request(
            config,
            config.rx_grouping,
            self.rx_channels(config, topology),
            TxRequest::Replay {
                channels: self.tx_channels(config, topology),
            },
        )
    }

    fn execute(&self, session: &Session) -> Result<PoolReport> {
        execute_simultaneous_replay(session, &self.tx_channels(session.config, &session.topology))
    }
}

/// Replay loopback at every frequency of a sweep. Each step retunes all
/// selected channels, takes a fresh start time and writes under its own
/// frequency folder.
pub struct MultiFreqLoopback;

impl ModeStrategy for MultiFreqLoopback {
    fn name(&self) -> &'static str {
        "multifreq-loopback"
    }

    fn streamer_request(&self, config: &RunConfig, topology: &Topology) -> StreamerRequest {
        base_request(
            config,
            config.rx_grouping,
            self.rx_channels(config, topology),
            TxRequest::Replay {
                channels: self.tx_channels(config, topology),
            },
        )
    }

    fn execute(&self, session: &Session) -> Result<PoolReport> {
        let descriptor = session.replay_descriptor()?;
        let tx_channels = self.tx_channels(session.config, &session.topology);
        let rx_channels = self.rx_channels(session.config, &session.topology);
        let targets = session.replay_targets(&tx_channels)?;
        let tx_channel = tx_channels.first().copied().unwrap_or(0);
        let mut report = PoolReport::default();

        'sweep: for freq in session.config.sweep_frequencies() {
            if session.stop.is_set() {
                warn!("Stop requested, skipping remaining frequencies");
                break;
            }
            session.tune(freq, &rx_channels, &tx_channels)?;
            let naming = session.naming.at_frequency(freq);

            for run in 0..session.config.nruns {
                if session.stop.is_set() {
                    warn!("Stop requested, skipping remaining frequencies");
                    break 'sweep;
                }
                let schedule = session.schedule_for_run(run, std::time::Duration::ZERO);
                info!("{:.3} MHz run {}: starting at {}", freq / 1e6, run, schedule.start);

                let receivers = session.receivers(&naming, tx_channel, run, 0)?;
                let mut pool = WorkerPool::new(session.context(schedule));
                pool.spawn(Box::new(TxReplayWorker::new(
                    "tx-replay",
                    targets.clone(),
                    descriptor,
                    session.config.nsamps,
                )));
                receivers.into_iter().for_each(|worker| pool.spawn(worker));
                report.merge(pool.join());
                session.end_playback(&targets);
            }
        }
        Ok(report)
    }
}

pub fn strategy_for(mode: RunMode) -> Box<dyn ModeStrategy> {
    match mode {
        RunMode::SingleLoopback => Box::new(SingleLoopback),
        RunMode::IterativeLoopback => Box::new(IterativeLoopback),
        RunMode::HostFullDuplex => Box::new(HostFullDuplex),
        RunMode::ReplayFullDuplex => Box::new(ReplayFullDuplex),
        RunMode::MultiFreqLoopback => Box::new(MultiFreqLoopback),
    }
}

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub mode: &'static str,
    pub report: PoolReport,
    /// Directory-independent name of the output folder
    pub folder_name: String,
}

impl RunSummary {
    /// Process exit status: non-zero when any worker failed
    pub fn exit_status(&self) -> i32 {
        if self.report.failures() == 0 { 0 } else { 1 }
    }
}

fn output_naming(config: &RunConfig) -> Result<OutputNaming> {
    let table = if config.rx_file_channels.is_empty() {
        LocationTable::single(PathBuf::from("."))
    } else {
        LocationTable::parse(&config.rx_file_channels, &config.rx_file_locations)?
    };
    let folder_name = if config.folder_name.is_empty() {
        RunConfig::timestamped_folder(&config.rx_file)
    } else {
        config.folder_name.clone()
    };
    Ok(OutputNaming {
        base: config.rx_file.clone(),
        frequency: config.tx_freq,
        folder_name,
        table,
    })
}

/// Run `config.mode` end to end. Setup errors are returned before any worker
/// starts; worker failures only show up in the summary.
pub fn run(config: &RunConfig, driver: &dyn Driver, stop: &StopFlag) -> Result<RunSummary> {
    config.validate()?;
    let (graph, topology) = discover(driver, &config.device)?;
    run_on(config, graph, topology, stop)
}

/// [`run`] against an already opened session
pub fn run_on(config: &RunConfig, graph: Arc<dyn Graph>, topology: Topology, stop: &StopFlag) -> Result<RunSummary> {
    config.validate()?;
    let naming = output_naming(config)?;
    let strategy = strategy_for(config.mode);
    info!("Running {}", strategy.name());

    config.validate_channels(topology.num_channels())?;
    if let Some(source) = &config.clock_ref {
        set_sources(graph.as_ref(), source)?;
    }

    if strategy.uses_replay() {
        for ch in strategy.tx_channels(config, &topology) {
            if topology.replay_for(ch).is_none() {
                return Err(ReplayError::NoReplayEndpoint.into());
            }
        }
    }
    let streamers = create_streamers(graph.as_ref(), &topology, &strategy.streamer_request(config, &topology))?;

    synchronize_clocks(graph.as_ref(), config.settle_interval)?;

    let replay = if strategy.uses_replay() {
        Some(load_replay_buffer(
            &config.tx_file,
            graph.as_ref(),
            &streamers.tx,
            config.format,
            &LoadOptions::default(),
        )?)
    } else {
        None
    };

    let folder_name = naming.folder_name.clone();
    let session = Session {
        config,
        graph,
        topology,
        streamers,
        naming,
        replay,
        stop: stop.clone(),
        watchdog: Watchdog::default(),
    };
    let result = strategy.execute(&session);

    if strategy.uses_replay()
        && let Err(e) = stop_replay(session.graph.as_ref(), &session.topology)
    {
        warn!("Failed to stop replay: {}", e);
    }

    let report = result?;
    info!(
        "{} done: {} rx samples, {} worker failures",
        strategy.name(),
        report.samples(Side::Rx),
        report.failures()
    );
    Ok(RunSummary {
        mode: strategy.name(),
        report,
        folder_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SampleFormat;
    use crate::driver::sim::{SimConfig, SimDriver, SimGraph};
    use crate::driver::{BlockId, RxErrorCode};
    use crate::runtime::errors::TopologyError;
    use std::time::Duration;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lockstep-modes-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn config(dir: &PathBuf, mode: RunMode) -> RunConfig {
        let tx_file = dir.join("tx.dat");
        std::fs::write(&tx_file, vec![1u8; 800]).unwrap();
        RunConfig {
            mode,
            tx_file,
            nsamps: 4000,
            rx_timeout: Duration::from_millis(300),
            lead_time: Duration::from_millis(30),
            settle_interval: Duration::ZERO,
            time_adjust: Duration::from_millis(20),
            clock_ref: Some("internal".to_string()),
            tx_freq: 1e9,
            folder_name: "t".to_string(),
            rx_file_channels: vec!["0 1".to_string(), "2 3".to_string()],
            rx_file_locations: vec![dir.join("a"), dir.join("b")],
            ..RunConfig::default()
        }
    }

    fn driver(devices: usize) -> SimDriver {
        SimDriver::new(SimConfig {
            devices,
            ..SimConfig::default()
        })
    }

    fn count_files(dir: &PathBuf) -> usize {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return 0;
        };
        entries
            .flatten()
            .map(|e| {
                let path = e.path();
                if path.is_dir() { count_files(&path) } else { 1 }
            })
            .sum()
    }

    #[test]
    fn test_replay_full_duplex_records_every_channel() {
        let dir = scratch("replay-duplex");
        let cfg = config(&dir, RunMode::ReplayFullDuplex);
        let stop = StopFlag::new();

        let summary = run(&cfg, &driver(2), &stop).unwrap();
        assert_eq!(summary.exit_status(), 0);
        assert_eq!(summary.report.samples(Side::Rx), 4 * 4000);
        assert!(!stop.is_set());

        let file = cfg
            .rx_file_locations[1]
            .join("CW_1.000000_GHz_t")
            .join("test.tx_00_rx_03_run_00_cw_1000000000.dat");
        assert_eq!(std::fs::metadata(file).unwrap().len(), 4000 * 4);
        assert_eq!(count_files(&dir.join("a")) + count_files(&dir.join("b")), 4);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_iterative_loopback_one_file_set_per_tx_channel() {
        let dir = scratch("iterative");
        let mut cfg = config(&dir, RunMode::IterativeLoopback);
        cfg.nsamps = 1000;
        cfg.rx_grouping = ChannelGrouping::Single;

        let summary = run(&cfg, &driver(1), &StopFlag::new()).unwrap();
        assert_eq!(summary.exit_status(), 0);
        // two tx channels, each recorded on two rx channels
        assert_eq!(count_files(&dir.join("a")), 4);
        assert!(
            dir.join("a")
                .join("CW_1.000000_GHz_t")
                .join("test.tx_01_rx_00_run_00_cw_1000000000.dat")
                .exists()
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_host_full_duplex_with_multiple_runs() {
        let dir = scratch("host");
        let mut cfg = config(&dir, RunMode::HostFullDuplex);
        cfg.nruns = 2;
        cfg.nsamps = 500;
        cfg.rx_grouping = ChannelGrouping::PerChannel;

        let summary = run(&cfg, &driver(1), &StopFlag::new()).unwrap();
        assert_eq!(summary.exit_status(), 0);
        assert_eq!(summary.report.results.len(), 2 * 3);
        assert_eq!(count_files(&dir.join("a")), 4);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_single_loopback_selected_channels() {
        let dir = scratch("single");
        let mut cfg = config(&dir, RunMode::SingleLoopback);
        cfg.single_txrx_loopback = true;
        cfg.single_tx = 1;
        cfg.single_rx = 0;

        let summary = run(&cfg, &driver(1), &StopFlag::new()).unwrap();
        assert_eq!(summary.report.samples(Side::Rx), 4000);
        assert!(
            dir.join("a")
                .join("CW_1.000000_GHz_t")
                .join("test.tx_01_rx_00_run_00_cw_1000000000.dat")
                .exists()
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_worker_failure_sets_exit_status() {
        let dir = scratch("failure");
        let cfg = RunConfig {
            rx_grouping: ChannelGrouping::PerChannel,
            ..config(&dir, RunMode::ReplayFullDuplex)
        };
        let driver = SimDriver::new(SimConfig {
            rx_faults: vec![crate::driver::sim::SimFault {
                streamer: 0,
                call: 1,
                code: RxErrorCode::Other("link down".to_string()),
                out_of_sequence: false,
            }],
            ..SimConfig::default()
        });

        let summary = run(&cfg, &driver, &StopFlag::new()).unwrap();
        assert_eq!(summary.report.failures(), 1);
        assert_eq!(summary.exit_status(), 1);
        // sibling channel still written
        assert_eq!(count_files(&dir.join("a")), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_setup_errors_before_streaming() {
        let dir = scratch("setup");
        let cfg = config(&dir, RunMode::ReplayFullDuplex);

        let missing = SimDriver::new(SimConfig {
            devices: 0,
            ..SimConfig::default()
        });
        assert!(matches!(
            run(&cfg, &missing, &StopFlag::new()),
            Err(ArchError::Topology(TopologyError::DeviceNotFound(_)))
        ));

        let no_sync = SimDriver::new(SimConfig {
            sync_ok: false,
            ..SimConfig::default()
        });
        assert!(matches!(run(&cfg, &no_sync, &StopFlag::new()), Err(ArchError::Sync(_))));

        let mismatched = RunConfig {
            rx_file_locations: vec![dir.clone()],
            ..cfg.clone()
        };
        assert!(run(&mismatched, &driver(1), &StopFlag::new()).is_err());

        let no_replay = SimDriver::new(SimConfig {
            replays_per_device: 0,
            ..SimConfig::default()
        });
        assert!(matches!(
            run(&cfg, &no_replay, &StopFlag::new()),
            Err(ArchError::Replay(ReplayError::NoReplayEndpoint))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_replay_is_stopped_after_run() {
        let dir = scratch("stop-replay");
        let cfg = config(&dir, RunMode::ReplayFullDuplex);
        let graph = SimGraph::new(SimConfig::default());
        let topology = Topology::discover(graph.as_ref()).unwrap();

        run_on(&cfg, graph.clone(), topology, &StopFlag::new()).unwrap();

        let replay = graph.sim_replay(&BlockId::new(0, "Replay", 0)).unwrap();
        assert_eq!(replay.play_cmds(0).len(), 1);
        assert_eq!(replay.play_cmds(1).len(), 1);
        assert_eq!(replay.stops(0), 1);
        assert_eq!(replay.stops(1), 1);
        assert_eq!(graph.sources(), vec![(0, "internal".to_string(), "internal".to_string())]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_iterative_start_times_accumulate() {
        let dir = scratch("iterative-times");
        let mut cfg = config(&dir, RunMode::IterativeLoopback);
        cfg.nsamps = 200;
        cfg.time_adjust = Duration::from_millis(40);
        let graph = SimGraph::new(SimConfig::default());
        let topology = Topology::discover(graph.as_ref()).unwrap();

        run_on(&cfg, graph.clone(), topology, &StopFlag::new()).unwrap();

        let replay = graph.sim_replay(&BlockId::new(0, "Replay", 0)).unwrap();
        let first = replay.play_cmds(0)[0].time_spec;
        let second = replay.play_cmds(1)[0].time_spec;
        assert_eq!(second - first, Duration::from_millis(40));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_iterative_continuous_playback_stops_each_slot() {
        let dir = scratch("iterative-continuous");
        let mut cfg = config(&dir, RunMode::IterativeLoopback);
        cfg.nsamps = 0;
        cfg.time_requested = Duration::from_millis(50);
        let graph = SimGraph::new(SimConfig {
            sample_rate: 1e6,
            ..SimConfig::default()
        });
        let topology = Topology::discover(graph.as_ref()).unwrap();

        let summary = run_on(&cfg, graph.clone(), topology, &StopFlag::new()).unwrap();
        assert_eq!(summary.exit_status(), 0);

        let replay = graph.sim_replay(&BlockId::new(0, "Replay", 0)).unwrap();
        assert_eq!(replay.play_cmds(0)[0].mode, crate::driver::StreamMode::StartContinuous);
        assert_eq!(replay.play_cmds(1)[0].mode, crate::driver::StreamMode::StartContinuous);
        // once when its slot ends, once more by the final stop of every port
        assert_eq!(replay.stops(0), 2);
        assert_eq!(replay.stops(1), 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_multifreq_sweep_writes_one_folder_per_frequency() {
        use crate::driver::sim::TunePath;

        let dir = scratch("multifreq");
        let mut cfg = config(&dir, RunMode::MultiFreqLoopback);
        cfg.nsamps = 200;
        cfg.freq_start = 1e9;
        cfg.freq_stop = 1.2e9;
        cfg.freq_step = 1e8;
        let graph = SimGraph::new(SimConfig::default());
        let topology = Topology::discover(graph.as_ref()).unwrap();

        let summary = run_on(&cfg, graph.clone(), topology, &StopFlag::new()).unwrap();
        assert_eq!(summary.exit_status(), 0);
        assert_eq!(summary.report.samples(Side::Rx), 3 * 2 * 200);

        let mut folders: Vec<String> = std::fs::read_dir(dir.join("a"))
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        folders.sort();
        assert_eq!(folders, vec!["CW_1.000000_GHz_t", "CW_1.100000_GHz_t", "CW_1.200000_GHz_t"]);
        assert!(
            dir.join("a")
                .join("CW_1.100000_GHz_t")
                .join("test.tx_00_rx_01_run_00_cw_1100000000.dat")
                .exists()
        );
        assert_eq!(count_files(&dir.join("a")), 3 * 2);

        let tunes = graph.tunes();
        assert_eq!(tunes.len(), 3 * 4);
        assert!(tunes.iter().any(|t| t.path == TunePath::Tx && t.chan == 1 && t.freq == 1.2e9));
        assert!(tunes.iter().any(|t| t.path == TunePath::Rx && t.chan == 0 && t.freq == 1.1e9));

        let replay = graph.sim_replay(&BlockId::new(0, "Replay", 0)).unwrap();
        assert_eq!(replay.play_cmds(0).len(), 3);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_multifreq_sweep_honors_stop_flag() {
        let dir = scratch("multifreq-stop");
        let mut cfg = config(&dir, RunMode::MultiFreqLoopback);
        cfg.nsamps = 200;
        let graph = SimGraph::new(SimConfig::default());
        let topology = Topology::discover(graph.as_ref()).unwrap();
        let stop = StopFlag::new();
        stop.set();

        let summary = run_on(&cfg, graph.clone(), topology, &stop).unwrap();
        assert!(summary.report.results.is_empty());
        assert!(graph.tunes().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_fc32_replay_format() {
        let dir = scratch("fc32");
        let mut cfg = config(&dir, RunMode::ReplayFullDuplex);
        cfg.format = SampleFormat::Fc32;
        cfg.nsamps = 100;
        let summary = run(&cfg, &driver(1), &StopFlag::new()).unwrap();
        assert_eq!(summary.exit_status(), 0);
        let file = dir
            .join("a")
            .join("CW_1.000000_GHz_t")
            .join("test.tx_00_rx_00_run_00_cw_1000000000.dat");
        assert_eq!(std::fs::metadata(file).unwrap().len(), 100 * 8);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
