//! In-process simulated driver
//!
//! Models just enough of a clock-shared radio system to drive the
//! orchestration engine end to end: a per-device block inventory with static
//! radio/converter connections, a resettable device clock, timed rx streamers
//! producing a deterministic ramp, tx streamers that fill replay memory, and
//! replay blocks with record fullness and a command log. Faults can be
//! scripted per rx streamer.

use super::{
    BlockId, DriverError, DriverResult, Graph, GraphEdge, Node, PortRef, ReplayBlock, RxErrorCode,
    RxMetadata, RxStream, StreamArgs, StreamCmd, StreamMode, StreamerId, TimeSpec, TxMetadata,
    TxStream,
};
use crate::config::DeviceArgs;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const REPLAY_PORTS: usize = 2;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fault injected into one `recv` call of one rx streamer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimFault {
    /// Rx streamer creation index
    pub streamer: usize,
    /// 1-based `recv` call number the fault replaces
    pub call: usize,
    pub code: RxErrorCode,
    pub out_of_sequence: bool,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub devices: usize,
    pub radios_per_device: usize,
    /// Include DDC/DUC blocks between radios and streamers
    pub with_converters: bool,
    pub replays_per_device: usize,
    /// Default samples per packet of every streamer
    pub max_samps_per_packet: usize,
    /// Pacing of rx delivery, samples per second
    pub sample_rate: f64,
    pub sync_ok: bool,
    /// Bytes already sitting in every replay record buffer at startup
    pub stale_record_bytes: u64,
    /// Number of `record_restart` calls needed before stale data clears
    pub restarts_to_clear: usize,
    /// Tx sends report one sample fewer than requested
    pub short_tx_send: bool,
    pub rx_faults: Vec<SimFault>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            radios_per_device: 2,
            with_converters: true,
            replays_per_device: 1,
            max_samps_per_packet: 1999,
            sample_rate: 10e6,
            sync_ok: true,
            stale_record_bytes: 0,
            restarts_to_clear: 1,
            short_tx_send: false,
            rx_faults: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunePath {
    Rx,
    Tx,
}

/// One recorded tune request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimTune {
    pub path: TunePath,
    pub chan: usize,
    pub freq: f64,
}

/// Per-streamer tx accounting, for inspection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxStats {
    pub samples: u64,
    pub sends: usize,
    pub start_of_burst: usize,
    pub end_of_burst: usize,
    /// End-of-burst markers that carried no samples
    pub empty_end_of_burst: usize,
}

#[derive(Debug, Default)]
struct ReplayPort {
    record_offset: u64,
    record_size: u64,
    fullness: u64,
    restarts: usize,
    play: Option<(u64, u64)>,
    play_cmds: Vec<StreamCmd>,
    stops: usize,
}

/// Simulated replay block with two ports
pub struct SimReplay {
    id: BlockId,
    restarts_to_clear: usize,
    ports: Mutex<Vec<ReplayPort>>,
}

impl SimReplay {
    fn new(id: BlockId, config: &SimConfig) -> Self {
        let ports = (0..REPLAY_PORTS)
            .map(|_| ReplayPort {
                fullness: config.stale_record_bytes,
                ..ReplayPort::default()
            })
            .collect();
        Self {
            id,
            restarts_to_clear: config.restarts_to_clear,
            ports: Mutex::new(ports),
        }
    }

    fn with_port<R>(&self, port: usize, f: impl FnOnce(&mut ReplayPort) -> R) -> DriverResult<R> {
        let mut ports = lock(&self.ports);
        let state = ports
            .get_mut(port)
            .ok_or_else(|| DriverError::Rejected(format!("{} has no port {}", self.id, port)))?;
        Ok(f(state))
    }

    fn write(&self, port: usize, bytes: u64) {
        let _ = self.with_port(port, |p| {
            p.fullness = (p.fullness + bytes).min(p.record_size.max(p.fullness));
        });
    }

    pub fn play_cmds(&self, port: usize) -> Vec<StreamCmd> {
        self.with_port(port, |p| p.play_cmds.clone()).unwrap_or_default()
    }

    pub fn play_config(&self, port: usize) -> Option<(u64, u64)> {
        self.with_port(port, |p| p.play).ok().flatten()
    }

    pub fn stops(&self, port: usize) -> usize {
        self.with_port(port, |p| p.stops).unwrap_or(0)
    }

    pub fn restarts(&self, port: usize) -> usize {
        self.with_port(port, |p| p.restarts).unwrap_or(0)
    }

    pub fn record_region(&self, port: usize) -> Option<(u64, u64)> {
        self.with_port(port, |p| (p.record_offset, p.record_size)).ok()
    }
}

impl ReplayBlock for SimReplay {
    fn block_id(&self) -> &BlockId {
        &self.id
    }

    fn record(&self, offset: u64, size: u64, port: usize) -> DriverResult<()> {
        self.with_port(port, |p| {
            p.record_offset = offset;
            p.record_size = size;
        })
    }

    fn record_restart(&self, port: usize) -> DriverResult<()> {
        let threshold = self.restarts_to_clear;
        self.with_port(port, |p| {
            p.restarts += 1;
            if p.restarts >= threshold {
                p.fullness = 0;
            }
        })
    }

    fn record_fullness(&self, port: usize) -> u64 {
        self.with_port(port, |p| p.fullness).unwrap_or(0)
    }

    fn config_play(&self, offset: u64, size: u64, port: usize) -> DriverResult<()> {
        self.with_port(port, |p| p.play = Some((offset, size)))
    }

    fn issue_stream_cmd(&self, cmd: &StreamCmd, port: usize) -> DriverResult<()> {
        self.with_port(port, |p| {
            if cmd.mode == StreamMode::StopContinuous {
                p.stops += 1;
            } else {
                p.play_cmds.push(cmd.clone());
            }
        })
    }

    fn stop(&self, port: usize) -> DriverResult<()> {
        self.with_port(port, |p| p.stops += 1)
    }
}

struct Clock {
    epoch: Mutex<Instant>,
}

impl Clock {
    fn now(&self) -> TimeSpec {
        TimeSpec::from(lock(&self.epoch).elapsed())
    }

    fn set(&self, time: TimeSpec) {
        let now = Instant::now();
        let offset = Duration::from_nanos(time.as_nanos());
        *lock(&self.epoch) = now.checked_sub(offset).unwrap_or(now);
    }
}

struct SimState {
    config: SimConfig,
    clock: Clock,
    blocks: Vec<BlockId>,
    edges: Vec<GraphEdge>,
    replays: BTreeMap<BlockId, Arc<SimReplay>>,
    next_streamer: AtomicUsize,
    rx_created: AtomicUsize,
    tx_routes: Mutex<HashMap<StreamerId, Vec<(BlockId, usize)>>>,
    tx_stats: Mutex<HashMap<StreamerId, TxStats>>,
    rx_cmds: Mutex<HashMap<StreamerId, Vec<StreamCmd>>>,
    connections: Mutex<Vec<(PortRef, PortRef)>>,
    sources: Mutex<Vec<(usize, String, String)>>,
    tunes: Mutex<Vec<SimTune>>,
    committed: AtomicBool,
}

impl SimState {
    fn has_node(&self, node: &Node) -> bool {
        let streamers = self.next_streamer.load(Ordering::SeqCst);
        match node {
            Node::Block(id) => self.blocks.contains(id),
            Node::RxStreamer(id) | Node::TxStreamer(id) => id.0 < streamers,
        }
    }
}

/// Simulated multi-device session
pub struct SimGraph {
    state: Arc<SimState>,
}

impl SimGraph {
    pub fn new(config: SimConfig) -> Arc<Self> {
        let mut blocks = Vec::new();
        let mut edges = Vec::new();
        let mut replays = BTreeMap::new();

        for device in 0..config.devices {
            for i in 0..config.radios_per_device {
                let radio = BlockId::new(device, "Radio", i);
                blocks.push(radio.clone());
                if config.with_converters {
                    let ddc = BlockId::new(device, "DDC", i);
                    let duc = BlockId::new(device, "DUC", i);
                    edges.push(GraphEdge {
                        src_block: radio.clone(),
                        src_port: 0,
                        dst_block: ddc.clone(),
                        dst_port: 0,
                    });
                    edges.push(GraphEdge {
                        src_block: duc.clone(),
                        src_port: 0,
                        dst_block: radio,
                        dst_port: 0,
                    });
                    blocks.push(ddc);
                    blocks.push(duc);
                }
            }
            for i in 0..config.replays_per_device {
                let id = BlockId::new(device, "Replay", i);
                blocks.push(id.clone());
                replays.insert(id.clone(), Arc::new(SimReplay::new(id, &config)));
            }
        }

        Arc::new(Self {
            state: Arc::new(SimState {
                config,
                clock: Clock {
                    epoch: Mutex::new(Instant::now()),
                },
                blocks,
                edges,
                replays,
                next_streamer: AtomicUsize::new(0),
                rx_created: AtomicUsize::new(0),
                tx_routes: Mutex::new(HashMap::new()),
                tx_stats: Mutex::new(HashMap::new()),
                rx_cmds: Mutex::new(HashMap::new()),
                connections: Mutex::new(Vec::new()),
                sources: Mutex::new(Vec::new()),
                tunes: Mutex::new(Vec::new()),
                committed: AtomicBool::new(false),
            }),
        })
    }

    pub fn sim_replay(&self, id: &BlockId) -> Option<Arc<SimReplay>> {
        self.state.replays.get(id).cloned()
    }

    pub fn connections(&self) -> Vec<(PortRef, PortRef)> {
        lock(&self.state.connections).clone()
    }

    pub fn is_committed(&self) -> bool {
        self.state.committed.load(Ordering::SeqCst)
    }

    pub fn tx_stats(&self, id: StreamerId) -> TxStats {
        lock(&self.state.tx_stats).get(&id).cloned().unwrap_or_default()
    }

    pub fn rx_stream_cmds(&self, id: StreamerId) -> Vec<StreamCmd> {
        lock(&self.state.rx_cmds).get(&id).cloned().unwrap_or_default()
    }

    /// `(mboard, clock source, time source)` in the order they were applied
    pub fn sources(&self) -> Vec<(usize, String, String)> {
        lock(&self.state.sources).clone()
    }

    /// Every tune request, in call order
    pub fn tunes(&self) -> Vec<SimTune> {
        lock(&self.state.tunes).clone()
    }

    fn tune(&self, path: TunePath, chan: usize, freq: f64) -> DriverResult<()> {
        let radios = self.state.config.devices * self.state.config.radios_per_device;
        if chan >= radios {
            return Err(DriverError::Rejected(format!("no radio channel {}", chan)));
        }
        if !freq.is_finite() || freq <= 0.0 {
            return Err(DriverError::Rejected(format!("cannot tune to {} Hz", freq)));
        }
        debug!("sim: {:?} channel {} tuned to {} Hz", path, chan, freq);
        lock(&self.state.tunes).push(SimTune { path, chan, freq });
        Ok(())
    }

    fn allocate_streamer(&self) -> StreamerId {
        StreamerId(self.state.next_streamer.fetch_add(1, Ordering::SeqCst))
    }

    fn check_channels(&self, num_channels: usize) -> DriverResult<()> {
        let radios = self.state.config.devices * self.state.config.radios_per_device;
        if num_channels == 0 || num_channels > radios {
            return Err(DriverError::Rejected(format!(
                "cannot stream {} channels, {} radios available",
                num_channels, radios
            )));
        }
        Ok(())
    }

    fn apply_source(&self, mboard: usize, source: &str, clock: bool) -> DriverResult<()> {
        if mboard >= self.state.config.devices {
            return Err(DriverError::Rejected(format!("no motherboard {}", mboard)));
        }
        if !matches!(source, "internal" | "external" | "gpsdo") {
            return Err(DriverError::Rejected(format!("unknown reference source '{}'", source)));
        }
        let mut sources = lock(&self.state.sources);
        match sources.iter_mut().find(|(mb, _, _)| *mb == mboard) {
            Some(entry) if clock => entry.1 = source.to_string(),
            Some(entry) => entry.2 = source.to_string(),
            None if clock => sources.push((mboard, source.to_string(), String::new())),
            None => sources.push((mboard, String::new(), source.to_string())),
        }
        Ok(())
    }
}

impl Graph for SimGraph {
    fn num_mboards(&self) -> usize {
        self.state.config.devices
    }

    fn find_blocks(&self, block_type: &str) -> Vec<BlockId> {
        // Driver order is not canonical; callers sort.
        self.state
            .blocks
            .iter()
            .rev()
            .filter(|id| id.matches(block_type))
            .cloned()
            .collect()
    }

    fn static_connections(&self) -> Vec<GraphEdge> {
        self.state.edges.clone()
    }

    fn replay_block(&self, id: &BlockId) -> DriverResult<Arc<dyn ReplayBlock>> {
        self.state
            .replays
            .get(id)
            .map(|r| Arc::clone(r) as Arc<dyn ReplayBlock>)
            .ok_or_else(|| DriverError::NotFound(id.to_string()))
    }

    fn create_rx_streamer(&self, num_channels: usize, args: &StreamArgs) -> DriverResult<Arc<dyn RxStream>> {
        self.check_channels(num_channels)?;
        let id = self.allocate_streamer();
        let index = self.state.rx_created.fetch_add(1, Ordering::SeqCst);
        debug!("sim: created rx {} with {} channels", id, num_channels);
        Ok(Arc::new(SimRxStream {
            id,
            index,
            num_channels,
            spp: args.spp.unwrap_or(self.state.config.max_samps_per_packet),
            bytes_per_sample: args.cpu_format.bytes_per_sample(),
            state: Arc::clone(&self.state),
            rx: Mutex::new(RxState::default()),
        }))
    }

    fn create_tx_streamer(&self, num_channels: usize, args: &StreamArgs) -> DriverResult<Arc<dyn TxStream>> {
        self.check_channels(num_channels)?;
        let id = self.allocate_streamer();
        debug!("sim: created tx {} with {} channels", id, num_channels);
        lock(&self.state.tx_stats).insert(id, TxStats::default());
        Ok(Arc::new(SimTxStream {
            id,
            num_channels,
            spp: args.spp.unwrap_or(self.state.config.max_samps_per_packet),
            bytes_per_sample: args.cpu_format.bytes_per_sample(),
            state: Arc::clone(&self.state),
        }))
    }

    fn connect(&self, src: &PortRef, dst: &PortRef) -> DriverResult<()> {
        for end in [src, dst] {
            if !self.state.has_node(&end.node) {
                return Err(DriverError::Rejected(format!("unknown endpoint {}", end)));
            }
        }
        if let (Node::TxStreamer(id), Node::Block(block)) = (&src.node, &dst.node)
            && self.state.replays.contains_key(block)
        {
            let mut routes = lock(&self.state.tx_routes);
            let route = routes.entry(*id).or_default();
            if route.len() <= src.port {
                route.resize(src.port + 1, (block.clone(), dst.port));
            }
            route[src.port] = (block.clone(), dst.port);
        }
        trace!("sim: connect {} -> {}", src, dst);
        lock(&self.state.connections).push((src.clone(), dst.clone()));
        Ok(())
    }

    fn commit(&self) -> DriverResult<()> {
        self.state.committed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_clock_source(&self, mboard: usize, source: &str) -> DriverResult<()> {
        self.apply_source(mboard, source, true)
    }

    fn set_time_source(&self, mboard: usize, source: &str) -> DriverResult<()> {
        self.apply_source(mboard, source, false)
    }

    fn set_rx_freq(&self, chan: usize, freq: f64) -> DriverResult<()> {
        self.tune(TunePath::Rx, chan, freq)
    }

    fn set_tx_freq(&self, chan: usize, freq: f64) -> DriverResult<()> {
        self.tune(TunePath::Tx, chan, freq)
    }

    fn synchronize_devices(&self, time: TimeSpec) -> bool {
        if !self.state.config.sync_ok {
            return false;
        }
        self.state.clock.set(time);
        true
    }

    fn time_now(&self, _mboard: usize) -> TimeSpec {
        self.state.clock.now()
    }
}

#[derive(Default)]
struct RxState {
    cmd: Option<StreamCmd>,
    delivered: u64,
    calls: usize,
}

struct SimRxStream {
    id: StreamerId,
    index: usize,
    num_channels: usize,
    spp: usize,
    bytes_per_sample: usize,
    state: Arc<SimState>,
    rx: Mutex<RxState>,
}

impl SimRxStream {
    fn scripted_fault(&self, call: usize) -> Option<RxMetadata> {
        self.state
            .config
            .rx_faults
            .iter()
            .find(|f| f.streamer == self.index && f.call == call)
            .map(|f| RxMetadata {
                error_code: f.code.clone(),
                out_of_sequence: f.out_of_sequence,
                time_spec: None,
            })
    }

    fn idle(&self, timeout: Duration) -> (usize, RxMetadata) {
        thread::sleep(timeout);
        (0, RxMetadata::error(RxErrorCode::Timeout))
    }
}

impl RxStream for SimRxStream {
    fn id(&self) -> StreamerId {
        self.id
    }

    fn num_channels(&self) -> usize {
        self.num_channels
    }

    fn max_num_samps(&self) -> usize {
        self.spp
    }

    fn issue_stream_cmd(&self, cmd: &StreamCmd) -> DriverResult<()> {
        lock(&self.state.rx_cmds).entry(self.id).or_default().push(cmd.clone());
        let mut rx = lock(&self.rx);
        if cmd.mode == StreamMode::StopContinuous {
            rx.cmd = None;
        } else {
            rx.cmd = Some(cmd.clone());
            rx.delivered = 0;
        }
        Ok(())
    }

    fn recv(&self, buffs: &mut [Vec<u8>], nsamps: usize, timeout: Duration) -> (usize, RxMetadata) {
        let (cmd, delivered, call) = {
            let mut rx = lock(&self.rx);
            rx.calls += 1;
            (rx.cmd.clone(), rx.delivered, rx.calls)
        };

        if let Some(md) = self.scripted_fault(call) {
            return (0, md);
        }

        let Some(cmd) = cmd else {
            return self.idle(timeout);
        };

        if !cmd.stream_now {
            let now = self.state.clock.now();
            if cmd.time_spec > now {
                let wait = cmd.time_spec - now;
                if wait > timeout {
                    return self.idle(timeout);
                }
                thread::sleep(wait);
            }
        }

        let capacity = buffs
            .iter()
            .map(|b| b.len() / self.bytes_per_sample)
            .min()
            .unwrap_or(0);
        let mut n = nsamps.min(self.spp).min(capacity);
        if cmd.mode == StreamMode::NumSampsAndDone {
            n = n.min(cmd.num_samps.saturating_sub(delivered) as usize);
        }
        if n == 0 {
            return self.idle(timeout);
        }

        for (ch, buf) in buffs.iter_mut().take(self.num_channels).enumerate() {
            for (i, byte) in buf[..n * self.bytes_per_sample].iter_mut().enumerate() {
                *byte = (ch as u64 + delivered + (i / self.bytes_per_sample) as u64) as u8;
            }
        }

        if self.state.config.sample_rate > 0.0 {
            thread::sleep(Duration::from_secs_f64(n as f64 / self.state.config.sample_rate));
        }

        let mut rx = lock(&self.rx);
        rx.delivered += n as u64;
        if cmd.mode == StreamMode::NumSampsAndDone && rx.delivered >= cmd.num_samps {
            rx.cmd = None;
        }
        let offset = Duration::from_secs_f64(delivered as f64 / self.state.config.sample_rate.max(1.0));
        (n, RxMetadata::ok(cmd.time_spec + offset))
    }
}

struct SimTxStream {
    id: StreamerId,
    num_channels: usize,
    spp: usize,
    bytes_per_sample: usize,
    state: Arc<SimState>,
}

impl TxStream for SimTxStream {
    fn id(&self) -> StreamerId {
        self.id
    }

    fn num_channels(&self) -> usize {
        self.num_channels
    }

    fn max_num_samps(&self) -> usize {
        self.spp
    }

    fn send(&self, buffs: &[&[u8]], nsamps: usize, md: &TxMetadata, _timeout: Duration) -> DriverResult<usize> {
        if buffs.len() < self.num_channels {
            return Err(DriverError::Rejected(format!(
                "{} buffers for {} channels",
                buffs.len(),
                self.num_channels
            )));
        }
        let sent = if self.state.config.short_tx_send && nsamps > 0 {
            nsamps - 1
        } else {
            nsamps
        };

        let routes = lock(&self.state.tx_routes).get(&self.id).cloned().unwrap_or_default();
        for (block, port) in routes.iter().take(self.num_channels) {
            if let Some(replay) = self.state.replays.get(block) {
                replay.write(*port, (sent * self.bytes_per_sample) as u64);
            }
        }

        let mut stats = lock(&self.state.tx_stats);
        let entry = stats.entry(self.id).or_default();
        entry.samples += sent as u64;
        entry.sends += 1;
        if md.start_of_burst {
            entry.start_of_burst += 1;
        }
        if md.end_of_burst {
            entry.end_of_burst += 1;
            if nsamps == 0 {
                entry.empty_end_of_burst += 1;
            }
        }
        Ok(sent)
    }
}

/// Driver entry point for the simulated system
#[derive(Debug, Clone, Default)]
pub struct SimDriver {
    config: SimConfig,
}

impl SimDriver {
    pub fn new(config: SimConfig) -> Self {
        Self { config }
    }
}

impl super::Driver for SimDriver {
    fn open(&self, args: &DeviceArgs) -> DriverResult<Arc<dyn Graph>> {
        if let Some(kind) = args.get("type")
            && kind != "sim"
        {
            return Err(DriverError::NotFound(args.to_string()));
        }
        let mut config = self.config.clone();
        if let Some(devices) = args.get("devices") {
            config.devices = devices
                .parse()
                .map_err(|_| DriverError::Rejected(format!("invalid device count '{}'", devices)))?;
        }
        if config.devices == 0 {
            return Err(DriverError::NotFound(args.to_string()));
        }
        Ok(SimGraph::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SampleFormat;
    use crate::driver::Driver;

    #[test]
    fn test_open_without_devices_fails() {
        let driver = SimDriver::new(SimConfig {
            devices: 0,
            ..SimConfig::default()
        });
        assert!(matches!(driver.open(&DeviceArgs::default()), Err(DriverError::NotFound(_))));
    }

    #[test]
    fn test_device_count_from_args() {
        let driver = SimDriver::default();
        let graph = driver.open(&DeviceArgs::new("type=sim,devices=3")).unwrap();
        assert_eq!(graph.num_mboards(), 3);
        assert_eq!(graph.find_blocks("Radio").len(), 6);
    }

    #[test]
    fn test_tune_records_valid_requests() {
        let graph = SimGraph::new(SimConfig::default());
        graph.set_rx_freq(1, 2.4e9).unwrap();
        graph.set_tx_freq(0, 2.4e9).unwrap();
        assert!(graph.set_rx_freq(2, 1e9).is_err());
        assert!(graph.set_tx_freq(0, 0.0).is_err());
        assert_eq!(
            graph.tunes(),
            vec![
                SimTune {
                    path: TunePath::Rx,
                    chan: 1,
                    freq: 2.4e9
                },
                SimTune {
                    path: TunePath::Tx,
                    chan: 0,
                    freq: 2.4e9
                },
            ]
        );
    }

    #[test]
    fn test_replay_restart_clears_stale_data() {
        let graph = SimGraph::new(SimConfig {
            stale_record_bytes: 64,
            restarts_to_clear: 2,
            ..SimConfig::default()
        });
        let replay = graph.sim_replay(&BlockId::new(0, "Replay", 0)).unwrap();
        assert_eq!(replay.record_fullness(0), 64);
        replay.record_restart(0).unwrap();
        assert_eq!(replay.record_fullness(0), 64);
        replay.record_restart(0).unwrap();
        assert_eq!(replay.record_fullness(0), 0);
    }

    #[test]
    fn test_rx_finite_stream_delivers_exact_count() {
        let graph = SimGraph::new(SimConfig::default());
        let rx = graph.create_rx_streamer(1, &StreamArgs::new(SampleFormat::Sc16, "sc16")).unwrap();
        rx.issue_stream_cmd(&StreamCmd::start_at(5000, TimeSpec::ZERO)).unwrap();

        let mut buffs = vec![vec![0u8; 4096 * 4]];
        let mut total = 0;
        loop {
            let (n, md) = rx.recv(&mut buffs, 4096, Duration::from_millis(20));
            if md.error_code != RxErrorCode::Ok {
                assert_eq!(md.error_code, RxErrorCode::Timeout);
                break;
            }
            total += n;
        }
        assert_eq!(total, 5000);
    }

    #[test]
    fn test_tx_into_replay_raises_fullness() {
        let graph = SimGraph::new(SimConfig::default());
        let replay_id = BlockId::new(0, "Replay", 0);
        let tx = graph.create_tx_streamer(1, &StreamArgs::new(SampleFormat::Sc16, "sc16")).unwrap();
        graph
            .connect(
                &PortRef {
                    node: Node::TxStreamer(tx.id()),
                    port: 0,
                },
                &PortRef::block(replay_id.clone(), 1),
            )
            .unwrap();

        let replay = graph.sim_replay(&replay_id).unwrap();
        replay.record(0, 400, 1).unwrap();
        let data = vec![0u8; 400];
        let md = TxMetadata {
            start_of_burst: true,
            end_of_burst: true,
            time_spec: None,
        };
        assert_eq!(tx.send(&[&data], 100, &md, Duration::from_millis(10)).unwrap(), 100);
        assert_eq!(replay.record_fullness(1), 400);
        assert_eq!(replay.record_fullness(0), 0);
        assert_eq!(graph.tx_stats(tx.id()).end_of_burst, 1);
    }

    #[test]
    fn test_connect_rejects_unknown_block() {
        let graph = SimGraph::new(SimConfig::default());
        let result = graph.connect(
            &PortRef::block(BlockId::new(0, "Radio", 0), 0),
            &PortRef::block(BlockId::new(4, "DDC", 0), 0),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_sync_resets_clock() {
        let graph = SimGraph::new(SimConfig::default());
        thread::sleep(Duration::from_millis(20));
        assert!(graph.time_now(0) >= TimeSpec::from_nanos(20_000_000));
        assert!(graph.synchronize_devices(TimeSpec::ZERO));
        assert!(graph.time_now(0) < TimeSpec::from_nanos(20_000_000));
    }
}
