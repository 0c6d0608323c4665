//! Replay memory loading and playback control
//!
//! The driver gives no completion event for writes into replay memory;
//! record fullness is the only signal, so both the drain and the write are
//! bounded sleep-polls.

use super::errors::ReplayError;
use super::streamers::TxEndpoint;
use super::topology::{BlockPort, Topology};
use crate::config::SampleFormat;
use crate::driver::{DriverResult, Graph, ReplayBlock, StreamCmd, TimeSpec, TxMetadata};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Replay memory word, bytes
pub const REPLAY_WORD_SIZE: usize = 8;

/// Samples of `format` per replay word
pub fn samples_per_word(format: SampleFormat) -> Result<usize, ReplayError> {
    let sample = format.bytes_per_sample();
    if sample == 0 || REPLAY_WORD_SIZE % sample != 0 {
        return Err(ReplayError::UnalignedSample {
            sample,
            word: REPLAY_WORD_SIZE,
        });
    }
    Ok(REPLAY_WORD_SIZE / sample)
}

/// Region of replay memory holding loaded samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayDescriptor {
    pub base: u64,
    /// Always a whole number of replay words
    pub byte_size: u64,
    pub samples: u64,
}

impl ReplayDescriptor {
    /// Describe `file_size` bytes at `base`, truncated to whole words
    pub fn for_file_size(base: u64, file_size: u64, bytes_per_sample: usize) -> Self {
        let words = file_size / REPLAY_WORD_SIZE as u64;
        let byte_size = words * REPLAY_WORD_SIZE as u64;
        Self {
            base,
            byte_size,
            samples: byte_size / bytes_per_sample as u64,
        }
    }

    pub fn words(&self) -> u64 {
        self.byte_size / REPLAY_WORD_SIZE as u64
    }
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub base: u64,
    /// Time the record buffer must stay empty after a restart
    pub drain_window: Duration,
    pub drain_attempts: usize,
    pub poll_interval: Duration,
    /// Limit on waiting for the record buffer to fill after the send
    pub record_timeout: Duration,
    pub send_timeout: Duration,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            base: 0,
            drain_window: Duration::from_millis(250),
            drain_attempts: 20,
            poll_interval: Duration::from_millis(5),
            record_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(3),
        }
    }
}

/// Poll `fullness` until `done` holds or `window` elapses
fn poll_fullness(replay: &dyn ReplayBlock, port: usize, window: Duration, interval: Duration, done: impl Fn(u64) -> bool) -> (bool, u64) {
    let deadline = Instant::now() + window;
    loop {
        let fullness = replay.record_fullness(port);
        if done(fullness) {
            return (true, fullness);
        }
        if Instant::now() >= deadline {
            return (false, fullness);
        }
        thread::sleep(interval);
    }
}

/// Restart the record buffer until it stays empty for a whole drain window.
/// Late writes still in flight can refill it after a restart, so any non-zero
/// reading inside the window costs another restart.
pub fn drain_record_buffer(replay: &dyn ReplayBlock, port: usize, options: &LoadOptions) -> Result<(), ReplayError> {
    let mut fullness = replay.record_fullness(port);
    for attempt in 1..=options.drain_attempts.max(1) {
        replay.record_restart(port)?;
        let (refilled, now) = poll_fullness(replay, port, options.drain_window, options.poll_interval, |f| f != 0);
        fullness = now;
        if !refilled {
            debug!("{} port {}: record buffer empty after {} restart(s)", replay.block_id(), port, attempt);
            return Ok(());
        }
        debug!("{} port {}: {} bytes after restart {}", replay.block_id(), port, now, attempt);
    }
    Err(ReplayError::DrainTimeout {
        block: replay.block_id().to_string(),
        port,
        fullness,
        attempts: options.drain_attempts,
    })
}

/// Load `path` into the replay memory behind every replay tx endpoint
pub fn load_replay_buffer(
    path: &Path,
    graph: &dyn Graph,
    endpoints: &[TxEndpoint],
    format: SampleFormat,
    options: &LoadOptions,
) -> Result<ReplayDescriptor, ReplayError> {
    samples_per_word(format)?;
    let data = std::fs::read(path).map_err(|source| ReplayError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let descriptor = ReplayDescriptor::for_file_size(options.base, data.len() as u64, format.bytes_per_sample());
    if descriptor.words() == 0 {
        return Err(ReplayError::EmptyFile(path.to_path_buf()));
    }
    info!(
        "{} holds {} replay words, {} samples ({} bytes)",
        path.display(),
        descriptor.words(),
        descriptor.samples,
        descriptor.byte_size
    );

    let targets: Vec<&TxEndpoint> = endpoints.iter().filter(|e| e.replay.is_some()).collect();
    if targets.is_empty() {
        return Err(ReplayError::NoReplayEndpoint);
    }

    let payload = &data[..descriptor.byte_size as usize];
    let expected = descriptor.samples as usize;
    for endpoint in targets {
        let Some(target) = &endpoint.replay else {
            continue;
        };
        let replay = graph.replay_block(&target.block)?;

        replay.record(descriptor.base, descriptor.byte_size, target.port)?;
        drain_record_buffer(replay.as_ref(), target.port, options)?;

        let md = TxMetadata {
            start_of_burst: true,
            end_of_burst: true,
            time_spec: None,
        };
        let sent = endpoint.stream.send(&[payload], expected, &md, options.send_timeout)?;
        if sent != expected {
            return Err(ReplayError::IncompleteWrite { sent, expected });
        }

        let (complete, fullness) = poll_fullness(
            replay.as_ref(),
            target.port,
            options.record_timeout,
            options.poll_interval,
            |f| f >= descriptor.byte_size,
        );
        if !complete {
            return Err(ReplayError::RecordTimeout {
                block: target.block.to_string(),
                port: target.port,
                fullness,
                expected: descriptor.byte_size,
            });
        }
        info!("{}: replay buffer loaded ({} bytes)", target, fullness);
    }
    Ok(descriptor)
}

/// Configure playback of `descriptor` on `port` and start it at `time`.
/// `nsamps == 0` plays continuously; larger counts wrap in replay memory.
pub fn issue_playback(
    replay: &dyn ReplayBlock,
    port: usize,
    descriptor: &ReplayDescriptor,
    nsamps: u64,
    time: TimeSpec,
) -> DriverResult<()> {
    replay.config_play(descriptor.base, descriptor.byte_size, port)?;
    let cmd = StreamCmd::start_at(nsamps, time);
    debug!("{} port {}: play {:?} at {}", replay.block_id(), port, cmd.mode, time);
    replay.issue_stream_cmd(&cmd, port)
}

/// Stop playback on every replay port
pub fn stop_replay(graph: &dyn Graph, topology: &Topology) -> Result<(), ReplayError> {
    stop_targets(graph, &topology.replays)
}

/// Stop playback on `targets`, attempting every port before reporting the
/// first failure
pub fn stop_targets(graph: &dyn Graph, targets: &[BlockPort]) -> Result<(), ReplayError> {
    let mut first_error = None;
    for target in targets {
        let result = graph
            .replay_block(&target.block)
            .and_then(|replay| replay.stop(target.port));
        if let Err(e) = result {
            warn!("Failed to stop replay on {}: {}", target, e);
            first_error.get_or_insert(ReplayError::Driver(e));
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
