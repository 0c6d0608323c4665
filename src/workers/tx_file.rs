//! Transmit-from-file worker

use crate::config::SampleFormat;
use crate::driver::TxMetadata;
use crate::runtime::errors::WorkResult;
use crate::runtime::streamers::TxEndpoint;
use crate::runtime::worker::{Lifecycle, Side, Worker, WorkerContext, WorkerReport, WorkerState};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Fill `buf` from `reader`, returning fewer bytes only at end of file
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Streams one sample file to every channel of a tx endpoint, starting at
/// the schedule's start time and ending with an empty end-of-burst packet
pub struct TxFileWorker {
    name: String,
    endpoint: TxEndpoint,
    path: PathBuf,
    format: SampleFormat,
    /// Samples per transfer, 0 uses ten times the endpoint maximum
    spb: usize,
    timeout: Duration,
    slot: usize,
    life: Lifecycle,
}

impl TxFileWorker {
    pub fn new(
        name: impl Into<String>,
        endpoint: TxEndpoint,
        path: impl Into<PathBuf>,
        format: SampleFormat,
        spb: usize,
        timeout: Duration,
    ) -> Self {
        let name = name.into();
        Self {
            life: Lifecycle::new(&name),
            name,
            endpoint,
            path: path.into(),
            format,
            spb,
            timeout,
            slot: 0,
        }
    }

    pub fn with_slot(mut self, slot: usize) -> Self {
        self.slot = slot;
        self
    }

    fn send_file(&mut self, ctx: &WorkerContext) -> WorkResult<u64> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let bytes_per_sample = self.format.bytes_per_sample();
        let spb = if self.spb == 0 {
            self.endpoint.max_samps * 10
        } else {
            self.spb
        }
        .max(1);
        let mut buf = vec![0u8; spb * bytes_per_sample];
        let channels = self.endpoint.stream.num_channels();
        let watch = ctx.watchdog.register(&self.name, "send");

        // only the first packet opens the burst and carries the start time
        let mut md = TxMetadata {
            start_of_burst: true,
            end_of_burst: false,
            time_spec: Some(ctx.schedule.start_for(self.slot)),
        };
        let mut total = 0u64;

        while !md.end_of_burst && !ctx.stop.is_set() {
            let read = read_chunk(&mut reader, &mut buf)?;
            let samples = read / bytes_per_sample;
            md.end_of_burst = read < buf.len();

            let chunk = &buf[..samples * bytes_per_sample];
            let buffs: Vec<&[u8]> = vec![chunk; channels];
            let stream = &self.endpoint.stream;
            let sent = watch.guard(|| stream.send(&buffs, samples, &md, self.timeout))?;
            if sent != samples {
                warn!("[{}] The tx stream timed out sending {} samples ({} sent)", self.name, samples, sent);
            }
            total += sent as u64 * channels as u64;
            md.start_of_burst = false;
            md.time_spec = None;
        }
        Ok(total)
    }

    /// Empty end-of-burst packet, required to leave the endpoint drained
    fn end_burst(&self) -> WorkResult {
        let md = TxMetadata {
            start_of_burst: false,
            end_of_burst: true,
            time_spec: None,
        };
        let empty: &[u8] = &[];
        let buffs = vec![empty; self.endpoint.stream.num_channels()];
        self.endpoint.stream.send(&buffs, 0, &md, self.timeout)?;
        Ok(())
    }
}

impl Worker for TxFileWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn side(&self) -> Side {
        Side::Tx
    }

    fn run(&mut self, ctx: &WorkerContext) -> WorkResult<WorkerReport> {
        self.life.enter(WorkerState::Streaming);
        let result = self.send_file(ctx);

        self.life.enter(WorkerState::Draining);
        let ended = self.end_burst();
        self.life.enter(WorkerState::Terminated);

        let total = result?;
        ended?;
        debug!("[{}] Sent {} from {}", self.name, total, self.path.display());
        Ok(WorkerReport { samples: total })
    }

    fn state(&self) -> WorkerState {
        self.life.state()
    }
}
