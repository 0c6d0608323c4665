//! Receive-to-file worker

use crate::config::SampleFormat;
use crate::driver::{RxErrorCode, StreamCmd, TimeSpec};
use crate::runtime::errors::{WorkError, WorkResult};
use crate::runtime::output::ChannelWriters;
use crate::runtime::streamers::RxEndpoint;
use crate::runtime::worker::{Lifecycle, Side, Worker, WorkerContext, WorkerReport, WorkerState};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RecvOptions {
    /// Samples per channel, 0 streams until stopped
    pub nsamps: u64,
    /// Samples per transfer, 0 uses the endpoint maximum
    pub spb: usize,
    pub timeout: Duration,
    /// Limit on streaming time measured on the device clock, zero disables it
    pub time_requested: Duration,
    pub format: SampleFormat,
    /// Sample rate, only used to size the overflow diagnostic. Zero when unknown.
    pub rate: f64,
    /// Schedule slot this worker starts in
    pub slot: usize,
}

pub struct RecvWorker {
    name: String,
    endpoint: RxEndpoint,
    writers: ChannelWriters,
    options: RecvOptions,
    life: Lifecycle,
}

impl RecvWorker {
    pub fn new(name: impl Into<String>, endpoint: RxEndpoint, writers: ChannelWriters, options: RecvOptions) -> Self {
        let name = name.into();
        Self {
            life: Lifecycle::new(&name),
            name,
            endpoint,
            writers,
            options,
        }
    }

    fn transfer_size(&self) -> usize {
        if self.options.spb == 0 {
            self.endpoint.max_samps
        } else {
            self.options.spb
        }
    }

    /// The `Streaming` state. Returns samples received summed over channels.
    fn stream(&mut self, ctx: &WorkerContext, start: TimeSpec) -> WorkResult<u64> {
        let channels = self.endpoint.stream.num_channels() as u64;
        let bytes_per_sample = self.options.format.bytes_per_sample();
        let spb = self.transfer_size().max(1);
        let target = self.options.nsamps * channels;
        let mut buffs = vec![vec![0u8; spb * bytes_per_sample]; channels as usize];
        let watch = ctx.watchdog.register(&self.name, "recv");
        let mut overflow_reported = false;
        let mut total = 0u64;

        loop {
            if ctx.stop.is_set() {
                debug!("[{}] Stop flag raised", self.name);
                break;
            }
            if self.options.nsamps > 0 && total >= target {
                break;
            }
            if !self.options.time_requested.is_zero() && ctx.device_time() >= start + self.options.time_requested {
                info!("[{}] Requested streaming time elapsed", self.name);
                break;
            }

            let mut request = spb;
            if self.options.nsamps > 0 {
                request = request.min(((target - total) / channels) as usize);
            }

            let stream = &self.endpoint.stream;
            let timeout = self.options.timeout;
            let (n, md) = watch.guard(|| stream.recv(&mut buffs, request, timeout));

            match md.error_code {
                RxErrorCode::Timeout => {
                    warn!("[{}] Timeout while streaming", self.name);
                    return Err(WorkError::Timeout);
                }
                RxErrorCode::Overflow => {
                    if !overflow_reported {
                        overflow_reported = true;
                        // the sustained-rate hint needs a known sample rate
                        let medium = if self.options.rate > 0.0 {
                            let rate = self.options.rate * bytes_per_sample as f64 * channels as f64 / 1e6;
                            format!("Your write medium must sustain a rate of {:.2} MB/s.\n  ", rate)
                        } else {
                            String::new()
                        };
                        warn!(
                            "[{}] Got an overflow indication. Please consider the following:\n  \
                             {}Dropped samples will not be written to the file.\n  \
                             This message will not appear again.",
                            self.name, medium
                        );
                    }
                    if !md.out_of_sequence {
                        return Err(WorkError::Overflow);
                    }
                    continue;
                }
                RxErrorCode::Other(msg) => return Err(WorkError::ReceiverError(msg)),
                RxErrorCode::Ok => {}
            }

            if n == 0 {
                continue;
            }
            total += n as u64 * channels;
            let len = n * bytes_per_sample;
            for (index, buf) in buffs.iter().enumerate() {
                self.writers.write(index, &buf[..len])?;
            }
        }
        Ok(total)
    }
}

impl Worker for RecvWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn side(&self) -> Side {
        Side::Rx
    }

    fn run(&mut self, ctx: &WorkerContext) -> WorkResult<WorkerReport> {
        let start = ctx.schedule.start_for(self.options.slot);
        let cmd = StreamCmd::start_at(self.options.nsamps, start);
        debug!(
            "[{}] Issuing {:?} for {} samples at {}",
            self.name, cmd.mode, self.options.nsamps, start
        );
        self.endpoint.stream.issue_stream_cmd(&cmd)?;
        self.life.enter(WorkerState::Streaming);

        let result = self.stream(ctx, start);

        self.life.enter(WorkerState::Draining);
        if let Err(e) = self.endpoint.stream.issue_stream_cmd(&StreamCmd::stop()) {
            warn!("[{}] Failed to stop stream: {}", self.name, e);
        }
        let closed = self.writers.close();
        self.life.enter(WorkerState::Terminated);

        let total = result?;
        closed?;
        Ok(WorkerReport { samples: total })
    }

    fn state(&self) -> WorkerState {
        self.life.state()
    }
}
