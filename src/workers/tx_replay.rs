//! Transmit-from-replay worker
//!
//! Does not loop: issues one timed playback command per channel and returns.
//! Playback itself runs in the device.

use crate::runtime::errors::WorkResult;
use crate::runtime::replay::{ReplayDescriptor, issue_playback};
use crate::runtime::topology::BlockPort;
use crate::runtime::worker::{Lifecycle, Side, Worker, WorkerContext, WorkerReport, WorkerState};
use tracing::info;

pub struct TxReplayWorker {
    name: String,
    targets: Vec<BlockPort>,
    descriptor: ReplayDescriptor,
    /// Samples to play per channel, 0 plays until stopped
    nsamps: u64,
    slot: usize,
    life: Lifecycle,
}

impl TxReplayWorker {
    pub fn new(name: impl Into<String>, targets: Vec<BlockPort>, descriptor: ReplayDescriptor, nsamps: u64) -> Self {
        let name = name.into();
        Self {
            life: Lifecycle::new(&name),
            name,
            targets,
            descriptor,
            nsamps,
            slot: 0,
        }
    }

    pub fn with_slot(mut self, slot: usize) -> Self {
        self.slot = slot;
        self
    }
}

impl Worker for TxReplayWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn side(&self) -> Side {
        Side::Tx
    }

    fn run(&mut self, ctx: &WorkerContext) -> WorkResult<WorkerReport> {
        let start = ctx.schedule.start_for(self.slot);
        self.life.enter(WorkerState::Streaming);
        let result = self.targets.iter().try_for_each(|target| {
            let replay = ctx.graph().replay_block(&target.block)?;
            info!("[{}] Replaying {} samples on {} at {}", self.name, self.nsamps, target, start);
            issue_playback(replay.as_ref(), target.port, &self.descriptor, self.nsamps, start)
        });
        self.life.enter(WorkerState::Terminated);
        result?;
        Ok(WorkerReport {
            samples: self.nsamps * self.targets.len() as u64,
        })
    }

    fn state(&self) -> WorkerState {
        self.life.state()
    }
}
