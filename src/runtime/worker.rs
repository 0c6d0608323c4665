//! Worker trait for capture and playback tasks
//!
//! A worker is bound to one endpoint and runs on its own thread. It sees the
//! rest of the run only through a [`WorkerContext`]: the shared schedule, the
//! stop flag, and the device clock.

use super::errors::WorkResult;
use super::stop::StopFlag;
use super::timing::Schedule;
use super::watchdog::Watchdog;
use crate::driver::{Graph, TimeSpec};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Which side of the join barrier a worker belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Rx,
    Tx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Streaming,
    Draining,
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::Streaming => "streaming",
            WorkerState::Draining => "draining",
            WorkerState::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

/// State of one worker, logged on every transition
#[derive(Debug)]
pub struct Lifecycle {
    name: String,
    state: WorkerState,
}

impl Lifecycle {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: WorkerState::Idle,
        }
    }

    pub fn enter(&mut self, next: WorkerState) {
        if self.state != next {
            debug!("[{}] {} -> {}", self.name, self.state, next);
            self.state = next;
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }
}

/// Read-only view of the run shared by every worker
#[derive(Clone)]
pub struct WorkerContext {
    pub schedule: Schedule,
    pub stop: StopFlag,
    pub watchdog: Watchdog,
    graph: Arc<dyn Graph>,
}

impl WorkerContext {
    pub fn new(graph: Arc<dyn Graph>, schedule: Schedule, stop: StopFlag, watchdog: Watchdog) -> Self {
        Self {
            schedule,
            stop,
            watchdog,
            graph,
        }
    }

    /// Device clock of the first motherboard
    pub fn device_time(&self) -> TimeSpec {
        self.graph.time_now(0)
    }

    pub fn graph(&self) -> &Arc<dyn Graph> {
        &self.graph
    }
}

/// What a worker reports back when its loop ends cleanly
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Samples moved, summed over channels
    pub samples: u64,
}

/// A capture or playback task bound to one endpoint
pub trait Worker: Send {
    fn name(&self) -> &str;

    fn side(&self) -> Side;

    /// Run to completion on the calling thread
    fn run(&mut self, ctx: &WorkerContext) -> WorkResult<WorkerReport>;

    fn state(&self) -> WorkerState;
}

/// Result of one worker as seen by the join barrier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed(WorkerReport),
    Failed,
}

impl WorkerOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, WorkerOutcome::Failed)
    }
}
