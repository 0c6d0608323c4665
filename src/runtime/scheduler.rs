//! Thread-per-worker pool with a join barrier
//!
//! Spawns a dedicated thread for each worker and joins them as they finish,
//! driven by a completion channel rather than polling. The barrier waits for
//! every rx worker, raises the stop flag so tx workers still sending wind
//! down, waits for every tx worker, then restores the flag.

use super::worker::{Side, Worker, WorkerContext, WorkerOutcome};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::HashMap;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Sends the completion notice even if the worker panics
struct CompletionGuard {
    id: usize,
    tx: Sender<usize>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(self.id);
    }
}

struct Spawned {
    name: String,
    side: Side,
    handle: JoinHandle<WorkerOutcome>,
}

/// Outcome of one worker, in completion order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResult {
    pub name: String,
    pub side: Side,
    pub outcome: WorkerOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct PoolReport {
    pub results: Vec<WorkerResult>,
}

impl PoolReport {
    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_failure()).count()
    }

    /// Samples moved by every completed worker on `side`
    pub fn samples(&self, side: Side) -> u64 {
        self.results
            .iter()
            .filter(|r| r.side == side)
            .filter_map(|r| match r.outcome {
                WorkerOutcome::Completed(report) => Some(report.samples),
                WorkerOutcome::Failed => None,
            })
            .sum()
    }

    pub fn merge(&mut self, other: PoolReport) {
        self.results.extend(other.results);
    }
}

pub struct WorkerPool {
    ctx: WorkerContext,
    threads: HashMap<usize, Spawned>,
    next_id: usize,
    completion_tx: Sender<usize>,
    completion_rx: Receiver<usize>,
    watchdog_handle: Option<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(ctx: WorkerContext) -> Self {
        let (completion_tx, completion_rx) = unbounded();
        let watchdog_handle = ctx.watchdog.start_monitoring_thread();
        debug!(
            "Watchdog enabled - will report transfers blocked >{:.1}s",
            ctx.watchdog.threshold().as_secs_f64()
        );
        Self {
            ctx,
            threads: HashMap::new(),
            next_id: 0,
            completion_tx,
            completion_rx,
            watchdog_handle: Some(watchdog_handle),
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    /// Start `worker` on its own thread
    pub fn spawn(&mut self, mut worker: Box<dyn Worker>) {
        let id = self.next_id;
        self.next_id += 1;
        let name = worker.name().to_string();
        let side = worker.side();
        let ctx = self.ctx.clone();
        let guard = CompletionGuard {
            id,
            tx: self.completion_tx.clone(),
        };

        debug!("Starting worker: {}", name);
        let thread_name = name.clone();
        let handle = thread::spawn(move || {
            let _guard = guard;
            match worker.run(&ctx) {
                Ok(report) => {
                    info!("[{}] Shutdown. Moved {} samples.", thread_name, report.samples);
                    WorkerOutcome::Completed(report)
                }
                Err(e) => {
                    error!("[{}] {}", thread_name, e);
                    WorkerOutcome::Failed
                }
            }
        });

        self.threads.insert(id, Spawned { name, side, handle });
    }

    pub fn num_workers(&self) -> usize {
        self.threads.len()
    }

    fn remaining(&self, side: Side) -> usize {
        self.threads.values().filter(|s| s.side == side).count()
    }

    /// Join whichever worker finishes next
    fn join_next(&mut self, report: &mut PoolReport, total: usize) -> bool {
        let Ok(id) = self.completion_rx.recv() else {
            return false;
        };
        let Some(spawned) = self.threads.remove(&id) else {
            return true;
        };
        let outcome = match spawned.handle.join() {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("[{}] Worker panicked: {:?}", spawned.name, e);
                WorkerOutcome::Failed
            }
        };
        info!(
            "[{}] Worker completed ({}/{})",
            spawned.name,
            report.results.len() + 1,
            total
        );
        report.results.push(WorkerResult {
            name: spawned.name,
            side: spawned.side,
            outcome,
        });
        true
    }

    /// Join barrier. Returns once every worker has terminated, with the stop
    /// flag back at the value it had when the rx side finished.
    pub fn join(mut self) -> PoolReport {
        let total = self.threads.len();
        let mut report = PoolReport::default();
        info!("Waiting for {} workers to complete...", total);

        while self.remaining(Side::Rx) > 0 {
            if !self.join_next(&mut report, total) {
                break;
            }
        }

        let saved = self.ctx.stop.replace(true);
        if self.remaining(Side::Tx) > 0 {
            debug!("Rx side done, stopping {} tx workers", self.remaining(Side::Tx));
        }
        while !self.threads.is_empty() {
            if !self.join_next(&mut report, total) {
                break;
            }
        }
        self.ctx.stop.replace(saved);

        info!("All {} workers completed, {} failed", total, report.failures());
        report
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.ctx.watchdog.stop();
        if let Some(handle) = self.watchdog_handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::TimeSpec;
    use crate::driver::sim::{SimConfig, SimGraph};
    use crate::runtime::errors::{WorkError, WorkResult};
    use crate::runtime::stop::StopFlag;
    use crate::runtime::timing::Schedule;
    use crate::runtime::watchdog::Watchdog;
    use crate::runtime::worker::{Lifecycle, WorkerReport, WorkerState};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    fn context(stop: &StopFlag) -> WorkerContext {
        WorkerContext::new(
            SimGraph::new(SimConfig::default()),
            Schedule::simultaneous(TimeSpec::ZERO),
            stop.clone(),
            Watchdog::new(Duration::from_secs(5)),
        )
    }

    enum Behavior {
        Finish(Duration),
        UntilStopped(Arc<AtomicBool>),
        Fail,
        Panic,
    }

    struct TestWorker {
        name: String,
        side: Side,
        behavior: Behavior,
        life: Lifecycle,
    }

    impl TestWorker {
        fn boxed(name: &str, side: Side, behavior: Behavior) -> Box<dyn Worker> {
            Box::new(Self {
                name: name.to_string(),
                side,
                behavior,
                life: Lifecycle::new(name),
            })
        }
    }

    impl Worker for TestWorker {
        fn name(&self) -> &str {
            &self.name
        }

        fn side(&self) -> Side {
            self.side
        }

        fn run(&mut self, ctx: &WorkerContext) -> WorkResult<WorkerReport> {
            self.life.enter(WorkerState::Streaming);
            match &self.behavior {
                Behavior::Finish(d) => thread::sleep(*d),
                Behavior::UntilStopped(observed) => {
                    while !ctx.stop.is_set() {
                        thread::sleep(Duration::from_millis(5));
                    }
                    observed.store(true, Ordering::SeqCst);
                }
                Behavior::Fail => return Err(WorkError::Timeout),
                Behavior::Panic => panic!("worker blew up"),
            }
            self.life.enter(WorkerState::Terminated);
            Ok(WorkerReport { samples: 10 })
        }

        fn state(&self) -> WorkerState {
            self.life.state()
        }
    }

    #[test]
    fn test_barrier_stops_tx_and_restores_flag() {
        let stop = StopFlag::new();
        let observed = Arc::new(AtomicBool::new(false));
        let mut pool = WorkerPool::new(context(&stop));
        pool.spawn(TestWorker::boxed("tx-0", Side::Tx, Behavior::UntilStopped(Arc::clone(&observed))));
        pool.spawn(TestWorker::boxed("rx-0", Side::Rx, Behavior::Finish(Duration::from_millis(20))));

        let start = Instant::now();
        let report = pool.join();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(observed.load(Ordering::SeqCst));
        assert!(!stop.is_set());
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.failures(), 0);
        assert_eq!(report.samples(Side::Rx), 10);
    }

    #[test]
    fn test_barrier_restores_raised_flag() {
        let stop = StopFlag::new();
        stop.set();
        let mut pool = WorkerPool::new(context(&stop));
        pool.spawn(TestWorker::boxed("rx-0", Side::Rx, Behavior::Finish(Duration::ZERO)));
        pool.join();
        assert!(stop.is_set());
    }

    #[test]
    fn test_failures_do_not_affect_siblings() {
        let stop = StopFlag::new();
        let mut pool = WorkerPool::new(context(&stop));
        pool.spawn(TestWorker::boxed("rx-0", Side::Rx, Behavior::Fail));
        pool.spawn(TestWorker::boxed("rx-1", Side::Rx, Behavior::Panic));
        pool.spawn(TestWorker::boxed("rx-2", Side::Rx, Behavior::Finish(Duration::from_millis(10))));
        assert_eq!(pool.num_workers(), 3);

        let report = pool.join();
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.failures(), 2);
        let ok = report.results.iter().find(|r| r.name == "rx-2").unwrap();
        assert_eq!(ok.outcome, WorkerOutcome::Completed(WorkerReport { samples: 10 }));
    }
}
