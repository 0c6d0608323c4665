//! Transfer-call watchdog
//!
//! Low-overhead monitoring using atomic timestamps instead of locks.
//! Each worker stores the start time of its current transfer call in an
//! atomic, and a monitor thread periodically scans those timestamps to
//! report workers stuck inside the driver.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Timestamp in milliseconds since UNIX_EPOCH
#[inline(always)]
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

struct CallState {
    /// Start (ms since epoch) of the call in progress, or 0 if idle
    last_op_start: AtomicU64,
    has_warned: AtomicBool,
    worker: String,
    operation: String,
}

/// Held by a worker for one kind of transfer call
#[derive(Clone)]
pub struct WatchdogHandle {
    state: Arc<CallState>,
}

impl WatchdogHandle {
    #[inline(always)]
    pub fn start_operation(&self) {
        self.state.last_op_start.store(now_millis(), Ordering::Relaxed);
        self.state.has_warned.store(false, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn finish_operation(&self) {
        if self.state.has_warned.swap(false, Ordering::Relaxed) {
            info!("[{}] {} unblocked", self.state.worker, self.state.operation);
        }
        self.state.last_op_start.store(0, Ordering::Relaxed);
    }

    /// Time the current operation while `f` runs
    #[inline(always)]
    pub fn guard<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = OperationGuard::new(self);
        f()
    }

    fn is_warned(&self) -> bool {
        self.state.has_warned.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct Watchdog {
    calls: Arc<Mutex<Vec<Weak<CallState>>>>,
    enabled: Arc<AtomicBool>,
    threshold: Duration,
}

impl Watchdog {
    pub fn new(threshold: Duration) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            enabled: Arc::new(AtomicBool::new(true)),
            threshold,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn register(&self, worker: &str, operation: &str) -> WatchdogHandle {
        let state = Arc::new(CallState {
            last_op_start: AtomicU64::new(0),
            has_warned: AtomicBool::new(false),
            worker: worker.to_string(),
            operation: operation.to_string(),
        });
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&state));
        WatchdogHandle { state }
    }

    /// Warn once for every call blocked longer than the threshold
    pub fn check_for_blocked(&self) {
        let now = now_millis();
        let threshold_ms = self.threshold.as_millis() as u64;

        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.retain(|weak| {
            let Some(state) = weak.upgrade() else {
                return false;
            };
            let start = state.last_op_start.load(Ordering::Relaxed);
            if start > 0 {
                let duration_ms = now.saturating_sub(start);
                if duration_ms > threshold_ms && !state.has_warned.swap(true, Ordering::Relaxed) {
                    warn!(
                        "[{}] blocked in {} for {:.1}s",
                        state.worker,
                        state.operation,
                        duration_ms as f64 / 1000.0
                    );
                }
            }
            true
        });
    }

    pub fn start_monitoring_thread(&self) -> JoinHandle<()> {
        self.enabled.store(true, Ordering::Relaxed);
        let watchdog = self.clone();
        let period = (self.threshold / 5).clamp(Duration::from_millis(10), Duration::from_millis(100));
        std::thread::spawn(move || {
            loop {
                std::thread::sleep(period);
                if !watchdog.enabled.load(Ordering::Relaxed) {
                    break;
                }
                watchdog.check_for_blocked();
            }
        })
    }

    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// RAII guard for tracking an operation
pub struct OperationGuard<'a> {
    handle: &'a WatchdogHandle,
}

impl<'a> OperationGuard<'a> {
    #[inline(always)]
    pub fn new(handle: &'a WatchdogHandle) -> Self {
        handle.start_operation();
        Self { handle }
    }
}

impl Drop for OperationGuard<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        self.handle.finish_operation();
    }
}
