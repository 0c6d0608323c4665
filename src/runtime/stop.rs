//! Run-scoped stop flag
//!
//! The one piece of mutable state shared by every worker. Cloning shares the
//! same flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Store `value`, returning the previous value
    pub fn replace(&self, value: bool) -> bool {
        self.0.swap(value, Ordering::SeqCst)
    }
}

/// Route SIGINT to `flag`. Only one handler can be installed per process.
pub fn install_interrupt_handler(flag: &StopFlag) -> Result<(), ctrlc::Error> {
    let flag = flag.clone();
    ctrlc::set_handler(move || {
        warn!("Interrupt received, stopping...");
        flag.set();
    })
}
