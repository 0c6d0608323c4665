//! Device time alignment and the shared start schedule

use super::errors::SyncError;
use crate::driver::{Graph, TimeSpec};
use std::thread;
use std::time::Duration;
use tracing::info;

/// Set clock and time reference on every motherboard
pub fn set_sources(graph: &dyn Graph, source: &str) -> Result<(), SyncError> {
    for mboard in 0..graph.num_mboards() {
        graph
            .set_clock_source(mboard, source)
            .map_err(|e| SyncError::Source {
                kind: "clock",
                source_name: source.to_string(),
                mboard,
                source: e,
            })?;
        graph
            .set_time_source(mboard, source)
            .map_err(|e| SyncError::Source {
                kind: "time",
                source_name: source.to_string(),
                mboard,
                source: e,
            })?;
    }
    info!("Using {} clock and time reference on {} devices", source, graph.num_mboards());
    Ok(())
}

/// Reset every device clock to zero on the next reference edge, then wait
/// `settle` so all devices have seen the edge
pub fn synchronize_clocks(graph: &dyn Graph, settle: Duration) -> Result<(), SyncError> {
    info!("Synchronizing device clocks...");
    if !graph.synchronize_devices(TimeSpec::ZERO) {
        return Err(SyncError::SyncFailure);
    }
    thread::sleep(settle);
    info!("Device clocks synchronized");
    Ok(())
}

pub fn compute_start_time(now: TimeSpec, lead_time: Duration) -> TimeSpec {
    now + lead_time
}

/// Shared start time plus the separation between sequentially started slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub start: TimeSpec,
    pub time_adjust: Duration,
}

impl Schedule {
    /// Every slot starts at `start`
    pub fn simultaneous(start: TimeSpec) -> Self {
        Self {
            start,
            time_adjust: Duration::ZERO,
        }
    }

    pub fn sequential(start: TimeSpec, time_adjust: Duration) -> Self {
        Self { start, time_adjust }
    }

    /// Start of the `slot`-th sequential slot: the adjustment accumulates
    /// from `start`, it is never re-based on the current time
    pub fn start_for(&self, slot: usize) -> TimeSpec {
        let mut time = self.start;
        for _ in 0..slot {
            time += self.time_adjust;
        }
        time
    }

    /// Schedule of run `run`: the first run waits `lead_time`, later runs wait
    /// `repeat_delay` (falling back to `lead_time` when it is zero)
    pub fn for_run(now: TimeSpec, run: usize, lead_time: Duration, repeat_delay: Duration, time_adjust: Duration) -> Self {
        let delay = if run == 0 || repeat_delay.is_zero() {
            lead_time
        } else {
            repeat_delay
        };
        Self::sequential(compute_start_time(now, delay), time_adjust)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::sim::{SimConfig, SimGraph};

    #[test]
    fn test_start_time_is_now_plus_lead() {
        let now = TimeSpec::from_nanos(5_500_000_000);
        let lead = Duration::from_secs(2);
        let first = compute_start_time(now, lead);
        assert_eq!(first, compute_start_time(now, lead));
        assert!(first > now);
        assert_eq!(first - now, lead);
    }

    #[test]
    fn test_time_adjust_accumulates_from_first_slot() {
        let now = TimeSpec::from_nanos(1_000);
        let schedule = Schedule::sequential(compute_start_time(now, Duration::from_secs(2)), Duration::from_secs(2));
        assert_eq!(schedule.start_for(0), now + Duration::from_secs(2));
        assert_eq!(schedule.start_for(1), schedule.start_for(0) + Duration::from_secs(2));
        assert_eq!(schedule.start_for(3), now + Duration::from_secs(8));
    }

    #[test]
    fn test_run_schedules() {
        let now = TimeSpec::from_nanos(0);
        let lead = Duration::from_secs(2);
        let first = Schedule::for_run(now, 0, lead, Duration::from_secs(5), Duration::ZERO);
        let second = Schedule::for_run(now, 1, lead, Duration::from_secs(5), Duration::ZERO);
        let no_delay = Schedule::for_run(now, 1, lead, Duration::ZERO, Duration::ZERO);
        assert_eq!(first.start, now + lead);
        assert_eq!(second.start, now + Duration::from_secs(5));
        assert_eq!(no_delay.start, now + lead);
        assert_eq!(Schedule::simultaneous(now).start_for(4), now);
    }

    #[test]
    fn test_sync_failure_is_reported() {
        let graph = SimGraph::new(SimConfig {
            sync_ok: false,
            ..SimConfig::default()
        });
        assert!(matches!(
            synchronize_clocks(graph.as_ref(), Duration::ZERO),
            Err(SyncError::SyncFailure)
        ));
    }

    #[test]
    fn test_sources_applied_to_every_mboard() {
        let graph = SimGraph::new(SimConfig {
            devices: 2,
            ..SimConfig::default()
        });
        set_sources(graph.as_ref(), "external").unwrap();
        let sources = graph.sources();
        assert_eq!(sources.len(), 2);
        assert!(sources.iter().all(|(_, clock, time)| clock == "external" && time == "external"));
        assert!(set_sources(graph.as_ref(), "bogus").is_err());
    }
}
