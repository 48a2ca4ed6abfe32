//! Read-only counters exposed to the metrics/status collaborator.
//!
//! Every counter here is an independent statistic. None of them guards a
//! structural invariant; the locks in the registry and the thread cache do.

use core::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct ServerStats {
    pub forced_closed: AtomicU64,
    pub threads_spawned: AtomicU64,
    pub spawn_failures: AtomicU64,
    pub total_accepted: AtomicU64,
}

impl ServerStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub live_connections: usize,
    pub admitted_connections: usize,
    pub high_water_mark: usize,
    pub pending_admissions: usize,
    pub rejected_capacity: u64,
    pub rejected_shutdown: u64,
    /// `rejected_capacity + rejected_shutdown`.
    pub total_rejected: u64,
    pub forced_closed: u64,
    pub idle_workers: usize,
    pub live_workers: usize,
    pub threads_spawned: u64,
    pub spawn_failures: u64,
    pub total_accepted: u64,
}

/// Rate-limits a repeated warning to one line per window, reporting how many
/// occurrences were folded into it.
pub struct ThrottledLog {
    window: Duration,
    state: Mutex<ThrottleState>,
}

struct ThrottleState {
    last: Option<Instant>,
    suppressed: u64,
}

impl ThrottledLog {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(ThrottleState { last: None, suppressed: 0 }),
        }
    }

    /// Returns `Some(suppressed_since_last)` when the caller should emit a
    /// line now, `None` when this occurrence is folded into the next one.
    pub fn admit(&self) -> Option<u64> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let due = match state.last {
            None => true,
            Some(last) => now.duration_since(last) >= self.window,
        };
        if due {
            state.last = Some(now);
            let folded = state.suppressed;
            state.suppressed = 0;
            Some(folded)
        } else {
            state.suppressed += 1;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttled_log_folds_bursts() {
        let log = ThrottledLog::new(Duration::from_secs(60));
        assert_eq!(log.admit(), Some(0));
        assert_eq!(log.admit(), None);
        assert_eq!(log.admit(), None);
        let zero_window = ThrottledLog::new(Duration::ZERO);
        assert_eq!(zero_window.admit(), Some(0));
        assert_eq!(zero_window.admit(), Some(0));
    }
}
