//! # Staged Backoff
//!
//! Used by consumers polling a lock-free ring that may be empty. Escalates
//! from busy-waiting to yielding to short sleeps so an idle consumer does not
//! burn a core, while a busy one never leaves the spin stage.

use std::time::Duration;

const MAX_SPIN_SHIFT: u32 = 6;
const YIELD_ROUNDS: u32 = 4;
const FIRST_SLEEP: Duration = Duration::from_micros(16);

/// What the caller did (or should have done) for one empty poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStage {
    Spin(u32),
    Yield,
    Sleep(Duration),
}

#[derive(Debug, Clone)]
pub struct StagedBackoff {
    step: u32,
    spin_limit: u32,
    max_sleep: Duration,
}

impl StagedBackoff {
    /// `spin_limit` spin rounds, then a few yields, then sleeps doubling up
    /// to `max_sleep`.
    pub fn new(spin_limit: u32, max_sleep: Duration) -> Self {
        Self {
            step: 0,
            spin_limit,
            max_sleep: max_sleep.max(FIRST_SLEEP),
        }
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Computes the next stage without blocking.
    pub fn next_stage(&mut self) -> BackoffStage {
        let step = self.step;
        self.step = self.step.saturating_add(1);

        if step < self.spin_limit {
            return BackoffStage::Spin(1 << step.min(MAX_SPIN_SHIFT));
        }
        let step = step - self.spin_limit;
        if step < YIELD_ROUNDS {
            return BackoffStage::Yield;
        }
        let shift = (step - YIELD_ROUNDS).min(16);
        let sleep = FIRST_SLEEP.saturating_mul(1 << shift);
        BackoffStage::Sleep(sleep.min(self.max_sleep))
    }

    /// Performs the next stage.
    pub fn snooze(&mut self) -> BackoffStage {
        let stage = self.next_stage();
        match stage {
            BackoffStage::Spin(n) => {
                for _ in 0..n {
                    std::hint::spin_loop();
                }
            }
            BackoffStage::Yield => std::thread::yield_now(),
            BackoffStage::Sleep(d) => std::thread::sleep(d),
        }
        stage
    }

    /// True once the backoff has escalated past spinning and yielding.
    pub fn is_sleeping(&self) -> bool {
        self.step > self.spin_limit + YIELD_ROUNDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalates_spin_yield_sleep() {
        let mut backoff = StagedBackoff::new(3, Duration::from_micros(100));
        assert_eq!(backoff.next_stage(), BackoffStage::Spin(1));
        assert_eq!(backoff.next_stage(), BackoffStage::Spin(2));
        assert_eq!(backoff.next_stage(), BackoffStage::Spin(4));
        for _ in 0..YIELD_ROUNDS {
            assert_eq!(backoff.next_stage(), BackoffStage::Yield);
        }
        assert_eq!(backoff.next_stage(), BackoffStage::Sleep(Duration::from_micros(16)));
        assert_eq!(backoff.next_stage(), BackoffStage::Sleep(Duration::from_micros(32)));
        assert_eq!(backoff.next_stage(), BackoffStage::Sleep(Duration::from_micros(64)));
        // Capped.
        assert_eq!(backoff.next_stage(), BackoffStage::Sleep(Duration::from_micros(100)));
        assert!(backoff.is_sleeping());
    }

    #[test]
    fn reset_returns_to_spinning() {
        let mut backoff = StagedBackoff::new(1, Duration::from_millis(1));
        for _ in 0..20 {
            backoff.next_stage();
        }
        backoff.reset();
        assert_eq!(backoff.next_stage(), BackoffStage::Spin(1));
    }
}
