use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct CacheState<T> {
    idle: usize,
    /// Hand-offs queued for an idle worker that has not picked them up yet.
    wake_pending: usize,
    queue: VecDeque<T>,
    draining: bool,
    live_workers: usize,
}

/// A bounded set of parked OS threads waiting for their next job.
///
/// ## Hand-off
/// `try_hand_off` only succeeds when an idle worker exists that no earlier
/// hand-off has already claimed (`idle > wake_pending`), so every queued job
/// has a parked thread reserved for it. The woken worker takes the job
/// without an OS thread-create.
///
/// ## Bound
/// `idle <= max_idle` at all times. A worker that cannot park exits.
pub struct ThreadCache<T> {
    max_idle: usize,
    state: Mutex<CacheState<T>>,
    /// Parked workers wait here.
    wake: Condvar,
    /// `drain` and worker-exit waiters wait here.
    idle_changed: Condvar,
}

impl<T> ThreadCache<T> {
    /// `max_idle == 0` disables pooling: every job gets a fresh thread.
    pub fn new(max_idle: usize) -> Self {
        Self {
            max_idle,
            state: Mutex::new(CacheState {
                idle: 0,
                wake_pending: 0,
                queue: VecDeque::new(),
                draining: false,
                live_workers: 0,
            }),
            wake: Condvar::new(),
            idle_changed: Condvar::new(),
        }
    }

    pub fn max_idle(&self) -> usize {
        self.max_idle
    }

    /// Hands `job` to a parked worker, or gives it back when none is free.
    pub fn try_hand_off(&self, job: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.draining || state.idle <= state.wake_pending {
            return Err(job);
        }
        state.queue.push_back(job);
        state.wake_pending += 1;
        self.wake.notify_one();
        Ok(())
    }

    /// Parks the calling worker until a job arrives or the cache drains.
    ///
    /// Returns `None` immediately when parking is not permitted (cache full
    /// or draining); the caller must then exit.
    pub fn park(&self) -> Option<T> {
        let mut state = self.state.lock();
        if state.draining || state.idle >= self.max_idle {
            return None;
        }
        state.idle += 1;

        loop {
            if let Some(job) = state.queue.pop_front() {
                state.idle -= 1;
                state.wake_pending -= 1;
                if state.draining {
                    self.idle_changed.notify_all();
                }
                return Some(job);
            }
            if state.draining {
                state.idle -= 1;
                self.idle_changed.notify_all();
                return None;
            }
            self.wake.wait(&mut state);
        }
    }

    /// Wakes every parked worker and blocks until none is parked. Workers
    /// that finish afterwards will not park.
    pub fn drain(&self) {
        let mut state = self.state.lock();
        state.draining = true;
        self.wake.notify_all();
        while state.idle > 0 {
            self.idle_changed.wait(&mut state);
        }
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle
    }

    /// Accounts a worker thread about to be spawned.
    pub fn worker_started(&self) {
        self.state.lock().live_workers += 1;
    }

    /// Accounts a worker thread leaving (or a spawn that failed).
    pub fn worker_exited(&self) {
        let mut state = self.state.lock();
        match state.live_workers.checked_sub(1) {
            Some(n) => state.live_workers = n,
            None => {
                drop(state);
                tracing::error!("ThreadCache: worker exit without matching start");
                debug_assert!(false, "ThreadCache: live_workers underflow");
                return;
            }
        }
        self.idle_changed.notify_all();
    }

    pub fn live_workers(&self) -> usize {
        self.state.lock().live_workers
    }

    /// Blocks until every worker thread has exited or `timeout` elapses.
    pub fn wait_no_workers(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.live_workers > 0 {
            if self.idle_changed.wait_until(&mut state, deadline).timed_out() {
                return state.live_workers == 0;
            }
        }
        true
    }
}
