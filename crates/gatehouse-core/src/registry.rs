use crate::session::{SessionHandle, SessionId};
use core::sync::atomic::{AtomicUsize, Ordering};
use gatehouse_dsa::ShardedMap;
use parking_lot::{Condvar, Mutex};
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The ThreadRegistry is the globally visible set of live sessions.
///
/// ## Membership
/// A handle is added exactly once, after admission, and removed exactly once,
/// when its session ends. `add` and `remove` take the owning shard lock
/// internally; callers never hold a shard lock across these calls.
///
/// ## Global Iteration
/// `snapshot` and `for_each_locked` take every shard lock in ascending
/// order. They serve shutdown and diagnostics only, never the per-request
/// path.
pub struct ThreadRegistry {
    shards: ShardedMap<SessionId, Arc<SessionHandle>>,
    live: AtomicUsize,
    drained_lock: Mutex<()>,
    drained: Condvar,
}

impl ThreadRegistry {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: ShardedMap::new(shards),
            live: AtomicUsize::new(0),
            drained_lock: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.shard_count()
    }

    /// Stable for the handle's lifetime: derived from the session id.
    pub fn shard_of(&self, handle: &SessionHandle) -> usize {
        self.shards.index_of(handle.id())
    }

    /// Inserts `handle`. A duplicate add is a programming error: it panics
    /// in debug builds and is logged and ignored in release builds.
    pub fn add(&self, handle: &Arc<SessionHandle>) -> bool {
        let idx = self.shard_of(handle);
        let inserted = {
            let mut shard = self.shards.lock_shard(idx);
            match shard.entry(handle.id()) {
                Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(handle));
                    true
                }
                Entry::Occupied(_) => false,
            }
        };

        if !inserted {
            tracing::error!("ThreadRegistry: session {} registered twice", handle.id());
            debug_assert!(false, "ThreadRegistry: duplicate add of session {}", handle.id());
            return false;
        }

        self.live.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Removes `handle`; wakes drain waiters when the registry becomes empty.
    /// Removing an absent handle is a programming error, handled like a
    /// duplicate add.
    pub fn remove(&self, handle: &SessionHandle) -> bool {
        let idx = self.shard_of(handle);
        let removed = self.shards.lock_shard(idx).remove(&handle.id()).is_some();

        if !removed {
            tracing::error!("ThreadRegistry: session {} removed while absent", handle.id());
            debug_assert!(false, "ThreadRegistry: remove of unregistered session {}", handle.id());
            return false;
        }

        let previous = self.live.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            let _guard = self.drained_lock.lock();
            self.drained.notify_all();
        }
        true
    }

    pub fn contains(&self, handle: &SessionHandle) -> bool {
        let idx = self.shard_of(handle);
        self.shards.lock_shard(idx).contains_key(&handle.id())
    }

    pub fn count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Copies every registered handle, holding all shard locks while copying.
    pub fn snapshot(&self) -> Vec<Arc<SessionHandle>> {
        let all = self.shards.lock_all();
        let mut handles: Vec<Arc<SessionHandle>> = all.iter().map(|(_, h)| Arc::clone(h)).collect();
        drop(all);
        handles.sort_by_key(|h| h.id());
        handles
    }

    /// Visits every handle with all shard locks held. `f` must not call
    /// back into the registry.
    pub fn for_each_locked<F: FnMut(&Arc<SessionHandle>)>(&self, mut f: F) {
        let all = self.shards.lock_all();
        for (_, handle) in all.iter() {
            f(handle);
        }
    }

    /// Blocks until the live count is zero or `timeout` elapses. Returns
    /// whether the registry was drained.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.drained_lock.lock();
        loop {
            if self.count() == 0 {
                return true;
            }
            if self.drained.wait_until(&mut guard, deadline).timed_out() {
                return self.count() == 0;
            }
        }
    }
}
