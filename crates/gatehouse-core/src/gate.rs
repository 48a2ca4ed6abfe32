use crate::error::Rejection;
use crate::session::SessionCategory;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

#[repr(align(64))]
struct CacheAlignedCounter(AtomicUsize);

/// Proof that the gate counted a connection. Must be turned into a
/// registration or rolled back.
#[must_use = "an admitted connection must be registered or rolled back"]
#[derive(Debug)]
pub struct AdmitTicket {
    category: SessionCategory,
}

impl AdmitTicket {
    pub fn category(&self) -> SessionCategory {
        self.category
    }
}

/// Capacity check on the accept hot path.
///
/// ## Hot Path
/// `try_admit` never blocks: a closed-flag load followed by a CAS loop on the
/// connection counter, the same pattern a credit window uses. The counter and
/// the registry's live count are only eventually consistent; the `pending`
/// counter covers the window between the two.
pub struct AdmissionGate {
    max_connections: usize,
    slack: usize,
    count: CacheAlignedCounter,
    high_water: AtomicUsize,
    /// Admitted but not yet registered.
    pending: AtomicUsize,
    closed: AtomicBool,
    rejected_capacity: AtomicU64,
    rejected_shutdown: AtomicU64,
}

impl AdmissionGate {
    pub fn new(max_connections: usize, slack: usize) -> Self {
        Self {
            max_connections,
            slack,
            count: CacheAlignedCounter(AtomicUsize::new(0)),
            high_water: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            rejected_capacity: AtomicU64::new(0),
            rejected_shutdown: AtomicU64::new(0),
        }
    }

    /// Admits unless shutdown is in progress or, for non-admin sessions,
    /// `count >= max_connections + slack`.
    pub fn try_admit(&self, category: SessionCategory) -> Result<AdmitTicket, Rejection> {
        if self.is_closed() {
            self.rejected_shutdown.fetch_add(1, Ordering::Relaxed);
            return Err(Rejection::ShuttingDown);
        }

        let admitted = if category == SessionCategory::Admin {
            self.count.0.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            let limit = self.max_connections.saturating_add(self.slack);
            let mut current = self.count.0.load(Ordering::Acquire);
            loop {
                if current >= limit {
                    self.rejected_capacity.fetch_add(1, Ordering::Relaxed);
                    return Err(Rejection::TooManyConnections);
                }
                match self.count.0.compare_exchange_weak(
                    current,
                    current + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break current + 1,
                    Err(seen) => current = seen,
                }
            }
        };

        self.high_water.fetch_max(admitted, Ordering::Relaxed);
        self.pending.fetch_add(1, Ordering::AcqRel);
        Ok(AdmitTicket { category })
    }

    /// The admitted connection reached the registry.
    pub fn mark_registered(&self, ticket: AdmitTicket) {
        let _ = ticket;
        Self::decrement(&self.pending, "pending");
    }

    /// Undoes an admission that never reached the registry (spawn failure,
    /// dispatch abandoned during shutdown).
    pub fn rollback(&self, ticket: AdmitTicket) {
        let _ = ticket;
        Self::decrement(&self.pending, "pending");
        Self::decrement(&self.count.0, "count");
    }

    /// A registered session finished.
    pub fn release(&self) {
        Self::decrement(&self.count.0, "count");
    }

    fn decrement(counter: &AtomicUsize, name: &str) {
        let result = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        if result.is_err() {
            debug_assert!(false, "AdmissionGate: {} underflow", name);
            tracing::error!("AdmissionGate: {} underflow ignored", name);
        }
    }

    /// Stops admitting anything, admin included.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn count(&self) -> usize {
        self.count.0.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn rejected_capacity(&self) -> u64 {
        self.rejected_capacity.load(Ordering::Relaxed)
    }

    pub fn rejected_shutdown(&self) -> u64 {
        self.rejected_shutdown.load(Ordering::Relaxed)
    }

    /// Counts a connection turned away outside `try_admit`, e.g. one still
    /// queued for a dispatcher when shutdown began.
    pub fn note_shutdown_rejection(&self) {
        self.rejected_shutdown.fetch_add(1, Ordering::Relaxed);
    }
}
