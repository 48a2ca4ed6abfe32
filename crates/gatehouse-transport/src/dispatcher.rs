use core::sync::atomic::{AtomicBool, Ordering};
use gatehouse_core::bridge::SqBridge;
use gatehouse_core::{ServerRuntime, SessionCategory};
use gatehouse_dsa::StagedBackoff;
use std::net::TcpStream;
use std::sync::Arc;

/// An accepted socket that has not been through admission yet.
pub struct PendingConnection {
    pub stream: TcpStream,
    pub category: SessionCategory,
}

/// Dispatcher side of the (accept loop x dispatcher) ring matrix.
pub type Inbound = Arc<SqBridge<PendingConnection>>;

/// A long-lived thread performing admission and dispatch for sockets handed
/// over by the accept loops, so `accept()` latency does not include them.
///
/// ## Idle Behaviour
/// Empty polls escalate through a staged backoff (spin, yield, sleep) and
/// any successful pop resets it.
pub struct DedicatedDispatcher {
    id: usize,
    inbound: Vec<Inbound>,
    rt: Arc<ServerRuntime>,
    producers_done: Arc<AtomicBool>,
}

impl DedicatedDispatcher {
    pub fn new(id: usize, inbound: Vec<Inbound>, rt: Arc<ServerRuntime>, producers_done: Arc<AtomicBool>) -> Self {
        Self {
            id,
            inbound,
            rt,
            producers_done,
        }
    }

    /// Runs until every accept loop has exited and the rings are empty.
    pub fn run(self) {
        if self.rt.config().pin_dispatchers {
            self.pin();
        }

        let config = self.rt.config();
        let mut backoff = StagedBackoff::new(config.dispatcher_spin_limit, config.dispatcher_max_sleep());
        let mut handled = 0u64;

        loop {
            let batch = self.poll_once();
            if batch > 0 {
                handled += batch;
                backoff.reset();
                continue;
            }
            if self.producers_done.load(Ordering::Acquire) && self.inbound.iter().all(|b| b.is_empty()) {
                break;
            }
            backoff.snooze();
        }

        tracing::info!("Dispatcher {}: exiting after {} connections", self.id, handled);
    }

    fn poll_once(&self) -> u64 {
        let mut batch = 0;
        for bridge in &self.inbound {
            while let Some(pending) = bridge.pop() {
                batch += 1;
                // Once shutdown began the gate rejects and counts these.
                let _ = self.rt.admit_and_dispatch(pending.stream, pending.category);
            }
        }
        batch
    }

    fn pin(&self) {
        let core = core_affinity::get_core_ids()
            .filter(|ids| !ids.is_empty())
            .map(|ids| ids[self.id % ids.len()]);
        match core {
            Some(core) if core_affinity::set_for_current(core) => {
                tracing::info!("Dispatcher {} pinned to core {}", self.id, core.id);
            }
            _ => tracing::warn!("Dispatcher {}: failed to pin to a CPU core", self.id),
        }
    }
}

/// Accept-loop side: one ring per dispatcher plus a round-robin cursor.
pub struct Outbound {
    rings: Vec<Arc<SqBridge<PendingConnection>>>,
    cursor: usize,
}

impl Outbound {
    pub fn new(rings: Vec<Arc<SqBridge<PendingConnection>>>) -> Self {
        Self { rings, cursor: 0 }
    }

    /// Pushes to the next dispatcher in turn, skipping full rings. Hands the
    /// connection back when every ring is full.
    pub fn push(&mut self, pending: PendingConnection) -> Result<(), PendingConnection> {
        let n = self.rings.len();
        let mut item = pending;
        for step in 0..n {
            let idx = (self.cursor + step) % n;
            match self.rings[idx].try_push(item) {
                Ok(()) => {
                    self.cursor = (idx + 1) % n;
                    return Ok(());
                }
                Err((_, back)) => item = back,
            }
        }
        Err(item)
    }
}
