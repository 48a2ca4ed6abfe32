use crate::phase::{PhaseCell, ShutdownPhase};
use core::sync::atomic::{AtomicBool, Ordering};
use gatehouse_core::stats::ServerStats;
use gatehouse_core::{AcceptControl, ServerRuntime, SessionCategory, SessionHandle, TeardownHooks};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(i32),
    Requested,
}

#[derive(Debug, Clone, Copy)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    /// Sessions whose stream was shut down from the server side.
    pub forced_closed: u64,
    pub elapsed: Duration,
}

/// Drives the server from `Running` to `TornDown`.
///
/// ## Exactly Once
/// `shutdown` is guarded by a compare-and-set: the first caller runs the
/// whole sequence, every other caller (a second signal, an admin command)
/// returns `false` at once. Each step additionally checks that the phase
/// cell is where it expects, so no step can run twice.
///
/// ## Escalation
/// Normal sessions are soft-killed first. Replication-dump sessions follow
/// once the normal ones have left or the grace period ran out, because
/// killing them while normal clients still hold resources can corrupt the
/// stream they are sending. Whatever remains is then hard-killed.
pub struct ShutdownOrchestrator {
    rt: Arc<ServerRuntime>,
    acceptors: Vec<Arc<dyn AcceptControl>>,
    hooks: Arc<dyn TeardownHooks>,
    started: AtomicBool,
    phase: PhaseCell,
    report: Mutex<Option<ShutdownReport>>,
    torn_down: Condvar,
}

impl ShutdownOrchestrator {
    pub fn new(rt: Arc<ServerRuntime>, hooks: Arc<dyn TeardownHooks>) -> Self {
        Self {
            rt,
            acceptors: Vec::new(),
            hooks,
            started: AtomicBool::new(false),
            phase: PhaseCell::new(),
            report: Mutex::new(None),
            torn_down: Condvar::new(),
        }
    }

    pub fn with_acceptor(mut self, acceptor: Arc<dyn AcceptControl>) -> Self {
        self.acceptors.push(acceptor);
        self
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.phase.load()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Runs the shutdown sequence. Returns `true` only for the caller that
    /// actually ran it.
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Shutdown: already in progress, ignoring {:?}", reason);
            return false;
        }

        let start = Instant::now();
        let forced_before = ServerStats::read(&self.rt.stats().forced_closed);
        tracing::info!("Shutdown: initiated ({:?})", reason);

        self.stop_accepting();
        self.drain_normal();
        self.drain_special();
        self.force_close();
        self.wait_empty();
        self.tear_down(ShutdownReport {
            reason,
            forced_closed: ServerStats::read(&self.rt.stats().forced_closed) - forced_before,
            elapsed: start.elapsed(),
        });
        true
    }

    /// Blocks until `TornDown` or `timeout`. Returns the report when done.
    pub fn wait_torn_down(&self, timeout: Duration) -> Option<ShutdownReport> {
        let deadline = Instant::now() + timeout;
        let mut report = self.report.lock();
        while report.is_none() {
            if self.torn_down.wait_until(&mut report, deadline).timed_out() {
                break;
            }
        }
        *report
    }

    /// Blocks until `TornDown`, however long it takes.
    pub fn wait(&self) -> ShutdownReport {
        let mut report = self.report.lock();
        loop {
            if let Some(done) = *report {
                return done;
            }
            self.torn_down.wait(&mut report);
        }
    }

    fn stop_accepting(&self) {
        if !self.phase.advance(ShutdownPhase::Running) {
            return;
        }
        self.rt.begin_shutdown();
        for acceptor in &self.acceptors {
            acceptor.stop_accepting();
        }
        for acceptor in &self.acceptors {
            acceptor.join();
        }
        self.rt.thread_cache().drain();
    }

    fn drain_normal(&self) {
        if !self.phase.advance(ShutdownPhase::StopAccepting) {
            return;
        }
        let mut killed = 0usize;
        for handle in self.rt.registry().snapshot() {
            if handle.category() != SessionCategory::ReplicationDump && handle.soft_kill(self.rt.next_kill_seq()) {
                killed += 1;
            }
        }
        tracing::info!("Shutdown: soft-killed {} sessions", killed);
    }

    fn drain_special(&self) {
        if !self.phase.advance(ShutdownPhase::DrainNormal) {
            return;
        }
        let grace = self.rt.config().shutdown_grace_period();
        let deadline = Instant::now() + grace;

        // Normal sessions get the grace period to leave before dump
        // sessions are touched.
        while Instant::now() < deadline && self.remaining(|c| c != SessionCategory::ReplicationDump) > 0 {
            std::thread::sleep(POLL);
        }

        let retries = self.rt.config().force_close_retries;
        let slice = grace / retries.saturating_add(1);
        for attempt in 0..=retries {
            let dumps = self.sessions(|c| c == SessionCategory::ReplicationDump);
            if dumps.is_empty() {
                return;
            }
            if attempt == 0 {
                tracing::info!("Shutdown: soft-killing {} replication sessions", dumps.len());
            } else {
                tracing::warn!(
                    "Shutdown: {} replication sessions still running (retry {}/{})",
                    dumps.len(),
                    attempt,
                    retries
                );
            }
            for handle in &dumps {
                handle.soft_kill(self.rt.next_kill_seq());
            }
            let until = Instant::now() + slice;
            while Instant::now() < until && self.remaining(|c| c == SessionCategory::ReplicationDump) > 0 {
                std::thread::sleep(POLL);
            }
        }
    }

    fn force_close(&self) {
        if !self.phase.advance(ShutdownPhase::DrainSpecial) {
            return;
        }
        let forced = self.hard_kill_all();
        if forced > 0 {
            tracing::warn!("Shutdown: grace period expired, forcibly closed {} sessions", forced);
        }
    }

    fn wait_empty(&self) {
        if !self.phase.advance(ShutdownPhase::ForceClose) {
            return;
        }
        let interval = self.rt.config().drain_log_interval();
        let registry = self.rt.registry();
        let gate = self.rt.gate();

        loop {
            let drained = registry.wait_drained(interval);
            if drained && gate.pending() == 0 {
                break;
            }
            if drained {
                // Admitted but not registered yet; they will see the closed gate.
                std::thread::sleep(POLL);
                continue;
            }
            tracing::warn!(
                "Shutdown: waiting for {} sessions ({} pending admissions)",
                registry.count(),
                gate.pending()
            );
            self.hard_kill_all();
        }

        self.rt.thread_cache().drain();
        while !self.rt.thread_cache().wait_no_workers(interval) {
            tracing::warn!(
                "Shutdown: waiting for {} worker threads to exit",
                self.rt.thread_cache().live_workers()
            );
        }
    }

    fn tear_down(&self, report: ShutdownReport) {
        if !self.phase.advance(ShutdownPhase::WaitEmpty) {
            return;
        }
        self.hooks.storage_prepare_shutdown();
        self.hooks.replication_shutdown();
        self.hooks.logging_shutdown();

        tracing::info!(
            "Shutdown: complete in {:?}, {} sessions forcibly closed",
            report.elapsed,
            report.forced_closed
        );
        let mut slot = self.report.lock();
        *slot = Some(report);
        self.torn_down.notify_all();
    }

    fn hard_kill_all(&self) -> usize {
        let mut forced = 0;
        for handle in self.rt.registry().snapshot() {
            if handle.hard_kill() {
                ServerStats::bump(&self.rt.stats().forced_closed);
                forced += 1;
            }
        }
        forced
    }

    fn sessions<F: Fn(SessionCategory) -> bool>(&self, keep: F) -> Vec<Arc<SessionHandle>> {
        self.rt
            .registry()
            .snapshot()
            .into_iter()
            .filter(|h| keep(h.category()))
            .collect()
    }

    fn remaining<F: Fn(SessionCategory) -> bool>(&self, keep: F) -> usize {
        let mut n = 0;
        self.rt.registry().for_each_locked(|h| {
            if keep(h.category()) {
                n += 1;
            }
        });
        n
    }
}
