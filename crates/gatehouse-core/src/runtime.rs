use crate::config::ServerConfig;
use crate::error::Rejection;
use crate::gate::{AdmissionGate, AdmitTicket};
use crate::pool::ThreadCache;
use crate::registry::ThreadRegistry;
use crate::session::{SessionCategory, SessionHandle, SessionId};
use crate::stats::{ServerStats, StatsSnapshot, ThrottledLog};
use crate::worker;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;

/// How a session ended, as reported by the session collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Disconnected,
    Killed,
    Error(String),
}

/// The session-execution collaborator. Runs one session to completion on
/// a worker thread and must return promptly once the handle is killed.
pub trait SessionExecutor: Send + Sync + 'static {
    fn run_session(&self, handle: &Arc<SessionHandle>) -> ExitReason;

    /// Tells a turned-away client why, when the protocol allows it.
    fn reject(&self, mut stream: &TcpStream, reason: Rejection) {
        if reason == Rejection::TooManyConnections {
            let _ = stream.write_all(b"ERROR 1040 (08004): Too many connections\n");
        }
    }
}

/// External teardown sequence, called once, in declaration order.
pub trait TeardownHooks: Send + Sync + 'static {
    fn storage_prepare_shutdown(&self) {}
    fn replication_shutdown(&self) {}
    fn logging_shutdown(&self) {}
}

pub struct NoopHooks;

impl TeardownHooks for NoopHooks {}

/// Implemented by the transport layer so shutdown can stop it without
/// depending on it.
pub trait AcceptControl: Send + Sync {
    /// Sets the stop flag and shuts every listening socket down. Idempotent.
    fn stop_accepting(&self);
    /// Joins accept and dispatcher threads. Idempotent.
    fn join(&self);
}

/// A session plus its admission proof, travelling to a worker.
pub struct Assignment {
    pub handle: Arc<SessionHandle>,
    pub ticket: AdmitTicket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Woke a parked worker.
    Reused,
    /// Created a new OS thread.
    Spawned,
    /// Spawn failed; admission rolled back and the stream closed.
    Failed,
}

/// Process-wide context shared by every component.
///
/// Constructed once at startup and passed (as `Arc`) to the transport and
/// lifecycle layers instead of free-standing globals.
pub struct ServerRuntime {
    config: ServerConfig,
    gate: AdmissionGate,
    registry: ThreadRegistry,
    cache: ThreadCache<Assignment>,
    stats: ServerStats,
    executor: Arc<dyn SessionExecutor>,
    stop_accepting: AtomicBool,
    kill_seq: AtomicU64,
    worker_seq: AtomicU64,
    spawn_log: ThrottledLog,
}

impl ServerRuntime {
    pub fn new(config: ServerConfig, executor: Arc<dyn SessionExecutor>) -> Arc<Self> {
        let gate = AdmissionGate::new(config.max_connections, config.admission_slack);
        let registry = ThreadRegistry::new(config.num_registry_shards);
        let cache = ThreadCache::new(config.effective_max_idle_threads());
        tracing::info!(
            "ServerRuntime: max_connections={} max_idle_threads={} registry_shards={}",
            config.max_connections,
            cache.max_idle(),
            registry.shard_count()
        );
        Arc::new(Self {
            config,
            gate,
            registry,
            cache,
            stats: ServerStats::default(),
            executor,
            stop_accepting: AtomicBool::new(false),
            kill_seq: AtomicU64::new(1),
            worker_seq: AtomicU64::new(0),
            spawn_log: ThrottledLog::new(Duration::from_secs(5)),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn thread_cache(&self) -> &ThreadCache<Assignment> {
        &self.cache
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub(crate) fn executor(&self) -> &dyn SessionExecutor {
        self.executor.as_ref()
    }

    /// The accept hot path: gate check, then dispatch. A rejected stream is
    /// told why (when possible) and closed here.
    ///
    /// An admitted session whose worker could not be spawned comes back as
    /// `DispatchOutcome::Failed`; its admission is already rolled back and
    /// its stream closed.
    pub fn admit_and_dispatch(
        self: &Arc<Self>,
        stream: TcpStream,
        category: SessionCategory,
    ) -> Result<(SessionId, DispatchOutcome), Rejection> {
        ServerStats::bump(&self.stats.total_accepted);
        match self.gate.try_admit(category) {
            Ok(ticket) => {
                let handle = SessionHandle::new(stream, category);
                let id = handle.id();
                Ok((id, self.dispatch(handle, ticket)))
            }
            Err(reason) => {
                tracing::debug!("Admission: rejected {:?} connection ({})", category, reason);
                self.executor.reject(&stream, reason);
                let _ = stream.shutdown(Shutdown::Both);
                Err(reason)
            }
        }
    }

    /// Reuses a parked worker when one is free, otherwise spawns a thread.
    pub fn dispatch(self: &Arc<Self>, handle: Arc<SessionHandle>, ticket: AdmitTicket) -> DispatchOutcome {
        let job = Assignment { handle, ticket };
        let job = match self.cache.try_hand_off(job) {
            Ok(()) => return DispatchOutcome::Reused,
            Err(job) => job,
        };
        self.spawn_worker(job)
    }

    fn spawn_worker(self: &Arc<Self>, job: Assignment) -> DispatchOutcome {
        let n = self.worker_seq.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::clone(&job.handle);
        // Lets us recover the ticket if the closure never runs.
        let slot = Arc::new(Mutex::new(Some(job)));
        let thread_slot = Arc::clone(&slot);
        let rt = Arc::clone(self);

        self.cache.worker_started();
        let spawned = std::thread::Builder::new()
            .name(format!("gatehouse-worker-{}", n))
            .spawn(move || {
                let job = thread_slot.lock().take();
                match job {
                    Some(job) => worker::run(rt, job),
                    None => rt.cache.worker_exited(),
                }
            });

        match spawned {
            Ok(_) => {
                ServerStats::bump(&self.stats.threads_spawned);
                DispatchOutcome::Spawned
            }
            Err(e) => {
                self.cache.worker_exited();
                // The closure was dropped unrun, so the job is still in the slot.
                match slot.lock().take() {
                    Some(job) => self.abandon_spawn(job, e),
                    None => {
                        handle.close();
                        DispatchOutcome::Failed
                    }
                }
            }
        }
    }

    /// Undoes an admission whose worker thread could not be created: counts
    /// the failure, rolls the gate back and closes the stream.
    fn abandon_spawn(&self, job: Assignment, err: io::Error) -> DispatchOutcome {
        ServerStats::bump(&self.stats.spawn_failures);
        if let Some(folded) = self.spawn_log.admit() {
            tracing::error!(
                "ThreadCache: cannot spawn worker for session {}: {} ({} similar failures suppressed)",
                job.handle.id(),
                err,
                folded
            );
        }
        let Assignment { handle, ticket } = job;
        self.gate.rollback(ticket);
        handle.close();
        DispatchOutcome::Failed
    }

    /// Stops admission (admin included) and flags accept loops to exit.
    /// Idempotent.
    pub fn begin_shutdown(&self) {
        self.gate.close();
        self.stop_accepting.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_accepting.load(Ordering::Acquire)
    }

    /// Next soft-kill stamp. Strictly increasing across the process.
    pub fn next_kill_seq(&self) -> u64 {
        self.kill_seq.fetch_add(1, Ordering::AcqRel)
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            live_connections: self.registry.count(),
            admitted_connections: self.gate.count(),
            high_water_mark: self.gate.high_water_mark(),
            pending_admissions: self.gate.pending(),
            rejected_capacity: self.gate.rejected_capacity(),
            rejected_shutdown: self.gate.rejected_shutdown(),
            total_rejected: self.gate.rejected_capacity() + self.gate.rejected_shutdown(),
            forced_closed: ServerStats::read(&self.stats.forced_closed),
            idle_workers: self.cache.idle_count(),
            live_workers: self.cache.live_workers(),
            threads_spawned: ServerStats::read(&self.stats.threads_spawned),
            spawn_failures: ServerStats::read(&self.stats.spawn_failures),
            total_accepted: ServerStats::read(&self.stats.total_accepted),
        }
    }
}

static_assertions::assert_impl_all!(ServerRuntime: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    struct Idle;

    impl SessionExecutor for Idle {
        fn run_session(&self, _handle: &Arc<SessionHandle>) -> ExitReason {
            ExitReason::Disconnected
        }
    }

    #[test]
    fn failed_spawn_rolls_admission_back() {
        let rt = ServerRuntime::new(ServerConfig::default(), Arc::new(Idle));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let ticket = rt.gate().try_admit(SessionCategory::Normal).unwrap();
        assert_eq!(rt.gate().count(), 1);
        assert_eq!(rt.gate().pending(), 1);

        let job = Assignment {
            handle: SessionHandle::new(server, SessionCategory::Normal),
            ticket,
        };
        let outcome = rt.abandon_spawn(job, io::Error::from(io::ErrorKind::WouldBlock));

        assert_eq!(outcome, DispatchOutcome::Failed);
        assert_eq!(rt.gate().count(), 0);
        assert_eq!(rt.gate().pending(), 0);
        assert_eq!(rt.stats_snapshot().spawn_failures, 1);
        assert_eq!(rt.registry().count(), 0);

        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0, "Stream must be closed");
    }
}
