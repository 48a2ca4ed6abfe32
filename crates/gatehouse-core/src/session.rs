use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use parking_lot::{Condvar, Mutex};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Kill requests only ever escalate: `None -> SoftKill -> HardKill`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KillState {
    None = 0,
    /// Cooperative: the session should finish its current step and leave.
    SoftKill = 1,
    /// Forced: the stream has been shut down from the server side.
    HardKill = 2,
}

impl KillState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => KillState::None,
            1 => KillState::SoftKill,
            _ => KillState::HardKill,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCategory {
    Normal = 0,
    /// Accepted on the admin socket; bypasses the connection quota.
    Admin = 1,
    /// Streaming a replication log; drained after everyone else.
    ReplicationDump = 2,
}

impl SessionCategory {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionCategory::Admin,
            2 => SessionCategory::ReplicationDump,
            _ => SessionCategory::Normal,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Accepted = 0,
    Running = 1,
    Finished = 2,
    Rejected = 3,
}

impl SessionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionStatus::Running,
            2 => SessionStatus::Finished,
            3 => SessionStatus::Rejected,
            _ => SessionStatus::Accepted,
        }
    }
}

/// Per-connection state tracked from admission to completion.
///
/// Shared between the worker running the session and the shutdown path, so
/// every mutable field is an atomic. The wake condition lets a session that
/// is blocked inside its collaborator observe a kill request promptly.
pub struct SessionHandle {
    id: SessionId,
    stream: TcpStream,
    peer: Option<SocketAddr>,
    category: AtomicU8,
    kill: AtomicU8,
    status: AtomicU8,
    /// Order in which the shutdown path soft-killed this session; 0 if never.
    kill_seq: AtomicU64,
    created_at: Instant,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

impl SessionHandle {
    pub fn new(stream: TcpStream, category: SessionCategory) -> Arc<Self> {
        let peer = stream.peer_addr().ok();
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            stream,
            peer,
            category: AtomicU8::new(category as u8),
            kill: AtomicU8::new(KillState::None as u8),
            status: AtomicU8::new(SessionStatus::Accepted as u8),
            kill_seq: AtomicU64::new(0),
            created_at: Instant::now(),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// The client stream. `Read` and `Write` are implemented for `&TcpStream`.
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn category(&self) -> SessionCategory {
        SessionCategory::from_u8(self.category.load(Ordering::Acquire))
    }

    /// Promotes a normal session that started streaming a replication log.
    /// Returns `false` for admin sessions, which keep their class.
    pub fn mark_replication_dump(&self) -> bool {
        self.category
            .compare_exchange(
                SessionCategory::Normal as u8,
                SessionCategory::ReplicationDump as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
            || self.category() == SessionCategory::ReplicationDump
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: SessionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn kill_state(&self) -> KillState {
        KillState::from_u8(self.kill.load(Ordering::Acquire))
    }

    pub fn is_killed(&self) -> bool {
        self.kill_state() != KillState::None
    }

    pub fn kill_sequence(&self) -> u64 {
        self.kill_seq.load(Ordering::Acquire)
    }

    /// Requests cooperative termination, stamping `seq` on the first request.
    /// Returns `true` if this call changed the kill state.
    pub fn soft_kill(&self, seq: u64) -> bool {
        let changed = self.escalate(KillState::SoftKill);
        if changed {
            self.kill_seq.store(seq, Ordering::Release);
        }
        self.notify();
        changed
    }

    /// Forces termination: marks the handle and shuts the stream down so a
    /// session blocked on I/O returns immediately.
    pub fn hard_kill(&self) -> bool {
        let changed = self.escalate(KillState::HardKill);
        self.close();
        self.notify();
        changed
    }

    fn escalate(&self, target: KillState) -> bool {
        let mut current = self.kill.load(Ordering::Acquire);
        loop {
            if current >= target as u8 {
                return false;
            }
            match self.kill.compare_exchange(
                current,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }

    fn notify(&self) {
        let _guard = self.wake_lock.lock();
        self.wake.notify_all();
    }

    /// Blocks until a kill request arrives or `timeout` elapses.
    pub fn wait_for_kill(&self, timeout: Duration) -> KillState {
        let deadline = Instant::now() + timeout;
        let mut guard = self.wake_lock.lock();
        loop {
            let state = self.kill_state();
            if state != KillState::None {
                return state;
            }
            if self.wake.wait_until(&mut guard, deadline).timed_out() {
                return self.kill_state();
            }
        }
    }

    /// Shuts the stream down in both directions. Errors (already closed,
    /// peer gone) are ignored.
    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("category", &self.category())
            .field("kill", &self.kill_state())
            .field("status", &self.status())
            .finish()
    }
}

static_assertions::assert_impl_all!(SessionHandle: Send, Sync);
