//! Shared fixtures: loopback socket pairs and scripted session executors.

#![allow(dead_code)]

use gatehouse::{ExitReason, SessionExecutor, SessionHandle};
use gatehouse_core::KillState;
use parking_lot::Mutex;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Returns `(server_side, client_side)` of a connected loopback TCP pair.
pub fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    let client = TcpStream::connect(addr).expect("connect loopback");
    let (server, _) = listener.accept().expect("accept loopback");
    (server, client)
}

/// Polls `cond` every millisecond until it holds or `timeout` passes.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Holds every session open until `release()` (or any kill request), and
/// records the handles it saw and the thread-local session id per run.
#[derive(Default)]
pub struct HeldExecutor {
    released: AtomicBool,
    pub seen: Mutex<Vec<Arc<SessionHandle>>>,
    pub thread_ids: Mutex<Vec<(u64, Option<u64>)>>,
}

impl HeldExecutor {
    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
    }
}

impl SessionExecutor for HeldExecutor {
    fn run_session(&self, handle: &Arc<SessionHandle>) -> ExitReason {
        self.seen.lock().push(Arc::clone(handle));
        self.thread_ids
            .lock()
            .push((handle.id(), gatehouse_core::current_session_id()));
        loop {
            if self.released.load(Ordering::Acquire) {
                return ExitReason::Disconnected;
            }
            if handle.wait_for_kill(Duration::from_millis(2)) != KillState::None {
                return ExitReason::Killed;
            }
        }
    }
}

/// Ignores soft kills; leaves only when the stream is forced closed.
#[derive(Default)]
pub struct StubbornExecutor {
    pub seen: Mutex<Vec<Arc<SessionHandle>>>,
}

impl SessionExecutor for StubbornExecutor {
    fn run_session(&self, handle: &Arc<SessionHandle>) -> ExitReason {
        self.seen.lock().push(Arc::clone(handle));
        while handle.kill_state() != KillState::HardKill {
            std::thread::sleep(Duration::from_millis(2));
        }
        ExitReason::Killed
    }
}
