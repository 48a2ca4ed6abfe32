//! The worker main loop: serve a session, then park or exit.

use crate::runtime::{Assignment, ExitReason, ServerRuntime};
use crate::session::{SessionId, SessionStatus};
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

thread_local! {
    static CURRENT_SESSION: Cell<Option<SessionId>> = const { Cell::new(None) };
}

/// The session the calling worker thread is serving, if any.
pub fn current_session_id() -> Option<SessionId> {
    CURRENT_SESSION.with(|c| c.get())
}

/// Accounts the worker's exit however `run` is left, unwinding included.
struct ExitGuard<'a>(&'a ServerRuntime);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        CURRENT_SESSION.with(|c| c.set(None));
        self.0.thread_cache().worker_exited();
    }
}

pub(crate) fn run(rt: Arc<ServerRuntime>, first: Assignment) {
    let _exit = ExitGuard(&rt);
    let mut job = first;
    loop {
        serve(&rt, job);
        match rt.thread_cache().park() {
            Some(next) => job = next,
            None => break,
        }
    }
}

fn serve(rt: &ServerRuntime, job: Assignment) {
    let Assignment { handle, ticket } = job;

    // A duplicate add asserts in debug builds; the ticket must still go back.
    let added = catch_unwind(AssertUnwindSafe(|| rt.registry().add(&handle))).unwrap_or(false);
    if !added {
        // Already registered elsewhere; drop this copy without touching it.
        rt.gate().rollback(ticket);
        return;
    }
    rt.gate().mark_registered(ticket);

    // Shutdown may have snapshotted the registry before we got in.
    if rt.gate().is_closed() {
        handle.soft_kill(rt.next_kill_seq());
    }

    CURRENT_SESSION.with(|c| c.set(Some(handle.id())));
    handle.set_status(SessionStatus::Running);

    let reason = catch_unwind(AssertUnwindSafe(|| rt.executor().run_session(&handle)))
        .unwrap_or_else(|_| ExitReason::Error("session executor panicked".to_string()));

    handle.set_status(SessionStatus::Finished);
    handle.close();
    CURRENT_SESSION.with(|c| c.set(None));

    match &reason {
        ExitReason::Error(msg) => {
            tracing::warn!("Worker: session {} ended with error: {}", handle.id(), msg)
        }
        other => tracing::debug!("Worker: session {} ended ({:?})", handle.id(), other),
    }

    rt.registry().remove(&handle);
    rt.gate().release();
}
