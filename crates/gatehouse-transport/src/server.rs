use crate::dispatcher::{DedicatedDispatcher, Inbound, Outbound, PendingConnection};
use crate::listener::{BoundSocket, ListenerSet};
use core::sync::atomic::{AtomicBool, Ordering};
use gatehouse_core::bridge::SqBridge;
use gatehouse_core::{AcceptControl, GatehouseError, ServerRuntime, ThrottledLog};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Where an accept loop sends what it accepted.
enum Route {
    /// Admission and dispatch on the accept thread itself.
    Inline,
    Dedicated(Outbound),
}

/// The accept side of the server: one accept thread per listening socket and,
/// in dedicated mode, a fixed set of dispatcher threads.
pub struct Transport {
    rt: Arc<ServerRuntime>,
    listeners: ListenerSet,
    accept_threads: Mutex<Vec<JoinHandle<()>>>,
    dispatcher_threads: Mutex<Vec<JoinHandle<()>>>,
    producers_done: Arc<AtomicBool>,
}

impl Transport {
    /// Spawns the accept loops (and dispatchers) over already-bound sockets.
    pub fn start(rt: Arc<ServerRuntime>, listeners: ListenerSet) -> Result<Arc<Self>, GatehouseError> {
        let producers_done = Arc::new(AtomicBool::new(false));
        let sockets = listeners.sockets().to_vec();
        let mut routes: Vec<Route> = Vec::with_capacity(sockets.len());
        let mut dispatcher_threads = Vec::new();

        if rt.config().enable_dedicated_dispatchers {
            let dispatchers = rt.config().effective_num_dispatchers();
            let capacity = rt.config().dispatcher_queue_capacity;

            // rings[accept_loop][dispatcher]: each ring has one producer and one consumer.
            let rings: Vec<Vec<Inbound>> = (0..sockets.len())
                .map(|_| (0..dispatchers).map(|_| SqBridge::new(capacity)).collect())
                .collect();

            for d in 0..dispatchers {
                let inbound: Vec<Inbound> = rings.iter().map(|row| Arc::clone(&row[d])).collect();
                let dispatcher = DedicatedDispatcher::new(d, inbound, Arc::clone(&rt), Arc::clone(&producers_done));
                let handle = std::thread::Builder::new()
                    .name(format!("gatehouse-dispatch-{}", d))
                    .spawn(move || dispatcher.run())
                    .map_err(|e| abort_start(&rt, &listeners, &producers_done, e))?;
                dispatcher_threads.push(handle);
            }
            routes.extend(rings.into_iter().map(|row| Route::Dedicated(Outbound::new(row))));
            tracing::info!("Transport: {} dedicated dispatchers, ring capacity {}", dispatchers, capacity);
        } else {
            routes.extend(sockets.iter().map(|_| Route::Inline));
        }

        let mut accept_threads = Vec::with_capacity(sockets.len());
        for (n, (socket, route)) in sockets.into_iter().zip(routes).enumerate() {
            let loop_rt = Arc::clone(&rt);
            let handle = std::thread::Builder::new()
                .name(format!("gatehouse-accept-{}", n))
                .spawn(move || accept_loop(socket, loop_rt, route))
                .map_err(|e| abort_start(&rt, &listeners, &producers_done, e))?;
            accept_threads.push(handle);
        }

        Ok(Arc::new(Self {
            rt,
            listeners,
            accept_threads: Mutex::new(accept_threads),
            dispatcher_threads: Mutex::new(dispatcher_threads),
            producers_done,
        }))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listeners.primary_addr()
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.listeners.admin_addr()
    }

    pub fn listeners(&self) -> &ListenerSet {
        &self.listeners
    }
}

impl AcceptControl for Transport {
    fn stop_accepting(&self) {
        self.rt.begin_shutdown();
        self.listeners.shutdown_all();
    }

    fn join(&self) {
        let accept: Vec<_> = self.accept_threads.lock().drain(..).collect();
        for handle in accept {
            if handle.join().is_err() {
                tracing::error!("Transport: accept thread panicked");
            }
        }
        // Accept loops are gone, so the rings only shrink from here on.
        self.producers_done.store(true, Ordering::Release);

        let dispatchers: Vec<_> = self.dispatcher_threads.lock().drain(..).collect();
        for handle in dispatchers {
            if handle.join().is_err() {
                tracing::error!("Transport: dispatcher thread panicked");
            }
        }
    }
}

/// Unwinds a partially started transport so no thread is left waiting.
fn abort_start(
    rt: &ServerRuntime,
    listeners: &ListenerSet,
    producers_done: &AtomicBool,
    e: io::Error,
) -> GatehouseError {
    tracing::error!("Transport: startup aborted: {}", e);
    rt.begin_shutdown();
    listeners.shutdown_all();
    producers_done.store(true, Ordering::Release);
    GatehouseError::Spawn(e)
}

fn accept_loop(socket: Arc<BoundSocket>, rt: Arc<ServerRuntime>, mut route: Route) {
    let category = socket.kind().category();
    let error_log = ThrottledLog::new(Duration::from_secs(5));
    tracing::debug!("Accept loop started on {} ({:?})", socket.local_addr(), socket.kind());

    loop {
        let accepted = socket.accept();

        // Checked after every return, spurious or not.
        if rt.is_stopping() || socket.is_closed() {
            if let Ok((stream, _)) = accepted {
                rt.gate().note_shutdown_rejection();
                drop(stream);
            }
            break;
        }

        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!("Accepted {} on {:?}", peer, socket.kind());
                match &mut route {
                    Route::Inline => {
                        let _ = rt.admit_and_dispatch(stream, category);
                    }
                    Route::Dedicated(outbound) => {
                        if let Err(pending) = outbound.push(PendingConnection { stream, category }) {
                            // Every dispatcher ring is full; do the work here.
                            let _ = rt.admit_and_dispatch(pending.stream, pending.category);
                        }
                    }
                }
            }
            Err(e) => {
                let pause = accept_error_pause(&e);
                if let Some(folded) = error_log.admit() {
                    tracing::warn!(
                        "Accept on {} failed: {} ({} similar errors suppressed)",
                        socket.local_addr(),
                        e,
                        folded
                    );
                }
                if let Some(pause) = pause {
                    std::thread::sleep(pause);
                }
            }
        }
    }

    tracing::debug!("Accept loop on {} exiting", socket.local_addr());
}

/// How long to back off after a failed `accept()`. Descriptor and memory
/// exhaustion get a longer pause so the loop does not spin on them.
fn accept_error_pause(e: &io::Error) -> Option<Duration> {
    match e.raw_os_error() {
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM) => {
            Some(Duration::from_millis(50))
        }
        Some(libc::ECONNABORTED) | Some(libc::EINTR) => None,
        _ => Some(Duration::from_millis(10)),
    }
}
