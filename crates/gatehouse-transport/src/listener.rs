//! Listening sockets: primary, SO_REUSEPORT duplicates, and the admin port.

use core::sync::atomic::{AtomicBool, Ordering};
use gatehouse_core::{GatehouseError, ServerConfig, SessionCategory};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Primary,
    /// A SO_REUSEPORT duplicate of the primary, spreading `accept()` load.
    PrimaryShard(usize),
    Admin,
}

impl SocketKind {
    pub fn category(&self) -> SessionCategory {
        match self {
            SocketKind::Admin => SessionCategory::Admin,
            _ => SessionCategory::Normal,
        }
    }
}

/// A bound listening socket with an idempotent shutdown guard.
///
/// The accept loop never closes its own socket. Shutdown happens from the
/// outside so a thread blocked in `accept()` returns predictably.
pub struct BoundSocket {
    kind: SocketKind,
    listener: TcpListener,
    local_addr: SocketAddr,
    closed: AtomicBool,
}

impl BoundSocket {
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept()
    }

    /// Shuts the socket down exactly once. Blocked `accept()` calls return
    /// with an error afterwards.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = SockRef::from(&self.listener).shutdown(Shutdown::Both) {
            // ENOTCONN on some platforms; the closed flag still stops the loop.
            tracing::debug!("Listener: shutdown of {} reported {}", self.local_addr, e);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Bounded exponential backoff for "address in use" at bind time.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            timeout: config.bind_timeout(),
            initial: config.bind_retry_initial(),
            max: config.bind_retry_max(),
        }
    }
}

/// Runs `attempt` until it succeeds, retrying only `AddrInUse` until the
/// policy's timeout. Any other error is fatal immediately.
pub fn retry_addr_in_use<T, F>(addr: SocketAddr, policy: RetryPolicy, mut attempt: F) -> Result<T, GatehouseError>
where
    F: FnMut(u32) -> io::Result<T>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut delay = policy.initial;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match attempt(attempts) {
            Ok(value) => {
                if attempts > 1 {
                    tracing::info!("Listener: bound {} after {} attempts", addr, attempts);
                }
                return Ok(value);
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(GatehouseError::BindTimeout { addr, attempts });
                }
                tracing::warn!("Listener: {} in use (attempt {}), retrying in {:?}", addr, attempts, delay);
                std::thread::sleep(delay.min(deadline - now));
                delay = (delay * 2).min(policy.max);
            }
            Err(source) => return Err(GatehouseError::Bind { addr, source }),
        }
    }
}

fn open_listener(addr: SocketAddr, reuse_port: bool, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

fn bind_one(
    kind: SocketKind,
    addr: SocketAddr,
    reuse_port: bool,
    config: &ServerConfig,
) -> Result<Arc<BoundSocket>, GatehouseError> {
    let policy = RetryPolicy::from_config(config);
    let listener = retry_addr_in_use(addr, policy, |_| open_listener(addr, reuse_port, config.listen_backlog))?;
    let local_addr = listener.local_addr()?;
    tracing::info!("Listener: {:?} socket listening on {}", kind, local_addr);
    Ok(Arc::new(BoundSocket {
        kind,
        listener,
        local_addr,
        closed: AtomicBool::new(false),
    }))
}

/// Every listening socket the server owns. Opened at startup, shut down
/// once during shutdown, never reopened.
pub struct ListenerSet {
    sockets: Vec<Arc<BoundSocket>>,
}

impl ListenerSet {
    pub fn bind(config: &ServerConfig) -> Result<Self, GatehouseError> {
        let shards = config.num_listen_shards.max(1);
        let reuse_port = shards > 1;
        let mut sockets = Vec::with_capacity(shards + 1);

        let primary = bind_one(SocketKind::Primary, config.listen_addr()?, reuse_port, config)?;
        // Duplicates join the primary's actual port (it may have been 0).
        let shared_addr = primary.local_addr();
        sockets.push(primary);
        for shard in 1..shards {
            sockets.push(bind_one(SocketKind::PrimaryShard(shard), shared_addr, true, config)?);
        }

        if let Some(admin_addr) = config.admin_addr()? {
            sockets.push(bind_one(SocketKind::Admin, admin_addr, false, config)?);
        }

        Ok(Self { sockets })
    }

    pub fn sockets(&self) -> &[Arc<BoundSocket>] {
        &self.sockets
    }

    pub fn primary_addr(&self) -> Option<SocketAddr> {
        self.sockets
            .iter()
            .find(|s| s.kind() == SocketKind::Primary)
            .map(|s| s.local_addr())
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.sockets
            .iter()
            .find(|s| s.kind() == SocketKind::Admin)
            .map(|s| s.local_addr())
    }

    pub fn shutdown_all(&self) {
        for socket in &self.sockets {
            socket.shutdown();
        }
    }
}
