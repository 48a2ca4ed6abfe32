use std::fmt;
use std::net::SocketAddr;

#[derive(Debug)]
pub enum GatehouseError {
    Transport(std::io::Error),
    /// A bind or listen failure other than "address in use". Fatal at startup.
    Bind { addr: SocketAddr, source: std::io::Error },
    /// "Address in use" persisted past the configured bind timeout.
    BindTimeout { addr: SocketAddr, attempts: u32 },
    Config(String),
    Spawn(std::io::Error),
}

impl fmt::Display for GatehouseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatehouseError::Transport(e) => write!(f, "transport error: {}", e),
            GatehouseError::Bind { addr, source } => write!(f, "cannot bind {}: {}", addr, source),
            GatehouseError::BindTimeout { addr, attempts } => {
                write!(f, "address {} still in use after {} attempts", addr, attempts)
            }
            GatehouseError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            GatehouseError::Spawn(e) => write!(f, "cannot spawn thread: {}", e),
        }
    }
}

impl std::error::Error for GatehouseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatehouseError::Transport(e) | GatehouseError::Spawn(e) => Some(e),
            GatehouseError::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for GatehouseError {
    fn from(e: std::io::Error) -> Self {
        GatehouseError::Transport(e)
    }
}

/// Why the Admission Gate turned a connection away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TooManyConnections,
    ShuttingDown,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::TooManyConnections => f.write_str("too many connections"),
            Rejection::ShuttingDown => f.write_str("server shutdown in progress"),
        }
    }
}
