use crate::error::GatehouseError;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Upper bound of the derived idle-worker cap.
const DERIVED_IDLE_CAP: usize = 100;
/// Base of the derived idle-worker cap before scaling with `max_connections`.
const DERIVED_IDLE_BASE: usize = 8;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Operator socket that still admits when the normal quota is saturated.
    pub admin_port: Option<u16>,
    pub max_connections: usize,
    /// Slots beyond `max_connections` kept free so a client can still be
    /// told "too many connections".
    pub admission_slack: usize,
    /// `None` derives the cap from `max_connections`; `Some(0)` disables pooling.
    pub max_idle_threads: Option<usize>,
    pub num_registry_shards: usize,
    /// Sockets bound on the primary port; more than one enables SO_REUSEPORT.
    pub num_listen_shards: usize,
    pub enable_dedicated_dispatchers: bool,
    /// `0` means one dispatcher per CPU.
    pub num_dispatchers: usize,
    pub dispatcher_queue_capacity: usize,
    pub dispatcher_spin_limit: u32,
    pub dispatcher_max_sleep_us: u64,
    pub pin_dispatchers: bool,
    pub listen_backlog: i32,
    pub bind_timeout_ms: u64,
    pub bind_retry_initial_ms: u64,
    pub bind_retry_max_ms: u64,
    pub shutdown_grace_period_ms: u64,
    pub force_close_retries: u32,
    pub drain_log_interval_ms: u64,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            admin_port: None,
            max_connections: 151,
            admission_slack: 1,
            max_idle_threads: None,
            num_registry_shards: 8,
            num_listen_shards: 1,
            enable_dedicated_dispatchers: false,
            num_dispatchers: 0,
            dispatcher_queue_capacity: 256,
            dispatcher_spin_limit: 6,
            dispatcher_max_sleep_us: 1_000,
            pin_dispatchers: false,
            listen_backlog: 1024,
            bind_timeout_ms: 5_000,
            bind_retry_initial_ms: 10,
            bind_retry_max_ms: 1_000,
            shutdown_grace_period_ms: 2_000,
            force_close_retries: 3,
            drain_log_interval_ms: 1_000,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parses a TOML document. Missing keys take their default.
    pub fn from_toml_str(raw: &str) -> Result<Self, GatehouseError> {
        let config: ServerConfig =
            toml::from_str(raw).map_err(|e| GatehouseError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, GatehouseError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatehouseError::Config(format!("reading {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), GatehouseError> {
        if self.num_listen_shards == 0 {
            return Err(GatehouseError::Config("num_listen_shards must be >= 1".into()));
        }
        if self.num_registry_shards == 0 {
            return Err(GatehouseError::Config("num_registry_shards must be >= 1".into()));
        }
        if self.enable_dedicated_dispatchers && !self.dispatcher_queue_capacity.is_power_of_two() {
            return Err(GatehouseError::Config(format!(
                "dispatcher_queue_capacity must be a power of two, got {}",
                self.dispatcher_queue_capacity
            )));
        }
        if self.admin_port.is_some() && self.admin_port == Some(self.port) && self.port != 0 {
            return Err(GatehouseError::Config("admin_port must differ from port".into()));
        }
        self.host
            .parse::<IpAddr>()
            .map_err(|e| GatehouseError::Config(format!("host {:?}: {}", self.host, e)))?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, GatehouseError> {
        self.addr_for(self.port)
    }

    pub fn admin_addr(&self) -> Result<Option<SocketAddr>, GatehouseError> {
        self.admin_port.map(|p| self.addr_for(p)).transpose()
    }

    fn addr_for(&self, port: u16) -> Result<SocketAddr, GatehouseError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|e| GatehouseError::Config(format!("host {:?}: {}", self.host, e)))?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Idle-worker cap: the configured value, or `min(8 + max_connections / 100, 100)`.
    pub fn effective_max_idle_threads(&self) -> usize {
        match self.max_idle_threads {
            Some(n) => n,
            None => (DERIVED_IDLE_BASE + self.max_connections / 100).min(DERIVED_IDLE_CAP),
        }
    }

    pub fn effective_num_dispatchers(&self) -> usize {
        if self.num_dispatchers == 0 {
            num_cpus::get().max(1)
        } else {
            self.num_dispatchers
        }
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    pub fn bind_retry_initial(&self) -> Duration {
        Duration::from_millis(self.bind_retry_initial_ms.max(1))
    }

    pub fn bind_retry_max(&self) -> Duration {
        Duration::from_millis(self.bind_retry_max_ms.max(self.bind_retry_initial_ms).max(1))
    }

    pub fn dispatcher_max_sleep(&self) -> Duration {
        Duration::from_micros(self.dispatcher_max_sleep_us)
    }

    pub fn drain_log_interval(&self) -> Duration {
        Duration::from_millis(self.drain_log_interval_ms.max(1))
    }
}
