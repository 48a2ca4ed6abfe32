pub mod bridge;
pub mod config;
pub mod error;
pub mod gate;
pub mod pool;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod stats;
pub mod worker;

pub use config::ServerConfig;
pub use error::{GatehouseError, Rejection};
pub use gate::{AdmissionGate, AdmitTicket};
pub use pool::ThreadCache;
pub use registry::ThreadRegistry;
pub use runtime::{
    AcceptControl, Assignment, DispatchOutcome, ExitReason, NoopHooks, ServerRuntime,
    SessionExecutor, TeardownHooks,
};
pub use session::{KillState, SessionCategory, SessionHandle, SessionId, SessionStatus};
pub use stats::{StatsSnapshot, ThrottledLog};
pub use worker::current_session_id;
