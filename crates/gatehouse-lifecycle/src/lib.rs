pub mod orchestrator;
pub mod phase;
pub mod signal;

pub use orchestrator::{ShutdownOrchestrator, ShutdownReason, ShutdownReport};
pub use phase::{PhaseCell, ShutdownPhase};
pub use signal::SignalListener;
