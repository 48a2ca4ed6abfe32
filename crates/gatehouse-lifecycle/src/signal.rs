//! Maps process signals onto a single call into the orchestrator.

use crate::orchestrator::{ShutdownOrchestrator, ShutdownReason};
use crate::phase::ShutdownPhase;
use gatehouse_core::GatehouseError;
use nix::sys::signal::{SigSet, Signal};
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Blocks the termination and reload signals so a dedicated thread can
/// `sigwait` for them.
pub struct SignalListener {
    set: SigSet,
}

impl SignalListener {
    /// Blocks SIGTERM, SIGINT and SIGHUP for the calling thread. Call this
    /// before spawning any other thread so they all inherit the mask.
    pub fn install() -> Result<Self, GatehouseError> {
        let mut set = SigSet::empty();
        set.add(Signal::SIGTERM);
        set.add(Signal::SIGINT);
        set.add(Signal::SIGHUP);
        set.thread_block()
            .map_err(|e| GatehouseError::Transport(io::Error::from(e)))?;
        Ok(Self { set })
    }

    /// Spawns the `gatehouse-signal` thread. Termination signals start the
    /// shutdown sequence (later ones are ignored by the orchestrator);
    /// SIGHUP runs `on_reload`.
    pub fn spawn<F>(self, orchestrator: Arc<ShutdownOrchestrator>, on_reload: F) -> Result<JoinHandle<()>, GatehouseError>
    where
        F: Fn() + Send + 'static,
    {
        let set = self.set;
        std::thread::Builder::new()
            .name("gatehouse-signal".to_string())
            .spawn(move || loop {
                match set.wait() {
                    Ok(sig) => handle_signal(sig, &orchestrator, &on_reload),
                    Err(e) => {
                        tracing::warn!("Signal: sigwait failed: {}", e);
                    }
                }
                if orchestrator.phase() == ShutdownPhase::TornDown {
                    break;
                }
            })
            .map_err(GatehouseError::Spawn)
    }
}

fn handle_signal<F: Fn()>(sig: Signal, orchestrator: &ShutdownOrchestrator, on_reload: &F) {
    match sig {
        Signal::SIGHUP => {
            tracing::info!("Signal: SIGHUP, reloading");
            on_reload();
        }
        sig => {
            tracing::info!("Signal: {:?}, shutting down", sig);
            orchestrator.shutdown(ShutdownReason::Signal(sig as i32));
        }
    }
}
