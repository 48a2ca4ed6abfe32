use core::sync::atomic::{AtomicU8, Ordering};

/// Process-wide shutdown phases, in the only order they may be visited.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownPhase {
    Running = 0,
    StopAccepting = 1,
    DrainNormal = 2,
    DrainSpecial = 3,
    ForceClose = 4,
    WaitEmpty = 5,
    TornDown = 6,
}

impl ShutdownPhase {
    pub fn next(self) -> Option<Self> {
        match self {
            ShutdownPhase::Running => Some(ShutdownPhase::StopAccepting),
            ShutdownPhase::StopAccepting => Some(ShutdownPhase::DrainNormal),
            ShutdownPhase::DrainNormal => Some(ShutdownPhase::DrainSpecial),
            ShutdownPhase::DrainSpecial => Some(ShutdownPhase::ForceClose),
            ShutdownPhase::ForceClose => Some(ShutdownPhase::WaitEmpty),
            ShutdownPhase::WaitEmpty => Some(ShutdownPhase::TornDown),
            ShutdownPhase::TornDown => None,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => ShutdownPhase::Running,
            1 => ShutdownPhase::StopAccepting,
            2 => ShutdownPhase::DrainNormal,
            3 => ShutdownPhase::DrainSpecial,
            4 => ShutdownPhase::ForceClose,
            5 => ShutdownPhase::WaitEmpty,
            _ => ShutdownPhase::TornDown,
        }
    }
}

/// Atomic holder of the current phase. Transitions are compare-and-set, so
/// a step attempted twice (or out of order) is refused, not re-run.
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ShutdownPhase::Running as u8))
    }

    pub fn load(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves from `from` to its successor. Returns `false` when the cell is
    /// not at `from` (already advanced, or not there yet).
    pub fn advance(&self, from: ShutdownPhase) -> bool {
        let Some(to) = from.next() else { return false };
        let moved = self
            .0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            tracing::info!("Shutdown: {:?} -> {:?}", from, to);
        }
        moved
    }
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new()
    }
}
