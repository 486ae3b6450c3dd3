//! Completion-versus-timeout arbitration for one turn
//!
//! Both the reply path and the inactivity deadline try to resolve the turn.
//! Whichever wins the compare-and-swap owns the turn; the loser does nothing.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TurnPhase {
    Idle = 0,
    Awaiting = 1,
    Succeeded = 2,
    TimedOut = 3,
}

impl TurnPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TurnPhase::Awaiting,
            2 => TurnPhase::Succeeded,
            3 => TurnPhase::TimedOut,
            _ => TurnPhase::Idle,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TurnPhase::Succeeded | TurnPhase::TimedOut)
    }
}

#[derive(Debug)]
pub struct TurnArbiter {
    phase: AtomicU8,
}

impl Default for TurnArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnArbiter {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(TurnPhase::Idle as u8),
        }
    }

    /// `Idle -> Awaiting`. Returns false if the turn was already armed.
    pub fn arm(&self) -> bool {
        self.transition(TurnPhase::Idle, TurnPhase::Awaiting)
    }

    /// `Awaiting -> outcome`. Exactly one caller ever gets `true`.
    pub fn claim(&self, outcome: TurnPhase) -> bool {
        debug_assert!(outcome.is_terminal());
        self.transition(TurnPhase::Awaiting, outcome)
    }

    pub fn phase(&self) -> TurnPhase {
        TurnPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_resolved(&self) -> bool {
        self.phase().is_terminal()
    }

    fn transition(&self, from: TurnPhase, to: TurnPhase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
