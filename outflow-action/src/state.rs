//! Action states and the lock-free cell that holds them.
//!
//! # State Transitions
//!
//! ```text
//!              ┌──────────── commit ────────────┐
//!              v                                 │
//! ┌───────┐ submit ┌──────────┐ batch end ┌─────────────┐
//! │ Ready │ ─────> │ TxActive │ ────────> │ TxCommitted │ ──> Ready
//! └───────┘        └──────────┘           └─────────────┘
//!     │ ^  transient failure (Ready / TxActive / TxCommitted)
//!     v │ resume ok
//! ┌──────────┐  budget exhausted  ┌───────────┐
//! │ Retrying │ ─────────────────> │ Suspended │
//! └──────────┘ <───────────────── └───────────┘
//!                 resume failed
//!
//! fatal failure or flapping (any state) ──> Dead (absorbing)
//! ```

use core::fmt::{self, Display, Formatter};
use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

/// Execution state of an action
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionState {
    /// Permanently failed and disabled. Must stay zero.
    Dead = 0,
    /// Ready, waiting for a new transaction
    Ready = 1,
    /// Transaction active, waiting for more data or the commit
    TxActive = 2,
    /// Transaction finished (transient)
    TxCommitted = 3,
    /// Failure occurred, trying to re-establish the ready state
    Retrying = 4,
    /// Suspended after failure, submissions fail until the resume deadline
    Suspended = 5,
}

impl ActionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ready,
            2 => Self::TxActive,
            3 => Self::TxCommitted,
            4 => Self::Retrying,
            5 => Self::Suspended,
            _ => Self::Dead,
        }
    }

    /// Whether the transition table allows moving from `self` to `next`.
    #[must_use]
    pub const fn permits(self, next: Self) -> bool {
        match (self, next) {
            (Self::Dead, _) => false,
            (_, Self::Dead)
            | (Self::Ready, Self::TxActive | Self::TxCommitted | Self::Retrying)
            | (Self::TxActive, Self::TxCommitted | Self::Retrying)
            | (Self::TxCommitted, Self::Ready | Self::Retrying)
            | (Self::Retrying, Self::Ready | Self::Suspended)
            | (Self::Suspended, Self::Ready | Self::Retrying) => true,
            _ => false,
        }
    }

    /// Whether a record submitted in this state can be queued for delivery
    #[must_use]
    pub const fn accepts_submissions(self) -> bool {
        matches!(
            self,
            Self::Ready | Self::TxActive | Self::TxCommitted | Self::Retrying
        )
    }
}

impl Display for ActionState {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Dead => "dead",
            Self::Ready => "ready",
            Self::TxActive => "transaction-active",
            Self::TxCommitted => "transaction-committed",
            Self::Retrying => "retrying",
            Self::Suspended => "suspended",
        })
    }
}

/// Shared, read-only view of another action's state (used by the failover gate)
pub type StateHandle = Arc<AtomicState>;

/// Atomically guarded state field.
///
/// Reads never block. Writes use compare-and-swap and retry on conflict, and
/// refuse any move the transition table does not allow, so `Dead` can never
/// be left once entered.
#[derive(Debug)]
pub struct AtomicState(AtomicU8);

impl Default for AtomicState {
    fn default() -> Self {
        Self::new(ActionState::Ready)
    }
}

impl AtomicState {
    #[must_use]
    pub const fn new(state: ActionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Current state
    pub fn load(&self) -> ActionState {
        ActionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_suspended(&self) -> bool {
        self.load() == ActionState::Suspended
    }

    pub fn is_dead(&self) -> bool {
        self.load() == ActionState::Dead
    }

    /// Move from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns the actual state if it was not `from`, or if the move is not permitted.
    pub fn transition(&self, from: ActionState, to: ActionState) -> Result<(), ActionState> {
        if !from.permits(to) {
            return Err(self.load());
        }

        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ActionState::from_u8)
    }

    /// Compute the next state from the current one and store it, retrying the
    /// compare-and-swap whenever another thread got there first.
    ///
    /// Returns the state that was replaced.
    ///
    /// # Errors
    ///
    /// Returns the current state if `next` declined to move or the move is not permitted.
    pub fn update<F>(&self, mut next: F) -> Result<ActionState, ActionState>
    where
        F: FnMut(ActionState) -> Option<ActionState>,
    {
        loop {
            let current = ActionState::from_u8(self.0.load(Ordering::Acquire));
            let Some(target) = next(current).filter(|target| current.permits(*target)) else {
                return Err(current);
            };

            match self.0.compare_exchange_weak(
                current as u8,
                target as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(current),
                Err(_) => continue,
            }
        }
    }

    /// Disable permanently. Returns `false` if already dead.
    pub fn kill(&self) -> bool {
        self.update(|_| Some(ActionState::Dead)).is_ok()
    }
}
