//! Cooperative cancellation and pausing for long-running loops.
//!
//! An [`Interruptable`] is a cloneable handle. One task drives a loop through
//! the gate methods ([`proceed_if`](Interruptable::proceed_if),
//! [`next`](Interruptable::next), [`execute`](Interruptable::execute)) while
//! any other holder of the handle may pause, resume or cancel it. Nothing
//! runs in parallel: the loop only stops at a gate.
//!
//! ```rust
//! # async fn demo() -> driftsync_sync::Result<()> {
//! use driftsync_sync::Interruptable;
//!
//! let interruptable = Interruptable::new();
//! let mut items = vec![1, 2, 3].into_iter();
//! let mut sum = 0;
//! while let Some(item) = interruptable.next(&mut items).await? {
//!     sum += item;
//! }
//! assert_eq!(sum, 6);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{Result, SyncError};

/// Lifecycle of an [`Interruptable`]. `Cancelled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Cancelled,
}

#[derive(Clone)]
pub struct Interruptable {
    state: Arc<watch::Sender<RunState>>,
    diagnostic: bool,
}

impl std::fmt::Debug for Interruptable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interruptable")
            .field("state", &self.state())
            .field("diagnostic", &self.diagnostic)
            .finish()
    }
}

impl Default for Interruptable {
    fn default() -> Self {
        Self::new()
    }
}

impl Interruptable {
    /// A running handle whose gates report "stop" after cancellation.
    pub fn new() -> Self {
        let (state, _) = watch::channel(RunState::Running);
        Self {
            state: Arc::new(state),
            diagnostic: false,
        }
    }

    /// A running handle whose gates fail with [`SyncError::Cancelled`] after
    /// cancellation.
    pub fn diagnostic() -> Self {
        Self {
            diagnostic: true,
            ..Self::new()
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == RunState::Cancelled
    }

    pub fn is_paused(&self) -> bool {
        self.state() == RunState::Paused
    }

    /// Stop before the next step. Idempotent and irreversible.
    pub fn cancel(&self) {
        self.state.send_replace(RunState::Cancelled);
    }

    /// Suspend at the next gate. No-op unless running.
    pub fn pause(&self) {
        self.state.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Paused;
                true
            } else {
                false
            }
        });
    }

    /// Release a pending pause. No-op unless paused.
    pub fn resume(&self) {
        self.state.send_if_modified(|state| {
            if *state == RunState::Paused {
                *state = RunState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Resolves once the handle is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the wait only ends on cancellation.
        let _ = rx.wait_for(|s| *s == RunState::Cancelled).await;
    }

    /// The gate: `Ok(true)` to run the next step, `Ok(false)` to stop.
    ///
    /// Suspends while paused.
    pub async fn gate(&self) -> Result<bool> {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|s| *s != RunState::Paused).await {
            Ok(state) => *state,
            Err(_) => RunState::Cancelled,
        };

        match state {
            RunState::Running => Ok(true),
            _ if self.diagnostic => Err(SyncError::Cancelled),
            _ => Ok(false),
        }
    }

    /// Conditional-loop gate: `while interruptable.proceed_if(cond).await? { .. }`.
    pub async fn proceed_if(&self, condition: bool) -> Result<bool> {
        if !condition {
            return Ok(false);
        }
        self.gate().await
    }

    /// Pull the next item of `iter`, but only once the gate passes.
    pub async fn next<I: Iterator>(&self, iter: &mut I) -> Result<Option<I::Item>> {
        if !self.gate().await? {
            return Ok(None);
        }
        Ok(iter.next())
    }

    /// Run a single step behind the gate. `None` when stopped.
    pub async fn execute<F: Future>(&self, step: F) -> Result<Option<F::Output>> {
        if !self.gate().await? {
            return Ok(None);
        }
        Ok(Some(step.await))
    }
}
