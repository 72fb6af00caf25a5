//! Single-assignment result cell
//!
//! A `PendingResult` is created for every dispatched request and completed
//! exactly once by the dispatcher. Readers can wait asynchronously, block the
//! current thread, or register callbacks.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard},
};
use tokio::sync::watch;
use tracing::{error, trace};

use crate::error::TransportError;
use crate::models::Payload;

/// Terminal value of a dispatched request
pub type Outcome = Result<Arc<Payload>, TransportError>;

type Callback = Box<dyn FnOnce() + Send + 'static>;

enum State {
    Pending(Vec<Callback>),
    Complete(Outcome),
}

struct Cell {
    state: Mutex<State>,
    /// Flipped after completion callbacks have run; blocking waiters park here.
    released: Mutex<bool>,
    condvar: Condvar,
    /// Async waiters subscribe to this.
    release_tx: watch::Sender<bool>,
}

/// Handle to the eventual outcome of a dispatched request
#[derive(Clone)]
pub struct PendingResult {
    cell: Arc<Cell>,
}

impl std::fmt::Debug for PendingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResult")
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl PendingResult {
    pub(crate) fn new() -> (Self, Completer) {
        let (release_tx, _) = watch::channel(false);
        let pending = Self {
            cell: Arc::new(Cell {
                state: Mutex::new(State::Pending(Vec::new())),
                released: Mutex::new(false),
                condvar: Condvar::new(),
                release_tx,
            }),
        };
        let completer = Completer {
            pending: Some(pending.clone()),
        };
        (pending, completer)
    }

    /// A result that is already terminal.
    pub fn ready(outcome: Outcome) -> Self {
        let (pending, completer) = Self::new();
        completer.complete(outcome);
        pending
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // a panicking callback never runs under this lock, so poisoning only
        // means some other reader panicked; the state itself is still valid
        self.cell
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_complete(&self) -> bool {
        matches!(*self.state(), State::Complete(_))
    }

    /// The outcome if the request has finished, without waiting.
    pub fn try_outcome(&self) -> Option<Outcome> {
        match &*self.state() {
            State::Complete(outcome) => Some(outcome.clone()),
            State::Pending(_) => None,
        }
    }

    /// Run `callback` once the result is terminal.
    ///
    /// If the result is already terminal the callback runs right away on the
    /// calling thread. Otherwise it runs on the dispatcher's worker that
    /// completes the request.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.state();
            if let State::Pending(callbacks) = &mut *state {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Wait for the terminal value.
    ///
    /// Returns after every callback registered before completion has run.
    pub async fn wait(&self) -> Outcome {
        let mut release_rx = self.cell.release_tx.subscribe();
        if release_rx.wait_for(|released| *released).await.is_err() {
            // the sender lives in the cell we hold, so this is unreachable
            return Err(TransportError::Abandoned);
        }
        self.try_outcome().unwrap_or(Err(TransportError::Abandoned))
    }

    /// Blocking variant of [`PendingResult::wait`].
    ///
    /// Parks the calling thread. Do not call this from inside an async task or
    /// from a completion callback of the same result.
    pub fn wait_blocking(&self) -> Outcome {
        let mut released = self
            .cell
            .released
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while !*released {
            released = self
                .cell
                .condvar
                .wait(released)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        drop(released);
        self.try_outcome().unwrap_or(Err(TransportError::Abandoned))
    }

    fn complete(&self, outcome: Outcome) {
        let callbacks = {
            let mut state = self.state();
            match std::mem::replace(&mut *state, State::Complete(outcome)) {
                State::Pending(callbacks) => callbacks,
                // already terminal: put the first outcome back and ignore this one
                previous @ State::Complete(_) => {
                    *state = previous;
                    return;
                }
            }
        };

        trace!(callbacks = callbacks.len(), "Request complete");
        for callback in callbacks {
            // a panicking callback must neither skip the others nor leave
            // waiters parked forever
            if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!("Completion callback panicked");
            }
        }

        *self
            .cell
            .released
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        self.cell.condvar.notify_all();
        self.cell.release_tx.send_replace(true);
    }
}

/// Write side of a [`PendingResult`], owned by the dispatcher task.
///
/// Dropping it without completing (task cancelled, runtime shut down) completes
/// the result with [`TransportError::Abandoned`] so no reader waits forever.
pub(crate) struct Completer {
    pending: Option<PendingResult>,
}

impl Completer {
    pub(crate) fn complete(mut self, outcome: Outcome) {
        if let Some(pending) = self.pending.take() {
            pending.complete(outcome);
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.complete(Err(TransportError::Abandoned));
        }
    }
}
