//! FIFO admission gate bounding the number of in-flight operations.
//!
//! An operation handed to [`Lock::acquire`] runs as soon as fewer than `max`
//! operations are pending, otherwise it is queued. It receives a [`Release`]
//! handle which must be released exactly once to admit the next queued
//! operation. Drain observers registered with [`Lock::wait`] are notified
//! when the pending count returns to zero.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::{Result, SlicerError};

type Operation = Box<dyn FnOnce(Release) + Send>;
type Waiter = Box<dyn FnOnce(Option<SlicerError>) + Send>;

struct LockState {
    pending: usize,
    max: usize,
    error: Option<SlicerError>,
    waiting: VecDeque<Operation>,
    listeners: Vec<Waiter>,
}

fn lock_state(state: &Mutex<LockState>) -> MutexGuard<'_, LockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A simple lock for managing concurrency.
pub struct Lock {
    state: Arc<Mutex<LockState>>,
}

impl Lock {
    /// Create a lock without an admission ceiling.
    pub fn new() -> Self {
        Self::with_max(usize::MAX)
    }

    /// Create a lock admitting at most `max` operations at once.
    ///
    /// # Zero
    /// A `max` of 0 would never admit anything and is treated as 1:
    /// `Lock::with_max(0).max() == 1`.
    pub fn with_max(max: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(LockState {
                pending: 0,
                max: max.max(1),
                error: None,
                waiting: VecDeque::new(),
                listeners: Vec::new(),
            })),
        }
    }

    /// The number of admitted operations that have not been released yet.
    pub fn pending(&self) -> usize {
        lock_state(&self.state).pending
    }

    pub fn max(&self) -> usize {
        lock_state(&self.state).max
    }

    /// The number of operations waiting for admission.
    pub fn queued(&self) -> usize {
        lock_state(&self.state).waiting.len()
    }

    /// The first error ever passed to a release, if any.
    pub fn error(&self) -> Option<SlicerError> {
        lock_state(&self.state).error.clone()
    }

    /// Run `op` now if there is capacity, otherwise queue it behind the
    /// operations already waiting.
    pub fn acquire<F>(&self, op: F)
    where
        F: FnOnce(Release) + Send + 'static,
    {
        let mut state = lock_state(&self.state);
        if state.waiting.is_empty() && state.pending < state.max {
            state.pending += 1;
            drop(state);
            op(Release::new(self.state.clone()));
        } else {
            state.waiting.push_back(Box::new(op));
            log::trace!(
                "operation queued behind {} pending ({} waiting)",
                state.pending,
                state.waiting.len()
            );
        }
    }

    /// Wait for admission and hand the release handle to the caller.
    ///
    /// Dropping the returned future after admission releases the slot.
    pub async fn acquire_owned(&self) -> Result<Release> {
        let (tx, rx) = oneshot::channel();
        self.acquire(move |release| {
            // An abandoned receiver hands the handle back, dropping it
            // releases the slot.
            let _ = tx.send(release);
        });
        rx.await.map_err(|_| SlicerError::Closed)
    }

    /// Call `f` with the sticky error once no operation is pending.
    ///
    /// `f` is never called inline: when nothing is pending it is spawned on
    /// the current Tokio runtime, which therefore must exist.
    pub fn wait<F>(&self, f: F)
    where
        F: FnOnce(Option<SlicerError>) + Send + 'static,
    {
        let mut state = lock_state(&self.state);
        if state.pending == 0 {
            let error = state.error.clone();
            drop(state);
            tokio::spawn(async move { f(error) });
        } else {
            state.listeners.push(Box::new(f));
        }
    }

    /// Async form of [`Lock::wait`].
    pub async fn drained(&self) -> Option<SlicerError> {
        let (tx, rx) = oneshot::channel();
        self.wait(move |error| {
            let _ = tx.send(error);
        });
        rx.await.unwrap_or(None)
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_state(&self.state);
        f.debug_struct("Lock")
            .field("pending", &state.pending)
            .field("max", &state.max)
            .field("queued", &state.waiting.len())
            .field("error", &state.error)
            .finish()
    }
}

/// One-shot permission to leave the lock, given to every admitted operation.
///
/// A handle dropped without being released releases itself.
pub struct Release {
    state: Arc<Mutex<LockState>>,
    released: AtomicBool,
}

impl Release {
    fn new(state: Arc<Mutex<LockState>>) -> Self {
        Self {
            state,
            released: AtomicBool::new(false),
        }
    }

    /// Leave the lock, recording `error` as the sticky error if none was
    /// recorded before. Admits the next queued operation, or notifies the
    /// drain observers when nothing is pending anymore.
    ///
    /// # Errors
    /// [`SlicerError::ReleasedTwice`] if this handle was already released.
    pub fn release(&self, error: Option<SlicerError>) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            log::error!("lock released twice");
            return Err(SlicerError::ReleasedTwice);
        }
        finish(&self.state, error);
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        if !*self.released.get_mut() {
            log::warn!("admitted operation dropped without release");
            *self.released.get_mut() = true;
            finish(&self.state, None);
        }
    }
}

impl fmt::Debug for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Release")
            .field("released", &self.is_released())
            .finish()
    }
}

fn finish(state: &Arc<Mutex<LockState>>, error: Option<SlicerError>) {
    let mut next = None;
    let mut listeners = Vec::new();
    let mut sticky = None;
    {
        let mut guard = lock_state(state);
        if guard.error.is_none() {
            guard.error = error;
        }
        guard.pending -= 1;
        if guard.pending < guard.max && !guard.waiting.is_empty() {
            guard.pending += 1;
            next = guard.waiting.pop_front();
        } else if guard.pending == 0 {
            listeners = std::mem::take(&mut guard.listeners);
            sticky = guard.error.clone();
        }
    }

    if let Some(op) = next {
        op(Release::new(state.clone()));
    }
    for listener in listeners {
        listener(sticky.clone());
    }
}
