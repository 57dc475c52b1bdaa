//! FIFO async mutex.
//!
//! The lock is either `Idle` or `Locked` with a queue of waiters. Releasing
//! hands the guard straight to the oldest live waiter, so exclusive sections
//! run in the order they were requested. The internal std mutex only guards
//! the queue and is never held across an await point.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard as StdGuard, PoisonError};
use tokio::sync::oneshot;

enum LockState {
    Idle,
    Locked(VecDeque<oneshot::Sender<MutexGuard>>),
}

struct Inner {
    state: Mutex<LockState>,
}

impl Inner {
    fn state(&self) -> StdGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pass ownership to the next waiter still listening, or go idle
    fn release(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state();
                match &mut *state {
                    LockState::Idle => return,
                    LockState::Locked(waiters) => match waiters.pop_front() {
                        Some(next) => next,
                        None => {
                            *state = LockState::Idle;
                            return;
                        }
                    },
                }
            };
            let guard = MutexGuard {
                inner: Some(Arc::clone(self)),
            };
            match next.send(guard) {
                Ok(()) => return,
                // waiter gave up; try the one behind it
                Err(mut abandoned) => {
                    abandoned.inner = None;
                }
            }
        }
    }
}

/// Mutex whose waiters are served strictly in arrival order
#[derive(Clone)]
pub struct AsyncMutex {
    inner: Arc<Inner>,
}

impl AsyncMutex {
    /// Create an idle mutex
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LockState::Idle),
            }),
        }
    }

    /// Acquire the lock, queueing behind earlier callers.
    ///
    /// Dropping the returned future before it completes gives up the place
    /// in the queue; it never strands the lock.
    pub async fn lock(&self) -> MutexGuard {
        loop {
            let waiter = match self.enqueue() {
                Ok(guard) => return guard,
                Err(waiter) => waiter,
            };
            if let Ok(guard) = waiter.await {
                return guard;
            }
        }
    }

    /// Take the lock only if it is idle
    #[must_use]
    pub fn try_lock(&self) -> Option<MutexGuard> {
        let mut state = self.inner.state();
        match &*state {
            LockState::Idle => {
                *state = LockState::Locked(VecDeque::new());
                Some(self.guard())
            }
            LockState::Locked(_) => None,
        }
    }

    /// Whether someone holds the lock
    #[must_use]
    pub fn is_locked(&self) -> bool {
        matches!(&*self.inner.state(), LockState::Locked(_))
    }

    /// Number of callers waiting, including ones that may have given up
    #[must_use]
    pub fn queue_len(&self) -> usize {
        match &*self.inner.state() {
            LockState::Idle => 0,
            LockState::Locked(waiters) => waiters.len(),
        }
    }

    fn enqueue(&self) -> Result<MutexGuard, oneshot::Receiver<MutexGuard>> {
        let mut state = self.inner.state();
        match &mut *state {
            LockState::Idle => {
                *state = LockState::Locked(VecDeque::new());
                Ok(self.guard())
            }
            LockState::Locked(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push_back(tx);
                Err(rx)
            }
        }
    }

    fn guard(&self) -> MutexGuard {
        MutexGuard {
            inner: Some(Arc::clone(&self.inner)),
        }
    }
}

impl Default for AsyncMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsyncMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncMutex")
            .field("locked", &self.is_locked())
            .field("queued", &self.queue_len())
            .finish()
    }
}

/// Proof of exclusive access; dropping it wakes the next waiter
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard {
    inner: Option<Arc<Inner>>,
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}

impl fmt::Debug for MutexGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexGuard").finish_non_exhaustive()
    }
}
