//! Guest closures wrapped as host-callable values.
//!
//! The guest hands over a two-word context `(a, b)` plus two trampoline
//! slots: one that invokes the closure and one that destroys it. The host
//! keeps a manual reference count. Each invocation holds a reference and
//! zeroes `a` while the guest runs, so a release triggered from inside the
//! call cannot destroy the context underneath it. Whoever drops the count
//! to zero runs the destructor, exactly once.
//!
//! Dropping the last host reference without releasing queues the
//! destructor on the bridge's finalizer queue instead of leaking it.

use crate::guest::{self, GuestContext};
use crate::host::{Finalizer, FinalizerQueue};
use crate::value::HostValue;
use ferry_core::{BridgeError, BridgeResult, Handle, Word};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct ClosureState {
    a: Word,
    b: Word,
    refcount: u32,
    invoke_slot: Word,
    dtor_slot: Word,
    destroyed: bool,
}

struct ClosureCell {
    state: Mutex<ClosureState>,
    finalizers: FinalizerQueue,
}

impl Drop for ClosureCell {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !state.destroyed {
            tracing::warn!(a = state.a, b = state.b, "closure dropped without release, destructor deferred");
            self.finalizers.push(Finalizer::Slot {
                slot: state.dtor_slot,
                a: state.a,
                b: state.b,
            });
        }
    }
}

/// A guest closure the host can call
#[derive(Clone)]
pub struct GuestClosure(Arc<ClosureCell>);

/// Destructor owed after the count reached zero
struct PendingDtor {
    slot: Word,
    a: Word,
    b: Word,
}

impl GuestClosure {
    /// Wrap a guest closure context with one reference held
    ///
    /// # Errors
    ///
    /// Returns error if the context word `a` is null
    pub fn new(
        a: Word,
        b: Word,
        invoke_slot: Word,
        dtor_slot: Word,
        finalizers: FinalizerQueue,
    ) -> BridgeResult<Self> {
        if a == 0 {
            return Err(BridgeError::ClosureUnavailable {
                reason: "null closure context".to_string(),
            });
        }
        Ok(Self(Arc::new(ClosureCell {
            state: Mutex::new(ClosureState {
                a,
                b,
                refcount: 1,
                invoke_slot,
                dtor_slot,
                destroyed: false,
            }),
            finalizers,
        })))
    }

    fn lock(&self) -> MutexGuard<'_, ClosureState> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether two values wrap the same closure
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Current reference count
    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.lock().refcount
    }

    /// Whether the destructor has run (or been claimed)
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Take another reference
    ///
    /// # Errors
    ///
    /// Returns error if the closure is already destroyed
    pub fn retain(&self) -> BridgeResult<()> {
        let mut state = self.lock();
        if state.destroyed {
            return Err(destroyed());
        }
        state.refcount += 1;
        Ok(())
    }

    /// Invoke the closure with one argument handle
    ///
    /// # Errors
    ///
    /// Returns error if the closure is destroyed, already running, or the
    /// guest call fails
    pub fn invoke<C: GuestContext + ?Sized>(&self, ctx: &mut C, arg: Handle) -> BridgeResult<Handle> {
        let (a, b, slot) = {
            let mut state = self.lock();
            if state.destroyed {
                return Err(destroyed());
            }
            if state.a == 0 {
                return Err(BridgeError::ClosureUnavailable {
                    reason: "closure invoked recursively".to_string(),
                });
            }
            state.refcount += 1;
            (std::mem::replace(&mut state.a, 0), state.b, state.invoke_slot)
        };

        let result = guest::call_slot(ctx, slot, &[a, b, arg.word()])
            .and_then(|words| guest::first_word(&words, "closure invoke"));

        let pending = {
            let mut state = self.lock();
            state.refcount -= 1;
            if state.refcount == 0 {
                state.destroyed = true;
                Some(PendingDtor {
                    slot: state.dtor_slot,
                    a,
                    b,
                })
            } else {
                state.a = a;
                None
            }
        };

        let dtor = pending.map_or(Ok(()), |p| run_dtor(ctx, p));
        match result {
            Ok(word) => dtor.map(|()| Handle(word)),
            Err(err) => {
                if let Err(dtor_err) = dtor {
                    tracing::warn!(error = %dtor_err, "closure destructor failed after failed invoke");
                }
                Err(err)
            }
        }
    }

    /// Invoke with a host value, returning the host value the guest produced
    ///
    /// # Errors
    ///
    /// Same as [`GuestClosure::invoke`], plus an invalid result handle
    pub fn call_with<C: GuestContext + ?Sized>(
        &self,
        ctx: &mut C,
        arg: HostValue,
    ) -> BridgeResult<HostValue> {
        let arg = ctx.host().intern(arg);
        let result = self.invoke(ctx, arg);
        ctx.host().release(arg);
        let handle = result?;
        ctx.host().take(handle)
    }

    /// Drop one reference, running the destructor if it was the last.
    /// Returns whether this call destroyed the closure.
    ///
    /// # Errors
    ///
    /// Returns error if the destructor call fails
    pub fn release<C: GuestContext + ?Sized>(&self, ctx: &mut C) -> BridgeResult<bool> {
        let pending = {
            let mut state = self.lock();
            if state.destroyed || state.refcount == 0 {
                return Ok(false);
            }
            state.refcount -= 1;
            if state.refcount > 0 {
                return Ok(false);
            }
            state.destroyed = true;
            // a is zero while an invocation is in flight, but then the
            // count cannot reach zero here.
            PendingDtor {
                slot: state.dtor_slot,
                a: state.a,
                b: state.b,
            }
        };
        run_dtor(ctx, pending)?;
        Ok(true)
    }
}

fn destroyed() -> BridgeError {
    BridgeError::ClosureUnavailable {
        reason: "closure already destroyed".to_string(),
    }
}

fn run_dtor<C: GuestContext + ?Sized>(ctx: &mut C, dtor: PendingDtor) -> BridgeResult<()> {
    tracing::debug!(a = dtor.a, b = dtor.b, slot = dtor.slot, "closure destroyed");
    guest::call_slot(ctx, dtor.slot, &[dtor.a, dtor.b]).map(drop)
}

impl fmt::Debug for GuestClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("GuestClosure")
            .field("a", &state.a)
            .field("b", &state.b)
            .field("refcount", &state.refcount)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}
