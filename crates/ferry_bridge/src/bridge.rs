//! The outermost call site.
//!
//! [`Bridge`] owns a guest and is the single place where guest results are
//! converted back into host errors. Every call through it surfaces errors
//! the guest never observed and drains the finalizer queue afterwards.

use crate::closure::GuestClosure;
use crate::collection::{self, HandleRun};
use crate::error_channel::{self, StatusRecord};
use crate::guest::{self, GuestContext};
use crate::host::{Finalizer, FinalizerQueue, HostFunction, HostState};
use crate::string::{self, GuestStr};
use crate::value::HostValue;
use ferry_core::{BridgeResult, Handle, Word};

/// Typed access to one guest
#[derive(Debug)]
pub struct Bridge<G> {
    guest: G,
}

impl<G: GuestContext> Bridge<G> {
    /// Wrap a guest
    pub fn new(guest: G) -> Self {
        Self { guest }
    }

    /// The guest
    pub fn guest(&self) -> &G {
        &self.guest
    }

    /// The guest, mutably
    pub fn guest_mut(&mut self) -> &mut G {
        &mut self.guest
    }

    /// Give back the guest
    pub fn into_inner(self) -> G {
        self.guest
    }

    /// Host-side state
    pub fn host(&mut self) -> &mut HostState {
        self.guest.host()
    }

    /// Register a host function the guest can reach through `call_host`
    pub fn register(&mut self, function: HostFunction) {
        self.host().register(function);
    }

    /// Call an export that returns plain words
    ///
    /// # Errors
    ///
    /// Returns the guest failure, or a host error the guest left unobserved
    pub fn call(&mut self, name: &str, args: &[Word]) -> BridgeResult<Vec<Word>> {
        let result = guest::call(&mut self.guest, name, args);
        self.finish(result)
    }

    fn finish<T>(&mut self, result: BridgeResult<T>) -> BridgeResult<T> {
        let unobserved = error_channel::surface_unobserved(&mut self.guest);
        self.collect_garbage();
        match (result, unobserved) {
            (_, Err(host_err)) => Err(host_err),
            (result, Ok(())) => result,
        }
    }

    /// Call a fallible export and return the handle it produced.
    ///
    /// The status area's address is appended to `args`.
    ///
    /// # Errors
    ///
    /// Returns the error the guest reported, or any fault on the way
    pub fn call_fallible_raw(&mut self, name: &str, args: &[Word]) -> BridgeResult<Handle> {
        let area = error_channel::status_area(&mut self.guest)?;
        StatusRecord::ok(Handle::UNDEFINED).write(&mut self.guest, area)?;
        let mut full = Vec::with_capacity(args.len() + 1);
        full.extend_from_slice(args);
        full.push(area);

        if let Err(err) = self.call(name, &full) {
            // Reclaim whichever handle this call wrote; sentinels are no-ops
            if let Ok(record) = StatusRecord::read(&mut self.guest, area) {
                if record.is_error {
                    self.host().release(record.error);
                } else {
                    self.host().release(record.value);
                }
            }
            return Err(err);
        }
        StatusRecord::read(&mut self.guest, area)?.resolve(&mut self.guest)
    }

    /// Call a fallible export and take the value it produced
    ///
    /// # Errors
    ///
    /// Same as [`Bridge::call_fallible_raw`]
    pub fn call_fallible(&mut self, name: &str, args: &[Word]) -> BridgeResult<HostValue> {
        let handle = self.call_fallible_raw(name, args)?;
        self.host().take(handle)
    }

    /// Copy text into guest memory
    ///
    /// # Errors
    ///
    /// Returns error if allocation fails
    pub fn pass_str(&mut self, text: &str) -> BridgeResult<GuestStr> {
        string::encode(&mut self.guest, text)
    }

    /// Read text out of guest memory
    ///
    /// # Errors
    ///
    /// Returns `Decode` for malformed UTF-8
    pub fn read_str(&mut self, ptr: Word, len: Word) -> BridgeResult<String> {
        string::decode(&mut self.guest, ptr, len)
    }

    /// Free text passed with [`Bridge::pass_str`]
    ///
    /// # Errors
    ///
    /// Propagates guest failures
    pub fn free_str(&mut self, s: GuestStr) -> BridgeResult<()> {
        string::free_str(&mut self.guest, s)
    }

    /// Copy raw bytes into guest memory, returning `(ptr, len)`
    ///
    /// # Errors
    ///
    /// Returns error if allocation fails
    pub fn pass_bytes(&mut self, bytes: &[u8]) -> BridgeResult<(Word, Word)> {
        collection::pass_bytes(&mut self.guest, bytes)
    }

    /// Free bytes passed with [`Bridge::pass_bytes`]
    ///
    /// # Errors
    ///
    /// Propagates guest failures
    pub fn free_bytes(&mut self, ptr: Word, len: Word) -> BridgeResult<()> {
        guest::free(&mut self.guest, ptr, len, 1)
    }

    /// Pass values as a run of handles
    ///
    /// # Errors
    ///
    /// Returns error if allocation fails
    pub fn pass_values(&mut self, values: impl IntoIterator<Item = HostValue>) -> BridgeResult<HandleRun> {
        collection::pass_values(&mut self.guest, values)
    }

    /// Release a run of handles and its buffer
    ///
    /// # Errors
    ///
    /// Propagates guest failures
    pub fn release_run(&mut self, run: HandleRun) -> BridgeResult<()> {
        collection::release_run(&mut self.guest, run)
    }

    /// Invoke a guest closure from host code
    ///
    /// # Errors
    ///
    /// Returns error if the closure is unavailable or the guest fails
    pub fn invoke_closure(&mut self, closure: &GuestClosure, arg: HostValue) -> BridgeResult<HostValue> {
        let result = closure.call_with(&mut self.guest, arg);
        self.finish(result)
    }

    /// Drop the host's reference to a closure
    ///
    /// # Errors
    ///
    /// Returns error if the destructor call fails
    pub fn release_closure(&mut self, closure: &GuestClosure) -> BridgeResult<bool> {
        closure.release(&mut self.guest)
    }

    /// Run every queued finalizer; returns how many ran.
    /// Failures are logged and skipped.
    pub fn collect_garbage(&mut self) -> usize {
        let pending = self.host().finalizers.drain();
        let mut ran = 0;
        for finalizer in pending {
            let result = match &finalizer {
                Finalizer::Slot { slot, a, b } => guest::call_slot(&mut self.guest, *slot, &[*a, *b]),
                Finalizer::Export { name, args } => guest::call(&mut self.guest, name, args),
            };
            match result {
                Ok(_) => ran += 1,
                Err(err) => tracing::warn!(?finalizer, error = %err, "finalizer failed"),
            }
        }
        if ran > 0 {
            tracing::debug!(ran, "finalizers collected");
        }
        ran
    }

    /// Handle to the finalizer queue, for wrappers that defer cleanup
    pub fn finalizers(&mut self) -> FinalizerQueue {
        self.host().finalizers()
    }
}
