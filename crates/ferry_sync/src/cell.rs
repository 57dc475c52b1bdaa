//! Shared ownership of one bridged guest.

use ferry_bridge::{Bridge, FinalizerQueue, GuestContext};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// A bridge shared by every object living in the same guest.
///
/// Access is synchronous: [`GuestCell::with`] runs a closure to completion
/// and offers no way to await while the bridge is borrowed, so a guest call
/// can never be interleaved with another one.
pub struct GuestCell<G> {
    bridge: Arc<Mutex<Bridge<G>>>,
}

impl<G: GuestContext> GuestCell<G> {
    /// Share a bridge
    pub fn new(bridge: Bridge<G>) -> Self {
        Self {
            bridge: Arc::new(Mutex::new(bridge)),
        }
    }

    /// Run `f` against the bridge
    pub fn with<R>(&self, f: impl FnOnce(&mut Bridge<G>) -> R) -> R {
        let mut bridge = self.bridge.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut bridge)
    }

    /// Queue for cleanup that cannot run where it is discovered
    pub fn finalizers(&self) -> FinalizerQueue {
        self.with(Bridge::finalizers)
    }

    /// Run queued finalizers now
    pub fn collect_garbage(&self) -> usize {
        self.with(Bridge::collect_garbage)
    }
}

impl<G> Clone for GuestCell<G> {
    fn clone(&self) -> Self {
        Self {
            bridge: Arc::clone(&self.bridge),
        }
    }
}

impl<G> fmt::Debug for GuestCell<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestCell")
            .field("owners", &Arc::strong_count(&self.bridge))
            .finish()
    }
}
