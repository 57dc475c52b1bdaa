//! Guest-held stateful objects behind an exclusive-access guard.

use crate::cell::GuestCell;
use crate::mutex::{AsyncMutex, MutexGuard};
use ferry_bridge::{Bridge, Finalizer, FinalizerQueue, GuestContext, HostValue};
use ferry_core::{BridgeError, BridgeResult, Word};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

struct Object<G> {
    cell: GuestCell<G>,
    mutex: AsyncMutex,
    /// `None` once released
    ptr: Mutex<Option<Word>>,
    kind: String,
    release_export: String,
    finalizers: FinalizerQueue,
}

impl<G> Object<G> {
    fn ptr(&self) -> Option<Word> {
        *self.ptr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_ptr(&self) -> Option<Word> {
        self.ptr.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn released(&self) -> BridgeError {
        BridgeError::ObjectReleased(self.kind.clone())
    }
}

impl<G> Drop for Object<G> {
    fn drop(&mut self) {
        if let Some(ptr) = self.take_ptr() {
            tracing::warn!(kind = %self.kind, ptr, "object dropped without release");
            self.finalizers.push(Finalizer::Export {
                name: self.release_export.clone(),
                args: vec![ptr],
            });
        }
    }
}

/// Host wrapper pairing a guest object pointer with its exclusive guard.
///
/// Clones share the same object and the same guard. The object is freed by
/// [`StatefulHandle::release`]; if every clone is dropped first, the free is
/// queued and runs at the guest's next call boundary.
pub struct StatefulHandle<G> {
    object: Arc<Object<G>>,
}

impl<G: GuestContext> StatefulHandle<G> {
    /// Construct an object through a fallible guest export.
    ///
    /// The constructor reports the new object's pointer as its status value;
    /// `release_export` is called with that pointer to free it.
    ///
    /// # Errors
    ///
    /// Returns the constructor's error, or a fault if it reported no object
    pub fn construct(
        cell: &GuestCell<G>,
        constructor: &str,
        args: &[Word],
        release_export: &str,
    ) -> BridgeResult<Self> {
        let (ptr, finalizers) = cell.with(|bridge| {
            let ptr = bridge.call_fallible_raw(constructor, args)?.word();
            BridgeResult::Ok((ptr, bridge.finalizers()))
        })?;
        if ptr == 0 {
            return Err(BridgeError::Trap(format!("{constructor} returned a null object")));
        }
        tracing::debug!(kind = constructor, ptr, "object constructed");
        Ok(Self {
            object: Arc::new(Object {
                cell: cell.clone(),
                mutex: AsyncMutex::new(),
                ptr: Mutex::new(Some(ptr)),
                kind: constructor.to_string(),
                release_export: release_export.to_string(),
                finalizers,
            }),
        })
    }

    /// Wait for exclusive access.
    ///
    /// The guard is held until the session is dropped, across any number of
    /// guest calls and suspension points in between.
    ///
    /// # Errors
    ///
    /// Returns error if the object was released, including while waiting
    pub async fn exclusive(&self) -> BridgeResult<ExclusiveSession<'_, G>> {
        let guard = self.object.mutex.lock().await;
        let ptr = self.object.ptr().ok_or_else(|| self.object.released())?;
        Ok(ExclusiveSession {
            object: &self.object,
            ptr,
            _guard: guard,
        })
    }

    /// Free the guest object once queued sessions have finished
    ///
    /// # Errors
    ///
    /// Returns error if already released or the free call fails
    pub async fn release(&self) -> BridgeResult<()> {
        let _guard = self.object.mutex.lock().await;
        let ptr = self.object.take_ptr().ok_or_else(|| self.object.released())?;
        tracing::debug!(kind = %self.object.kind, ptr, "object released");
        self.object
            .cell
            .with(|bridge| bridge.call(&self.object.release_export, &[ptr]))
            .map(drop)
    }

    /// Pointer of an object nobody else can reach yet
    pub(crate) fn unshared_ptr(&self) -> Option<Word> {
        self.object.ptr()
    }

    /// Free an object nobody else can reach yet, without queueing
    pub(crate) fn discard(&self) -> BridgeResult<()> {
        let Some(ptr) = self.object.take_ptr() else {
            return Ok(());
        };
        self.object
            .cell
            .with(|bridge| bridge.call(&self.object.release_export, &[ptr]))
            .map(drop)
    }

    /// Whether the object has been released
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.object.ptr().is_none()
    }

    /// Whether an exclusive session is running
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.object.mutex.is_locked()
    }

    /// The guest the object lives in
    #[must_use]
    pub fn cell(&self) -> &GuestCell<G> {
        &self.object.cell
    }
}

impl<G> Clone for StatefulHandle<G> {
    fn clone(&self) -> Self {
        Self {
            object: Arc::clone(&self.object),
        }
    }
}

impl<G> fmt::Debug for StatefulHandle<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatefulHandle")
            .field("kind", &self.object.kind)
            .field("ptr", &self.object.ptr())
            .finish()
    }
}

/// Exclusive access to one object, released on drop even after a failure
pub struct ExclusiveSession<'a, G> {
    object: &'a Object<G>,
    ptr: Word,
    _guard: MutexGuard,
}

impl<G: GuestContext> ExclusiveSession<'_, G> {
    /// The object's guest pointer
    #[must_use]
    pub fn ptr(&self) -> Word {
        self.ptr
    }

    /// Call a method export; the object pointer is passed first
    ///
    /// # Errors
    ///
    /// Propagates guest failures
    pub fn call(&mut self, export: &str, args: &[Word]) -> BridgeResult<Vec<Word>> {
        let full = self.with_receiver(args);
        self.object.cell.with(|bridge| bridge.call(export, &full))
    }

    /// Call a fallible method export; the object pointer is passed first
    ///
    /// # Errors
    ///
    /// Returns the error the guest reported, or any fault on the way
    pub fn call_fallible(&mut self, export: &str, args: &[Word]) -> BridgeResult<HostValue> {
        let full = self.with_receiver(args);
        self.object.cell.with(|bridge| bridge.call_fallible(export, &full))
    }

    /// Run several bridge operations as one synchronous step
    pub fn with_bridge<R>(&mut self, f: impl FnOnce(&mut Bridge<G>, Word) -> R) -> R {
        let ptr = self.ptr;
        self.object.cell.with(|bridge| f(bridge, ptr))
    }

    fn with_receiver(&self, args: &[Word]) -> Vec<Word> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(self.ptr);
        full.extend_from_slice(args);
        full
    }
}

impl<G> fmt::Debug for ExclusiveSession<'_, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveSession")
            .field("kind", &self.object.kind)
            .field("ptr", &self.ptr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{counter_cell, CounterGuest};
    use futures::FutureExt;

    fn counter(cell: &GuestCell<CounterGuest>, start: Word) -> StatefulHandle<CounterGuest> {
        StatefulHandle::construct(cell, "counter_new", &[start], "counter_free").unwrap()
    }

    #[tokio::test]
    async fn test_exclusive_call_passes_receiver() {
        let cell = counter_cell();
        let object = counter(&cell, 10);
        let mut session = object.exclusive().await.unwrap();
        assert_eq!(session.call("counter_add", &[5]).unwrap(), vec![15]);
        assert_eq!(session.call("counter_add", &[1]).unwrap(), vec![16]);
    }

    #[tokio::test]
    async fn test_constructor_error_propagates() {
        let cell = counter_cell();
        let err = StatefulHandle::construct(&cell, "counter_new", &[CounterGuest::REJECTED], "counter_free")
            .unwrap_err();
        assert_eq!(err.as_domain().unwrap().message, "rejected start");
        cell.with(|bridge| assert_eq!(bridge.host().heap().live_count(), 0));
    }

    #[tokio::test]
    async fn test_guard_released_after_failure() {
        let cell = counter_cell();
        let object = counter(&cell, 0);
        {
            let mut session = object.exclusive().await.unwrap();
            assert!(session.call("no_such_method", &[]).is_err());
        }
        assert!(!object.is_busy());
        assert!(object.exclusive().now_or_never().is_some());
    }

    #[tokio::test]
    async fn test_release_frees_and_blocks_later_sessions() {
        let cell = counter_cell();
        let object = counter(&cell, 3);
        object.release().await.unwrap();
        assert!(object.is_released());
        cell.with(|bridge| assert_eq!(bridge.guest().live_objects(), 0));
        assert!(matches!(
            object.exclusive().await,
            Err(BridgeError::ObjectReleased(kind)) if kind == "counter_new"
        ));
        assert!(object.release().await.is_err());
    }

    #[tokio::test]
    async fn test_release_waits_for_running_session() {
        let cell = counter_cell();
        let object = counter(&cell, 0);
        let session = object.exclusive().await.unwrap();
        let mut release = Box::pin(object.release());
        assert!((&mut release).now_or_never().is_none());
        assert!(!object.is_released());
        drop(session);
        release.await.unwrap();
        assert!(object.is_released());
    }

    #[tokio::test]
    async fn test_dropped_object_is_finalized_at_next_boundary() {
        let cell = counter_cell();
        let object = counter(&cell, 1);
        let clone = object.clone();
        drop(object);
        cell.with(|bridge| assert_eq!(bridge.guest().live_objects(), 1));
        drop(clone);
        assert_eq!(cell.collect_garbage(), 1);
        cell.with(|bridge| assert_eq!(bridge.guest().live_objects(), 0));
    }

    #[tokio::test]
    async fn test_released_object_is_not_finalized_again() {
        let cell = counter_cell();
        let object = counter(&cell, 1);
        object.release().await.unwrap();
        drop(object);
        assert_eq!(cell.collect_garbage(), 0);
    }
}
