//! Split views: an exclusive handle plus an immutable companion snapshot.
//!
//! Fields that never change after construction are read once, while the
//! new object is still private to the constructor, and served from the
//! companion afterwards. Companion reads never wait on the exclusive guard,
//! so they stay cheap even while a long mutating call holds it.

use crate::cell::GuestCell;
use crate::object::{ExclusiveSession, StatefulHandle};
use ferry_bridge::{Bridge, GuestContext};
use ferry_core::{BridgeError, BridgeResult, Word};
use std::fmt;
use std::sync::Arc;

/// Fields fixed at construction
pub struct CompanionView<T> {
    fields: Arc<T>,
}

impl<T> CompanionView<T> {
    /// Wrap a snapshot
    pub fn new(fields: T) -> Self {
        Self {
            fields: Arc::new(fields),
        }
    }

    /// The snapshot
    #[must_use]
    pub fn get(&self) -> &T {
        &self.fields
    }
}

impl<T> Clone for CompanionView<T> {
    fn clone(&self) -> Self {
        Self {
            fields: Arc::clone(&self.fields),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for CompanionView<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompanionView").field(&self.fields).finish()
    }
}

/// A guest object seen through both its exclusive and companion halves
pub struct SplitView<G, T> {
    exclusive: StatefulHandle<G>,
    companion: CompanionView<T>,
}

impl<G: GuestContext, T> SplitView<G, T> {
    /// Construct the object, then take the companion snapshot.
    ///
    /// If the snapshot fails the object is freed before returning.
    ///
    /// # Errors
    ///
    /// Returns the constructor's or the snapshot's error
    pub fn construct(
        cell: &GuestCell<G>,
        constructor: &str,
        args: &[Word],
        release_export: &str,
        snapshot: impl FnOnce(&mut Bridge<G>, Word) -> BridgeResult<T>,
    ) -> BridgeResult<Self> {
        let exclusive = StatefulHandle::construct(cell, constructor, args, release_export)?;
        let ptr = exclusive
            .unshared_ptr()
            .ok_or_else(|| BridgeError::ObjectReleased(constructor.to_string()))?;
        match cell.with(|bridge| snapshot(bridge, ptr)) {
            Ok(fields) => Ok(Self {
                exclusive,
                companion: CompanionView::new(fields),
            }),
            Err(err) => {
                if let Err(free_err) = exclusive.discard() {
                    tracing::warn!(kind = constructor, error = %free_err, "failed to free object after snapshot error");
                }
                Err(err)
            }
        }
    }

    /// Fixed fields; never waits
    #[must_use]
    pub fn companion(&self) -> &CompanionView<T> {
        &self.companion
    }

    /// Shorthand for `companion().get()`
    #[must_use]
    pub fn fields(&self) -> &T {
        self.companion.get()
    }

    /// Wait for exclusive access to the mutable half
    ///
    /// # Errors
    ///
    /// Returns error if the object was released
    pub async fn exclusive(&self) -> BridgeResult<ExclusiveSession<'_, G>> {
        self.exclusive.exclusive().await
    }

    /// The exclusive half
    #[must_use]
    pub fn handle(&self) -> &StatefulHandle<G> {
        &self.exclusive
    }

    /// Free the guest object. The companion stays readable.
    ///
    /// # Errors
    ///
    /// Returns error if already released or the free call fails
    pub async fn release(&self) -> BridgeResult<()> {
        self.exclusive.release().await
    }
}

impl<G, T> Clone for SplitView<G, T> {
    fn clone(&self) -> Self {
        Self {
            exclusive: self.exclusive.clone(),
            companion: self.companion.clone(),
        }
    }
}

impl<G, T: fmt::Debug> fmt::Debug for SplitView<G, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitView")
            .field("exclusive", &self.exclusive)
            .field("companion", &self.companion)
            .finish()
    }
}
