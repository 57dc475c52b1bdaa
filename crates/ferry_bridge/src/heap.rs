//! Handle table: a slab of host values addressed by small integers.
//!
//! Slots are `Live(value)` or `Free(next)`, with the free list threaded
//! through the vector itself. A released slot is the next one handed out.
//! The first `sentinels` slots hold fixed singletons and are never released.

use ferry_core::{BridgeError, BridgeResult, Handle, Word};

#[derive(Debug, Clone)]
enum Slot<T> {
    Live(T),
    Free(Option<Word>),
}

/// Growable slab allocator for host values
#[derive(Debug, Clone)]
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<Word>,
    sentinels: Word,
    live: usize,
}

impl<T> HandleTable<T> {
    /// Create a table whose first slots are the given sentinels
    #[must_use]
    pub fn with_sentinels(sentinels: impl IntoIterator<Item = T>) -> Self {
        Self::with_capacity(sentinels, 0)
    }

    /// Create a table with room for `capacity` dynamic slots
    #[must_use]
    pub fn with_capacity(sentinels: impl IntoIterator<Item = T>, capacity: usize) -> Self {
        let mut slots: Vec<Slot<T>> = sentinels.into_iter().map(Slot::Live).collect();
        let count = slots.len() as Word;
        slots.reserve(capacity);
        Self {
            slots,
            free_head: None,
            sentinels: count,
            live: 0,
        }
    }

    /// Store a value and return its handle
    pub fn assign(&mut self, value: T) -> Handle {
        self.live += 1;
        match self.free_head {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                self.free_head = match slot {
                    Slot::Free(next) => *next,
                    Slot::Live(_) => unreachable!("free list points at a live slot"),
                };
                *slot = Slot::Live(value);
                Handle(index)
            }
            None => {
                let index = self.slots.len() as Word;
                self.slots.push(Slot::Live(value));
                Handle(index)
            }
        }
    }

    /// Borrow the value behind a handle
    ///
    /// # Errors
    ///
    /// Returns error if the handle is out of range or released
    pub fn get(&self, handle: Handle) -> BridgeResult<&T> {
        match self.slots.get(handle.0 as usize) {
            Some(Slot::Live(value)) => Ok(value),
            _ => Err(BridgeError::InvalidHandle { handle: handle.0 }),
        }
    }

    /// Mutably borrow the value behind a handle
    ///
    /// # Errors
    ///
    /// Returns error if the handle is out of range or released
    pub fn get_mut(&mut self, handle: Handle) -> BridgeResult<&mut T> {
        match self.slots.get_mut(handle.0 as usize) {
            Some(Slot::Live(value)) => Ok(value),
            _ => Err(BridgeError::InvalidHandle { handle: handle.0 }),
        }
    }

    /// Release a handle, returning its value.
    ///
    /// Sentinels, released slots and out-of-range handles yield `None` and
    /// leave the table untouched.
    pub fn release(&mut self, handle: Handle) -> Option<T> {
        if handle.0 < self.sentinels {
            return None;
        }
        let slot = self.slots.get_mut(handle.0 as usize)?;
        if matches!(slot, Slot::Free(_)) {
            tracing::warn!(%handle, "release of already-free handle ignored");
            return None;
        }
        let previous = std::mem::replace(slot, Slot::Free(self.free_head));
        self.free_head = Some(handle.0);
        self.live -= 1;
        match previous {
            Slot::Live(value) => Some(value),
            Slot::Free(_) => None,
        }
    }

    /// Whether the handle names a live slot
    #[must_use]
    pub fn is_live(&self, handle: Handle) -> bool {
        matches!(self.slots.get(handle.0 as usize), Some(Slot::Live(_)))
    }

    /// Number of live non-sentinel values
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Total slots, sentinels included
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// First handle past the sentinel range
    #[must_use]
    pub fn sentinel_boundary(&self) -> Word {
        self.sentinels
    }
}

impl<T: Clone> HandleTable<T> {
    /// Dereference and release in one step. Sentinels are copied, not released.
    ///
    /// # Errors
    ///
    /// Returns error if the handle is out of range or released
    pub fn take(&mut self, handle: Handle) -> BridgeResult<T> {
        if handle.0 < self.sentinels {
            return self.get(handle).cloned();
        }
        self.release(handle)
            .ok_or(BridgeError::InvalidHandle { handle: handle.0 })
    }
}
