//! FERRY Sync
//!
//! Safe sharing of guest-held stateful objects between concurrent async
//! callers. Mutating operations queue on a per-object FIFO mutex and run in
//! issue order; fields fixed at construction are served from an immutable
//! companion snapshot that never touches the mutex.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cell;
pub mod mutex;
pub mod object;
pub mod view;

#[cfg(test)]
mod testing;

pub use cell::GuestCell;
pub use mutex::{AsyncMutex, MutexGuard};
pub use object::{ExclusiveSession, StatefulHandle};
pub use view::{CompanionView, SplitView};
