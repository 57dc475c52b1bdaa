//! FERRY Sim
//!
//! An in-process reference guest (an account/signing core living in flat
//! linear memory) and the typed facade application code calls it through.
//! Used by the end-to-end tests and the `ferry demo` command.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod account;
pub mod guest;
pub mod journal;
pub mod policy;

pub use account::{AccountCore, AccountInfo, Subscription};
pub use guest::{SimGuest, LISTENER_DTOR, LISTENER_INVOKE};
pub use journal::Journal;
pub use policy::{AllowAll, Delayed, Denylist, SessionPolicy, SessionRequest};

use ferry_bridge::Bridge;
use ferry_core::BridgeConfig;
use ferry_sync::GuestCell;

/// A fresh reference guest behind a shared cell
#[must_use]
pub fn sim_cell(config: &BridgeConfig) -> GuestCell<SimGuest> {
    GuestCell::new(Bridge::new(SimGuest::new(config)))
}
