//! FERRY Bridge
//!
//! Marshaling between a host and a memory-isolated guest: a handle table
//! for host values, cached views over guest memory, a string codec,
//! reference-counted guest closures, an error channel that never unwinds
//! through guest frames, and runs of handles for collections.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod abi;
pub mod bridge;
pub mod closure;
pub mod collection;
pub mod error_channel;
pub mod flat;
pub mod guest;
pub mod heap;
pub mod host;
pub mod imports;
pub mod memory;
pub mod string;
pub mod value;

#[cfg(test)]
mod testing;

pub use abi::{AbiError, AbiSignature, AbiType, GuestAbi};
pub use bridge::Bridge;
pub use closure::GuestClosure;
pub use collection::HandleRun;
pub use error_channel::{ErrorChannel, StatusRecord};
pub use flat::FlatMemory;
pub use guest::GuestContext;
pub use heap::HandleTable;
pub use host::{Finalizer, FinalizerQueue, HostFunction, HostRegistry, HostState};
pub use memory::{BufferIdentity, MemoryViewCache};
pub use string::GuestStr;
pub use value::{HostValue, OpaqueObject};
