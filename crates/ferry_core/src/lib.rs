//! FERRY Core Types
//!
//! Pure types shared by every layer of the host/guest bridge: handle words,
//! the stable error code space, the fault taxonomy, and memory limits.
//! Nothing in this crate touches guest memory or performs I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod code;
pub mod config;
pub mod error;
pub mod handle;
pub mod limits;

// Re-exports
pub use code::ErrorCode;
pub use config::{BridgeConfig, ConfigError};
pub use error::{BridgeError, BridgeResult, DomainError};
pub use handle::{Handle, Word, SENTINEL_COUNT};
pub use limits::{MemoryLimit, PAGE_SIZE};
