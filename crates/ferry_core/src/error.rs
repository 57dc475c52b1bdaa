//! Error types for FERRY.
//!
//! Two families cross the bridge. Faults (bad handles, malformed bytes,
//! allocator failures, traps) are always fatal to the call that raised them.
//! Domain errors carry a stable [`ErrorCode`], a message and an optional
//! free-form detail, and are meant to be branched on by callers.

use crate::code::ErrorCode;
use crate::handle::Word;
use serde::{Deserialize, Serialize};

/// Bridge result type
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Structured failure reported by guest logic or a host function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct DomainError {
    /// Stable code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Unstructured payload, passed through untouched
    pub detail: Option<String>,
}

impl DomainError {
    /// Create a domain error without detail
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    /// Attach a detail payload
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Everything that can go wrong while brokering a guest call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// Handle does not name a live slot
    #[error("Invalid handle: {handle}")]
    InvalidHandle { handle: Word },

    /// Guest bytes are not valid UTF-8
    #[error("Decode fault at 0x{ptr:X} ({len} bytes): invalid UTF-8 after {valid_up_to} bytes")]
    Decode {
        ptr: Word,
        len: Word,
        valid_up_to: usize,
    },

    /// Guest allocator returned null
    #[error("Guest allocation of {size} bytes failed")]
    AllocationFailed { size: Word },

    /// Range lies outside the current guest buffer
    #[error("Out of bounds: 0x{ptr:X}+{len} exceeds guest memory of {memory_size} bytes")]
    OutOfBounds {
        ptr: Word,
        len: Word,
        memory_size: usize,
    },

    /// Word access at an address that is not word-aligned
    #[error("Misaligned word access at 0x{ptr:X}")]
    Misaligned { ptr: Word },

    /// Guest is missing an export the bridge needs
    #[error("Missing guest export: {0}")]
    MissingExport(String),

    /// Guest asked for a host function that is not registered
    #[error("Unknown host function: {0}")]
    UnknownHostFunction(String),

    /// Trampoline slot is empty or not callable
    #[error("Invalid trampoline slot: {slot}")]
    InvalidSlot { slot: Word },

    /// Guest execution trapped
    #[error("Guest trapped: {0}")]
    Trap(String),

    /// Value behind a handle has the wrong kind
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Closure was destroyed or is mid-invocation
    #[error("Closure unavailable: {reason}")]
    ClosureUnavailable { reason: String },

    /// Stateful object was already released
    #[error("Object released: {0}")]
    ObjectReleased(String),

    /// A host callback panicked while the guest was on the stack
    #[error("Host callback panicked: {0}")]
    HostPanic(String),

    /// Structured error returned across the boundary
    #[error(transparent)]
    Domain(DomainError),
}

impl BridgeError {
    /// Structured code, if this is a domain error
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Domain(err) => Some(err.code),
            _ => None,
        }
    }

    /// Domain payload, if this is a domain error
    #[must_use]
    pub fn as_domain(&self) -> Option<&DomainError> {
        match self {
            Self::Domain(err) => Some(err),
            _ => None,
        }
    }

    /// Whether this is a transport/marshaling fault rather than a domain error
    #[must_use]
    pub fn is_fault(&self) -> bool {
        !matches!(self, Self::Domain(_))
    }
}

impl From<DomainError> for BridgeError {
    fn from(err: DomainError) -> Self {
        Self::Domain(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_display() {
        let err = DomainError::new(ErrorCode::RateLimited, "slow down");
        assert_eq!(err.to_string(), "[E1002] slow down");
    }

    #[test]
    fn test_domain_error_detail_preserved() {
        let err = DomainError::new(ErrorCode::StorageFailed, "write failed")
            .with_detail("{\"errno\":28}");
        let bridged: BridgeError = err.clone().into();
        assert_eq!(bridged.code(), Some(ErrorCode::StorageFailed));
        assert_eq!(
            bridged.as_domain().and_then(|d| d.detail.as_deref()),
            Some("{\"errno\":28}")
        );
        assert!(!bridged.is_fault());
    }

    #[test]
    fn test_domain_error_serde() {
        let err = DomainError::new(ErrorCode::SessionConflict, "taken").with_detail("alice");
        let json = serde_json::to_string(&err).unwrap();
        let back: DomainError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }

    #[test]
    fn test_faults_have_no_code() {
        let err = BridgeError::Decode {
            ptr: 16,
            len: 4,
            valid_up_to: 2,
        };
        assert!(err.is_fault());
        assert!(err.code().is_none());
        assert!(err.to_string().contains("Decode fault"));
    }

    #[test]
    fn test_transparent_domain_display() {
        let err: BridgeError = DomainError::new(ErrorCode::SigningFailed, "bad nonce").into();
        assert_eq!(err.to_string(), "[E2000] bad nonce");
    }
}
