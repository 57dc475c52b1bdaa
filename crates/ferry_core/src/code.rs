//! Stable enumerated error code space.
//!
//! Codes are grouped by thousands so callers can branch on a family
//! (`is_retryable`, `family`) without matching every variant. The numeric
//! values cross the guest boundary and must never be renumbered.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error code shared by host and guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Transport-level network failure
    Network,
    /// Upstream provider unavailable
    ProviderUnavailable,
    /// Upstream provider rate-limited the request
    RateLimited,
    /// Signing operation failed
    SigningFailed,
    /// Key material missing or malformed
    InvalidKey,
    /// Persistent storage failure
    StorageFailed,
    /// Requested record does not exist
    StorageNotFound,
    /// Session state conflicts with the request
    SessionConflict,
    /// Policy rejected the request
    PolicyViolation,
    /// Value could not be encoded or decoded
    EncodingFailed,
    /// Unexpected internal failure
    Internal,
    /// A code outside the known space, preserved verbatim
    Unrecognized(u32),
}

impl ErrorCode {
    /// Numeric wire value
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Network => 1000,
            Self::ProviderUnavailable => 1001,
            Self::RateLimited => 1002,
            Self::SigningFailed => 2000,
            Self::InvalidKey => 2001,
            Self::StorageFailed => 3000,
            Self::StorageNotFound => 3001,
            Self::SessionConflict => 4000,
            Self::PolicyViolation => 4001,
            Self::EncodingFailed => 5000,
            Self::Internal => 9000,
            Self::Unrecognized(raw) => raw,
        }
    }

    /// Decode a wire value. Unknown values are kept as [`ErrorCode::Unrecognized`].
    #[must_use]
    pub const fn from_u32(raw: u32) -> Self {
        match raw {
            1000 => Self::Network,
            1001 => Self::ProviderUnavailable,
            1002 => Self::RateLimited,
            2000 => Self::SigningFailed,
            2001 => Self::InvalidKey,
            3000 => Self::StorageFailed,
            3001 => Self::StorageNotFound,
            4000 => Self::SessionConflict,
            4001 => Self::PolicyViolation,
            5000 => Self::EncodingFailed,
            9000 => Self::Internal,
            other => Self::Unrecognized(other),
        }
    }

    /// Family name of the code
    #[must_use]
    pub const fn family(self) -> &'static str {
        match self.as_u32() / 1000 {
            1 => "network",
            2 => "signing",
            3 => "storage",
            4 => "session",
            5 => "encoding",
            9 => "internal",
            _ => "unknown",
        }
    }

    /// Whether a caller may reasonably retry with backoff
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::ProviderUnavailable | Self::RateLimited
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrecognized(raw) => write!(f, "E{raw}?"),
            other => write!(f, "E{}", other.as_u32()),
        }
    }
}
