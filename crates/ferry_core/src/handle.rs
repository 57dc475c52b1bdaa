//! Handle words exchanged with the guest.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine word of the guest ABI (32-bit linear memory)
pub type Word = u32;

/// Number of reserved sentinel handles at the bottom of the table
pub const SENTINEL_COUNT: Word = 4;

/// Opaque reference to a host-owned value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(pub Word);

impl Handle {
    /// `undefined`; also means "no value" in error positions
    pub const UNDEFINED: Self = Self(0);
    /// `null`
    pub const NULL: Self = Self(1);
    /// `true`
    pub const TRUE: Self = Self(2);
    /// `false`
    pub const FALSE: Self = Self(3);

    /// Raw word
    #[must_use]
    pub const fn word(self) -> Word {
        self.0
    }

    /// Whether this handle is one of the fixed singletons
    #[must_use]
    pub const fn is_sentinel(self) -> bool {
        self.0 < SENTINEL_COUNT
    }

    /// Sentinel for a boolean
    #[must_use]
    pub const fn from_bool(value: bool) -> Self {
        if value { Self::TRUE } else { Self::FALSE }
    }
}

impl From<Word> for Handle {
    fn from(word: Word) -> Self {
        Self(word)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
