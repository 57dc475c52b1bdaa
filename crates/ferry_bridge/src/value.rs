//! Host-side values the guest can refer to by handle.

use crate::closure::GuestClosure;
use ferry_core::{BridgeError, Handle};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Shared opaque host object
pub type OpaqueObject = Arc<dyn Any + Send + Sync>;

/// A value living in the handle table
#[derive(Clone)]
pub enum HostValue {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Bool(bool),
    /// Number
    Number(f64),
    /// Text
    String(String),
    /// Raw bytes copied out of or into guest memory
    Bytes(Vec<u8>),
    /// Opaque host object, never inspected by the guest
    Object(OpaqueObject),
    /// Guest closure wrapped as a host-callable function
    Closure(GuestClosure),
    /// Captured failure waiting to be surfaced
    Error(BridgeError),
}

impl HostValue {
    /// Sentinel handle for this value, if it is one of the fixed singletons
    #[must_use]
    pub fn sentinel(&self) -> Option<Handle> {
        match self {
            Self::Undefined => Some(Handle::UNDEFINED),
            Self::Null => Some(Handle::NULL),
            Self::Bool(b) => Some(Handle::from_bool(*b)),
            _ => None,
        }
    }

    /// Short kind name for diagnostics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Object(_) => "object",
            Self::Closure(_) => "closure",
            Self::Error(_) => "error",
        }
    }

    /// Borrow as text
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Read as a number
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Read as a boolean
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Downcast an opaque object
    #[must_use]
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Self::Object(obj) => Arc::clone(obj).downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Unwrap text or report a type mismatch
    ///
    /// # Errors
    ///
    /// Returns error if the value is not a string
    pub fn into_string(self) -> Result<String, BridgeError> {
        match self {
            Self::String(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    /// Unwrap a closure or report a type mismatch
    ///
    /// # Errors
    ///
    /// Returns error if the value is not a closure
    pub fn into_closure(self) -> Result<GuestClosure, BridgeError> {
        match self {
            Self::Closure(c) => Ok(c),
            other => Err(other.mismatch("closure")),
        }
    }

    /// Build a type mismatch error against this value
    #[must_use]
    pub fn mismatch(&self, expected: &str) -> BridgeError {
        BridgeError::TypeMismatch {
            expected: expected.to_string(),
            actual: self.kind().to_string(),
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "Undefined"),
            Self::Null => write!(f, "Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Number(n) => write!(f, "Number({n})"),
            Self::String(s) => write!(f, "String({s:?})"),
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::Object(_) => write!(f, "Object(..)"),
            Self::Closure(c) => write!(f, "{c:?}"),
            Self::Error(e) => write!(f, "Error({e})"),
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            (Self::Closure(a), Self::Closure(b)) => a.same(b),
            (Self::Error(a), Self::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        assert_eq!(HostValue::Undefined.sentinel(), Some(Handle::UNDEFINED));
        assert_eq!(HostValue::Bool(false).sentinel(), Some(Handle::FALSE));
        assert_eq!(HostValue::from("x").sentinel(), None);
    }

    #[test]
    fn test_downcast_object() {
        let value = HostValue::Object(Arc::new(42u32));
        assert_eq!(value.downcast::<u32>().as_deref(), Some(&42));
        assert!(value.downcast::<String>().is_none());
    }

    #[test]
    fn test_object_equality_is_identity() {
        let obj: OpaqueObject = Arc::new(1u8);
        let a = HostValue::Object(Arc::clone(&obj));
        let b = HostValue::Object(obj);
        assert_eq!(a, b);
        assert_ne!(a, HostValue::Object(Arc::new(1u8)));
    }

    #[test]
    fn test_into_string_mismatch() {
        let err = HostValue::Number(1.0).into_string().unwrap_err();
        assert_eq!(
            err,
            BridgeError::TypeMismatch {
                expected: "string".to_string(),
                actual: "number".to_string(),
            }
        );
    }
}
