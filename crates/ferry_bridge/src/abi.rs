//! Guest ABI: the exports a guest must provide and the imports it may use.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Linear memory export
pub const MEMORY_EXPORT: &str = "memory";
/// Trampoline table export
pub const TABLE_EXPORT: &str = "__indirect_function_table";
/// Import module name
pub const IMPORT_MODULE: &str = "ferry";

/// Import names in the `ferry` module
pub mod import {
    /// Call a registered host function
    pub const CALL_HOST: &str = "call_host";
    /// Wrap guest UTF-8 as a host string
    pub const STRING_NEW: &str = "string_new";
    /// Copy a host string into guest memory
    pub const STRING_GET: &str = "string_get";
    /// Take the pending error handle
    pub const TAKE_ERROR: &str = "take_error";
    /// Build a domain error handle
    pub const THROW: &str = "throw";
    /// Retain a host value under a second handle
    pub const HEAP_CLONE: &str = "heap_clone";
    /// Release a handle
    pub const HEAP_DROP: &str = "heap_drop";
    /// Wrap a guest closure context
    pub const CLOSURE_NEW: &str = "closure_new";
    /// Drop the guest's reference to a closure
    pub const CLOSURE_DROP: &str = "closure_drop";
}

/// Value types at the ABI level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbiType {
    /// 32-bit integer (also pointers, lengths and handles)
    I32,
    /// 64-bit integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
}

/// ABI function signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiSignature {
    /// Function name
    pub name: String,
    /// Parameter types
    pub params: Vec<AbiType>,
    /// Result types
    pub results: Vec<AbiType>,
    /// Whether a guest must provide it
    pub required: bool,
}

impl AbiSignature {
    fn words(name: &str, params: usize, results: usize, required: bool) -> Self {
        Self {
            name: name.to_string(),
            params: vec![AbiType::I32; params],
            results: vec![AbiType::I32; results],
            required,
        }
    }
}

/// ABI errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbiError {
    /// Unknown function
    #[error("Unknown ABI function: {0}")]
    UnknownFunction(String),

    /// A required export is absent
    #[error("Missing required export: {0}")]
    MissingExport(String),

    /// Signature differs from the ABI
    #[error("Signature mismatch for {name}: expected {expected}, got {actual}")]
    SignatureMismatch {
        name: String,
        expected: String,
        actual: String,
    },
}

/// The host/guest ABI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestAbi {
    /// ABI version
    pub version: semver::Version,
    /// Guest exports the bridge calls
    pub exports: BTreeMap<String, AbiSignature>,
    /// Host imports the guest may call
    pub imports: BTreeMap<String, AbiSignature>,
}

impl GuestAbi {
    /// Standard ferry ABI with the given allocator export names
    #[must_use]
    pub fn with_allocator(malloc: &str, realloc: &str, free: &str) -> Self {
        let exports = [
            AbiSignature::words(malloc, 2, 1, true),
            AbiSignature::words(realloc, 4, 1, true),
            AbiSignature::words(free, 3, 0, true),
        ];
        let imports = [
            AbiSignature::words(import::CALL_HOST, 4, 1, false),
            AbiSignature::words(import::STRING_NEW, 2, 1, false),
            AbiSignature::words(import::STRING_GET, 2, 1, false),
            AbiSignature::words(import::TAKE_ERROR, 0, 1, false),
            AbiSignature::words(import::THROW, 5, 1, false),
            AbiSignature::words(import::HEAP_CLONE, 1, 1, false),
            AbiSignature::words(import::HEAP_DROP, 1, 0, false),
            AbiSignature::words(import::CLOSURE_NEW, 4, 1, false),
            AbiSignature::words(import::CLOSURE_DROP, 1, 1, false),
        ];
        Self {
            version: semver::Version::new(0, 1, 0),
            exports: exports.into_iter().map(|s| (s.name.clone(), s)).collect(),
            imports: imports.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    /// Standard ferry ABI
    #[must_use]
    pub fn new() -> Self {
        Self::with_allocator("ferry_malloc", "ferry_realloc", "ferry_free")
    }

    /// Get an export signature
    #[must_use]
    pub fn export(&self, name: &str) -> Option<&AbiSignature> {
        self.exports.get(name)
    }

    /// Get an import signature
    #[must_use]
    pub fn import(&self, name: &str) -> Option<&AbiSignature> {
        self.imports.get(name)
    }

    /// Exports every guest must provide
    pub fn required_exports(&self) -> impl Iterator<Item = &AbiSignature> {
        self.exports.values().filter(|s| s.required)
    }

    /// Check an export the guest actually provides against the ABI.
    /// Exports the ABI does not know are accepted.
    ///
    /// # Errors
    ///
    /// Returns error if the signature differs
    pub fn check_export(
        &self,
        name: &str,
        params: &[AbiType],
        results: &[AbiType],
    ) -> Result<(), AbiError> {
        let Some(sig) = self.exports.get(name) else {
            return Ok(());
        };
        if sig.params != params || sig.results != results {
            return Err(AbiError::SignatureMismatch {
                name: name.to_string(),
                expected: format!("{:?} -> {:?}", sig.params, sig.results),
                actual: format!("{:?} -> {:?}", params, results),
            });
        }
        Ok(())
    }

    /// Check that every required export is present
    ///
    /// # Errors
    ///
    /// Returns the first missing export
    pub fn check_required<'a>(
        &self,
        present: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), AbiError> {
        let present: Vec<&str> = present.into_iter().collect();
        match self
            .required_exports()
            .find(|sig| !present.contains(&sig.name.as_str()))
        {
            Some(sig) => Err(AbiError::MissingExport(sig.name.clone())),
            None => Ok(()),
        }
    }
}

impl Default for GuestAbi {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_new() {
        let abi = GuestAbi::new();
        assert!(abi.export("ferry_malloc").is_some());
        assert!(abi.import(import::CALL_HOST).is_some());
        assert_eq!(abi.required_exports().count(), 3);
    }

    #[test]
    fn test_abi_signature_shapes() {
        let abi = GuestAbi::new();
        let realloc = abi.export("ferry_realloc").unwrap();
        assert_eq!(realloc.params.len(), 4);
        assert_eq!(realloc.results, vec![AbiType::I32]);
        assert!(abi.import(import::HEAP_DROP).unwrap().results.is_empty());
    }

    #[test]
    fn test_check_export_mismatch() {
        let abi = GuestAbi::new();
        assert!(abi
            .check_export("ferry_malloc", &[AbiType::I32, AbiType::I32], &[AbiType::I32])
            .is_ok());
        assert!(matches!(
            abi.check_export("ferry_malloc", &[AbiType::I64], &[AbiType::I32]),
            Err(AbiError::SignatureMismatch { .. })
        ));
        assert!(abi.check_export("whatever", &[], &[]).is_ok());
    }

    #[test]
    fn test_check_required() {
        let abi = GuestAbi::new();
        assert!(abi
            .check_required(["ferry_malloc", "ferry_realloc", "ferry_free", "memory"])
            .is_ok());
        assert_eq!(
            abi.check_required(["ferry_malloc", "ferry_free"]),
            Err(AbiError::MissingExport("ferry_realloc".to_string()))
        );
    }

    #[test]
    fn test_custom_allocator_names() {
        let abi = GuestAbi::with_allocator("malloc", "realloc", "free");
        assert!(abi.export("malloc").unwrap().required);
        assert!(abi.export("ferry_malloc").is_none());
    }

    #[test]
    fn test_abi_default_version() {
        let abi = GuestAbi::default();
        assert_eq!(abi.version.major, 0);
        assert_eq!(abi.version.minor, 1);
    }
}
