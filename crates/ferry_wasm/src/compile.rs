//! Module validation and compilation.

use ferry_bridge::abi::{AbiError, AbiType, GuestAbi, MEMORY_EXPORT};
use ferry_core::BridgeConfig;
use serde::{Deserialize, Serialize};
use wasmtime::{Engine, ExternType, Module, ValType};

/// Largest module accepted by default
pub const DEFAULT_MAX_MODULE_SIZE: usize = 10 * 1024 * 1024;

/// Compilation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileConfig {
    /// Maximum module size in bytes
    pub max_module_size: usize,
    /// Enable header validation
    pub validate: bool,
}

impl CompileConfig {
    /// Create a new compile config
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_module_size: DEFAULT_MAX_MODULE_SIZE,
            validate: true,
        }
    }

    /// Set the module size limit
    #[must_use]
    pub fn with_max_module_size(mut self, size: usize) -> Self {
        self.max_module_size = size;
        self
    }

    /// Enable/disable header validation
    #[must_use]
    pub fn with_validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Compilation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// Invalid WASM module
    #[error("Invalid WASM module: {0}")]
    InvalidModule(String),

    /// Size limit exceeded
    #[error("Module size {size} exceeds limit {limit}")]
    SizeLimitExceeded { size: usize, limit: usize },

    /// Module does not satisfy the guest ABI
    #[error(transparent)]
    Abi(#[from] AbiError),

    /// wasmtime rejected the module
    #[error("Compilation failed: {0}")]
    Wasmtime(String),
}

/// Validates modules and compiles them against the guest ABI
#[derive(Clone)]
pub struct WasmCompiler {
    engine: Engine,
    config: CompileConfig,
    abi: GuestAbi,
}

impl WasmCompiler {
    /// Create a compiler whose ABI uses the configured allocator names
    #[must_use]
    pub fn new(engine: Engine, config: CompileConfig, bridge: &BridgeConfig) -> Self {
        let abi = GuestAbi::with_allocator(
            &bridge.malloc_export,
            &bridge.realloc_export,
            &bridge.free_export,
        );
        Self { engine, config, abi }
    }

    /// The ABI modules are checked against
    #[must_use]
    pub fn abi(&self) -> &GuestAbi {
        &self.abi
    }

    /// Validate the module header and size
    ///
    /// # Errors
    ///
    /// Returns error if validation fails
    pub fn validate(&self, wasm_bytes: &[u8]) -> Result<(), CompileError> {
        if !self.config.validate {
            return Ok(());
        }

        if wasm_bytes.len() > self.config.max_module_size {
            return Err(CompileError::SizeLimitExceeded {
                size: wasm_bytes.len(),
                limit: self.config.max_module_size,
            });
        }

        if wasm_bytes.len() < 4 {
            return Err(CompileError::InvalidModule("Too small".to_string()));
        }
        if &wasm_bytes[0..4] != b"\0asm" {
            return Err(CompileError::InvalidModule(
                "Invalid magic number".to_string(),
            ));
        }

        if wasm_bytes.len() < 8 {
            return Err(CompileError::InvalidModule("Missing version".to_string()));
        }
        let version = &wasm_bytes[4..8];
        if version != b"\x01\x00\x00\x00" {
            return Err(CompileError::InvalidModule(format!(
                "Unsupported version: {version:?}"
            )));
        }

        Ok(())
    }

    /// Validate, compile and check exports against the ABI
    ///
    /// # Errors
    ///
    /// Returns error if validation, compilation or the ABI check fails
    pub fn compile(&self, wasm_bytes: &[u8]) -> Result<CompiledModule, CompileError> {
        self.validate(wasm_bytes)?;
        let module = Module::new(&self.engine, wasm_bytes)
            .map_err(|e| CompileError::Wasmtime(format!("{e:#}")))?;

        let mut names = Vec::new();
        let mut has_memory = false;
        for export in module.exports() {
            match export.ty() {
                ExternType::Func(ty) => {
                    let params = abi_types(export.name(), ty.params())?;
                    let results = abi_types(export.name(), ty.results())?;
                    self.abi.check_export(export.name(), &params, &results)?;
                }
                ExternType::Memory(_) if export.name() == MEMORY_EXPORT => has_memory = true,
                _ => {}
            }
            names.push(export.name().to_string());
        }
        if !has_memory {
            return Err(AbiError::MissingExport(MEMORY_EXPORT.to_string()).into());
        }
        self.abi.check_required(names.iter().map(String::as_str))?;

        let compiled = CompiledModule::new(module, wasm_bytes);
        tracing::debug!(hash = %compiled.hash, size = compiled.size, "module compiled");
        Ok(compiled)
    }
}

fn abi_types(name: &str, types: impl Iterator<Item = ValType>) -> Result<Vec<AbiType>, CompileError> {
    types
        .map(|ty| match ty {
            ValType::I32 => Ok(AbiType::I32),
            ValType::I64 => Ok(AbiType::I64),
            ValType::F32 => Ok(AbiType::F32),
            ValType::F64 => Ok(AbiType::F64),
            other => Err(AbiError::SignatureMismatch {
                name: name.to_string(),
                expected: "numeric types".to_string(),
                actual: format!("{other:?}"),
            }
            .into()),
        })
        .collect()
}

/// Compiled module ready for instantiation
#[derive(Clone)]
pub struct CompiledModule {
    /// The wasmtime module
    pub module: Module,
    /// BLAKE3 hash of the module bytes, hex encoded
    pub hash: String,
    /// Module size in bytes
    pub size: usize,
}

impl CompiledModule {
    fn new(module: Module, bytes: &[u8]) -> Self {
        Self {
            module,
            hash: hex::encode(blake3::hash(bytes).as_bytes()),
            size: bytes.len(),
        }
    }

    /// Check if module matches expected hash
    #[must_use]
    pub fn verify_hash(&self, expected: &str) -> bool {
        self.hash == expected
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("hash", &self.hash)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MINIMAL: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "ferry_malloc") (param i32 i32) (result i32) i32.const 16)
          (func (export "ferry_realloc") (param i32 i32 i32 i32) (result i32) local.get 0)
          (func (export "ferry_free") (param i32 i32 i32)))
    "#;

    fn compiler() -> WasmCompiler {
        WasmCompiler::new(Engine::default(), CompileConfig::new(), &BridgeConfig::default())
    }

    #[test]
    fn test_compile_minimal_guest() {
        let bytes = wat::parse_str(MINIMAL).unwrap();
        let compiled = compiler().compile(&bytes).unwrap();
        assert_eq!(compiled.size, bytes.len());
        assert_eq!(compiled.hash.len(), 64);
        assert!(compiled.verify_hash(&hex::encode(blake3::hash(&bytes).as_bytes())));
    }

    #[test]
    fn test_validate_invalid_magic() {
        let wasm = vec![0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        assert!(matches!(
            compiler().validate(&wasm),
            Err(CompileError::InvalidModule(_))
        ));
    }

    #[test]
    fn test_validate_too_small() {
        assert!(compiler().validate(&[0x00, 0x61, 0x73]).is_err());
    }

    #[test]
    fn test_validate_size_limit() {
        let c = WasmCompiler::new(
            Engine::default(),
            CompileConfig::new().with_max_module_size(4),
            &BridgeConfig::default(),
        );
        let bytes = wat::parse_str(MINIMAL).unwrap();
        assert!(matches!(
            c.compile(&bytes),
            Err(CompileError::SizeLimitExceeded { limit: 4, .. })
        ));
    }

    #[test]
    fn test_missing_allocator_export() {
        let bytes = wat::parse_str(r#"(module (memory (export "memory") 1))"#).unwrap();
        assert!(matches!(
            compiler().compile(&bytes),
            Err(CompileError::Abi(AbiError::MissingExport(_)))
        ));
    }

    #[test]
    fn test_missing_memory_export() {
        let bytes = wat::parse_str(
            r#"(module
                 (memory 1)
                 (func (export "ferry_malloc") (param i32 i32) (result i32) i32.const 16)
                 (func (export "ferry_realloc") (param i32 i32 i32 i32) (result i32) local.get 0)
                 (func (export "ferry_free") (param i32 i32 i32)))"#,
        )
        .unwrap();
        assert_eq!(
            compiler().compile(&bytes).unwrap_err(),
            CompileError::Abi(AbiError::MissingExport("memory".to_string()))
        );
    }

    #[test]
    fn test_allocator_signature_mismatch() {
        let bytes = wat::parse_str(
            r#"(module
                 (memory (export "memory") 1)
                 (func (export "ferry_malloc") (param i64) (result i32) i32.const 16)
                 (func (export "ferry_realloc") (param i32 i32 i32 i32) (result i32) local.get 0)
                 (func (export "ferry_free") (param i32 i32 i32)))"#,
        )
        .unwrap();
        assert!(matches!(
            compiler().compile(&bytes),
            Err(CompileError::Abi(AbiError::SignatureMismatch { .. }))
        ));
    }

    #[test]
    fn test_validation_can_be_disabled() {
        let c = WasmCompiler::new(
            Engine::default(),
            CompileConfig::new().with_validate(false),
            &BridgeConfig::default(),
        );
        assert!(c.validate(b"junk").is_ok());
        assert!(matches!(c.compile(b"junk"), Err(CompileError::Wasmtime(_))));
    }

    proptest! {
        #[test]
        fn prop_random_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            let _ = compiler().compile(&bytes);
        }
    }
}
