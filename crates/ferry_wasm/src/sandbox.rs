//! Sandbox: engine, linker and per-guest stores.

use crate::compile::{CompileConfig, CompileError, CompiledModule, WasmCompiler};
use crate::guest::{WasmGuest, WasmState};
use crate::link::link_imports;
use ferry_bridge::{Bridge, HostState};
use ferry_core::{BridgeConfig, BridgeError, ConfigError};
use wasmtime::{Engine, Linker, Store, StoreLimitsBuilder};

/// Sandbox errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    /// Configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Module rejected
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Engine or linker setup failed
    #[error("Engine setup failed: {0}")]
    Engine(String),

    /// Instantiation failed
    #[error("Instantiation failed: {0}")]
    Instantiate(String),

    /// Bridge-level fault while wiring the guest
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Compiles modules and instantiates them as bridged guests
pub struct Sandbox {
    config: BridgeConfig,
    engine: Engine,
    linker: Linker<WasmState>,
    compiler: WasmCompiler,
}

impl Sandbox {
    /// Create a sandbox; fuel metering is on when the config sets a budget
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or the engine cannot be built
    pub fn new(config: BridgeConfig) -> Result<Self, SandboxError> {
        Self::with_compile_config(config, CompileConfig::new())
    }

    /// Create a sandbox with explicit compile settings
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or the engine cannot be built
    pub fn with_compile_config(
        config: BridgeConfig,
        compile: CompileConfig,
    ) -> Result<Self, SandboxError> {
        config.validate()?;
        let mut wasm_config = wasmtime::Config::new();
        wasm_config.consume_fuel(config.max_fuel.is_some());
        let engine =
            Engine::new(&wasm_config).map_err(|e| SandboxError::Engine(format!("{e:#}")))?;
        let mut linker = Linker::new(&engine);
        link_imports(&mut linker).map_err(|e| SandboxError::Engine(format!("{e:#}")))?;
        let compiler = WasmCompiler::new(engine.clone(), compile, &config);
        Ok(Self {
            config,
            engine,
            linker,
            compiler,
        })
    }

    /// The bridge configuration
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The module compiler
    #[must_use]
    pub fn compiler(&self) -> &WasmCompiler {
        &self.compiler
    }

    /// Validate and compile a module
    ///
    /// # Errors
    ///
    /// Returns error if the module is rejected
    pub fn compile(&self, wasm_bytes: &[u8]) -> Result<CompiledModule, SandboxError> {
        Ok(self.compiler.compile(wasm_bytes)?)
    }

    /// Instantiate a compiled module in a fresh store
    ///
    /// # Errors
    ///
    /// Returns error if instantiation fails
    pub fn instantiate(&self, module: &CompiledModule) -> Result<Bridge<WasmGuest>, SandboxError> {
        let max_memory = usize::try_from(self.config.memory.max_bytes).unwrap_or(usize::MAX);
        let limits = StoreLimitsBuilder::new().memory_size(max_memory).build();
        let mut store = Store::new(
            &self.engine,
            WasmState::new(HostState::new(&self.config), limits),
        );
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = self.config.max_fuel {
            store
                .set_fuel(fuel)
                .map_err(|e| SandboxError::Engine(format!("{e:#}")))?;
        }

        let instance = self
            .linker
            .instantiate(&mut store, &module.module)
            .map_err(|e| SandboxError::Instantiate(format!("{e:#}")))?;
        let guest = WasmGuest::new(store, instance)?;
        tracing::debug!(hash = %module.hash, "guest instantiated");
        Ok(Bridge::new(guest))
    }

    /// Compile and instantiate in one step
    ///
    /// # Errors
    ///
    /// Returns error if the module is rejected or instantiation fails
    pub fn load(&self, wasm_bytes: &[u8]) -> Result<Bridge<WasmGuest>, SandboxError> {
        let module = self.compile(wasm_bytes)?;
        self.instantiate(&module)
    }
}
