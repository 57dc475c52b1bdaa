//! FERRY WASM Guests
//!
//! wasmtime-backed guests for the bridge: module validation against the
//! guest ABI, the `ferry` import module, fuel limits and memory limits.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compile;
pub mod guest;
pub mod link;
pub mod sandbox;

pub use compile::{CompileConfig, CompileError, CompiledModule, WasmCompiler};
pub use guest::{CallerContext, WasmGuest, WasmState};
pub use link::link_imports;
pub use sandbox::{Sandbox, SandboxError};
