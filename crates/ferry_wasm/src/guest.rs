//! wasmtime implementations of [`GuestContext`].
//!
//! [`WasmGuest`] owns the store and is used from the outermost call site.
//! [`CallerContext`] wraps the `Caller` a host import receives, so the
//! bridge can reenter the guest (allocate, run destructors) while guest
//! frames are still on the stack.

use ferry_bridge::abi::{MEMORY_EXPORT, TABLE_EXPORT};
use ferry_bridge::{GuestContext, HostState};
use ferry_core::{BridgeError, BridgeResult, Word};
use wasmtime::{
    AsContextMut, Caller, Extern, Func, Instance, Memory, Ref, Store, StoreLimits, Table, Val,
};

/// Store data: host state plus the limits wasmtime enforces
pub struct WasmState {
    pub(crate) host: HostState,
    pub(crate) limits: StoreLimits,
}

impl WasmState {
    /// Create store data
    #[must_use]
    pub fn new(host: HostState, limits: StoreLimits) -> Self {
        Self { host, limits }
    }
}

/// An instantiated wasm guest
pub struct WasmGuest {
    store: Store<WasmState>,
    instance: Instance,
    memory: Memory,
    table: Option<Table>,
}

impl WasmGuest {
    /// Wrap an instance. The memory export must exist; the table is optional.
    ///
    /// # Errors
    ///
    /// Returns error if the instance exports no memory
    pub fn new(mut store: Store<WasmState>, instance: Instance) -> BridgeResult<Self> {
        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| BridgeError::MissingExport(MEMORY_EXPORT.to_string()))?;
        let table = instance.get_table(&mut store, TABLE_EXPORT);
        Ok(Self {
            store,
            instance,
            memory,
            table,
        })
    }

    /// Fuel left, if fuel metering is on
    #[must_use]
    pub fn fuel_remaining(&self) -> Option<u64> {
        self.store.get_fuel().ok()
    }

    /// Refill the fuel budget
    ///
    /// # Errors
    ///
    /// Returns error if fuel metering is off
    pub fn set_fuel(&mut self, fuel: u64) -> BridgeResult<()> {
        self.store.set_fuel(fuel).map_err(into_bridge_error)
    }

    /// Current memory size in bytes
    #[must_use]
    pub fn memory_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }
}

impl std::fmt::Debug for WasmGuest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmGuest")
            .field("memory_size", &self.memory_size())
            .field("has_table", &self.table.is_some())
            .finish()
    }
}

impl GuestContext for WasmGuest {
    fn host(&mut self) -> &mut HostState {
        &mut self.store.data_mut().host
    }

    fn memory_and_host(&mut self) -> BridgeResult<(&mut [u8], &mut HostState)> {
        let (data, state) = self.memory.data_and_store_mut(self.store.as_context_mut());
        Ok((data, &mut state.host))
    }

    fn call_export(&mut self, name: &str, args: &[Word]) -> BridgeResult<Vec<Word>> {
        let func = self
            .instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| BridgeError::MissingExport(name.to_string()))?;
        call_func(&mut self.store, &func, args)
    }

    fn call_slot(&mut self, slot: Word, args: &[Word]) -> BridgeResult<Vec<Word>> {
        let table = self.table.ok_or(BridgeError::InvalidSlot { slot })?;
        let func = slot_func(&mut self.store, table, slot)?;
        call_func(&mut self.store, &func, args)
    }
}

/// The guest as seen from inside a host import
pub struct CallerContext<'c>(pub Caller<'c, WasmState>);

impl GuestContext for CallerContext<'_> {
    fn host(&mut self) -> &mut HostState {
        &mut self.0.data_mut().host
    }

    fn memory_and_host(&mut self) -> BridgeResult<(&mut [u8], &mut HostState)> {
        let memory = self
            .0
            .get_export(MEMORY_EXPORT)
            .and_then(Extern::into_memory)
            .ok_or_else(|| BridgeError::MissingExport(MEMORY_EXPORT.to_string()))?;
        let (data, state) = memory.data_and_store_mut(self.0.as_context_mut());
        Ok((data, &mut state.host))
    }

    fn call_export(&mut self, name: &str, args: &[Word]) -> BridgeResult<Vec<Word>> {
        let func = self
            .0
            .get_export(name)
            .and_then(Extern::into_func)
            .ok_or_else(|| BridgeError::MissingExport(name.to_string()))?;
        call_func(&mut self.0, &func, args)
    }

    fn call_slot(&mut self, slot: Word, args: &[Word]) -> BridgeResult<Vec<Word>> {
        let table = self
            .0
            .get_export(TABLE_EXPORT)
            .and_then(Extern::into_table)
            .ok_or(BridgeError::InvalidSlot { slot })?;
        let func = slot_func(&mut self.0, table, slot)?;
        call_func(&mut self.0, &func, args)
    }
}

fn slot_func(mut store: impl AsContextMut<Data = WasmState>, table: Table, slot: Word) -> BridgeResult<Func> {
    match table.get(store.as_context_mut(), u64::from(slot)) {
        Some(Ref::Func(Some(func))) => Ok(func),
        _ => Err(BridgeError::InvalidSlot { slot }),
    }
}

fn call_func(
    mut store: impl AsContextMut<Data = WasmState>,
    func: &Func,
    args: &[Word],
) -> BridgeResult<Vec<Word>> {
    let params: Vec<Val> = args.iter().map(|w| Val::I32(*w as i32)).collect();
    let arity = func.ty(store.as_context_mut()).results().len();
    let mut results = vec![Val::I32(0); arity];
    func.call(store.as_context_mut(), &params, &mut results)
        .map_err(into_bridge_error)?;
    results
        .iter()
        .map(|v| {
            v.i32()
                .map(|n| n as Word)
                .ok_or_else(|| BridgeError::Trap("guest returned a non-i32 value".to_string()))
        })
        .collect()
}

/// Map a wasmtime error onto the fault taxonomy
pub(crate) fn into_bridge_error(err: wasmtime::Error) -> BridgeError {
    if let Some(bridge) = err.downcast_ref::<BridgeError>() {
        return bridge.clone();
    }
    if let Some(trap) = err.downcast_ref::<wasmtime::Trap>() {
        return BridgeError::Trap(trap.to_string());
    }
    BridgeError::Trap(format!("{err:#}"))
}
