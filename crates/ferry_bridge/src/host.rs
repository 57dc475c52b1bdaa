//! Host-side state that travels with a guest: the handle table, the view
//! cache, the error channel, registered host functions and the finalizer
//! queue.

use crate::error_channel::ErrorChannel;
use crate::heap::HandleTable;
use crate::memory::MemoryViewCache;
use crate::value::HostValue;
use ferry_core::{BridgeConfig, BridgeError, BridgeResult, Handle, Word};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Host function callable from the guest
pub type HostFn = Arc<dyn Fn(&[HostValue]) -> BridgeResult<HostValue> + Send + Sync>;

/// Host function definition
#[derive(Clone)]
pub struct HostFunction {
    /// Function name
    pub name: String,
    /// The function implementation
    implementation: HostFn,
}

impl HostFunction {
    /// Create a new host function
    #[must_use]
    pub fn new<F>(name: impl Into<String>, implementation: F) -> Self
    where
        F: Fn(&[HostValue]) -> BridgeResult<HostValue> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            implementation: Arc::new(implementation),
        }
    }

    /// Call the host function
    ///
    /// # Errors
    ///
    /// Returns whatever the implementation returns
    pub fn call(&self, args: &[HostValue]) -> BridgeResult<HostValue> {
        (self.implementation)(args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction").field("name", &self.name).finish()
    }
}

/// Registry of host functions
#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    functions: HashMap<String, HostFunction>,
}

impl HostRegistry {
    /// Create a new host registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host function, replacing any previous one of that name
    pub fn register(&mut self, func: HostFunction) {
        self.functions.insert(func.name.clone(), func);
    }

    /// Get a function by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HostFunction> {
        self.functions.get(name)
    }

    /// Check if a function exists
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// List all registered function names, sorted
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Cleanup owed to the guest by a value dropped without explicit release
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalizer {
    /// Run a destructor trampoline with the saved closure context
    Slot {
        /// Destructor slot
        slot: Word,
        /// Context word `a`
        a: Word,
        /// Context word `b`
        b: Word,
    },
    /// Call a guest export, e.g. an object's free function
    Export {
        /// Export name
        name: String,
        /// Arguments
        args: Vec<Word>,
    },
}

/// Shared queue of pending finalizers, drained at call boundaries
#[derive(Debug, Clone, Default)]
pub struct FinalizerQueue(Arc<Mutex<Vec<Finalizer>>>);

impl FinalizerQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a finalizer
    pub fn push(&self, finalizer: Finalizer) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(finalizer);
    }

    /// Remove and return everything queued
    #[must_use]
    pub fn drain(&self) -> Vec<Finalizer> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Number queued
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Names of the guest allocator exports
#[derive(Debug, Clone)]
pub(crate) struct AllocatorExports {
    pub(crate) malloc: Arc<str>,
    pub(crate) realloc: Arc<str>,
    pub(crate) free: Arc<str>,
}

/// Everything the host keeps per guest
#[derive(Debug)]
pub struct HostState {
    pub(crate) heap: HandleTable<HostValue>,
    pub(crate) views: crate::memory::MemoryViewCache,
    pub(crate) errors: ErrorChannel,
    pub(crate) functions: HostRegistry,
    pub(crate) finalizers: FinalizerQueue,
    pub(crate) exports: AllocatorExports,
    pub(crate) status_area: Option<Word>,
}

impl HostState {
    /// Create host state for a guest
    #[must_use]
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            heap: HandleTable::with_capacity(
                [
                    HostValue::Undefined,
                    HostValue::Null,
                    HostValue::Bool(true),
                    HostValue::Bool(false),
                ],
                config.heap_capacity,
            ),
            views: MemoryViewCache::new(),
            errors: ErrorChannel::new(),
            functions: HostRegistry::new(),
            finalizers: FinalizerQueue::new(),
            exports: AllocatorExports {
                malloc: config.malloc_export.as_str().into(),
                realloc: config.realloc_export.as_str().into(),
                free: config.free_export.as_str().into(),
            },
            status_area: None,
        }
    }

    /// Store a value, using a sentinel when one fits
    pub fn intern(&mut self, value: HostValue) -> Handle {
        match value.sentinel() {
            Some(handle) => handle,
            None => self.heap.assign(value),
        }
    }

    /// Clone the value behind a handle, leaving it in place
    ///
    /// # Errors
    ///
    /// Returns error if the handle is invalid
    pub fn value(&self, handle: Handle) -> BridgeResult<HostValue> {
        self.heap.get(handle).cloned()
    }

    /// Take the value behind a handle and release the handle
    ///
    /// # Errors
    ///
    /// Returns error if the handle is invalid
    pub fn take(&mut self, handle: Handle) -> BridgeResult<HostValue> {
        self.heap.take(handle)
    }

    /// Release a handle; sentinels are ignored
    pub fn release(&mut self, handle: Handle) {
        self.heap.release(handle);
    }

    /// Read-only access to the handle table
    #[must_use]
    pub fn heap(&self) -> &HandleTable<HostValue> {
        &self.heap
    }

    /// The memory view cache
    pub fn views(&mut self) -> &mut MemoryViewCache {
        &mut self.views
    }

    /// Register a host function
    pub fn register(&mut self, function: HostFunction) {
        tracing::debug!(name = %function.name, "host function registered");
        self.functions.register(function);
    }

    /// Registered host functions
    #[must_use]
    pub fn functions(&self) -> &HostRegistry {
        &self.functions
    }

    /// Look up a host function for a guest call
    ///
    /// # Errors
    ///
    /// Returns error if no function has that name
    pub fn function(&self, name: &str) -> BridgeResult<HostFunction> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownHostFunction(name.to_string()))
    }

    /// Handle to the finalizer queue
    #[must_use]
    pub fn finalizers(&self) -> FinalizerQueue {
        self.finalizers.clone()
    }

    /// Whether an error is waiting for the guest to observe it
    #[must_use]
    pub fn has_pending_error(&self) -> bool {
        self.errors.has_pending()
    }
}

impl Default for HostState {
    fn default() -> Self {
        Self::new(&BridgeConfig::default())
    }
}
