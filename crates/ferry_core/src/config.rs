//! Bridge configuration.

use crate::limits::MemoryLimit;
use serde::{Deserialize, Serialize};

/// Configuration shared by every guest backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Linear memory cap
    pub memory: MemoryLimit,
    /// Fuel budget per bridge, if metering is wanted
    pub max_fuel: Option<u64>,
    /// Slots to pre-size the handle table with
    pub heap_capacity: usize,
    /// Guest allocator export
    pub malloc_export: String,
    /// Guest reallocator export
    pub realloc_export: String,
    /// Guest deallocator export
    pub free_export: String,
}

impl BridgeConfig {
    /// Create a config with defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            memory: MemoryLimit::default(),
            max_fuel: None,
            heap_capacity: 128,
            malloc_export: "ferry_malloc".to_string(),
            realloc_export: "ferry_realloc".to_string(),
            free_export: "ferry_free".to_string(),
        }
    }

    /// Set memory limit
    #[must_use]
    pub fn with_memory_limit(mut self, limit: MemoryLimit) -> Self {
        self.memory = limit;
        self
    }

    /// Set fuel budget
    #[must_use]
    pub fn with_max_fuel(mut self, fuel: u64) -> Self {
        self.max_fuel = Some(fuel);
        self
    }

    /// Set initial handle table capacity
    #[must_use]
    pub fn with_heap_capacity(mut self, capacity: usize) -> Self {
        self.heap_capacity = capacity;
        self
    }

    /// Parse from JSON; missing fields fall back to defaults
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or the result is inconsistent
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency
    ///
    /// # Errors
    ///
    /// Returns error describing the first inconsistent field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory.max_pages == 0 {
            return Err(ConfigError::Invalid {
                field: "memory.max_pages".to_string(),
                reason: "must allow at least one page".to_string(),
            });
        }
        if self.memory.initial_bytes > self.memory.max_bytes {
            return Err(ConfigError::Invalid {
                field: "memory.initial_bytes".to_string(),
                reason: "exceeds max_bytes".to_string(),
            });
        }
        for (field, name) in [
            ("malloc_export", &self.malloc_export),
            ("realloc_export", &self.realloc_export),
            ("free_export", &self.free_export),
        ] {
            if name.is_empty() {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: "export name is empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Input could not be parsed
    #[error("Config parse error: {0}")]
    Parse(String),

    /// Field value is inconsistent
    #[error("Invalid config field {field}: {reason}")]
    Invalid { field: String, reason: String },
}
