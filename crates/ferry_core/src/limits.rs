//! Memory limits for guest linear memory.

use serde::{Deserialize, Serialize};

/// Linear memory page size (64 KiB)
pub const PAGE_SIZE: u64 = 65536;

/// Memory limit configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimit {
    /// Maximum memory in bytes
    pub max_bytes: u64,
    /// Initial memory in bytes
    pub initial_bytes: u64,
    /// Maximum number of pages
    pub max_pages: u64,
}

impl MemoryLimit {
    /// Create a new memory limit
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            initial_bytes: max_bytes.min(PAGE_SIZE),
            max_pages: max_bytes.div_ceil(PAGE_SIZE),
        }
    }

    /// Create from a page count
    #[must_use]
    pub fn with_pages(max_pages: u64) -> Self {
        Self {
            max_bytes: max_pages * PAGE_SIZE,
            initial_bytes: PAGE_SIZE.min(max_pages * PAGE_SIZE),
            max_pages,
        }
    }

    /// Convert bytes to pages, rounding up
    #[must_use]
    pub fn bytes_to_pages(bytes: u64) -> u64 {
        bytes.div_ceil(PAGE_SIZE)
    }

    /// Initial page count
    #[must_use]
    pub fn initial_pages(&self) -> u64 {
        Self::bytes_to_pages(self.initial_bytes)
    }

    /// Check if byte count is within limit
    #[must_use]
    pub fn within_limit(&self, bytes: u64) -> bool {
        bytes <= self.max_bytes
    }

    /// Check if page count is within limit
    #[must_use]
    pub fn pages_within_limit(&self, pages: u64) -> bool {
        pages <= self.max_pages
    }
}

impl Default for MemoryLimit {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_limit_new() {
        let limit = MemoryLimit::new(1024 * 1024);
        assert_eq!(limit.max_bytes, 1024 * 1024);
        assert_eq!(limit.max_pages, 16);
        assert_eq!(limit.initial_pages(), 1);
    }

    #[test]
    fn test_memory_limit_with_pages() {
        let limit = MemoryLimit::with_pages(10);
        assert_eq!(limit.max_pages, 10);
        assert_eq!(limit.max_bytes, 10 * PAGE_SIZE);
    }

    #[test]
    fn test_bytes_to_pages() {
        assert_eq!(MemoryLimit::bytes_to_pages(PAGE_SIZE), 1);
        assert_eq!(MemoryLimit::bytes_to_pages(PAGE_SIZE + 1), 2);
        assert_eq!(MemoryLimit::bytes_to_pages(0), 0);
    }

    #[test]
    fn test_within_limit() {
        let limit = MemoryLimit::new(1024);
        assert!(limit.within_limit(1024));
        assert!(!limit.within_limit(1025));
        assert!(limit.pages_within_limit(1));
        assert!(!limit.pages_within_limit(2));
    }

    #[test]
    fn test_default() {
        assert_eq!(MemoryLimit::default().max_bytes, 16 * 1024 * 1024);
    }
}
