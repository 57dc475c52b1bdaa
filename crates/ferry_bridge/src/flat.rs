//! Flat growable linear memory with a simple guest-side allocator.
//!
//! In-process guests use this as their linear memory. Growing always moves
//! the buffer to a fresh allocation, and `detach` swaps it out without
//! changing its contents, so view invalidation is observable.

use ferry_core::{MemoryLimit, PAGE_SIZE, Word};
use std::collections::BTreeMap;

/// Bytes kept unallocated at the bottom so that 0 stays a null pointer
const NULL_GUARD: Word = 16;

/// Growable linear memory plus allocator
#[derive(Debug, Clone)]
pub struct FlatMemory {
    buf: Vec<u8>,
    next: Word,
    live: BTreeMap<Word, Word>,
    free: Vec<(Word, Word)>,
    limit: MemoryLimit,
}

impl FlatMemory {
    /// Create memory with the limit's initial pages
    #[must_use]
    pub fn new(limit: MemoryLimit) -> Self {
        let pages = limit.initial_pages().max(1);
        Self {
            buf: vec![0; (pages * PAGE_SIZE) as usize],
            next: NULL_GUARD,
            live: BTreeMap::new(),
            free: Vec::new(),
            limit,
        }
    }

    /// Current contents
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Current contents, mutable
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Size in pages
    #[must_use]
    pub fn pages(&self) -> u64 {
        self.buf.len() as u64 / PAGE_SIZE
    }

    /// Grow by `delta` pages, returning the previous page count.
    ///
    /// The buffer always moves, even when `delta` is zero capacity-wise.
    pub fn grow(&mut self, delta: u64) -> Option<u64> {
        let old = self.pages();
        let new = old.checked_add(delta)?;
        if !self.limit.pages_within_limit(new) {
            return None;
        }
        let mut moved = Vec::with_capacity((new * PAGE_SIZE) as usize);
        moved.extend_from_slice(&self.buf);
        moved.resize((new * PAGE_SIZE) as usize, 0);
        self.buf = moved;
        Some(old)
    }

    /// Move the contents to a new buffer of the same size
    pub fn detach(&mut self) {
        let moved = self.buf.clone();
        self.buf = moved;
    }

    /// Allocate `size` bytes. Returns 0 when the limit is reached.
    pub fn alloc(&mut self, size: Word, align: Word) -> Word {
        let align = align.max(1);
        let size = size.max(1);
        if let Some(pos) = self
            .free
            .iter()
            .position(|(ptr, cap)| *cap >= size && ptr % align == 0)
        {
            let (ptr, cap) = self.free.swap_remove(pos);
            self.live.insert(ptr, cap);
            return ptr;
        }
        let Some(ptr) = self.next.checked_next_multiple_of(align) else {
            return 0;
        };
        let Some(end) = ptr.checked_add(size) else {
            return 0;
        };
        while end as usize > self.buf.len() {
            let needed = MemoryLimit::bytes_to_pages(u64::from(end) - self.buf.len() as u64);
            if self.grow(needed).is_none() {
                return 0;
            }
        }
        self.next = end;
        self.live.insert(ptr, size);
        ptr
    }

    /// Resize an allocation, copying the overlapping prefix
    pub fn realloc(&mut self, ptr: Word, old: Word, new: Word, align: Word) -> Word {
        if ptr == 0 {
            return self.alloc(new, align);
        }
        match self.live.get(&ptr).copied() {
            Some(cap) if new <= cap => ptr,
            Some(_) => {
                let fresh = self.alloc(new, align);
                if fresh == 0 {
                    return 0;
                }
                let keep = old.min(new) as usize;
                self.buf
                    .copy_within(ptr as usize..ptr as usize + keep, fresh as usize);
                self.free(ptr, old, align);
                fresh
            }
            None => 0,
        }
    }

    /// Return an allocation to the free list
    pub fn free(&mut self, ptr: Word, _size: Word, _align: Word) {
        if let Some(cap) = self.live.remove(&ptr) {
            self.free.push((ptr, cap));
        }
    }

    /// Number of outstanding allocations
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    /// Guest-side read of raw bytes; `None` if out of range
    #[must_use]
    pub fn read(&self, ptr: Word, len: Word) -> Option<&[u8]> {
        let start = ptr as usize;
        self.buf.get(start..start.checked_add(len as usize)?)
    }

    /// Guest-side write of raw bytes; `false` if out of range
    pub fn write(&mut self, ptr: Word, bytes: &[u8]) -> bool {
        let start = ptr as usize;
        match self.buf.get_mut(start..start + bytes.len()) {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Guest-side read of one little-endian word
    #[must_use]
    pub fn read_word(&self, ptr: Word) -> Option<Word> {
        let raw = self.read(ptr, 4)?;
        Some(Word::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Guest-side write of one little-endian word
    pub fn write_word(&mut self, ptr: Word, value: Word) -> bool {
        self.write(ptr, &value.to_le_bytes())
    }
}

impl Default for FlatMemory {
    fn default() -> Self {
        Self::new(MemoryLimit::default())
    }
}
