//! Memory view cache over the guest's linear memory.
//!
//! A view is a typed window (bytes or little-endian words) borrowed from the
//! guest buffer. Views borrow the guest context, so the borrow checker keeps
//! them from living across a call into guest code. The cache tracks which
//! buffer the last view was built over and a staleness flag raised after
//! every guest call; the next access after either changes rebuilds the view
//! and bumps its generation.

use ferry_core::{BridgeError, BridgeResult, Word};

const WORD: usize = std::mem::size_of::<Word>();

/// Identity of the backing buffer (base address and length)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferIdentity {
    base: usize,
    len: usize,
}

impl BufferIdentity {
    /// Identity of a buffer
    #[must_use]
    pub fn of(buf: &[u8]) -> Self {
        Self {
            base: buf.as_ptr() as usize,
            len: buf.len(),
        }
    }

    /// Buffer length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty (detached buffers report zero length)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Tracks the live view over guest memory
#[derive(Debug, Clone, Default)]
pub struct MemoryViewCache {
    identity: Option<BufferIdentity>,
    stale: bool,
    generation: u64,
}

impl MemoryViewCache {
    /// Create an empty cache; the first access builds a view
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the current view stale
    pub fn invalidate(&mut self) {
        self.stale = true;
    }

    /// Whether the next access will rebuild
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale || self.identity.is_none()
    }

    /// Generation of the most recently built view
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Buffer the most recent view was built over
    #[must_use]
    pub fn identity(&self) -> Option<BufferIdentity> {
        self.identity
    }

    fn refresh(&mut self, buf: &[u8]) -> u64 {
        let identity = BufferIdentity::of(buf);
        if self.stale || self.identity != Some(identity) {
            self.generation += 1;
            if self.identity.is_some_and(|old| old != identity) {
                tracing::debug!(
                    generation = self.generation,
                    len = identity.len,
                    "guest buffer moved, view rebuilt"
                );
            }
            self.identity = Some(identity);
            self.stale = false;
        }
        self.generation
    }

    /// Byte view for reading
    pub fn bytes<'m>(&mut self, buf: &'m [u8]) -> ByteView<'m> {
        let generation = self.refresh(buf);
        ByteView { data: buf, generation }
    }

    /// Byte view for writing
    pub fn bytes_mut<'m>(&mut self, buf: &'m mut [u8]) -> ByteViewMut<'m> {
        let generation = self.refresh(buf);
        ByteViewMut { data: buf, generation }
    }

    /// Word view for reading
    pub fn words<'m>(&mut self, buf: &'m [u8]) -> WordView<'m> {
        let generation = self.refresh(buf);
        WordView { data: buf, generation }
    }

    /// Word view for writing
    pub fn words_mut<'m>(&mut self, buf: &'m mut [u8]) -> WordViewMut<'m> {
        let generation = self.refresh(buf);
        WordViewMut { data: buf, generation }
    }
}

fn range(data_len: usize, ptr: Word, len: Word) -> BridgeResult<std::ops::Range<usize>> {
    let start = ptr as usize;
    start
        .checked_add(len as usize)
        .filter(|end| *end <= data_len)
        .map(|end| start..end)
        .ok_or(BridgeError::OutOfBounds {
            ptr,
            len,
            memory_size: data_len,
        })
}

fn word_range(data_len: usize, ptr: Word, count: usize) -> BridgeResult<std::ops::Range<usize>> {
    if ptr as usize % WORD != 0 {
        return Err(BridgeError::Misaligned { ptr });
    }
    let len = Word::try_from(count * WORD).map_err(|_| BridgeError::OutOfBounds {
        ptr,
        len: Word::MAX,
        memory_size: data_len,
    })?;
    range(data_len, ptr, len)
}

/// Read-only byte window
#[derive(Debug)]
pub struct ByteView<'m> {
    data: &'m [u8],
    generation: u64,
}

impl<'m> ByteView<'m> {
    /// Generation this view was built in
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Identity of the underlying buffer
    #[must_use]
    pub fn identity(&self) -> BufferIdentity {
        BufferIdentity::of(self.data)
    }

    /// Bounds-checked sub-slice
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the buffer
    pub fn slice(&self, ptr: Word, len: Word) -> BridgeResult<&'m [u8]> {
        let r = range(self.data.len(), ptr, len)?;
        Ok(&self.data[r])
    }
}

/// Writable byte window
#[derive(Debug)]
pub struct ByteViewMut<'m> {
    data: &'m mut [u8],
    generation: u64,
}

impl ByteViewMut<'_> {
    /// Generation this view was built in
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bounds-checked mutable sub-slice
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the buffer
    pub fn slice_mut(&mut self, ptr: Word, len: Word) -> BridgeResult<&mut [u8]> {
        let r = range(self.data.len(), ptr, len)?;
        Ok(&mut self.data[r])
    }

    /// Copy bytes in at `ptr`
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the buffer
    pub fn write(&mut self, ptr: Word, bytes: &[u8]) -> BridgeResult<()> {
        let len = Word::try_from(bytes.len()).map_err(|_| BridgeError::OutOfBounds {
            ptr,
            len: Word::MAX,
            memory_size: self.data.len(),
        })?;
        self.slice_mut(ptr, len)?.copy_from_slice(bytes);
        Ok(())
    }
}

/// Read-only word window (little-endian, word-aligned addresses)
#[derive(Debug)]
pub struct WordView<'m> {
    data: &'m [u8],
    generation: u64,
}

impl WordView<'_> {
    /// Generation this view was built in
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Read one word at byte address `ptr`
    ///
    /// # Errors
    ///
    /// Returns error if misaligned or out of bounds
    pub fn get(&self, ptr: Word) -> BridgeResult<Word> {
        let r = word_range(self.data.len(), ptr, 1)?;
        let mut raw = [0u8; WORD];
        raw.copy_from_slice(&self.data[r]);
        Ok(Word::from_le_bytes(raw))
    }

    /// Read `count` consecutive words starting at `ptr`
    ///
    /// # Errors
    ///
    /// Returns error if misaligned or out of bounds
    pub fn read_run(&self, ptr: Word, count: usize) -> BridgeResult<Vec<Word>> {
        let r = word_range(self.data.len(), ptr, count)?;
        Ok(self.data[r]
            .chunks_exact(WORD)
            .map(|chunk| Word::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }
}

/// Writable word window (little-endian, word-aligned addresses)
#[derive(Debug)]
pub struct WordViewMut<'m> {
    data: &'m mut [u8],
    generation: u64,
}

impl WordViewMut<'_> {
    /// Generation this view was built in
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Write one word at byte address `ptr`
    ///
    /// # Errors
    ///
    /// Returns error if misaligned or out of bounds
    pub fn set(&mut self, ptr: Word, value: Word) -> BridgeResult<()> {
        let r = word_range(self.data.len(), ptr, 1)?;
        self.data[r].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write consecutive words starting at `ptr`
    ///
    /// # Errors
    ///
    /// Returns error if misaligned or out of bounds
    pub fn write_run(&mut self, ptr: Word, words: &[Word]) -> BridgeResult<()> {
        let r = word_range(self.data.len(), ptr, words.len())?;
        for (chunk, word) in self.data[r].chunks_exact_mut(WORD).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }
}
