//! Ordered runs of handles in guest memory.
//!
//! A collection crosses the boundary as a contiguous run of handle words.
//! The values stay host-owned: the guest may dereference them for the
//! duration of the call, and must `heap_clone` anything it keeps.

use crate::guest::{self, GuestContext};
use crate::value::HostValue;
use ferry_core::{BridgeResult, Handle, Word};

const WORD_BYTES: Word = 4;

/// A run of handle words in guest memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleRun {
    /// Start address (word-aligned)
    pub ptr: Word,
    /// Handles written, in order
    pub handles: Vec<Handle>,
}

impl HandleRun {
    /// Number of handles
    #[must_use]
    pub fn len(&self) -> Word {
        self.handles.len() as Word
    }

    /// Whether the run is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Intern `values` and write their handles as one run
///
/// # Errors
///
/// Returns error if allocation or the write fails; interned handles are
/// released again in that case
pub fn pass_values<C, I>(ctx: &mut C, values: I) -> BridgeResult<HandleRun>
where
    C: GuestContext + ?Sized,
    I: IntoIterator<Item = HostValue>,
{
    let handles: Vec<Handle> = values.into_iter().map(|v| ctx.host().intern(v)).collect();
    pass_handles(ctx, &handles).inspect_err(|_| {
        for handle in &handles {
            ctx.host().release(*handle);
        }
    })
}

/// Write existing handles as one run without interning anything
///
/// # Errors
///
/// Returns error if allocation or the write fails
pub fn pass_handles<C: GuestContext + ?Sized>(ctx: &mut C, handles: &[Handle]) -> BridgeResult<HandleRun> {
    let size = guest::to_word(handles.len())?
        .checked_mul(WORD_BYTES)
        .ok_or(ferry_core::BridgeError::AllocationFailed { size: Word::MAX })?;
    let ptr = guest::malloc(ctx, size, WORD_BYTES)?;
    let words: Vec<Word> = handles.iter().map(|h| h.word()).collect();
    if let Err(err) = guest::write_words(ctx, ptr, &words) {
        if let Err(free_err) = guest::free(ctx, ptr, size, WORD_BYTES) {
            tracing::warn!(ptr, error = %free_err, "failed to free handle run");
        }
        return Err(err);
    }
    Ok(HandleRun {
        ptr,
        handles: handles.to_vec(),
    })
}

/// Free the run's buffer and release its handles
///
/// # Errors
///
/// Propagates guest failures from the free call
pub fn release_run<C: GuestContext + ?Sized>(ctx: &mut C, run: HandleRun) -> BridgeResult<()> {
    for handle in &run.handles {
        ctx.host().release(*handle);
    }
    guest::free(ctx, run.ptr, run.len() * WORD_BYTES, WORD_BYTES)
}

/// Read a run of handle words written by the guest
///
/// # Errors
///
/// Returns error if the run is misaligned or out of bounds
pub fn read_handles<C: GuestContext + ?Sized>(ctx: &mut C, ptr: Word, count: Word) -> BridgeResult<Vec<Handle>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    Ok(guest::read_words(ctx, ptr, count as usize)?
        .into_iter()
        .map(Handle)
        .collect())
}

/// Clone the values behind a run of handles, leaving the handles live
///
/// # Errors
///
/// Returns error if any handle is invalid
pub fn read_values<C: GuestContext + ?Sized>(ctx: &mut C, ptr: Word, count: Word) -> BridgeResult<Vec<HostValue>> {
    let handles = read_handles(ctx, ptr, count)?;
    let host = ctx.host();
    handles.into_iter().map(|h| host.value(h)).collect()
}

/// Copy bytes into a fresh guest allocation
///
/// # Errors
///
/// Returns error if allocation or the write fails
pub fn pass_bytes<C: GuestContext + ?Sized>(ctx: &mut C, bytes: &[u8]) -> BridgeResult<(Word, Word)> {
    let len = guest::to_word(bytes.len())?;
    let ptr = guest::malloc(ctx, len, 1)?;
    guest::write_bytes(ctx, ptr, bytes)?;
    Ok((ptr, len))
}

/// Copy bytes out of guest memory as scalar data
///
/// # Errors
///
/// Returns error if the range is out of bounds
pub fn copy_bytes<C: GuestContext + ?Sized>(ctx: &mut C, ptr: Word, len: Word) -> BridgeResult<Vec<u8>> {
    guest::read_bytes(ctx, ptr, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScratchGuest;
    use ferry_core::BridgeError;

    #[test]
    fn test_pass_values_writes_contiguous_run() {
        let mut guest = ScratchGuest::new();
        let run = pass_values(
            &mut guest,
            [HostValue::from("a"), HostValue::Null, HostValue::Number(3.0)],
        )
        .unwrap();
        assert_eq!(run.len(), 3);
        assert_eq!(run.ptr % 4, 0);
        assert_eq!(run.handles[1], Handle::NULL);
        for (i, handle) in run.handles.iter().enumerate() {
            assert_eq!(guest.memory.read_word(run.ptr + 4 * i as Word), Some(handle.word()));
        }
        let values = read_values(&mut guest, run.ptr, run.len()).unwrap();
        assert_eq!(values[0], HostValue::from("a"));
        assert_eq!(values[2], HostValue::Number(3.0));
        // reading borrows
        assert_eq!(guest.host.heap().live_count(), 2);
    }

    #[test]
    fn test_release_run_returns_everything() {
        let mut guest = ScratchGuest::new();
        let run = pass_values(&mut guest, [HostValue::from("x"), HostValue::from("y")]).unwrap();
        let ptr = run.ptr;
        release_run(&mut guest, run).unwrap();
        assert_eq!(guest.host.heap().live_count(), 0);
        assert_eq!(guest.memory.live_allocations(), 0);
        assert!(read_values(&mut guest, ptr, 2).is_err());
    }

    #[test]
    fn test_failed_pass_releases_handles() {
        let mut guest = ScratchGuest::new();
        guest.fail_alloc = true;
        assert!(matches!(
            pass_values(&mut guest, [HostValue::from("x")]),
            Err(BridgeError::AllocationFailed { .. })
        ));
        assert_eq!(guest.host.heap().live_count(), 0);
    }

    #[test]
    fn test_empty_run() {
        let mut guest = ScratchGuest::new();
        let run = pass_values(&mut guest, std::iter::empty()).unwrap();
        assert!(run.is_empty());
        assert!(read_handles(&mut guest, run.ptr, 0).unwrap().is_empty());
    }

    #[test]
    fn test_bytes_copy_out() {
        let mut guest = ScratchGuest::new();
        let (ptr, len) = pass_bytes(&mut guest, &[1, 2, 3]).unwrap();
        assert_eq!(copy_bytes(&mut guest, ptr, len).unwrap(), vec![1, 2, 3]);
    }
}
