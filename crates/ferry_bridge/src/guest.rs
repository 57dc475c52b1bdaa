//! The seam between the bridge and a concrete guest.
//!
//! A [`GuestContext`] is whatever currently owns the guest: the top-level
//! store before a call, or the caller handle a host import receives while
//! guest frames are live. Both expose the same four capabilities, so every
//! marshaling routine is written once against this trait.

use crate::host::HostState;
use ferry_core::{BridgeError, BridgeResult, Word};

/// Access to a guest and the host state that travels with it
pub trait GuestContext {
    /// Host-side bookkeeping
    fn host(&mut self) -> &mut HostState;

    /// Current linear memory alongside the host state
    ///
    /// # Errors
    ///
    /// Returns error if the guest has no memory
    fn memory_and_host(&mut self) -> BridgeResult<(&mut [u8], &mut HostState)>;

    /// Call an exported entry point; runs to completion
    ///
    /// # Errors
    ///
    /// Returns error if the export is missing or the guest traps
    fn call_export(&mut self, name: &str, args: &[Word]) -> BridgeResult<Vec<Word>>;

    /// Call a trampoline slot from the guest's callback table
    ///
    /// # Errors
    ///
    /// Returns error if the slot is empty or the guest traps
    fn call_slot(&mut self, slot: Word, args: &[Word]) -> BridgeResult<Vec<Word>>;
}

/// Call an export and mark every view stale afterwards
///
/// # Errors
///
/// Propagates guest failures
pub fn call<C: GuestContext + ?Sized>(
    ctx: &mut C,
    name: &str,
    args: &[Word],
) -> BridgeResult<Vec<Word>> {
    tracing::trace!(export = name, ?args, "enter guest");
    let result = ctx.call_export(name, args);
    ctx.host().views.invalidate();
    tracing::trace!(export = name, ok = result.is_ok(), "leave guest");
    result
}

/// Call a trampoline slot and mark every view stale afterwards
///
/// # Errors
///
/// Propagates guest failures
pub fn call_slot<C: GuestContext + ?Sized>(
    ctx: &mut C,
    slot: Word,
    args: &[Word],
) -> BridgeResult<Vec<Word>> {
    tracing::trace!(slot, ?args, "enter trampoline");
    let result = ctx.call_slot(slot, args);
    ctx.host().views.invalidate();
    result
}

/// First result word of a call
///
/// # Errors
///
/// Returns error if the call produced no results
pub fn first_word(results: &[Word], what: &str) -> BridgeResult<Word> {
    results
        .first()
        .copied()
        .ok_or_else(|| BridgeError::Trap(format!("{what} returned no value")))
}

/// Allocate guest memory
///
/// # Errors
///
/// Returns error if the allocator fails or returns null
pub fn malloc<C: GuestContext + ?Sized>(ctx: &mut C, size: Word, align: Word) -> BridgeResult<Word> {
    let name = ctx.host().exports.malloc.clone();
    let ptr = first_word(&call(ctx, &name, &[size, align])?, &name)?;
    if ptr == 0 {
        return Err(BridgeError::AllocationFailed { size });
    }
    Ok(ptr)
}

/// Resize a guest allocation
///
/// # Errors
///
/// Returns error if the allocator fails or returns null
pub fn realloc<C: GuestContext + ?Sized>(
    ctx: &mut C,
    ptr: Word,
    old: Word,
    new: Word,
    align: Word,
) -> BridgeResult<Word> {
    let name = ctx.host().exports.realloc.clone();
    let moved = first_word(&call(ctx, &name, &[ptr, old, new, align])?, &name)?;
    if moved == 0 {
        return Err(BridgeError::AllocationFailed { size: new });
    }
    Ok(moved)
}

/// Free guest memory
///
/// # Errors
///
/// Propagates guest failures
pub fn free<C: GuestContext + ?Sized>(
    ctx: &mut C,
    ptr: Word,
    size: Word,
    align: Word,
) -> BridgeResult<()> {
    let name = ctx.host().exports.free.clone();
    call(ctx, &name, &[ptr, size, align]).map(drop)
}

/// Copy bytes out of guest memory through a fresh view
///
/// # Errors
///
/// Returns error if the range is out of bounds
pub fn read_bytes<C: GuestContext + ?Sized>(ctx: &mut C, ptr: Word, len: Word) -> BridgeResult<Vec<u8>> {
    let (mem, host) = ctx.memory_and_host()?;
    Ok(host.views.bytes(mem).slice(ptr, len)?.to_vec())
}

/// Copy bytes into guest memory through a fresh view
///
/// # Errors
///
/// Returns error if the range is out of bounds
pub fn write_bytes<C: GuestContext + ?Sized>(ctx: &mut C, ptr: Word, bytes: &[u8]) -> BridgeResult<()> {
    let (mem, host) = ctx.memory_and_host()?;
    host.views.bytes_mut(mem).write(ptr, bytes)
}

/// Read consecutive words through a fresh view
///
/// # Errors
///
/// Returns error if misaligned or out of bounds
pub fn read_words<C: GuestContext + ?Sized>(ctx: &mut C, ptr: Word, count: usize) -> BridgeResult<Vec<Word>> {
    let (mem, host) = ctx.memory_and_host()?;
    host.views.words(mem).read_run(ptr, count)
}

/// Write consecutive words through a fresh view
///
/// # Errors
///
/// Returns error if misaligned or out of bounds
pub fn write_words<C: GuestContext + ?Sized>(ctx: &mut C, ptr: Word, words: &[Word]) -> BridgeResult<()> {
    let (mem, host) = ctx.memory_and_host()?;
    host.views.words_mut(mem).write_run(ptr, words)
}

/// Convert a host length to a guest word
///
/// # Errors
///
/// Returns error if the length does not fit the guest's address space
pub fn to_word(len: usize) -> BridgeResult<Word> {
    Word::try_from(len).map_err(|_| BridgeError::AllocationFailed { size: Word::MAX })
}
