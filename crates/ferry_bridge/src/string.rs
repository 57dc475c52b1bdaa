//! Text to and from guest byte ranges.
//!
//! Encoding allocates one byte per UTF-16 code unit and copies the ASCII
//! prefix straight in. On the first non-ASCII character the buffer is
//! reallocated to the worst case for the rest (three bytes per unit), the
//! remainder is written, and the allocation is shrunk to the bytes actually
//! used. Decoding is strict: malformed UTF-8 is a fault.

use crate::guest::{self, GuestContext};
use ferry_core::{BridgeError, BridgeResult, Word};

/// A UTF-8 string living in guest memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestStr {
    /// Start address
    pub ptr: Word,
    /// Length in bytes (also the allocation size)
    pub len: Word,
}

/// Worst-case UTF-8 bytes per UTF-16 code unit
const MAX_BYTES_PER_UNIT: usize = 3;

/// Copy `text` into a fresh guest allocation
///
/// # Errors
///
/// Returns error if allocation fails or a write is out of bounds
pub fn encode<C: GuestContext + ?Sized>(ctx: &mut C, text: &str) -> BridgeResult<GuestStr> {
    let units = guest::to_word(text.encode_utf16().count())?;
    let ptr = guest::malloc(ctx, units, 1)?;
    let ascii = text.bytes().position(|b| !b.is_ascii()).unwrap_or(text.len());

    if let Err(err) = guest::write_bytes(ctx, ptr, &text.as_bytes()[..ascii]) {
        release_on_error(ctx, ptr, units);
        return Err(err);
    }
    if ascii == text.len() {
        return Ok(GuestStr { ptr, len: units });
    }

    let rest = &text[ascii..];
    // a failed realloc leaves the old allocation live
    let grown = guest::to_word(ascii + rest.encode_utf16().count() * MAX_BYTES_PER_UNIT)
        .and_then(|worst| Ok((guest::realloc(ctx, ptr, units, worst, 1)?, worst)));
    let (ptr, worst) = match grown {
        Ok(grown) => grown,
        Err(err) => {
            release_on_error(ctx, ptr, units);
            return Err(err);
        }
    };
    let written = guest::to_word(ascii)
        .and_then(|offset| guest::write_bytes(ctx, ptr + offset, rest.as_bytes()));
    if let Err(err) = written {
        release_on_error(ctx, ptr, worst);
        return Err(err);
    }

    let shrunk = guest::to_word(text.len())
        .and_then(|len| Ok((guest::realloc(ctx, ptr, worst, len, 1)?, len)));
    match shrunk {
        Ok((ptr, len)) => {
            tracing::trace!(ptr, len, units, "encoded non-ascii string");
            Ok(GuestStr { ptr, len })
        }
        Err(err) => {
            release_on_error(ctx, ptr, worst);
            Err(err)
        }
    }
}

fn release_on_error<C: GuestContext + ?Sized>(ctx: &mut C, ptr: Word, size: Word) {
    if let Err(err) = guest::free(ctx, ptr, size, 1) {
        tracing::warn!(ptr, error = %err, "failed to free partially encoded string");
    }
}

/// Read UTF-8 text from guest memory
///
/// # Errors
///
/// Returns `Decode` on malformed UTF-8 and `OutOfBounds` for a bad range
pub fn decode<C: GuestContext + ?Sized>(ctx: &mut C, ptr: Word, len: Word) -> BridgeResult<String> {
    let (mem, host) = ctx.memory_and_host()?;
    let bytes = host.views.bytes(mem).slice(ptr, len)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| BridgeError::Decode {
            ptr,
            len,
            valid_up_to: e.valid_up_to(),
        })
}

/// Free a string previously produced by [`encode`]
///
/// # Errors
///
/// Propagates guest failures
pub fn free_str<C: GuestContext + ?Sized>(ctx: &mut C, s: GuestStr) -> BridgeResult<()> {
    guest::free(ctx, s.ptr, s.len, 1)
}
