//! Carrying failures across the guest boundary without unwinding through it.
//!
//! Host code that runs because the guest called an import is wrapped in
//! [`shield`]. An error or panic there becomes an error handle marked
//! pending; the import returns a neutral word and the guest picks the
//! handle up with `take_error`. The guest unwinds its own frames and
//! reports the failure through a status record, which the outermost call
//! site turns back into a `BridgeError`.

use crate::guest::{self, GuestContext};
use crate::value::HostValue;
use ferry_core::{BridgeError, BridgeResult, DomainError, ErrorCode, Handle, Word};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Pending-error slot for one guest
#[derive(Debug, Default)]
pub struct ErrorChannel {
    pending: Option<Handle>,
    captured: u64,
}

impl ErrorChannel {
    /// Create an empty channel
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a handle as the pending error, returning any handle it displaces
    pub fn raise(&mut self, handle: Handle) -> Option<Handle> {
        self.captured += 1;
        self.pending.replace(handle)
    }

    /// Take the pending error handle
    pub fn take_pending(&mut self) -> Option<Handle> {
        self.pending.take()
    }

    /// Whether an error is pending
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Total number of errors captured
    #[must_use]
    pub fn captured(&self) -> u64 {
        self.captured
    }
}

/// Run host code on behalf of the guest, capturing errors and panics.
///
/// Returns the closure's word on success and 0 (the undefined handle) on
/// failure, with the error left pending for the guest.
pub fn shield<C, F>(ctx: &mut C, import: &str, f: F) -> Word
where
    C: GuestContext + ?Sized,
    F: FnOnce(&mut C) -> BridgeResult<Word>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&mut *ctx)));
    let err = match outcome {
        Ok(Ok(word)) => return word,
        Ok(Err(err)) => err,
        Err(payload) => BridgeError::HostPanic(panic_message(payload.as_ref())),
    };
    tracing::debug!(import, error = %err, "host error captured for guest");
    raise(ctx, err);
    0
}

/// Register an error as the guest's pending error
pub fn raise<C: GuestContext + ?Sized>(ctx: &mut C, err: BridgeError) {
    let host = ctx.host();
    let handle = host.intern(HostValue::Error(err));
    if let Some(displaced) = host.errors.raise(handle) {
        tracing::warn!(%displaced, "pending error replaced before the guest observed it");
        host.release(displaced);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "host function panicked".to_string()
    }
}

/// Convert a value the guest reported as an error into a `BridgeError`
#[must_use]
pub fn error_from_value(value: HostValue) -> BridgeError {
    match value {
        HostValue::Error(err) => err,
        HostValue::String(message) => DomainError::new(ErrorCode::Internal, message).into(),
        other => other.mismatch("error"),
    }
}

/// Surface an error the guest never took, if any
///
/// # Errors
///
/// Returns the unobserved error
pub fn surface_unobserved<C: GuestContext + ?Sized>(ctx: &mut C) -> BridgeResult<()> {
    let Some(handle) = ctx.host().errors.take_pending() else {
        return Ok(());
    };
    let err = error_from_value(ctx.host().take(handle)?);
    tracing::warn!(error = %err, "guest returned without observing a host error");
    Err(err)
}

/// Tri-word status record a fallible export writes at its `retptr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    /// Result handle when successful
    pub value: Handle,
    /// Error handle when failed
    pub error: Handle,
    /// Failure flag
    pub is_error: bool,
}

impl StatusRecord {
    /// Size in bytes
    pub const SIZE: Word = 12;

    /// Successful record
    #[must_use]
    pub fn ok(value: Handle) -> Self {
        Self {
            value,
            error: Handle::UNDEFINED,
            is_error: false,
        }
    }

    /// Failed record
    #[must_use]
    pub fn err(error: Handle) -> Self {
        Self {
            value: Handle::UNDEFINED,
            error,
            is_error: true,
        }
    }

    /// Read a record from guest memory
    ///
    /// # Errors
    ///
    /// Returns error if the address is misaligned or out of bounds
    pub fn read<C: GuestContext + ?Sized>(ctx: &mut C, ptr: Word) -> BridgeResult<Self> {
        let words = guest::read_words(ctx, ptr, 3)?;
        Ok(Self {
            value: Handle(words[0]),
            error: Handle(words[1]),
            is_error: words[2] != 0,
        })
    }

    /// Write a record into guest memory
    ///
    /// # Errors
    ///
    /// Returns error if the address is misaligned or out of bounds
    pub fn write<C: GuestContext + ?Sized>(&self, ctx: &mut C, ptr: Word) -> BridgeResult<()> {
        guest::write_words(
            ctx,
            ptr,
            &[self.value.word(), self.error.word(), Word::from(self.is_error)],
        )
    }

    /// Result handle, or the error the guest reported
    ///
    /// # Errors
    ///
    /// Returns the reported error, or `InvalidHandle` if the error handle is dead
    pub fn resolve<C: GuestContext + ?Sized>(self, ctx: &mut C) -> BridgeResult<Handle> {
        if !self.is_error {
            return Ok(self.value);
        }
        Err(error_from_value(ctx.host().take(self.error)?))
    }
}

/// Address of the bridge's status area, allocating it on first use
///
/// # Errors
///
/// Returns error if the allocation fails
pub fn status_area<C: GuestContext + ?Sized>(ctx: &mut C) -> BridgeResult<Word> {
    if let Some(ptr) = ctx.host().status_area {
        return Ok(ptr);
    }
    let ptr = guest::malloc(ctx, StatusRecord::SIZE, 4)?;
    ctx.host().status_area = Some(ptr);
    Ok(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScratchGuest;

    #[test]
    fn test_shield_passes_success_through() {
        let mut guest = ScratchGuest::new();
        assert_eq!(shield(&mut guest, "t", |_| Ok(17)), 17);
        assert!(!guest.host.has_pending_error());
    }

    #[test]
    fn test_shield_captures_domain_error() {
        let mut guest = ScratchGuest::new();
        let word = shield(&mut guest, "t", |_| {
            Err(DomainError::new(ErrorCode::StorageFailed, "disk").with_detail("ENOSPC").into())
        });
        assert_eq!(word, 0);
        let handle = guest.host.errors.take_pending().unwrap();
        let err = error_from_value(guest.host.take(handle).unwrap());
        let domain = err.as_domain().unwrap();
        assert_eq!(domain.code, ErrorCode::StorageFailed);
        assert_eq!(domain.detail.as_deref(), Some("ENOSPC"));
    }

    #[test]
    fn test_shield_captures_panic() {
        let mut guest = ScratchGuest::new();
        let word = shield(&mut guest, "t", |_| -> BridgeResult<Word> { panic!("boom") });
        assert_eq!(word, 0);
        assert!(matches!(
            surface_unobserved(&mut guest),
            Err(BridgeError::HostPanic(msg)) if msg == "boom"
        ));
        assert!(surface_unobserved(&mut guest).is_ok());
        assert_eq!(guest.host.heap().live_count(), 0);
    }

    #[test]
    fn test_second_raise_releases_displaced() {
        let mut guest = ScratchGuest::new();
        raise(&mut guest, BridgeError::Trap("first".into()));
        raise(&mut guest, BridgeError::Trap("second".into()));
        assert_eq!(guest.host.heap().live_count(), 1);
        assert_eq!(guest.host.errors.captured(), 2);
        assert!(matches!(
            surface_unobserved(&mut guest),
            Err(BridgeError::Trap(msg)) if msg == "second"
        ));
    }

    #[test]
    fn test_status_record_roundtrip_and_resolve() {
        let mut guest = ScratchGuest::new();
        let area = status_area(&mut guest).unwrap();
        assert_eq!(status_area(&mut guest).unwrap(), area);
        assert_eq!(area % 4, 0);

        StatusRecord::ok(Handle::TRUE).write(&mut guest, area).unwrap();
        let record = StatusRecord::read(&mut guest, area).unwrap();
        assert_eq!(record.resolve(&mut guest).unwrap(), Handle::TRUE);

        let err = guest
            .host
            .intern(HostValue::Error(DomainError::new(ErrorCode::RateLimited, "slow").into()));
        StatusRecord::err(err).write(&mut guest, area).unwrap();
        let record = StatusRecord::read(&mut guest, area).unwrap();
        let surfaced = record.resolve(&mut guest).unwrap_err();
        assert_eq!(surfaced.code(), Some(ErrorCode::RateLimited));
        assert!(!guest.host.heap().is_live(err));
    }

    #[test]
    fn test_error_from_string_value() {
        let err = error_from_value(HostValue::from("plain"));
        assert_eq!(err.code(), Some(ErrorCode::Internal));
        assert!(matches!(
            error_from_value(HostValue::Number(1.0)),
            BridgeError::TypeMismatch { .. }
        ));
    }
}
