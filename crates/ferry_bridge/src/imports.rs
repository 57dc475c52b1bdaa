//! The `ferry` import module, written once against [`GuestContext`].
//!
//! A wasm linker wraps each of these in a host function; in-process guests
//! call them directly. Every import that can fail runs under
//! [`shield`](crate::error_channel::shield), so nothing unwinds into guest
//! frames: a failure returns 0 and leaves the error pending for `take_error`.

use crate::closure::GuestClosure;
use crate::collection;
use crate::error_channel::shield;
use crate::guest::{self, GuestContext};
use crate::string;
use crate::value::HostValue;
use ferry_core::{DomainError, ErrorCode, Handle, Word};

/// `call_host(name_ptr, name_len, args_ptr, args_len) -> handle`
pub fn call_host<C: GuestContext + ?Sized>(
    ctx: &mut C,
    name_ptr: Word,
    name_len: Word,
    args_ptr: Word,
    args_len: Word,
) -> Word {
    shield(ctx, "call_host", |ctx| {
        let name = string::decode(ctx, name_ptr, name_len)?;
        let args = collection::read_values(ctx, args_ptr, args_len)?;
        let function = ctx.host().function(&name)?;
        tracing::trace!(function = %name, args = args.len(), "guest calls host");
        let result = function.call(&args)?;
        Ok(ctx.host().intern(result).word())
    })
}

/// `string_new(ptr, len) -> handle`
pub fn string_new<C: GuestContext + ?Sized>(ctx: &mut C, ptr: Word, len: Word) -> Word {
    shield(ctx, "string_new", |ctx| {
        let text = string::decode(ctx, ptr, len)?;
        Ok(ctx.host().intern(HostValue::String(text)).word())
    })
}

/// `string_get(handle, retptr) -> status`: writes `(ptr, len)` at `retptr`
pub fn string_get<C: GuestContext + ?Sized>(ctx: &mut C, handle: Word, retptr: Word) -> Word {
    shield(ctx, "string_get", |ctx| {
        let value = ctx.host().value(Handle(handle))?;
        let text = value.as_str().ok_or_else(|| value.mismatch("string"))?;
        let s = string::encode(ctx, text)?;
        guest::write_words(ctx, retptr, &[s.ptr, s.len])?;
        Ok(1)
    })
}

/// `take_error() -> handle`, 0 when nothing is pending
pub fn take_error<C: GuestContext + ?Sized>(ctx: &mut C) -> Word {
    ctx.host()
        .errors
        .take_pending()
        .map_or(Handle::UNDEFINED.word(), Handle::word)
}

/// `throw(code, msg_ptr, msg_len, detail_ptr, detail_len) -> handle`.
/// A null `detail_ptr` means no detail.
pub fn throw<C: GuestContext + ?Sized>(
    ctx: &mut C,
    code: Word,
    msg_ptr: Word,
    msg_len: Word,
    detail_ptr: Word,
    detail_len: Word,
) -> Word {
    shield(ctx, "throw", |ctx| {
        let message = string::decode(ctx, msg_ptr, msg_len)?;
        let mut err = DomainError::new(ErrorCode::from_u32(code), message);
        if detail_ptr != 0 {
            err = err.with_detail(string::decode(ctx, detail_ptr, detail_len)?);
        }
        Ok(ctx.host().intern(HostValue::Error(err.into())).word())
    })
}

/// `heap_clone(handle) -> handle`: a second handle to the same value
pub fn heap_clone<C: GuestContext + ?Sized>(ctx: &mut C, handle: Word) -> Word {
    shield(ctx, "heap_clone", |ctx| {
        let host = ctx.host();
        let value = host.value(Handle(handle))?;
        Ok(host.intern(value).word())
    })
}

/// `heap_drop(handle)`
pub fn heap_drop<C: GuestContext + ?Sized>(ctx: &mut C, handle: Word) {
    ctx.host().release(Handle(handle));
}

/// `closure_new(a, b, invoke_slot, dtor_slot) -> handle`
pub fn closure_new<C: GuestContext + ?Sized>(
    ctx: &mut C,
    a: Word,
    b: Word,
    invoke_slot: Word,
    dtor_slot: Word,
) -> Word {
    shield(ctx, "closure_new", |ctx| {
        let finalizers = ctx.host().finalizers();
        let closure = GuestClosure::new(a, b, invoke_slot, dtor_slot, finalizers)?;
        Ok(ctx.host().intern(HostValue::Closure(closure)).word())
    })
}

/// `closure_drop(handle) -> destroyed`: gives up the guest's reference
pub fn closure_drop<C: GuestContext + ?Sized>(ctx: &mut C, handle: Word) -> Word {
    shield(ctx, "closure_drop", |ctx| {
        let closure = ctx.host().take(Handle(handle))?.into_closure()?;
        let destroyed = closure.release(ctx)?;
        Ok(Word::from(destroyed))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_channel::surface_unobserved;
    use crate::host::HostFunction;
    use crate::testing::{DTOR_SLOT, INVOKE_SLOT, ScratchGuest};
    use ferry_core::BridgeError;

    fn put(guest: &mut ScratchGuest, bytes: &[u8]) -> (Word, Word) {
        let ptr = guest.memory.alloc(bytes.len() as Word, 4);
        guest.memory.write(ptr, bytes);
        (ptr, bytes.len() as Word)
    }

    #[test]
    fn test_call_host_with_args() {
        let mut guest = ScratchGuest::new();
        guest.host.register(HostFunction::new("concat", |args| {
            let joined: String = args.iter().filter_map(HostValue::as_str).collect();
            Ok(HostValue::String(joined))
        }));
        let (name_ptr, name_len) = put(&mut guest, b"concat");
        let a = guest.host.intern(HostValue::from("fe"));
        let b = guest.host.intern(HostValue::from("rry"));
        let args = guest.memory.alloc(8, 4);
        guest.memory.write_word(args, a.word());
        guest.memory.write_word(args + 4, b.word());

        let out = call_host(&mut guest, name_ptr, name_len, args, 2);
        assert_eq!(guest.host.take(Handle(out)).unwrap(), HostValue::from("ferry"));
        // arguments are borrowed, not consumed
        assert!(guest.host.heap().is_live(a));
    }

    #[test]
    fn test_call_host_unknown_function_is_pending() {
        let mut guest = ScratchGuest::new();
        let (name_ptr, name_len) = put(&mut guest, b"missing");
        assert_eq!(call_host(&mut guest, name_ptr, name_len, 0, 0), 0);
        let err = take_error(&mut guest);
        assert_ne!(err, 0);
        assert_eq!(take_error(&mut guest), 0);
        assert!(matches!(
            guest.host.take(Handle(err)).unwrap(),
            HostValue::Error(BridgeError::UnknownHostFunction(_))
        ));
    }

    #[test]
    fn test_string_new_and_get() {
        let mut guest = ScratchGuest::new();
        let (ptr, len) = put(&mut guest, "caf\u{e9}".as_bytes());
        let handle = string_new(&mut guest, ptr, len);
        let retptr = guest.memory.alloc(8, 4);
        assert_eq!(string_get(&mut guest, handle, retptr), 1);
        let out_ptr = guest.memory.read_word(retptr).unwrap();
        let out_len = guest.memory.read_word(retptr + 4).unwrap();
        assert_eq!(guest.memory.read(out_ptr, out_len), Some("caf\u{e9}".as_bytes()));
    }

    #[test]
    fn test_string_get_on_number_is_type_mismatch() {
        let mut guest = ScratchGuest::new();
        let handle = guest.host.intern(HostValue::Number(1.0));
        assert_eq!(string_get(&mut guest, handle.word(), 64), 0);
        assert!(matches!(
            surface_unobserved(&mut guest),
            Err(BridgeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_throw_preserves_code_message_detail() {
        let mut guest = ScratchGuest::new();
        let (msg_ptr, msg_len) = put(&mut guest, b"session taken");
        let (detail_ptr, detail_len) = put(&mut guest, b"{\"id\":7}");
        let handle = throw(&mut guest, 4000, msg_ptr, msg_len, detail_ptr, detail_len);
        let HostValue::Error(err) = guest.host.take(Handle(handle)).unwrap() else {
            panic!("expected error value");
        };
        let domain = err.as_domain().unwrap();
        assert_eq!(domain.code, ErrorCode::SessionConflict);
        assert_eq!(domain.message, "session taken");
        assert_eq!(domain.detail.as_deref(), Some("{\"id\":7}"));

        let bare = throw(&mut guest, 77, msg_ptr, msg_len, 0, 0);
        let HostValue::Error(err) = guest.host.take(Handle(bare)).unwrap() else {
            panic!("expected error value");
        };
        assert_eq!(err.code(), Some(ErrorCode::Unrecognized(77)));
        assert_eq!(err.as_domain().unwrap().detail, None);
    }

    #[test]
    fn test_heap_clone_and_drop() {
        let mut guest = ScratchGuest::new();
        let h = guest.host.intern(HostValue::from("v"));
        let c = heap_clone(&mut guest, h.word());
        assert_ne!(c, h.word());
        heap_drop(&mut guest, h.word());
        assert_eq!(guest.host.value(Handle(c)).unwrap(), HostValue::from("v"));
        heap_drop(&mut guest, Handle::TRUE.word());
        assert!(guest.host.heap().is_live(Handle::TRUE));
    }

    #[test]
    fn test_closure_new_and_drop() {
        let mut guest = ScratchGuest::new();
        let handle = closure_new(&mut guest, 0x80, 1, INVOKE_SLOT, DTOR_SLOT);
        assert!(!Handle(handle).is_sentinel());
        assert_eq!(closure_drop(&mut guest, handle), 1);
        assert_eq!(guest.dtor_runs, vec![(0x80, 1)]);
        assert!(guest.host.finalizers().is_empty());
    }

    #[test]
    fn test_closure_new_null_context() {
        let mut guest = ScratchGuest::new();
        assert_eq!(closure_new(&mut guest, 0, 1, INVOKE_SLOT, DTOR_SLOT), 0);
        assert!(guest.host.has_pending_error());
    }
}
