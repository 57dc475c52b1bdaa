//! Wiring the `ferry` import module into a wasmtime linker.

use crate::guest::{CallerContext, WasmState};
use ferry_bridge::abi::{IMPORT_MODULE, import};
use ferry_bridge::imports;
use wasmtime::{Caller, Linker};

type Cx<'c> = Caller<'c, WasmState>;

/// Define every `ferry` import on the linker
///
/// # Errors
///
/// Returns error if a name is already defined
pub fn link_imports(linker: &mut Linker<WasmState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        IMPORT_MODULE,
        import::CALL_HOST,
        |c: Cx<'_>, name_ptr: u32, name_len: u32, args_ptr: u32, args_len: u32| -> u32 {
            imports::call_host(&mut CallerContext(c), name_ptr, name_len, args_ptr, args_len)
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        import::STRING_NEW,
        |c: Cx<'_>, ptr: u32, len: u32| -> u32 { imports::string_new(&mut CallerContext(c), ptr, len) },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        import::STRING_GET,
        |c: Cx<'_>, handle: u32, retptr: u32| -> u32 {
            imports::string_get(&mut CallerContext(c), handle, retptr)
        },
    )?;
    linker.func_wrap(IMPORT_MODULE, import::TAKE_ERROR, |c: Cx<'_>| -> u32 {
        imports::take_error(&mut CallerContext(c))
    })?;
    linker.func_wrap(
        IMPORT_MODULE,
        import::THROW,
        |c: Cx<'_>, code: u32, msg_ptr: u32, msg_len: u32, detail_ptr: u32, detail_len: u32| -> u32 {
            imports::throw(&mut CallerContext(c), code, msg_ptr, msg_len, detail_ptr, detail_len)
        },
    )?;
    linker.func_wrap(IMPORT_MODULE, import::HEAP_CLONE, |c: Cx<'_>, handle: u32| -> u32 {
        imports::heap_clone(&mut CallerContext(c), handle)
    })?;
    linker.func_wrap(IMPORT_MODULE, import::HEAP_DROP, |c: Cx<'_>, handle: u32| {
        imports::heap_drop(&mut CallerContext(c), handle);
    })?;
    linker.func_wrap(
        IMPORT_MODULE,
        import::CLOSURE_NEW,
        |c: Cx<'_>, a: u32, b: u32, invoke_slot: u32, dtor_slot: u32| -> u32 {
            imports::closure_new(&mut CallerContext(c), a, b, invoke_slot, dtor_slot)
        },
    )?;
    linker.func_wrap(IMPORT_MODULE, import::CLOSURE_DROP, |c: Cx<'_>, handle: u32| -> u32 {
        imports::closure_drop(&mut CallerContext(c), handle)
    })?;
    Ok(())
}
