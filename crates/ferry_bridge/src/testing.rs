//! In-process guest used by this crate's unit tests.

use crate::closure::GuestClosure;
use crate::error_channel::StatusRecord;
use crate::flat::FlatMemory;
use crate::guest::GuestContext;
use crate::host::HostState;
use crate::imports;
use ferry_core::{BridgeError, BridgeResult, Handle, Word};

pub(crate) const INVOKE_SLOT: Word = 1;
pub(crate) const DTOR_SLOT: Word = 2;

type Export = fn(&mut ScratchGuest, &[Word]) -> BridgeResult<Vec<Word>>;

pub(crate) struct ScratchGuest {
    pub(crate) memory: FlatMemory,
    pub(crate) host: HostState,
    pub(crate) reallocs: usize,
    pub(crate) fail_alloc: bool,
    /// 1-based realloc call that returns 0
    pub(crate) fail_realloc_at: Option<usize>,
    pub(crate) invocations: Vec<(Word, Word)>,
    pub(crate) dtor_runs: Vec<(Word, Word)>,
    /// Released from inside the next invocation
    pub(crate) self_closure: Option<GuestClosure>,
}

impl ScratchGuest {
    pub(crate) fn new() -> Self {
        Self {
            memory: FlatMemory::default(),
            host: HostState::default(),
            reallocs: 0,
            fail_alloc: false,
            fail_realloc_at: None,
            invocations: Vec::new(),
            dtor_runs: Vec::new(),
            self_closure: None,
        }
    }

    fn export(name: &str) -> Option<Export> {
        let f: Export = match name {
            "ferry_malloc" => |g, args| {
                let ptr = if g.fail_alloc { 0 } else { g.memory.alloc(args[0], args[1]) };
                Ok(vec![ptr])
            },
            "ferry_realloc" => |g, args| {
                g.reallocs += 1;
                if g.fail_realloc_at == Some(g.reallocs) {
                    return Ok(vec![0]);
                }
                Ok(vec![g.memory.realloc(args[0], args[1], args[2], args[3])])
            },
            "ferry_free" => |g, args| {
                g.memory.free(args[0], args[1], args[2]);
                Ok(vec![])
            },
            "grow" => |g, _| {
                g.memory.grow(1).ok_or_else(|| BridgeError::Trap("grow".into()))?;
                Ok(vec![])
            },
            "detach" => |g, _| {
                g.memory.detach();
                Ok(vec![])
            },
            "ok_but_ignore" => |g, args| {
                let retptr = args[0];
                let name = g.memory.alloc(7, 1);
                g.memory.write(name, b"missing");
                imports::call_host(g, name, 7, 0, 0);
                let msg = g.memory.alloc(2, 1);
                g.memory.write(msg, b"ok");
                let handle = imports::string_new(g, msg, 2);
                StatusRecord::ok(Handle(handle)).write(g, retptr)?;
                Ok(vec![])
            },
            "ok_string" => |g, args| {
                let retptr = args[0];
                let msg = b"ok";
                let ptr = g.memory.alloc(2, 1);
                g.memory.write(ptr, msg);
                let handle = imports::string_new(g, ptr, 2);
                StatusRecord::ok(Handle(handle)).write(g, retptr)?;
                Ok(vec![])
            },
            "fail_with" => |g, args| {
                let (code, retptr) = (args[0], args[1]);
                let msg = g.memory.alloc(4, 1);
                g.memory.write(msg, b"fail");
                let detail = g.memory.alloc(6, 1);
                g.memory.write(detail, b"detail");
                let err = imports::throw(g, code, msg, 4, detail, 6);
                StatusRecord::err(Handle(err)).write(g, retptr)?;
                Ok(vec![])
            },
            "raise_and_ignore" => |g, _| {
                let name = g.memory.alloc(7, 1);
                g.memory.write(name, b"missing");
                imports::call_host(g, name, 7, 0, 0);
                Ok(vec![])
            },
            _ => return None,
        };
        Some(f)
    }
}

impl GuestContext for ScratchGuest {
    fn host(&mut self) -> &mut HostState {
        &mut self.host
    }

    fn memory_and_host(&mut self) -> BridgeResult<(&mut [u8], &mut HostState)> {
        Ok((self.memory.data_mut(), &mut self.host))
    }

    fn call_export(&mut self, name: &str, args: &[Word]) -> BridgeResult<Vec<Word>> {
        let f = Self::export(name).ok_or_else(|| BridgeError::MissingExport(name.to_string()))?;
        f(self, args)
    }

    fn call_slot(&mut self, slot: Word, args: &[Word]) -> BridgeResult<Vec<Word>> {
        match slot {
            INVOKE_SLOT => {
                self.invocations.push((args[0], args[1]));
                if let Some(closure) = self.self_closure.take() {
                    closure.release(self)?;
                }
                Ok(vec![imports::heap_clone(self, args[2])])
            }
            DTOR_SLOT => {
                self.dtor_runs.push((args[0], args[1]));
                Ok(vec![])
            }
            _ => Err(BridgeError::InvalidSlot { slot }),
        }
    }
}
