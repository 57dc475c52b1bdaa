//! In-process counter guest for this crate's tests.

use crate::cell::GuestCell;
use ferry_bridge::{imports, Bridge, FlatMemory, GuestContext, HostState, StatusRecord};
use ferry_core::{BridgeError, BridgeResult, ErrorCode, Handle, Word};

pub(crate) struct CounterGuest {
    memory: FlatMemory,
    host: HostState,
    objects: usize,
    pub(crate) log: Vec<String>,
}

impl CounterGuest {
    pub(crate) const REJECTED: Word = 0xDEAD;

    pub(crate) fn new() -> Self {
        Self {
            memory: FlatMemory::default(),
            host: HostState::default(),
            objects: 0,
            log: Vec::new(),
        }
    }

    pub(crate) fn live_objects(&self) -> usize {
        self.objects
    }

    fn load(&self, ptr: Word) -> BridgeResult<Word> {
        self.memory
            .read_word(ptr)
            .ok_or(BridgeError::Trap(format!("bad object 0x{ptr:X}")))
    }
}

pub(crate) fn counter_cell() -> GuestCell<CounterGuest> {
    GuestCell::new(Bridge::new(CounterGuest::new()))
}

impl GuestContext for CounterGuest {
    fn host(&mut self) -> &mut HostState {
        &mut self.host
    }

    fn memory_and_host(&mut self) -> BridgeResult<(&mut [u8], &mut HostState)> {
        Ok((self.memory.data_mut(), &mut self.host))
    }

    fn call_export(&mut self, name: &str, args: &[Word]) -> BridgeResult<Vec<Word>> {
        match name {
            "ferry_malloc" => Ok(vec![self.memory.alloc(args[0], args[1])]),
            "ferry_realloc" => Ok(vec![self.memory.realloc(args[0], args[1], args[2], args[3])]),
            "ferry_free" => {
                self.memory.free(args[0], args[1], args[2]);
                Ok(vec![])
            }
            "counter_new" => {
                let (start, retptr) = (args[0], args[1]);
                let record = if start == Self::REJECTED {
                    let msg = b"rejected start";
                    let ptr = self.memory.alloc(msg.len() as Word, 1);
                    self.memory.write(ptr, msg);
                    let err = imports::throw(self, ErrorCode::Internal.as_u32(), ptr, msg.len() as Word, 0, 0);
                    StatusRecord::err(Handle(err))
                } else {
                    let ptr = self.memory.alloc(4, 4);
                    self.memory.write_word(ptr, start);
                    self.objects += 1;
                    StatusRecord::ok(Handle(ptr))
                };
                record.write(self, retptr)?;
                Ok(vec![])
            }
            "counter_add" => {
                let (ptr, delta) = (args[0], args[1]);
                let value = self.load(ptr)? + delta;
                self.memory.write_word(ptr, value);
                self.log.push(format!("add {delta}"));
                Ok(vec![value])
            }
            "counter_get" => Ok(vec![self.load(args[0])?]),
            "counter_free" => {
                self.objects -= 1;
                self.memory.free(args[0], 4, 4);
                Ok(vec![])
            }
            _ => Err(BridgeError::MissingExport(name.to_string())),
        }
    }

    fn call_slot(&mut self, slot: Word, _args: &[Word]) -> BridgeResult<Vec<Word>> {
        Err(BridgeError::InvalidSlot { slot })
    }
}
