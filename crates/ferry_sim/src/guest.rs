//! Reference account guest running in-process over flat memory.
//!
//! Each account is a small allocation in guest memory whose address serves
//! as the object pointer. Key material never leaves the guest: the host only
//! sees the derived address, the public key and signatures, all returned as
//! string handles through the `ferry` imports.

use crate::journal::Journal;
use ferry_bridge::{imports, FlatMemory, GuestContext, HostState, StatusRecord};
use ferry_core::{BridgeConfig, BridgeError, BridgeResult, ErrorCode, Handle, Word};
use std::collections::HashMap;

/// Trampoline slot delivering an event to a listener closure
pub const LISTENER_INVOKE: Word = 1;
/// Trampoline slot tearing a listener down
pub const LISTENER_DTOR: Word = 2;

const KEY_CONTEXT: &str = "ferry sim 2024-01-01 account secret";
const ACCOUNT_SIZE: Word = 16;

#[derive(Debug)]
struct Account {
    secret: [u8; 32],
    public_key: [u8; 32],
    nonce: Word,
    pending: Option<String>,
    sessions: Vec<String>,
    events: Vec<String>,
    listeners: Word,
    next_listener: Word,
}

impl Account {
    fn derive(seed: &[u8]) -> Self {
        let secret = blake3::derive_key(KEY_CONTEXT, seed);
        Self {
            secret,
            public_key: *blake3::hash(&secret).as_bytes(),
            nonce: 0,
            pending: None,
            sessions: Vec::new(),
            events: Vec::new(),
            listeners: 0,
            next_listener: 1,
        }
    }

    fn address(&self) -> String {
        format!("0x{}", hex::encode(&self.public_key[..20]))
    }

    fn sign(&mut self, message: &[u8]) -> String {
        let mut hasher = blake3::Hasher::new_keyed(&self.secret);
        hasher.update(&self.nonce.to_le_bytes());
        hasher.update(message);
        self.nonce += 1;
        hasher.finalize().to_hex().to_string()
    }
}

/// In-process guest holding account objects
pub struct SimGuest {
    memory: FlatMemory,
    host: HostState,
    accounts: HashMap<Word, Account>,
    journal: Journal,
    refuse_frees: bool,
}

impl SimGuest {
    /// Create a guest with the configured memory limit
    #[must_use]
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            memory: FlatMemory::new(config.memory.clone()),
            host: HostState::new(config),
            accounts: HashMap::new(),
            journal: Journal::new(),
            refuse_frees: false,
        }
    }

    /// Journal of every non-allocator export this guest ran
    #[must_use]
    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// Accounts not yet freed
    #[must_use]
    pub fn live_accounts(&self) -> usize {
        self.accounts.len()
    }

    /// Listener closures not yet destroyed, across all accounts
    #[must_use]
    pub fn live_listeners(&self) -> Word {
        self.accounts.values().map(|a| a.listeners).sum()
    }

    /// Make `ferry_free` trap until reset
    #[cfg(test)]
    pub(crate) fn refuse_frees(&mut self, refuse: bool) {
        self.refuse_frees = refuse;
    }

    /// Outstanding guest allocations
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.memory.live_allocations()
    }

    fn account(&mut self, ptr: Word) -> BridgeResult<&mut Account> {
        self.accounts
            .get_mut(&ptr)
            .ok_or_else(|| BridgeError::Trap(format!("no account at 0x{ptr:X}")))
    }

    fn bytes(&self, ptr: Word, len: Word) -> BridgeResult<Vec<u8>> {
        self.memory
            .read(ptr, len)
            .map(<[u8]>::to_vec)
            .ok_or(BridgeError::OutOfBounds {
                ptr,
                len,
                memory_size: self.memory.data().len(),
            })
    }

    fn text(&self, ptr: Word, len: Word) -> BridgeResult<String> {
        String::from_utf8(self.bytes(ptr, len)?).map_err(|e| BridgeError::Decode {
            ptr,
            len,
            valid_up_to: e.utf8_error().valid_up_to(),
        })
    }

    /// Copy bytes into a scratch allocation
    fn stage(&mut self, bytes: &[u8]) -> BridgeResult<(Word, Word)> {
        let len = Word::try_from(bytes.len()).map_err(|_| BridgeError::AllocationFailed { size: Word::MAX })?;
        let ptr = self.memory.alloc(len, 1);
        if ptr == 0 {
            return Err(BridgeError::AllocationFailed { size: len });
        }
        self.memory.write(ptr, bytes);
        Ok((ptr, len))
    }

    fn succeed(&mut self, retptr: Word, value: Handle) -> BridgeResult<Vec<Word>> {
        StatusRecord::ok(value).write(self, retptr)?;
        Ok(vec![])
    }

    fn succeed_with_str(&mut self, retptr: Word, text: &str) -> BridgeResult<Vec<Word>> {
        let (ptr, len) = self.stage(text.as_bytes())?;
        let handle = imports::string_new(self, ptr, len);
        self.memory.free(ptr, len, 1);
        self.succeed(retptr, Handle(handle))
    }

    fn fail(&mut self, retptr: Word, code: ErrorCode, message: &str) -> BridgeResult<Vec<Word>> {
        let (ptr, len) = self.stage(message.as_bytes())?;
        let err = imports::throw(self, code.as_u32(), ptr, len, 0, 0);
        self.memory.free(ptr, len, 1);
        StatusRecord::err(Handle(err)).write(self, retptr)?;
        Ok(vec![])
    }

    fn account_new(&mut self, seed_ptr: Word, seed_len: Word, retptr: Word) -> BridgeResult<Vec<Word>> {
        let seed = self.bytes(seed_ptr, seed_len)?;
        if seed.is_empty() {
            return self.fail(retptr, ErrorCode::InvalidKey, "empty seed");
        }
        let ptr = self.memory.alloc(ACCOUNT_SIZE, 8);
        if ptr == 0 {
            return self.fail(retptr, ErrorCode::StorageFailed, "out of account storage");
        }
        self.accounts.insert(ptr, Account::derive(&seed));
        self.succeed(retptr, Handle(ptr))
    }

    fn account_sign(&mut self, ptr: Word, msg_ptr: Word, msg_len: Word, retptr: Word) -> BridgeResult<Vec<Word>> {
        let message = self.bytes(msg_ptr, msg_len)?;
        if message.is_empty() {
            return self.fail(retptr, ErrorCode::SigningFailed, "refusing to sign an empty message");
        }
        let signature = self.account(ptr)?.sign(&message);
        self.succeed_with_str(retptr, &signature)
    }

    fn session_begin(&mut self, ptr: Word, key_ptr: Word, key_len: Word, retptr: Word) -> BridgeResult<Vec<Word>> {
        let key = self.text(key_ptr, key_len)?;
        let account = self.account(ptr)?;
        if account.pending.is_some() {
            return self.fail(retptr, ErrorCode::SessionConflict, "another session is being registered");
        }
        if account.sessions.contains(&key) {
            return self.fail(retptr, ErrorCode::SessionConflict, "session already registered");
        }
        account.pending = Some(key);
        self.succeed(retptr, Handle::UNDEFINED)
    }

    fn session_commit(&mut self, ptr: Word, retptr: Word) -> BridgeResult<Vec<Word>> {
        let account = self.account(ptr)?;
        match account.pending.take() {
            Some(key) => {
                account.sessions.push(key);
                self.succeed(retptr, Handle::UNDEFINED)
            }
            None => self.fail(retptr, ErrorCode::SessionConflict, "no session pending"),
        }
    }

    fn account_subscribe(&mut self, ptr: Word) -> BridgeResult<Vec<Word>> {
        let account = self.account(ptr)?;
        let id = account.next_listener;
        account.next_listener += 1;
        account.listeners += 1;
        let handle = imports::closure_new(self, ptr, id, LISTENER_INVOKE, LISTENER_DTOR);
        if handle == 0 {
            self.account(ptr)?.listeners -= 1;
        }
        Ok(vec![handle])
    }

    fn account_free(&mut self, ptr: Word) -> BridgeResult<Vec<Word>> {
        if self.accounts.remove(&ptr).is_none() {
            return Err(BridgeError::Trap(format!("double free of account 0x{ptr:X}")));
        }
        self.memory.free(ptr, ACCOUNT_SIZE, 8);
        Ok(vec![])
    }

    fn deliver(&mut self, ptr: Word, event: Word) -> BridgeResult<Vec<Word>> {
        let retptr = self.memory.alloc(8, 4);
        if retptr == 0 {
            return Err(BridgeError::AllocationFailed { size: 8 });
        }
        let status = imports::string_get(self, event, retptr);
        let words = (self.memory.read_word(retptr), self.memory.read_word(retptr + 4));
        self.memory.free(retptr, 8, 4);
        // a pending error is picked up by the caller at the call boundary
        let (1, (Some(text_ptr), Some(text_len))) = (status, words) else {
            return Ok(vec![Handle::UNDEFINED.word()]);
        };
        let text = self.text(text_ptr, text_len);
        self.memory.free(text_ptr, text_len, 1);
        let text = text?;
        self.account(ptr)?.events.push(text);
        Ok(vec![Handle::UNDEFINED.word()])
    }
}

impl Default for SimGuest {
    fn default() -> Self {
        Self::new(&BridgeConfig::default())
    }
}

impl std::fmt::Debug for SimGuest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimGuest")
            .field("accounts", &self.accounts.len())
            .field("allocations", &self.memory.live_allocations())
            .finish()
    }
}

fn arg(args: &[Word], index: usize, export: &str) -> BridgeResult<Word> {
    args.get(index)
        .copied()
        .ok_or_else(|| BridgeError::Trap(format!("{export}: missing argument {index}")))
}

impl GuestContext for SimGuest {
    fn host(&mut self) -> &mut HostState {
        &mut self.host
    }

    fn memory_and_host(&mut self) -> BridgeResult<(&mut [u8], &mut HostState)> {
        Ok((self.memory.data_mut(), &mut self.host))
    }

    fn call_export(&mut self, name: &str, args: &[Word]) -> BridgeResult<Vec<Word>> {
        let a = |i| arg(args, i, name);
        match name {
            "ferry_malloc" => return Ok(vec![self.memory.alloc(a(0)?, a(1)?)]),
            "ferry_realloc" => return Ok(vec![self.memory.realloc(a(0)?, a(1)?, a(2)?, a(3)?)]),
            "ferry_free" => {
                if self.refuse_frees {
                    return Err(BridgeError::Trap("free refused".into()));
                }
                self.memory.free(a(0)?, a(1)?, a(2)?);
                return Ok(vec![]);
            }
            _ => {}
        }

        self.journal.record(name);
        match name {
            "account_new" => self.account_new(a(0)?, a(1)?, a(2)?),
            "account_address" => {
                let address = self.account(a(0)?)?.address();
                self.succeed_with_str(a(1)?, &address)
            }
            "account_public_key" => {
                let key = hex::encode(self.account(a(0)?)?.public_key);
                self.succeed_with_str(a(1)?, &key)
            }
            "account_sign" => self.account_sign(a(0)?, a(1)?, a(2)?, a(3)?),
            "account_nonce" => Ok(vec![self.account(a(0)?)?.nonce]),
            "session_begin" => self.session_begin(a(0)?, a(1)?, a(2)?, a(3)?),
            "session_commit" => self.session_commit(a(0)?, a(1)?),
            "session_abort" => {
                self.account(a(0)?)?.pending = None;
                Ok(vec![])
            }
            "session_count" => {
                let count = self.account(a(0)?)?.sessions.len();
                Ok(vec![Word::try_from(count).unwrap_or(Word::MAX)])
            }
            "account_subscribe" => self.account_subscribe(a(0)?),
            "account_events" => {
                let count = self.account(a(0)?)?.events.len();
                Ok(vec![Word::try_from(count).unwrap_or(Word::MAX)])
            }
            "account_free" => self.account_free(a(0)?),
            _ => Err(BridgeError::MissingExport(name.to_string())),
        }
    }

    fn call_slot(&mut self, slot: Word, args: &[Word]) -> BridgeResult<Vec<Word>> {
        let a = |i| arg(args, i, "trampoline");
        match slot {
            LISTENER_INVOKE => self.deliver(a(0)?, a(2)?),
            LISTENER_DTOR => {
                // the account may already be gone
                if let Some(account) = self.accounts.get_mut(&a(0)?) {
                    account.listeners = account.listeners.saturating_sub(1);
                }
                self.journal.record("listener_dtor");
                Ok(vec![])
            }
            _ => Err(BridgeError::InvalidSlot { slot }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_bridge::{Bridge, HostValue};

    fn bridge() -> Bridge<SimGuest> {
        Bridge::new(SimGuest::default())
    }

    fn create(bridge: &mut Bridge<SimGuest>, seed: &[u8]) -> BridgeResult<Word> {
        let (ptr, len) = bridge.pass_bytes(seed)?;
        let account = bridge.call_fallible_raw("account_new", &[ptr, len]);
        bridge.free_bytes(ptr, len)?;
        Ok(account?.word())
    }

    #[test]
    fn test_same_seed_same_address() {
        let mut bridge = bridge();
        let a = create(&mut bridge, b"seed").unwrap();
        let b = create(&mut bridge, b"seed").unwrap();
        assert_ne!(a, b);
        let addr_a = bridge.call_fallible("account_address", &[a]).unwrap();
        let addr_b = bridge.call_fallible("account_address", &[b]).unwrap();
        assert_eq!(addr_a, addr_b);
        let addr = addr_a.into_string().unwrap();
        assert!(addr.starts_with("0x"));
        assert_eq!(addr.len(), 42);
    }

    #[test]
    fn test_empty_seed_is_invalid_key() {
        let mut bridge = bridge();
        let err = create(&mut bridge, b"").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidKey));
        assert_eq!(bridge.guest().live_accounts(), 0);
    }

    #[test]
    fn test_sign_advances_nonce() {
        let mut bridge = bridge();
        let account = create(&mut bridge, b"seed").unwrap();
        let (msg, len) = bridge.pass_bytes(b"hello").unwrap();
        let first = bridge.call_fallible("account_sign", &[account, msg, len]).unwrap();
        let second = bridge.call_fallible("account_sign", &[account, msg, len]).unwrap();
        assert_ne!(first, second);
        assert_eq!(bridge.call("account_nonce", &[account]).unwrap(), vec![2]);
    }

    #[test]
    fn test_session_conflicts() {
        let mut bridge = bridge();
        let account = create(&mut bridge, b"seed").unwrap();
        let key = bridge.pass_str("k1").unwrap();
        bridge.call_fallible("session_begin", &[account, key.ptr, key.len]).unwrap();
        let err = bridge
            .call_fallible("session_begin", &[account, key.ptr, key.len])
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::SessionConflict));
        bridge.call_fallible("session_commit", &[account]).unwrap();
        let err = bridge.call_fallible("session_commit", &[account]).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::SessionConflict));
        assert_eq!(bridge.call("session_count", &[account]).unwrap(), vec![1]);
    }

    #[test]
    fn test_listener_receives_events_and_is_destroyed_once() {
        let mut bridge = bridge();
        let account = create(&mut bridge, b"seed").unwrap();
        let handle = bridge.call("account_subscribe", &[account]).unwrap()[0];
        let listener = bridge.host().take(Handle(handle)).unwrap().into_closure().unwrap();
        assert_eq!(bridge.guest().live_listeners(), 1);

        bridge.invoke_closure(&listener, HostValue::from("block 1")).unwrap();
        bridge.invoke_closure(&listener, HostValue::from("block 2")).unwrap();
        assert_eq!(bridge.call("account_events", &[account]).unwrap(), vec![2]);

        assert!(bridge.release_closure(&listener).unwrap());
        assert_eq!(bridge.guest().live_listeners(), 0);
        assert!(bridge.invoke_closure(&listener, HostValue::from("late")).is_err());
    }

    #[test]
    fn test_non_string_event_surfaces_at_call_site() {
        let mut bridge = bridge();
        let account = create(&mut bridge, b"seed").unwrap();
        let handle = bridge.call("account_subscribe", &[account]).unwrap()[0];
        let listener = bridge.host().take(Handle(handle)).unwrap().into_closure().unwrap();
        let err = bridge.invoke_closure(&listener, HostValue::Number(1.0)).unwrap_err();
        assert!(matches!(err, BridgeError::TypeMismatch { .. }));
        assert_eq!(bridge.call("account_events", &[account]).unwrap(), vec![0]);
        bridge.release_closure(&listener).unwrap();
    }

    proptest::proptest! {
        #[test]
        fn prop_address_depends_only_on_seed(seed in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..64)) {
            let mut bridge = bridge();
            let a = create(&mut bridge, &seed).unwrap();
            let (msg, len) = bridge.pass_bytes(b"advance").unwrap();
            bridge.call_fallible("account_sign", &[a, msg, len]).unwrap();
            let b = create(&mut bridge, &seed).unwrap();
            let first = bridge.call_fallible("account_address", &[a]).unwrap();
            let second = bridge.call_fallible("account_address", &[b]).unwrap();
            proptest::prop_assert_eq!(first, second);
        }
    }

    #[test]
    fn test_free_returns_memory() {
        let mut bridge = bridge();
        let account = create(&mut bridge, b"seed").unwrap();
        bridge.call("account_free", &[account]).unwrap();
        assert_eq!(bridge.guest().live_accounts(), 0);
        assert!(bridge.call("account_free", &[account]).is_err());
        assert_eq!(bridge.guest().journal().position("account_free"), Some(1));
    }
}
