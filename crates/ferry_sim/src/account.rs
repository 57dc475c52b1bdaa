//! Typed account facade.
//!
//! [`AccountCore`] is the surface application code uses. It hides pointers,
//! handles and status areas: arguments go in as host types, results and
//! errors come back as host types. The address and public key are fixed at
//! construction and served from the companion snapshot; everything else
//! runs inside an exclusive session.

use crate::guest::SimGuest;
use crate::policy::{SessionPolicy, SessionRequest};
use ferry_bridge::{Bridge, GuestClosure, HostValue};
use ferry_core::{BridgeError, BridgeResult, Handle, Word};
use ferry_sync::{GuestCell, SplitView};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fields fixed when the account is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Derived address
    pub address: String,
    /// Public key, hex encoded
    pub public_key: String,
}

fn snapshot(bridge: &mut Bridge<SimGuest>, ptr: Word) -> BridgeResult<AccountInfo> {
    Ok(AccountInfo {
        address: bridge.call_fallible("account_address", &[ptr])?.into_string()?,
        public_key: bridge.call_fallible("account_public_key", &[ptr])?.into_string()?,
    })
}

/// A guest-held account shared by any number of async callers
#[derive(Clone)]
pub struct AccountCore {
    view: SplitView<SimGuest, AccountInfo>,
}

impl AccountCore {
    /// Derive an account from seed bytes
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` for an empty seed, or any bridge fault
    pub fn create(cell: &GuestCell<SimGuest>, seed: &[u8]) -> BridgeResult<Self> {
        let (seed_ptr, seed_len) = cell.with(|bridge| bridge.pass_bytes(seed))?;
        let view = SplitView::construct(
            cell,
            "account_new",
            &[seed_ptr, seed_len],
            "account_free",
            snapshot,
        );
        cell.with(|bridge| bridge.free_bytes(seed_ptr, seed_len))?;
        let view = view?;
        tracing::debug!(address = %view.fields().address, "account created");
        Ok(Self { view })
    }

    /// The account address; never waits
    #[must_use]
    pub fn address(&self) -> &str {
        &self.view.fields().address
    }

    /// The public key; never waits
    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.view.fields().public_key
    }

    /// Both fixed fields
    #[must_use]
    pub fn info(&self) -> &AccountInfo {
        self.view.fields()
    }

    /// Sign a message, advancing the nonce
    ///
    /// # Errors
    ///
    /// Returns `SigningFailed` for an empty message, or any bridge fault
    pub async fn sign(&self, message: &[u8]) -> BridgeResult<String> {
        let mut session = self.view.exclusive().await?;
        session.with_bridge(|bridge, ptr| {
            let (msg_ptr, msg_len) = bridge.pass_bytes(message)?;
            let signature = bridge.call_fallible("account_sign", &[ptr, msg_ptr, msg_len]);
            bridge.free_bytes(msg_ptr, msg_len)?;
            signature?.into_string()
        })
    }

    /// Signatures issued so far
    ///
    /// # Errors
    ///
    /// Returns error if the account was released
    pub async fn nonce(&self) -> BridgeResult<Word> {
        let mut session = self.view.exclusive().await?;
        first(session.call("account_nonce", &[])?)
    }

    /// Register a session key after the policy approves it.
    ///
    /// Runs as one exclusive session: begin, ask the policy, commit. If the
    /// policy rejects the key or the commit fails, the pending registration
    /// is aborted before the session ends, so the next caller never sees it.
    ///
    /// # Errors
    ///
    /// Returns `SessionConflict` from the guest, the policy's rejection, or
    /// any bridge fault
    pub async fn register_session(&self, key: &str, policy: &dyn SessionPolicy) -> BridgeResult<()> {
        let mut session = self.view.exclusive().await?;
        // outer error: nothing began; inner error: begun but must be aborted
        let freed = session.with_bridge(|bridge, ptr| {
            let text = bridge.pass_str(key)?;
            let begun = bridge.call_fallible("session_begin", &[ptr, text.ptr, text.len]);
            let freed = bridge.free_str(text);
            if let (Err(_), Err(free_err)) = (&begun, &freed) {
                tracing::warn!(key, error = %free_err, "failed to free session key");
            }
            begun?;
            Ok::<_, BridgeError>(freed)
        })?;

        let outcome = match freed {
            Err(free_err) => Err(free_err),
            Ok(()) => {
                let request = SessionRequest {
                    address: self.address().to_string(),
                    key: key.to_string(),
                };
                match policy.approve(&request).await {
                    Ok(()) => session.call_fallible("session_commit", &[]).map(drop),
                    Err(rejected) => Err(rejected.into()),
                }
            }
        };
        if let Err(err) = outcome {
            tracing::debug!(key, error = %err, "session registration aborted");
            if let Err(abort_err) = session.call("session_abort", &[]) {
                tracing::warn!(key, error = %abort_err, "failed to abort session registration");
            }
            return Err(err);
        }
        tracing::debug!(key, address = %self.address(), "session registered");
        Ok(())
    }

    /// Sessions registered so far
    ///
    /// # Errors
    ///
    /// Returns error if the account was released
    pub async fn session_count(&self) -> BridgeResult<Word> {
        let mut session = self.view.exclusive().await?;
        first(session.call("session_count", &[])?)
    }

    /// Attach a listener the host can feed events into
    ///
    /// # Errors
    ///
    /// Returns error if the account was released or the guest refuses
    pub async fn subscribe(&self) -> BridgeResult<Subscription> {
        let mut session = self.view.exclusive().await?;
        let listener = session.with_bridge(|bridge, ptr| {
            let handle = first(bridge.call("account_subscribe", &[ptr])?)?;
            bridge.host().take(Handle(handle))?.into_closure()
        })?;
        Ok(Subscription {
            account: self.clone(),
            listener,
        })
    }

    /// Events delivered so far
    ///
    /// # Errors
    ///
    /// Returns error if the account was released
    pub async fn events_seen(&self) -> BridgeResult<Word> {
        let mut session = self.view.exclusive().await?;
        first(session.call("account_events", &[])?)
    }

    /// Free the account once queued operations have run
    ///
    /// # Errors
    ///
    /// Returns error if already released
    pub async fn release(&self) -> BridgeResult<()> {
        self.view.release().await
    }

    /// Whether the account has been released
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.view.handle().is_released()
    }
}

impl fmt::Debug for AccountCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCore")
            .field("address", &self.address())
            .field("released", &self.is_released())
            .finish()
    }
}

fn first(words: Vec<Word>) -> BridgeResult<Word> {
    ferry_bridge::guest::first_word(&words, "account call")
}

/// A guest listener receiving host events for one account
pub struct Subscription {
    account: AccountCore,
    listener: GuestClosure,
}

impl Subscription {
    /// Deliver an event to the guest listener
    ///
    /// # Errors
    ///
    /// Returns error if the listener was closed or the guest fails
    pub async fn deliver(&self, event: &str) -> BridgeResult<()> {
        let mut session = self.account.view.exclusive().await?;
        session
            .with_bridge(|bridge, _| bridge.invoke_closure(&self.listener, HostValue::from(event)))
            .map(drop)
    }

    /// Detach the listener, running the guest's destructor
    ///
    /// # Errors
    ///
    /// Returns error if the destructor fails
    pub async fn close(self) -> BridgeResult<bool> {
        match self.account.view.exclusive().await {
            Ok(mut session) => session.with_bridge(|bridge, _| bridge.release_closure(&self.listener)),
            Err(err) => {
                tracing::debug!(error = %err, "account gone, releasing listener outside its session");
                self.account
                    .view
                    .handle()
                    .cell()
                    .with(|bridge| bridge.release_closure(&self.listener))
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("address", &self.account.address())
            .field("listener", &self.listener)
            .finish()
    }
}
