//! Session approval seam.
//!
//! Registering a session asks a policy for approval between two guest calls.
//! The policy is async, so the check is a suspension point inside the
//! account's exclusive session.

use async_trait::async_trait;
use ferry_core::{DomainError, ErrorCode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// What a policy is asked to approve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Address of the account registering the session
    pub address: String,
    /// Session key
    pub key: String,
}

/// Decides whether a session may be registered
#[async_trait]
pub trait SessionPolicy: Send + Sync {
    /// Approve or reject a request
    ///
    /// # Errors
    ///
    /// Returns a domain error describing the rejection
    async fn approve(&self, request: &SessionRequest) -> Result<(), DomainError>;
}

/// Approves everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl SessionPolicy for AllowAll {
    async fn approve(&self, _request: &SessionRequest) -> Result<(), DomainError> {
        Ok(())
    }
}

/// Rejects a fixed set of session keys
#[derive(Debug, Clone, Default)]
pub struct Denylist {
    keys: HashSet<String>,
}

impl Denylist {
    /// Create a denylist
    #[must_use]
    pub fn new(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl SessionPolicy for Denylist {
    async fn approve(&self, request: &SessionRequest) -> Result<(), DomainError> {
        if self.keys.contains(&request.key) {
            return Err(DomainError::new(ErrorCode::PolicyViolation, "session key is denied")
                .with_detail(request.key.clone()));
        }
        Ok(())
    }
}

/// Wraps another policy and waits before deciding, like a remote check would
#[derive(Debug, Clone)]
pub struct Delayed<P> {
    inner: P,
    delay: Duration,
}

impl<P> Delayed<P> {
    /// Delay `inner` by `delay`
    #[must_use]
    pub fn new(inner: P, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl<P: SessionPolicy> SessionPolicy for Delayed<P> {
    async fn approve(&self, request: &SessionRequest) -> Result<(), DomainError> {
        tokio::time::sleep(self.delay).await;
        self.inner.approve(request).await
    }
}
