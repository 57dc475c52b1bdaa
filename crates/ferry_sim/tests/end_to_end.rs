//! Concurrent callers sharing one guest-held account.

use ferry_core::{BridgeConfig, ErrorCode};
use ferry_sim::{sim_cell, AccountCore, AllowAll, Delayed, Denylist};
use std::sync::Mutex;
use std::time::Duration;

#[tokio::test]
async fn test_exclusive_operations_run_in_issue_order() {
    let cell = sim_cell(&BridgeConfig::default());
    let account = AccountCore::create(&cell, b"end to end").unwrap();
    let journal = cell.with(|bridge| bridge.guest().journal());
    journal.clear();

    let fixed_address = account.address().to_string();
    let slow_policy = Delayed::new(AllowAll, Duration::from_millis(30));
    let observed = Mutex::new(Vec::new());

    // X: multi-step registration that suspends between its guest calls
    let x = async {
        account.register_session("session-x", &slow_policy).await.unwrap();
        observed.lock().unwrap().push("x done");
    };
    // Y: issued after X, must not start its guest call until X is done
    let y = async {
        let signature = account.sign(b"payload").await.unwrap();
        observed.lock().unwrap().push("y done");
        signature
    };
    // companion read issued concurrently with X
    let companion = async {
        let address = account.address().to_string();
        observed.lock().unwrap().push("companion read");
        address
    };

    let ((), signature, address) = tokio::join!(x, y, companion);

    assert_eq!(address, fixed_address);
    assert_eq!(signature.len(), 64);
    assert_eq!(
        journal.entries(),
        vec!["session_begin", "session_commit", "account_sign"]
    );
    assert_eq!(
        observed.into_inner().unwrap(),
        vec!["companion read", "x done", "y done"]
    );
    assert_eq!(account.session_count().await.unwrap(), 1);
    assert_eq!(account.nonce().await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_flow_leaves_no_partial_state_for_next_caller() {
    let cell = sim_cell(&BridgeConfig::default());
    let account = AccountCore::create(&cell, b"end to end").unwrap();
    let journal = cell.with(|bridge| bridge.guest().journal());
    journal.clear();

    let denying = Delayed::new(Denylist::new(["bad"]), Duration::from_millis(10));
    let (rejected, accepted) = tokio::join!(
        account.register_session("bad", &denying),
        account.register_session("good", &AllowAll),
    );

    assert_eq!(rejected.unwrap_err().code(), Some(ErrorCode::PolicyViolation));
    accepted.unwrap();
    assert_eq!(
        journal.entries(),
        vec!["session_begin", "session_abort", "session_begin", "session_commit"]
    );
}

#[tokio::test]
async fn test_accounts_in_one_guest_are_independent() {
    let cell = sim_cell(&BridgeConfig::default());
    let alice = AccountCore::create(&cell, b"alice").unwrap();
    let bob = AccountCore::create(&cell, b"bob").unwrap();
    assert_ne!(alice.address(), bob.address());

    let (a, b) = tokio::join!(alice.sign(b"m"), bob.sign(b"m"));
    assert_ne!(a.unwrap(), b.unwrap());

    alice.release().await.unwrap();
    assert_eq!(bob.nonce().await.unwrap(), 1);
    drop(bob);
    assert_eq!(cell.collect_garbage(), 1);
    cell.with(|bridge| assert_eq!(bridge.guest().live_accounts(), 0));
}

#[tokio::test]
async fn test_listener_events_interleave_with_signing() {
    let cell = sim_cell(&BridgeConfig::default());
    let account = AccountCore::create(&cell, b"listener").unwrap();
    let subscription = account.subscribe().await.unwrap();

    let (delivered, signed) = tokio::join!(subscription.deliver("tick"), account.sign(b"tx"));
    delivered.unwrap();
    signed.unwrap();

    assert_eq!(account.events_seen().await.unwrap(), 1);
    assert!(subscription.close().await.unwrap());
    cell.with(|bridge| {
        assert_eq!(bridge.guest().live_listeners(), 0);
        assert!(!bridge.host().has_pending_error());
    });
}
