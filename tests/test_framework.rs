//! The account aggregate through the given/when/then harness.

#![cfg(feature = "test-util")]

mod common;

use common::{Close, Closed, Deposit, Deposited, Opened, Reopen, Withdraw, account_id, metadata, open};
use strata::{
    AggregateProcessor, CommandMessage, StateAggregateRepository,
    error::codes,
    processor::ProcessError,
    store::inmemory,
    test::{RepositoryTestExt, TestFramework},
};

fn opened() -> Vec<strata::RaisedEvent> {
    vec![
        Opened {
            owner: "ada".into(),
        }
        .into(),
    ]
}

#[test]
fn opening_raises_opened() {
    TestFramework::new(metadata())
        .given_no_history()
        .when(open("ada"))
        .then_expect_events(&[Opened {
            owner: "ada".into(),
        }]);
}

#[test]
fn opening_twice_is_refused() {
    TestFramework::new(metadata())
        .given(opened())
        .when(open("ada"))
        .then_expect_error_code(codes::AGGREGATE_CREATED_BEFORE);
}

#[test]
fn deposit_needs_an_account() {
    TestFramework::new(metadata())
        .given_no_history()
        .when(Deposit(10))
        .then_expect_error_code(codes::AGGREGATE_NOT_FOUND);
}

#[test]
fn non_positive_deposit_is_a_bad_request() {
    TestFramework::new(metadata())
        .given(opened())
        .when(Deposit(0))
        .then_expect_error_code(codes::BAD_REQUEST);
}

#[test]
fn overdraft_is_refused() {
    TestFramework::new(metadata())
        .given(opened())
        .and(vec![Deposited { amount: 5 }.into()])
        .when(Withdraw(6))
        .then_expect_error_message("insufficient funds");
}

#[test]
fn withdrawal_updates_the_balance() {
    TestFramework::new(metadata())
        .given(opened())
        .and(vec![Deposited { amount: 50 }.into()])
        .when(Withdraw(20))
        .then_expect_state(|state| {
            assert_eq!(state.version(), 3);
            assert_eq!(state.state().balance, 30);
            assert_eq!(state.state().movements, 2);
        });
}

#[test]
fn closing_pays_out_before_deleting() {
    TestFramework::new(metadata())
        .given(opened())
        .and(vec![Deposited { amount: 50 }.into()])
        .when(Close)
        .then_expect_event_names(&["funds_withdrawn", "account_closed"]);
}

#[test]
fn closed_account_refuses_changes_but_accepts_recovery() {
    let closed = || {
        TestFramework::new(metadata())
            .given(opened())
            .and(vec![Closed.into()])
    };

    closed()
        .when(Deposit(1))
        .then_expect_error_code(codes::AGGREGATE_DELETED);
    closed().when(Reopen).then_expect_state(|state| {
        assert!(!state.deleted());
        assert_eq!(state.version(), 3);
    });
}

#[test]
fn unregistered_command_is_not_supported() {
    struct Freeze;

    TestFramework::new(metadata())
        .given(opened())
        .when(Freeze)
        .then_expect_error_code(codes::COMMAND_NOT_SUPPORTED);
}

#[tokio::test]
async fn seeded_concurrent_writer_trips_the_expected_version() {
    let store = inmemory::Store::new();
    let repository = StateAggregateRepository::new(store.clone());
    let id = account_id("acc-1");
    repository.seed_events(&id, opened()).await.unwrap();

    // The client read version 1; another writer deposits before it sends.
    repository
        .inject_concurrent_event(&id, Deposited { amount: 7 }.into())
        .await
        .unwrap();

    let processor = AggregateProcessor::new(metadata(), repository);
    let err = processor
        .process(&CommandMessage::new(id.clone(), Withdraw(5)).with_aggregate_version(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProcessError::CommandVersionConflict {
            expected: 1,
            actual: 2,
            ..
        }
    ));

    let state = processor.repository().load(&metadata(), &id).await.unwrap();
    assert_eq!(state.version(), 2);
    assert_eq!(state.state().balance, 7);
}
