//! Guarding a unique e-mail address around account creation.

mod common;

use std::{convert::Infallible, sync::Arc, time::Duration};

use common::{Account, account_id, init_tracing, metadata, open};
use strata::{
    AggregateProcessor, CommandMessage, StateAggregateRepository,
    prepare::{InMemoryPrepareKey, PrepareError, PrepareKey, PreparedValue},
    processor::ProcessError,
    store::inmemory,
};

type Processor = AggregateProcessor<Account, inmemory::Store>;

#[derive(Debug, thiserror::Error)]
enum RegisterError {
    #[error("e-mail address already registered")]
    EmailTaken,
    #[error(transparent)]
    Process(#[from] ProcessError<inmemory::InMemoryError>),
}

/// Open an account unless `email` already belongs to another one.
async fn register(
    emails: &InMemoryPrepareKey<String>,
    processor: &Processor,
    email: &str,
    account: &str,
    owner: &str,
) -> Result<u64, PrepareError<Infallible, RegisterError>> {
    let command = CommandMessage::new(account_id(account), open(owner));
    emails
        .with_prepared(email, PreparedValue::forever(account.to_string()), |claimed| async move {
            if !claimed {
                return Err(RegisterError::EmailTaken);
            }
            let processed = processor.process(&command).await?;
            Ok(processed.version)
        })
        .await
}

fn setup() -> (InMemoryPrepareKey<String>, Processor, inmemory::Store) {
    let store = inmemory::Store::new();
    let processor = AggregateProcessor::new(metadata(), StateAggregateRepository::new(store.clone()));
    (InMemoryPrepareKey::new("email"), processor, store)
}

#[tokio::test]
async fn first_registration_claims_the_address() {
    init_tracing();
    let (emails, processor, store) = setup();

    let version = register(&emails, &processor, "ada@example.com", "acc-1", "ada")
        .await
        .unwrap();

    assert_eq!(version, 1);
    assert_eq!(store.stream_count(), 1);
    assert_eq!(
        emails.get("ada@example.com").await.unwrap(),
        Some("acc-1".to_string())
    );
}

#[tokio::test]
async fn taken_address_is_refused_before_processing() {
    let (emails, processor, store) = setup();
    register(&emails, &processor, "ada@example.com", "acc-1", "ada")
        .await
        .unwrap();

    let err = register(&emails, &processor, "ada@example.com", "acc-2", "eve")
        .await
        .unwrap_err();

    assert!(matches!(err, PrepareError::Operation(RegisterError::EmailTaken)));
    assert_eq!(store.stream_count(), 1);
    // The refused attempt must not have released the owner's claim.
    assert_eq!(
        emails.get("ada@example.com").await.unwrap(),
        Some("acc-1".to_string())
    );
}

#[tokio::test]
async fn rejected_command_releases_the_claim() {
    let (emails, processor, store) = setup();

    let err = register(&emails, &processor, "ada@example.com", "acc-1", "")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PrepareError::Operation(RegisterError::Process(ProcessError::Rejected(_)))
    ));
    assert_eq!(store.stream_count(), 0);
    assert_eq!(emails.get("ada@example.com").await.unwrap(), None);

    // The address is free for the next attempt.
    let version = register(&emails, &processor, "ada@example.com", "acc-1", "ada")
        .await
        .unwrap();
    assert_eq!(version, 1);
}

#[tokio::test]
async fn existing_account_releases_the_new_claim() {
    let (emails, processor, _store) = setup();
    register(&emails, &processor, "ada@example.com", "acc-1", "ada")
        .await
        .unwrap();

    // Same account id under a second address: creation fails, so the second
    // address stays free.
    let err = register(&emails, &processor, "ada@work.example", "acc-1", "ada")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PrepareError::Operation(RegisterError::Process(ProcessError::AggregateCreatedBefore { .. }))
    ));
    assert_eq!(emails.get("ada@work.example").await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_yield_one_owner() {
    let (emails, processor, store) = setup();
    let emails = Arc::new(emails);
    let processor = Arc::new(processor);

    let mut tasks = Vec::new();
    for n in 0..8 {
        let (emails, processor) = (Arc::clone(&emails), Arc::clone(&processor));
        tasks.push(tokio::spawn(async move {
            register(&emails, &processor, "shared@example.com", &format!("acc-{n}"), "ada").await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => winners += 1,
            Err(PrepareError::Operation(RegisterError::EmailTaken)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.stream_count(), 1);
}

#[tokio::test]
async fn expiring_claim_can_be_taken_over() {
    let emails = InMemoryPrepareKey::<String>::new("email");
    assert!(
        emails
            .prepare(
                "ada@example.com",
                PreparedValue::expiring_in("acc-1".to_string(), Duration::from_millis(10)),
            )
            .await
            .unwrap()
    );
    assert!(
        !emails
            .prepare("ada@example.com", PreparedValue::forever("acc-2".to_string()))
            .await
            .unwrap()
    );

    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(
        emails
            .prepare("ada@example.com", PreparedValue::forever("acc-2".to_string()))
            .await
            .unwrap()
    );
    assert_eq!(
        emails.get("ada@example.com").await.unwrap(),
        Some("acc-2".to_string())
    );
}
