//! Integration tests for the `PostgreSQL` prepare key.
//!
//! These tests require Docker to be running and will spin up a `PostgreSQL`
//! container using testcontainers.

use std::convert::Infallible;

use chrono::{Duration, Utc};
use sqlx::PgPool;
use strata_core::prepare::{PrepareError, PrepareKey, PrepareOutcome, PreparedValue};
use strata_postgres::PgPrepareKey;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

struct TestDb {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestDb {
    async fn new() -> Self {
        let container = Postgres::default().start().await.unwrap();
        let host = container.get_host().await.unwrap();
        let port = container.get_host_port_ipv4(5432).await.unwrap();

        let connection_string = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let pool = PgPool::connect(&connection_string).await.unwrap();

        Self {
            _container: container,
            pool,
        }
    }

    async fn emails(&self) -> PgPrepareKey<String> {
        let emails = PgPrepareKey::new(self.pool.clone(), "email");
        emails.migrate().await.unwrap();
        emails
    }
}

#[derive(Debug, thiserror::Error)]
#[error("registration failed")]
struct RegistrationFailed;

#[tokio::test]
async fn first_claim_wins() {
    let db = TestDb::new().await;
    let emails = db.emails().await;

    assert!(emails.prepare("ada@example.com", PreparedValue::forever("user-1".into())).await.unwrap());
    assert!(!emails.prepare("ada@example.com", PreparedValue::forever("user-2".into())).await.unwrap());
    assert_eq!(emails.get("ada@example.com").await.unwrap().as_deref(), Some("user-1"));
}

#[tokio::test]
async fn repeated_claim_by_same_value_succeeds() {
    let db = TestDb::new().await;
    let emails = db.emails().await;

    assert!(emails.prepare("ada@example.com", PreparedValue::forever("user-1".into())).await.unwrap());
    assert!(emails.prepare("ada@example.com", PreparedValue::forever("user-1".into())).await.unwrap());
    assert_eq!(
        emails.try_prepare("ada@example.com", PreparedValue::forever("user-1".into())).await.unwrap(),
        PrepareOutcome::AlreadyHeld
    );
    assert_eq!(
        emails.try_prepare("ada@example.com", PreparedValue::forever("user-2".into())).await.unwrap(),
        PrepareOutcome::Taken
    );
}

#[tokio::test]
async fn expired_claim_can_be_taken_over() {
    let db = TestDb::new().await;
    let emails = db.emails().await;
    let lapsed = PreparedValue::until("user-1".to_string(), Utc::now() - Duration::seconds(5));

    assert!(emails.prepare("ada@example.com", lapsed).await.unwrap());
    assert_eq!(emails.get("ada@example.com").await.unwrap(), None);
    assert!(emails.get_value("ada@example.com").await.unwrap().unwrap().is_expired());

    assert!(emails.prepare("ada@example.com", PreparedValue::forever("user-2".into())).await.unwrap());
    assert_eq!(emails.get("ada@example.com").await.unwrap().as_deref(), Some("user-2"));
}

#[tokio::test]
async fn rollback_releases_claims() {
    let db = TestDb::new().await;
    let emails = db.emails().await;
    emails.prepare("a@example.com", PreparedValue::forever("user-1".into())).await.unwrap();
    emails.prepare("b@example.com", PreparedValue::forever("user-2".into())).await.unwrap();

    assert!(emails.rollback("a@example.com").await.unwrap());
    assert!(!emails.rollback("a@example.com").await.unwrap());

    assert!(!emails.rollback_value("b@example.com", &"user-9".to_string()).await.unwrap());
    assert!(emails.rollback_value("b@example.com", &"user-2".to_string()).await.unwrap());
    assert_eq!(emails.get_value("b@example.com").await.unwrap(), None);
}

#[tokio::test]
async fn reprepare_replaces_matching_claims() {
    let db = TestDb::new().await;
    let emails = db.emails().await;
    emails.prepare("ada@example.com", PreparedValue::forever("user-1".into())).await.unwrap();

    assert!(!emails
        .reprepare("ada@example.com", &"user-9".to_string(), PreparedValue::forever("user-2".into()))
        .await
        .unwrap());
    assert!(emails
        .reprepare("ada@example.com", &"user-1".to_string(), PreparedValue::forever("user-2".into()))
        .await
        .unwrap());
    assert!(emails
        .reprepare_value("ada@example.com", PreparedValue::forever("user-3".into()))
        .await
        .unwrap());
    assert!(!emails
        .reprepare_value("nobody@example.com", PreparedValue::forever("user-3".into()))
        .await
        .unwrap());
    assert_eq!(emails.get("ada@example.com").await.unwrap().as_deref(), Some("user-3"));
}

#[tokio::test]
async fn reprepare_key_moves_a_claim() {
    let db = TestDb::new().await;
    let emails = db.emails().await;
    emails.prepare("old@example.com", PreparedValue::forever("user-1".into())).await.unwrap();

    let moved = emails
        .reprepare_key(
            "old@example.com",
            &"user-1".to_string(),
            "new@example.com",
            PreparedValue::forever("user-1".into()),
        )
        .await
        .unwrap();
    assert!(moved);
    assert_eq!(emails.get("old@example.com").await.unwrap(), None);
    assert_eq!(emails.get("new@example.com").await.unwrap().as_deref(), Some("user-1"));
}

#[tokio::test]
async fn with_prepared_rolls_back_failed_operations() {
    let db = TestDb::new().await;
    let emails = db.emails().await;

    let err = emails
        .with_prepared("ada@example.com", PreparedValue::forever("user-1".into()), |claimed| async move {
            assert!(claimed);
            Err::<(), _>(RegistrationFailed)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PrepareError::Operation(RegistrationFailed)));
    assert_eq!(emails.get_value("ada@example.com").await.unwrap(), None);

    let registered = emails
        .with_prepared("ada@example.com", PreparedValue::forever("user-1".into()), |claimed| async move {
            Ok::<_, Infallible>(claimed)
        })
        .await
        .unwrap();
    assert!(registered);
    assert_eq!(emails.get("ada@example.com").await.unwrap().as_deref(), Some("user-1"));
}

#[tokio::test]
async fn failed_operation_keeps_a_claim_the_value_already_held() {
    let db = TestDb::new().await;
    let emails = db.emails().await;
    emails.prepare("ada@example.com", PreparedValue::forever("user-1".into())).await.unwrap();

    let err = emails
        .with_prepared("ada@example.com", PreparedValue::forever("user-1".into()), |claimed| async move {
            assert!(claimed);
            Err::<(), _>(RegistrationFailed)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PrepareError::Operation(RegistrationFailed)));
    assert_eq!(emails.get("ada@example.com").await.unwrap().as_deref(), Some("user-1"));
}

#[tokio::test]
async fn key_sets_share_the_table_but_not_claims() {
    let db = TestDb::new().await;
    let emails = db.emails().await;
    let usernames: PgPrepareKey<String> = PgPrepareKey::new(db.pool.clone(), "username");

    assert!(emails.prepare("ada", PreparedValue::forever("user-1".into())).await.unwrap());
    assert!(usernames.prepare("ada", PreparedValue::forever("user-2".into())).await.unwrap());
    assert_eq!(usernames.name(), "username");
}
