//! End-to-end command processing: retries, gateway round trips, snapshots.

mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use common::{Account, Close, Deposit, Reopen, Withdraw, account_id, init_tracing, metadata, open};
use strata::{
    AggregateId, AggregateProcessor, CommandDispatcher, CommandGateway, CommandMessage,
    CommandStage, CommandWaitRegistry, DomainEventStream, ErrorCode, RecoverableType,
    StateAggregateRepository, WaitingFor,
    bus::{InMemoryBus, MessageBus, Subscription},
    concurrency::{ConcurrencyConflict, RetryBound},
    error::codes,
    gateway::GatewayError,
    processor::ProcessError,
    snapshot::{SnapshotPolicy, SnapshotRepository, inmemory as snapshots},
    snapshotter::Snapshotter,
    store::{AppendError, EventStore, EventStreams, TimeRange, VersionRange, inmemory},
};

fn processor(store: &inmemory::Store) -> AggregateProcessor<Account, inmemory::Store> {
    AggregateProcessor::new(metadata(), StateAggregateRepository::new(store.clone()))
}

// ============================================================================
// Optimistic concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_commands_all_land_on_distinct_versions() {
    init_tracing();
    let store = inmemory::Store::new();
    let processor = processor(&store).with_retry(RetryBound::new(RetryBound::MAX));
    let id = account_id("acc-1");
    processor
        .process(&CommandMessage::new(id.clone(), open("ada")))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for amount in 1..=6 {
        let processor = processor.clone();
        let command = CommandMessage::new(id.clone(), Deposit(amount));
        tasks.push(tokio::spawn(async move { processor.process(&command).await }));
    }

    let mut versions = Vec::new();
    for task in tasks {
        versions.push(task.await.unwrap().unwrap().version);
    }
    versions.sort_unstable();
    assert_eq!(versions, vec![2, 3, 4, 5, 6, 7]);

    let state = processor.repository().load(&metadata(), &id).await.unwrap();
    assert_eq!(state.version(), 7);
    assert_eq!(state.state().balance, 21);
    assert_eq!(store.stream_count(), 7);
}

/// Delegates to the in-memory store but loses every append race.
struct AlwaysConflicting {
    inner: inmemory::Store,
    appends: AtomicUsize,
}

impl EventStore for AlwaysConflicting {
    type Error = inmemory::InMemoryError;

    async fn append<'a>(
        &'a self,
        stream: &'a DomainEventStream,
    ) -> Result<(), AppendError<Self::Error>> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        Err(ConcurrencyConflict {
            aggregate_id: stream.aggregate_id.clone(),
            expected: stream.version - 1,
            actual: stream.version,
        }
        .into())
    }

    fn load<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
        range: VersionRange,
    ) -> EventStreams<'a, Self::Error> {
        self.inner.load(aggregate_id, range)
    }

    fn load_by_time<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
        range: TimeRange,
    ) -> EventStreams<'a, Self::Error> {
        self.inner.load_by_time(aggregate_id, range)
    }

    async fn last<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
    ) -> Result<Option<DomainEventStream>, Self::Error> {
        self.inner.last(aggregate_id).await
    }
}

#[tokio::test]
async fn retries_stop_at_the_bound() {
    let store = Arc::new(AlwaysConflicting {
        inner: inmemory::Store::new(),
        appends: AtomicUsize::new(0),
    });
    let processor = AggregateProcessor::new(metadata(), StateAggregateRepository::new(Arc::clone(&store)));

    let err = processor
        .process(&CommandMessage::new(account_id("acc-1"), open("ada")))
        .await
        .unwrap_err();

    match &err {
        ProcessError::ConcurrencyExhausted { attempts, .. } => assert_eq!(*attempts, 3),
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(err.error_code(), codes::CONCURRENCY_EXHAUSTED);
    assert_eq!(err.recoverable(), RecoverableType::Unrecoverable);
    assert_eq!(store.appends.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn configured_retry_bound_is_clamped() {
    let store = Arc::new(AlwaysConflicting {
        inner: inmemory::Store::new(),
        appends: AtomicUsize::new(0),
    });
    let processor = AggregateProcessor::new(metadata(), StateAggregateRepository::new(Arc::clone(&store)))
        .with_retry(RetryBound::new(50));

    let result = processor
        .handle(&CommandMessage::new(account_id("acc-1"), open("ada")))
        .await;

    assert!(!result.is_succeeded());
    assert_eq!(result.error.error_code, codes::CONCURRENCY_EXHAUSTED);
    assert_eq!(store.appends.load(Ordering::SeqCst), RetryBound::MAX);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn closed_accounts_only_accept_recovery() {
    let store = inmemory::Store::new();
    let processor = processor(&store);
    let id = account_id("acc-1");
    let deposit = |amount| CommandMessage::new(id.clone(), Deposit(amount));

    assert!(processor.handle(&CommandMessage::new(id.clone(), open("ada"))).await.is_succeeded());
    assert!(processor.handle(&deposit(40)).await.is_succeeded());

    // Close empties the account and deletes it in one stream of two events.
    let closed = processor.handle(&CommandMessage::new(id.clone(), Close)).await;
    assert!(closed.is_succeeded());
    assert_eq!(closed.aggregate_version, Some(4));
    assert_eq!(store.stream_count(), 3);

    let refused = processor.handle(&deposit(1)).await;
    assert_eq!(refused.error.error_code, codes::AGGREGATE_DELETED);

    let reopened = processor.handle(&CommandMessage::new(id.clone(), Reopen)).await;
    assert!(reopened.is_succeeded());
    assert!(processor.handle(&deposit(1)).await.is_succeeded());

    let state = processor.repository().load(&metadata(), &id).await.unwrap();
    assert!(!state.deleted());
    assert_eq!(state.state().balance, 1);
}

// ============================================================================
// Gateway, dispatcher and waiting
// ============================================================================

struct Running {
    gateway: CommandGateway<InMemoryBus<CommandMessage>>,
    store: inmemory::Store,
    dispatcher: strata::bus::SubscriptionHandle,
}

fn start() -> Running {
    let store = inmemory::Store::new();
    let waits = CommandWaitRegistry::new();
    let commands = InMemoryBus::<CommandMessage>::default();
    let dispatcher = CommandDispatcher::new(waits.clone())
        .register(processor(&store))
        .unwrap();
    let handle = dispatcher.start(&commands).unwrap();
    Running {
        gateway: CommandGateway::new(commands, waits).with_timeout(Duration::from_secs(5)),
        store,
        dispatcher: handle,
    }
}

#[tokio::test]
async fn gateway_round_trip_reports_processed_versions() {
    init_tracing();
    let running = start();
    let id = account_id("acc-1");

    let created = running
        .gateway
        .send_and_wait(CommandMessage::new(id.clone(), open("ada")), WaitingFor::processed())
        .await
        .unwrap();
    assert_eq!(created.stage, CommandStage::Processed);
    assert_eq!(created.aggregate_version, Some(1));

    let deposited = running
        .gateway
        .send_and_wait(
            CommandMessage::new(id.clone(), Deposit(25)).with_aggregate_version(1),
            WaitingFor::processed(),
        )
        .await
        .unwrap();
    assert_eq!(deposited.aggregate_version, Some(2));
    assert_eq!(running.store.stream_count(), 2);

    running.dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn gateway_surfaces_domain_rejections() {
    let running = start();
    let id = account_id("acc-1");
    running
        .gateway
        .send_and_wait(CommandMessage::new(id.clone(), open("ada")), WaitingFor::processed())
        .await
        .unwrap();

    let err = running
        .gateway
        .send_and_wait(CommandMessage::new(id.clone(), Withdraw(10)), WaitingFor::processed())
        .await
        .unwrap_err();
    let GatewayError::Failed(result) = err else {
        panic!("expected a failed result, got {err:?}");
    };
    assert_eq!(result.error.error_code, "InsufficientFunds");
    assert_eq!(result.stage, CommandStage::Processed);
    assert_eq!(running.store.stream_count(), 1);
}

#[tokio::test]
async fn gateway_refuses_replayed_request_ids() {
    let running = start();
    let id = account_id("acc-1");
    let first = CommandMessage::new(id.clone(), open("ada")).with_request_id("req-open");
    let replay = CommandMessage::new(id.clone(), open("ada")).with_request_id("req-open");

    running
        .gateway
        .send_and_wait(first, WaitingFor::processed())
        .await
        .unwrap();
    let err = running.gateway.send(replay).await.unwrap_err();

    assert!(matches!(err, GatewayError::DuplicateRequestId { .. }));
    assert_eq!(err.error_code(), codes::DUPLICATE_REQUEST_ID);
    assert_eq!(running.store.stream_count(), 1);
}

#[tokio::test]
async fn gateway_validator_runs_before_sending() {
    let store = inmemory::Store::new();
    let waits = CommandWaitRegistry::new();
    let commands = InMemoryBus::<CommandMessage>::default();
    let gateway = CommandGateway::new(commands, waits).with_validator(|command: &CommandMessage| {
        match command.body::<Deposit>() {
            Some(Deposit(amount)) if *amount > 1_000 => Err(strata::DomainError::bad_request("limit exceeded")),
            _ => Ok(()),
        }
    });

    let err = gateway
        .send(CommandMessage::new(account_id("acc-1"), Deposit(5_000)))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), codes::BAD_REQUEST);
    assert_eq!(store.stream_count(), 0);
}

// ============================================================================
// Snapshots
// ============================================================================

#[tokio::test]
async fn stale_snapshot_plus_tail_equals_full_replay() {
    let store = inmemory::Store::new();
    let processor = processor(&store);
    let id = account_id("acc-1");
    processor
        .process(&CommandMessage::new(id.clone(), open("ada")))
        .await
        .unwrap();
    for amount in 1..=9 {
        processor
            .process(&CommandMessage::new(id.clone(), Deposit(amount)))
            .await
            .unwrap();
    }

    let plain = StateAggregateRepository::new(store.clone());
    let at_five = plain.load_until(&metadata(), &id, 5).await.unwrap();
    let snapshots = snapshots::Store::new();
    snapshots
        .save(&at_five.to_snapshot(Utc::now()).unwrap())
        .await
        .unwrap();

    let with_snapshots = StateAggregateRepository::new(store.clone()).with_snapshots(snapshots);
    let topped_up = with_snapshots.load(&metadata(), &id).await.unwrap();
    let replayed = plain.load(&metadata(), &id).await.unwrap();

    assert_eq!(topped_up.version(), 10);
    assert_eq!(topped_up.version(), replayed.version());
    assert_eq!(topped_up.state(), replayed.state());

    // A snapshot newer than the requested version is ignored.
    let historical = with_snapshots.load_until(&metadata(), &id, 3).await.unwrap();
    assert_eq!(historical.version(), 3);
    assert_eq!(
        historical.state(),
        plain.load_until(&metadata(), &id, 3).await.unwrap().state()
    );
}

#[tokio::test]
async fn snapshotter_follows_the_event_bus() {
    init_tracing();
    let store = inmemory::Store::new();
    let snapshot_store = snapshots::Store::new();
    let events = InMemoryBus::<DomainEventStream>::default();

    let snapshotter = Snapshotter::new(
        StateAggregateRepository::new(store.clone()).with_snapshots(snapshot_store.clone()),
        metadata(),
        SnapshotPolicy::Always,
    );
    let subscription = events
        .subscribe(Subscription::new("snapshotter"), snapshotter.event_stream_handler())
        .unwrap();

    let processor = processor(&store).with_event_bus(events.clone());
    let id = account_id("acc-1");
    processor
        .process(&CommandMessage::new(id.clone(), open("ada")))
        .await
        .unwrap();
    for amount in 1..=4 {
        processor
            .process(&CommandMessage::new(id.clone(), Deposit(amount)))
            .await
            .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while snapshot_store.version(&id).await.unwrap() != Some(5) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("snapshot never caught up");

    let from_snapshot = StateAggregateRepository::new(inmemory::Store::new())
        .with_snapshots(snapshot_store)
        .load(&metadata(), &id)
        .await
        .unwrap();
    assert_eq!(from_snapshot.version(), 5);
    assert_eq!(from_snapshot.state().balance, 10);
    assert_eq!(from_snapshot.state().owner, "ada");

    subscription.stop().await.unwrap();
}
