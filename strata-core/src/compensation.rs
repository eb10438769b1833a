//! Failure records and event re-delivery.
//!
//! Appending events is the commit point of a command; nothing after it is
//! rolled back. Deliveries that fail after the commit are kept as
//! [`ErrorRecord`]s in an [`ErrorRepository`], and an [`EventCompensator`]
//! later re-sends the affected streams from the event store.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_stream::StreamExt as _;

use crate::{
    bus::{BusError, MessageBus},
    command::CommandStage,
    error::{ErrorCode, ErrorInfo, codes},
    event::DomainEventStream,
    id::{AggregateId, generate_id},
    message::{BoxFuture, COMPENSATION_ID_HEADER, Message},
    store::{EventStore, EventStreams, RangeError, TimeRange, VersionRange},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorStatus {
    Pending,
    Resolved,
}

/// A failed delivery or publish, kept for operators and compensation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub aggregate_id: AggregateId,
    pub command_id: String,
    pub request_id: String,
    pub message_id: String,
    /// Subscriber or component that failed.
    pub processor: String,
    pub stage: Option<CommandStage>,
    pub error: ErrorInfo,
    /// Inclusive aggregate versions the failed message covered.
    pub version_range: Option<(u64, u64)>,
    pub create_time: DateTime<Utc>,
    pub status: ErrorStatus,
}

impl ErrorRecord {
    /// A pending record for a failure while handling `message`.
    pub fn from_message<M: Message>(
        processor: impl Into<String>,
        stage: Option<CommandStage>,
        message: &M,
        error: ErrorInfo,
    ) -> Self {
        Self {
            id: generate_id(),
            aggregate_id: message.aggregate_id().clone(),
            command_id: message.command_id().to_string(),
            request_id: message.request_id().to_string(),
            message_id: message.message_id().to_string(),
            processor: processor.into(),
            stage,
            error,
            version_range: message.version_range(),
            create_time: Utc::now(),
            status: ErrorStatus::Pending,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == ErrorStatus::Pending
    }
}

/// Failure of an [`ErrorRepository`] backend.
#[derive(Debug, Error)]
#[error("error repository failure: {0}")]
pub struct ErrorRepositoryError(#[source] pub Box<dyn std::error::Error + Send + Sync>);

// ANCHOR: error_repository
/// Storage for [`ErrorRecord`]s.
///
/// Object safe so buses and processors can share one repository as
/// `Arc<dyn ErrorRepository>`.
pub trait ErrorRepository: Send + Sync {
    fn record(&self, record: ErrorRecord) -> BoxFuture<'_, Result<(), ErrorRepositoryError>>;

    fn get<'a>(
        &'a self,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ErrorRecord>, ErrorRepositoryError>>;

    /// Records not yet resolved, oldest first.
    fn pending(&self) -> BoxFuture<'_, Result<Vec<ErrorRecord>, ErrorRepositoryError>>;

    /// Mark a record resolved. Returns `false` if it does not exist.
    fn resolve<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<bool, ErrorRepositoryError>>;
}
// ANCHOR_END: error_repository

/// In-memory [`ErrorRepository`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryErrorRepository {
    records: Arc<RwLock<HashMap<String, ErrorRecord>>>,
}

impl InMemoryErrorRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .expect("error repository lock poisoned")
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ErrorRepository for InMemoryErrorRepository {
    fn record(&self, record: ErrorRecord) -> BoxFuture<'_, Result<(), ErrorRepositoryError>> {
        tracing::debug!(
            record_id = %record.id,
            processor = %record.processor,
            aggregate_id = %record.aggregate_id,
            "error recorded"
        );
        self.records
            .write()
            .expect("error repository lock poisoned")
            .insert(record.id.clone(), record);
        Box::pin(std::future::ready(Ok(())))
    }

    fn get<'a>(
        &'a self,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ErrorRecord>, ErrorRepositoryError>> {
        let record = self
            .records
            .read()
            .expect("error repository lock poisoned")
            .get(id)
            .cloned();
        Box::pin(std::future::ready(Ok(record)))
    }

    fn pending(&self) -> BoxFuture<'_, Result<Vec<ErrorRecord>, ErrorRepositoryError>> {
        let mut pending: Vec<ErrorRecord> = self
            .records
            .read()
            .expect("error repository lock poisoned")
            .values()
            .filter(|record| record.is_pending())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.create_time.cmp(&b.create_time).then(a.id.cmp(&b.id)));
        Box::pin(std::future::ready(Ok(pending)))
    }

    fn resolve<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<bool, ErrorRepositoryError>> {
        let found = self
            .records
            .write()
            .expect("error repository lock poisoned")
            .get_mut(id)
            .map(|record| record.status = ErrorStatus::Resolved)
            .is_some();
        Box::pin(std::future::ready(Ok(found)))
    }
}

#[derive(Debug, Error)]
pub enum CompensationError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    #[error("failed to load event streams: {0}")]
    Store(#[source] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Repository(#[from] ErrorRepositoryError),
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error("error record `{0}` not found")]
    RecordNotFound(String),
    #[error("error record `{0}` has no version range to resend")]
    NoVersionRange(String),
}

impl<StoreError: std::error::Error + 'static> ErrorCode for CompensationError<StoreError> {
    fn error_code(&self) -> &str {
        match self {
            Self::Store(_) | Self::Repository(_) => codes::STORE_UNAVAILABLE,
            Self::Bus(e) => e.error_code(),
            Self::Range(e) => e.error_code(),
            Self::RecordNotFound(_) | Self::NoVersionRange(_) => codes::ILLEGAL_ARGUMENT,
        }
    }
}

/// Re-publishes persisted event streams.
///
/// Re-sent streams carry the [`COMPENSATION_ID_HEADER`] header so consumers
/// can tell a replay from the original delivery.
#[derive(Clone, Debug)]
pub struct EventCompensator<ES, EB> {
    store: ES,
    bus: EB,
}

impl<ES, EB> EventCompensator<ES, EB>
where
    ES: EventStore,
    EB: MessageBus<DomainEventStream>,
{
    pub const fn new(store: ES, bus: EB) -> Self {
        Self { store, bus }
    }

    /// Re-send the streams of `aggregate_id` within `range`.
    ///
    /// Returns the number of streams sent.
    ///
    /// # Errors
    ///
    /// Returns [`CompensationError::Store`] if loading fails and
    /// [`CompensationError::Bus`] if the bus refuses a stream.
    #[tracing::instrument(skip(self, aggregate_id), fields(aggregate_id = %aggregate_id))]
    pub async fn resend(
        &self,
        aggregate_id: &AggregateId,
        range: VersionRange,
        compensation_id: &str,
    ) -> Result<usize, CompensationError<ES::Error>> {
        self.send_all(self.store.load(aggregate_id, range), compensation_id)
            .await
    }

    /// Re-send the streams of `aggregate_id` created within `range`.
    ///
    /// # Errors
    ///
    /// See [`resend`](Self::resend).
    #[tracing::instrument(skip(self, aggregate_id), fields(aggregate_id = %aggregate_id))]
    pub async fn resend_by_time(
        &self,
        aggregate_id: &AggregateId,
        range: TimeRange,
        compensation_id: &str,
    ) -> Result<usize, CompensationError<ES::Error>> {
        self.send_all(self.store.load_by_time(aggregate_id, range), compensation_id)
            .await
    }

    /// Re-send what the record `record_id` failed to deliver, then mark it
    /// resolved.
    ///
    /// # Errors
    ///
    /// Returns [`CompensationError::RecordNotFound`] or
    /// [`CompensationError::NoVersionRange`] for unusable records, plus the
    /// errors of [`resend`](Self::resend).
    pub async fn compensate(
        &self,
        errors: &dyn ErrorRepository,
        record_id: &str,
    ) -> Result<usize, CompensationError<ES::Error>> {
        let record = errors
            .get(record_id)
            .await?
            .ok_or_else(|| CompensationError::RecordNotFound(record_id.to_string()))?;
        let (head, tail) = record
            .version_range
            .ok_or_else(|| CompensationError::NoVersionRange(record_id.to_string()))?;
        let range = VersionRange::new(head, tail)?;

        let sent = self.resend(&record.aggregate_id, range, &record.id).await?;
        errors.resolve(&record.id).await?;
        tracing::info!(record_id, sent, "error record compensated");
        Ok(sent)
    }

    async fn send_all(
        &self,
        mut streams: EventStreams<'_, ES::Error>,
        compensation_id: &str,
    ) -> Result<usize, CompensationError<ES::Error>> {
        let mut sent = 0;
        while let Some(stream) = streams.next().await {
            let mut stream = stream.map_err(CompensationError::Store)?;
            stream
                .header
                .insert(COMPENSATION_ID_HEADER.to_string(), compensation_id.to_string());
            tracing::debug!(version = stream.version, "resending stream");
            // Fire and forget: failures are recorded again by the bus.
            let _delivery = self.bus.send(stream).await?;
            sent += 1;
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::{
        bus::{HandlerError, InMemoryBus, Subscription},
        id::NamedAggregate,
        store::inmemory,
    };

    fn id() -> AggregateId {
        NamedAggregate::new("sales", "order").aggregate_id("o-1")
    }

    fn stream(version: u64) -> DomainEventStream {
        DomainEventStream::builder(id(), version)
            .request_id(format!("req-{version}"))
            .build(vec![("changed".into(), json!({ "v": version }))])
            .unwrap()
    }

    async fn seeded_store() -> inmemory::Store {
        let store = inmemory::Store::new();
        for version in 1..=4 {
            store.append(&stream(version)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn repository_tracks_pending_and_resolved() {
        let errors = InMemoryErrorRepository::new();
        let record = ErrorRecord::from_message(
            "projector",
            Some(CommandStage::Projected),
            &stream(2),
            ErrorInfo::new("Broken", "down"),
        );
        assert_eq!(record.version_range, Some((2, 2)));
        assert_eq!(record.request_id, "req-2");
        errors.record(record.clone()).await.unwrap();

        assert_eq!(errors.pending().await.unwrap(), vec![record.clone()]);
        assert!(errors.resolve(&record.id).await.unwrap());
        assert!(errors.pending().await.unwrap().is_empty());
        assert!(!errors.resolve("missing").await.unwrap());
        assert_eq!(
            errors.get(&record.id).await.unwrap().unwrap().status,
            ErrorStatus::Resolved
        );
    }

    #[tokio::test]
    async fn resend_publishes_the_range_with_compensation_header() {
        let store = seeded_store().await;
        let bus = InMemoryBus::<DomainEventStream>::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = bus
            .subscribe(Subscription::new("replay"), move |stream: DomainEventStream| {
                sink.lock().unwrap().push((
                    stream.version,
                    stream.header.get(COMPENSATION_ID_HEADER).cloned(),
                ));
                std::future::ready(Ok::<_, HandlerError>(()))
            })
            .unwrap();

        let compensator = EventCompensator::new(store, bus.clone());
        let sent = compensator
            .resend(&id(), VersionRange::new(2, 3).unwrap(), "comp-1")
            .await
            .unwrap();
        assert_eq!(sent, 2);

        for _ in 0..200 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        handle.stop().await.unwrap();
        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![(2, Some("comp-1".to_string())), (3, Some("comp-1".to_string()))]
        );
    }

    #[tokio::test]
    async fn compensate_resends_and_resolves_the_record() {
        let store = seeded_store().await;
        let errors = InMemoryErrorRepository::new();
        let record = ErrorRecord::from_message(
            "projector",
            None,
            &stream(3),
            ErrorInfo::new("Broken", "down"),
        );
        errors.record(record.clone()).await.unwrap();

        let compensator = EventCompensator::new(store, crate::bus::NoBus);
        assert_eq!(compensator.compensate(&errors, &record.id).await.unwrap(), 1);
        assert!(errors.pending().await.unwrap().is_empty());

        let err = compensator.compensate(&errors, "missing").await.unwrap_err();
        assert!(matches!(err, CompensationError::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn resend_by_time_covers_everything_so_far() {
        let store = seeded_store().await;
        let compensator = EventCompensator::new(store, crate::bus::NoBus);
        let range = TimeRange::new(Utc::now() - chrono::Duration::hours(1), Utc::now()).unwrap();
        assert_eq!(
            compensator.resend_by_time(&id(), range, "comp-2").await.unwrap(),
            4
        );
    }
}
