//! Command processing.
//!
//! [`AggregateProcessor`] runs one command against one aggregate:
//!
//! ```text
//! RECEIVED -> LOADING_STATE -> APPLYING_COMMAND -> PERSISTING -> PUBLISHING -> COMPLETED
//!                  ^                                    |
//!                  +------------- RETRYING <------------+  (version conflict)
//! ```
//!
//! with `FAILED` reachable from every state. The event store's append is
//! the only serialisation point: a concurrent writer shows up as a version
//! conflict, and the processor reloads and re-applies the command up to its
//! [`RetryBound`]. Append is the commit point; publishing failures after it
//! are logged and recorded, never rolled back.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tokio_stream::StreamExt as _;

use crate::{
    aggregate::{Aggregate, AggregateMetadata, CommandKind},
    bus::{MessageBus, NoBus},
    command::{CommandMessage, CommandResult, CommandStage},
    compensation::{ErrorRecord, ErrorRepository},
    concurrency::{ConcurrencyConflict, RetryBound},
    config::ProcessorConfig,
    error::{ErrorCode, ErrorInfo, RecoverableType, codes},
    event::{BuildStreamError, DomainEventStream},
    id::{AggregateId, NamedAggregate},
    message::BoxFuture,
    repository::{LoadError, StateAggregateRepository},
    snapshot::{NoSnapshots, SnapshotRepository},
    state::{SourcingError, StateAggregate, StateEvent},
    store::{AppendError, EventStore, VersionRange},
};

/// States of the processing state machine, logged as `state`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessingState {
    Received,
    LoadingState,
    ApplyingCommand,
    Persisting,
    Retrying,
    Publishing,
    Completed,
    Failed,
}

/// Why a command was not applied.
#[derive(Debug, Error)]
pub enum ProcessError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    #[error("aggregate {aggregate_id} already exists at version {version}")]
    AggregateCreatedBefore {
        aggregate_id: AggregateId,
        version: u64,
    },
    #[error("aggregate {0} not found")]
    AggregateNotFound(AggregateId),
    #[error("aggregate {0} is deleted")]
    AggregateDeleted(AggregateId),
    #[error("{aggregate} does not handle command {command}")]
    CommandNotSupported {
        aggregate: NamedAggregate,
        command: &'static str,
    },
    #[error("command expected {aggregate_id} at version {expected}, but it is at {actual}")]
    CommandVersionConflict {
        aggregate_id: AggregateId,
        expected: u64,
        actual: u64,
    },
    /// The aggregate's command handler refused the command.
    #[error("{0}")]
    Rejected(ErrorInfo),
    #[error("gave up on {aggregate_id} after {attempts} conflicting attempts")]
    ConcurrencyExhausted {
        aggregate_id: AggregateId,
        attempts: usize,
        #[source]
        last: ConcurrencyConflict,
    },
    #[error("request {request_id} was already applied to {aggregate_id}")]
    DuplicateRequestId {
        aggregate_id: AggregateId,
        request_id: String,
    },
    #[error("failed to build event stream: {0}")]
    Build(#[from] BuildStreamError),
    #[error(transparent)]
    Sourcing(#[from] SourcingError),
    #[error("event store failed: {0}")]
    Store(#[source] StoreError),
}

impl<StoreError> From<LoadError<StoreError>> for ProcessError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    fn from(error: LoadError<StoreError>) -> Self {
        match error {
            LoadError::Store(e) => Self::Store(e),
            LoadError::Sourcing(e) => Self::Sourcing(e),
        }
    }
}

impl<StoreError: std::error::Error + 'static> ErrorCode for ProcessError<StoreError> {
    fn error_code(&self) -> &str {
        match self {
            Self::AggregateCreatedBefore { .. } => codes::AGGREGATE_CREATED_BEFORE,
            Self::AggregateNotFound(_) => codes::AGGREGATE_NOT_FOUND,
            Self::AggregateDeleted(_) => codes::AGGREGATE_DELETED,
            Self::CommandNotSupported { .. } => codes::COMMAND_NOT_SUPPORTED,
            Self::CommandVersionConflict { .. } => codes::COMMAND_VERSION_CONFLICT,
            Self::Rejected(info) => &info.error_code,
            Self::ConcurrencyExhausted { .. } => codes::CONCURRENCY_EXHAUSTED,
            Self::DuplicateRequestId { .. } => codes::DUPLICATE_REQUEST_ID,
            Self::Build(e) => e.error_code(),
            Self::Sourcing(e) => e.error_code(),
            Self::Store(_) => codes::STORE_UNAVAILABLE,
        }
    }

    fn recoverable(&self) -> RecoverableType {
        match self {
            Self::AggregateCreatedBefore { .. }
            | Self::AggregateNotFound(_)
            | Self::AggregateDeleted(_)
            | Self::CommandNotSupported { .. }
            | Self::CommandVersionConflict { .. }
            | Self::ConcurrencyExhausted { .. }
            | Self::DuplicateRequestId { .. } => RecoverableType::Unrecoverable,
            Self::Rejected(info) => info.recoverable,
            Self::Build(e) => e.recoverable(),
            Self::Sourcing(e) => e.recoverable(),
            Self::Store(_) => RecoverableType::Unknown,
        }
    }
}

/// Successful outcome of [`AggregateProcessor::process`].
#[derive(Clone, Debug)]
pub struct Processed {
    /// The appended stream; `None` if the handler raised no events.
    pub stream: Option<DomainEventStream>,
    /// Aggregate version after the command.
    pub version: u64,
    /// The request had been applied before; `stream` is the earlier one.
    pub duplicate: bool,
    /// Attempts used, counting conflicts.
    pub attempts: usize,
}

enum Attempt<StoreError: std::error::Error + 'static> {
    Done(Processed),
    Conflict(ConcurrencyConflict),
    Failed(ProcessError<StoreError>),
}

#[derive(Default)]
struct AggregateLocks {
    locks: Mutex<HashMap<AggregateId, Arc<tokio::sync::Mutex<()>>>>,
}

impl AggregateLocks {
    async fn acquire(&self, aggregate_id: &AggregateId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("aggregate locks poisoned");
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(aggregate_id.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Applies commands to one aggregate type.
///
/// The processor publishes every appended stream on its event bus and,
/// when a state bus is attached with
/// [`with_state_bus`](Self::with_state_bus), the resulting [`StateEvent`] as
/// well.
pub struct AggregateProcessor<A: Aggregate, ES, SR = NoSnapshots, EB = NoBus, SB = NoBus> {
    name: String,
    metadata: Arc<AggregateMetadata<A>>,
    repository: StateAggregateRepository<ES, SR>,
    event_bus: EB,
    state_bus: Option<SB>,
    retry: RetryBound,
    locks: Option<Arc<AggregateLocks>>,
    errors: Option<Arc<dyn ErrorRepository>>,
}

impl<A, ES, SR, EB, SB> Clone for AggregateProcessor<A, ES, SR, EB, SB>
where
    A: Aggregate,
    ES: Clone,
    SR: Clone,
    EB: Clone,
    SB: Clone,
{
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            metadata: Arc::clone(&self.metadata),
            repository: self.repository.clone(),
            event_bus: self.event_bus.clone(),
            state_bus: self.state_bus.clone(),
            retry: self.retry,
            locks: self.locks.clone(),
            errors: self.errors.clone(),
        }
    }
}

impl<A, ES, SR> AggregateProcessor<A, ES, SR>
where
    A: Aggregate,
    ES: EventStore,
    SR: SnapshotRepository,
{
    pub fn new(
        metadata: Arc<AggregateMetadata<A>>,
        repository: StateAggregateRepository<ES, SR>,
    ) -> Self {
        Self {
            name: format!("{}.processor", metadata.named_aggregate()),
            metadata,
            repository,
            event_bus: NoBus,
            state_bus: None,
            retry: RetryBound::default(),
            locks: None,
            errors: None,
        }
    }
}

impl<A, ES, SR, EB, SB> AggregateProcessor<A, ES, SR, EB, SB>
where
    A: Aggregate,
    ES: EventStore,
    SR: SnapshotRepository,
    EB: MessageBus<DomainEventStream>,
    SB: MessageBus<StateEvent>,
{
    /// Publish appended streams on `bus`.
    pub fn with_event_bus<EB2>(self, bus: EB2) -> AggregateProcessor<A, ES, SR, EB2, SB>
    where
        EB2: MessageBus<DomainEventStream>,
    {
        AggregateProcessor {
            name: self.name,
            metadata: self.metadata,
            repository: self.repository,
            event_bus: bus,
            state_bus: self.state_bus,
            retry: self.retry,
            locks: self.locks,
            errors: self.errors,
        }
    }

    /// Publish a [`StateEvent`] for every appended stream on `bus`.
    pub fn with_state_bus<SB2>(self, bus: SB2) -> AggregateProcessor<A, ES, SR, EB, SB2>
    where
        SB2: MessageBus<StateEvent>,
    {
        AggregateProcessor {
            name: self.name,
            metadata: self.metadata,
            repository: self.repository,
            event_bus: self.event_bus,
            state_bus: Some(bus),
            retry: self.retry,
            locks: self.locks,
            errors: self.errors,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryBound) -> Self {
        self.retry = retry;
        self
    }

    /// Hold a per-aggregate lock while processing, so local commands for one
    /// aggregate queue up instead of conflicting.
    #[must_use]
    pub fn serialize_locally(mut self, enabled: bool) -> Self {
        self.locks = enabled.then(Arc::default);
        self
    }

    #[must_use]
    pub fn with_config(self, config: &ProcessorConfig) -> Self {
        self.with_retry(config.retry_bound())
            .serialize_locally(config.serialize_locally)
    }

    /// Record publishing failures in `errors`.
    #[must_use]
    pub fn with_error_repository(mut self, errors: Arc<dyn ErrorRepository>) -> Self {
        self.errors = Some(errors);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn named_aggregate(&self) -> &NamedAggregate {
        self.metadata.named_aggregate()
    }

    #[must_use]
    pub const fn repository(&self) -> &StateAggregateRepository<ES, SR> {
        &self.repository
    }

    /// Process `command` and report the outcome as a PROCESSED result.
    ///
    /// Never fails: errors are carried in [`CommandResult::error`].
    pub fn handle<'a>(
        &'a self,
        command: &'a CommandMessage,
    ) -> impl Future<Output = CommandResult> + Send + 'a {
        async move {
            match self.run(command).await {
                Ok(processed) => {
                    CommandResult::succeeded(CommandStage::Processed, self.name.as_str(), command)
                        .with_aggregate_version(Some(processed.version))
                        .with_duplicate(processed.duplicate)
                }
                Err(error) => CommandResult::failed(
                    CommandStage::Processed,
                    self.name.as_str(),
                    command,
                    &error,
                ),
            }
        }
    }

    /// Process `command`.
    ///
    /// # Errors
    ///
    /// Client errors (`AggregateCreatedBefore`, `AggregateNotFound`,
    /// `AggregateDeleted`, `CommandNotSupported`, `CommandVersionConflict`,
    /// `Rejected`) fail immediately. Version conflicts on append are retried;
    /// `ConcurrencyExhausted` is returned once the retry bound is spent.
    /// A command whose request id already produced a stream returns that
    /// earlier outcome with `duplicate` set, before any of these checks fail.
    pub fn process<'a>(
        &'a self,
        command: &'a CommandMessage,
    ) -> impl Future<Output = Result<Processed, ProcessError<ES::Error>>> + Send + 'a {
        self.run(command)
    }

    #[tracing::instrument(
        skip(self, command),
        fields(
            processor = %self.name,
            aggregate_id = %command.aggregate_id,
            command_id = %command.id,
            command = command.name(),
        )
    )]
    async fn run(&self, command: &CommandMessage) -> Result<Processed, ProcessError<ES::Error>> {
        tracing::debug!(state = ?ProcessingState::Received);
        let _guard = match &self.locks {
            Some(locks) => Some(locks.acquire(&command.aggregate_id).await),
            None => None,
        };

        let attempts = self.retry.attempts();
        let mut last_conflict = None;
        for attempt in 1..=attempts {
            match self.attempt(command).await {
                Attempt::Done(mut processed) => {
                    processed.attempts = attempt;
                    tracing::debug!(
                        state = ?ProcessingState::Completed,
                        version = processed.version,
                        attempt,
                        duplicate = processed.duplicate
                    );
                    return Ok(processed);
                }
                Attempt::Conflict(conflict) => {
                    tracing::debug!(
                        state = ?ProcessingState::Retrying,
                        attempt,
                        expected = conflict.expected,
                        actual = conflict.actual,
                    );
                    last_conflict = Some(conflict);
                }
                Attempt::Failed(error) => {
                    tracing::debug!(state = ?ProcessingState::Failed, error = %error);
                    return Err(error);
                }
            }
        }

        let last = last_conflict.unwrap_or_else(|| ConcurrencyConflict {
            aggregate_id: command.aggregate_id.clone(),
            expected: 0,
            actual: 0,
        });
        tracing::warn!(
            state = ?ProcessingState::Failed,
            attempts,
            "optimistic concurrency retries exhausted"
        );
        Err(ProcessError::ConcurrencyExhausted {
            aggregate_id: command.aggregate_id.clone(),
            attempts,
            last,
        })
    }

    async fn attempt(&self, command: &CommandMessage) -> Attempt<ES::Error> {
        match self.try_attempt(command).await {
            Ok(attempt) => attempt,
            Err(error) => Attempt::Failed(error),
        }
    }

    async fn try_attempt(
        &self,
        command: &CommandMessage,
    ) -> Result<Attempt<ES::Error>, ProcessError<ES::Error>> {
        let not_supported = || ProcessError::CommandNotSupported {
            aggregate: self.metadata.named_aggregate().clone(),
            command: command.name(),
        };
        let route = self
            .metadata
            .command_route(command.body_type_id())
            .ok_or_else(not_supported)?;

        tracing::trace!(state = ?ProcessingState::LoadingState);
        let mut state = self
            .repository
            .load(&self.metadata, &command.aggregate_id)
            .await?;
        if let Err(error) = self.check_preconditions(route.kind(), command, &state) {
            // A redelivered command fails these checks against its own outcome.
            if let Some(prior) = self.find_prior(command).await? {
                return Ok(Attempt::Done(prior));
            }
            return Err(error);
        }

        tracing::trace!(state = ?ProcessingState::ApplyingCommand, version = state.version());
        let raised = route
            .handle(state.state(), command.body_any())
            .ok_or_else(not_supported)?
            .map_err(|e| ProcessError::Rejected(ErrorInfo::from_error(&e)))?;
        if raised.is_empty() {
            tracing::debug!("command raised no events");
            return Ok(Attempt::Done(Processed {
                stream: None,
                version: state.version(),
                duplicate: false,
                attempts: 0,
            }));
        }

        let stream = DomainEventStream::builder(
            command.aggregate_id.clone(),
            state.expected_next_version(),
        )
        .command_id(command.id.as_str())
        .request_id(command.request_id.as_str())
        .header(command.header.clone())
        .build_raised(&raised)?;

        tracing::trace!(state = ?ProcessingState::Persisting, version = stream.version);
        match self.repository.event_store().append(&stream).await {
            Ok(()) => {}
            Err(AppendError::VersionConflict(conflict)) => return Ok(Attempt::Conflict(conflict)),
            Err(AppendError::DuplicateRequestId { .. }) => {
                return self.prior_outcome(command).await.map(Attempt::Done);
            }
            Err(AppendError::Store(e)) => return Err(ProcessError::Store(e)),
        }

        state.on_sourcing(&stream, &self.metadata)?;
        tracing::trace!(state = ?ProcessingState::Publishing);
        self.publish(&state, &stream).await;

        Ok(Attempt::Done(Processed {
            version: state.version(),
            stream: Some(stream),
            duplicate: false,
            attempts: 0,
        }))
    }

    fn check_preconditions(
        &self,
        kind: CommandKind,
        command: &CommandMessage,
        state: &StateAggregate<A>,
    ) -> Result<(), ProcessError<ES::Error>> {
        self.check_lifecycle(kind, state)?;
        match command.aggregate_version {
            Some(expected) if expected != state.version() => {
                Err(ProcessError::CommandVersionConflict {
                    aggregate_id: command.aggregate_id.clone(),
                    expected,
                    actual: state.version(),
                })
            }
            _ => Ok(()),
        }
    }

    fn check_lifecycle(
        &self,
        kind: CommandKind,
        state: &StateAggregate<A>,
    ) -> Result<(), ProcessError<ES::Error>> {
        let aggregate_id = state.aggregate_id();
        match kind {
            CommandKind::Create if state.initialized() => {
                Err(ProcessError::AggregateCreatedBefore {
                    aggregate_id: aggregate_id.clone(),
                    version: state.version(),
                })
            }
            CommandKind::Create => Ok(()),
            CommandKind::Change | CommandKind::Recover if !state.initialized() => {
                Err(ProcessError::AggregateNotFound(aggregate_id.clone()))
            }
            CommandKind::Change if state.deleted() => {
                Err(ProcessError::AggregateDeleted(aggregate_id.clone()))
            }
            CommandKind::Change | CommandKind::Recover => Ok(()),
        }
    }

    /// The stream an earlier delivery of the same request appended.
    async fn prior_outcome(
        &self,
        command: &CommandMessage,
    ) -> Result<Processed, ProcessError<ES::Error>> {
        self.find_prior(command)
            .await?
            .ok_or_else(|| ProcessError::DuplicateRequestId {
                aggregate_id: command.aggregate_id.clone(),
                request_id: command.request_id.clone(),
            })
    }

    async fn find_prior(
        &self,
        command: &CommandMessage,
    ) -> Result<Option<Processed>, ProcessError<ES::Error>> {
        let mut streams = self
            .repository
            .event_store()
            .load(&command.aggregate_id, VersionRange::all());
        while let Some(stream) = streams.next().await {
            let stream = stream.map_err(ProcessError::Store)?;
            if stream.request_id == command.request_id {
                tracing::debug!(
                    version = stream.version,
                    "request already applied, returning earlier outcome"
                );
                return Ok(Some(Processed {
                    version: stream.tail_version(),
                    stream: Some(stream),
                    duplicate: true,
                    attempts: 0,
                }));
            }
        }
        Ok(None)
    }

    async fn publish(&self, state: &StateAggregate<A>, stream: &DomainEventStream) {
        if let Err(error) = self.event_bus.send(stream.clone()).await {
            tracing::error!(error = %error, version = stream.version, "failed to publish event stream");
            self.record(stream, ErrorInfo::from_error(&error)).await;
        }

        let Some(state_bus) = &self.state_bus else {
            return;
        };
        let published = match state.to_state_event(stream.clone()) {
            Ok(event) => state_bus
                .send(event)
                .await
                .map(|_| ())
                .map_err(|e| ErrorInfo::from_error(&e)),
            Err(e) => Err(ErrorInfo::new(codes::CODEC, e.to_string())),
        };
        if let Err(error) = published {
            tracing::error!(error = %error, version = stream.version, "failed to publish state event");
            self.record(stream, error).await;
        }
    }

    async fn record(&self, stream: &DomainEventStream, error: ErrorInfo) {
        let Some(errors) = &self.errors else {
            return;
        };
        let record = ErrorRecord::from_message(
            self.name.as_str(),
            Some(CommandStage::Processed),
            stream,
            error,
        );
        if let Err(e) = errors.record(record).await {
            tracing::error!(error = %e, "failed to record publish failure");
        }
    }
}

// ANCHOR: command_processor
/// Object-safe view of a processor, used by the
/// [`CommandDispatcher`](crate::dispatcher::CommandDispatcher).
pub trait CommandProcessor: Send + Sync + 'static {
    fn named_aggregate(&self) -> &NamedAggregate;

    fn name(&self) -> &str;

    fn handle_command<'a>(&'a self, command: &'a CommandMessage) -> BoxFuture<'a, CommandResult>;
}
// ANCHOR_END: command_processor

impl<A, ES, SR, EB, SB> CommandProcessor for AggregateProcessor<A, ES, SR, EB, SB>
where
    A: Aggregate,
    ES: EventStore + 'static,
    SR: SnapshotRepository + 'static,
    EB: MessageBus<DomainEventStream> + 'static,
    SB: MessageBus<StateEvent> + 'static,
{
    fn named_aggregate(&self) -> &NamedAggregate {
        self.metadata.named_aggregate()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn handle_command<'a>(&'a self, command: &'a CommandMessage) -> BoxFuture<'a, CommandResult> {
        Box::pin(self.handle(command))
    }
}
