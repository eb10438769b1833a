//! Message buses.
//!
//! A [`MessageBus`] fans each sent message out to every matching
//! [`Subscription`]. Delivery is at-least-once and ordered per aggregate id:
//! the aggregate id is the partition key, and every subscriber processes one
//! partition strictly in send order.
//!
//! Each subscriber receives its own delivery and acknowledges it
//! independently, so a failing handler never blocks the others. The
//! [`Delivery`] returned by [`send`](MessageBus::send) resolves once every
//! subscriber has acked or nacked; see [`DeliveryReport::is_fully_handled`].
//!
//! # Example
//!
//! ```ignore
//! let bus = InMemoryBus::<DomainEventStream>::new(BusConfig::default());
//! let handle = bus.subscribe(
//!     Subscription::new("audit").topic(NamedAggregate::new("sales", "order")),
//!     |stream: DomainEventStream| async move {
//!         tracing::info!(version = stream.version, "order changed");
//!         Ok::<_, HandlerError>(())
//!     },
//! )?;
//!
//! let report = bus.send(stream).await?.wait().await;
//! assert!(report.is_fully_handled());
//! handle.stop().await?;
//! ```

use std::{collections::BTreeSet, fmt};

use thiserror::Error;
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};

use crate::{
    command::CommandStage,
    error::{ErrorCode, ErrorInfo, codes},
    id::{AggregateId, NamedAggregate},
    message::{BoxFuture, Message},
};

pub mod inmemory;

pub use inmemory::InMemoryBus;

/// A handler failure, reported back to the bus as a nack.
#[derive(Clone, Debug, Error)]
#[error("{0}")]
pub struct HandlerError(ErrorInfo);

impl HandlerError {
    pub fn new(error_code: impl Into<String>, error_msg: impl Into<String>) -> Self {
        Self(ErrorInfo::new(error_code, error_msg))
    }

    /// Wrap a typed error, keeping its code and classification.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: ErrorCode + std::error::Error + ?Sized,
    {
        Self(ErrorInfo::from_error(error))
    }

    #[must_use]
    pub const fn info(&self) -> &ErrorInfo {
        &self.0
    }

    #[must_use]
    pub fn into_info(self) -> ErrorInfo {
        self.0
    }
}

impl From<ErrorInfo> for HandlerError {
    fn from(info: ErrorInfo) -> Self {
        Self(info)
    }
}

impl ErrorCode for HandlerError {
    fn error_code(&self) -> &str {
        &self.0.error_code
    }

    fn recoverable(&self) -> crate::error::RecoverableType {
        self.0.recoverable
    }
}

// ANCHOR: message_handler
/// Consumer of messages of type `M`.
///
/// Implemented for every `Fn(M) -> impl Future<Output = Result<(),
/// HandlerError>>` closure. The returned future must be `'static`, so clone
/// what the handler needs into it.
pub trait MessageHandler<M>: Send + Sync + 'static {
    fn handle(&self, message: M) -> BoxFuture<'static, Result<(), HandlerError>>;
}
// ANCHOR_END: message_handler

impl<M, F, Fut> MessageHandler<M> for F
where
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, message: M) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(self(message))
    }
}

/// Who receives what.
///
/// An empty topic set subscribes to every aggregate type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    name: String,
    topics: BTreeSet<NamedAggregate>,
    stage: Option<CommandStage>,
}

impl Subscription {
    /// `name` identifies the subscriber; it must be unique per bus.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topics: BTreeSet::new(),
            stage: None,
        }
    }

    #[must_use]
    pub fn topic(mut self, topic: NamedAggregate) -> Self {
        self.topics.insert(topic);
        self
    }

    #[must_use]
    pub fn topics(mut self, topics: impl IntoIterator<Item = NamedAggregate>) -> Self {
        self.topics.extend(topics);
        self
    }

    /// The command stage this subscriber completes, recorded with failures.
    #[must_use]
    pub const fn stage(mut self, stage: CommandStage) -> Self {
        self.stage = Some(stage);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn command_stage(&self) -> Option<CommandStage> {
        self.stage
    }

    #[must_use]
    pub fn matches(&self, aggregate_id: &AggregateId) -> bool {
        self.topics.is_empty() || self.topics.contains(aggregate_id.named_aggregate())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("message bus is closed")]
    Closed,
    #[error("subscriber `{0}` is already registered")]
    DuplicateSubscriber(String),
    #[error("bus worker panicked")]
    WorkerPanicked,
}

impl ErrorCode for BusError {
    fn error_code(&self) -> &str {
        codes::BUS_UNAVAILABLE
    }
}

/// Final outcome of one delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    /// Every redelivery failed; carries the last error.
    Nacked(ErrorInfo),
}

/// Pending acknowledgements for one sent message.
pub struct Delivery {
    message_id: String,
    pending: Vec<(String, oneshot::Receiver<DeliveryOutcome>)>,
}

impl Delivery {
    pub(crate) const fn new(
        message_id: String,
        pending: Vec<(String, oneshot::Receiver<DeliveryOutcome>)>,
    ) -> Self {
        Self {
            message_id,
            pending,
        }
    }

    /// A delivery that reached no subscriber.
    pub fn empty(message_id: impl Into<String>) -> Self {
        Self::new(message_id.into(), Vec::new())
    }

    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Names of the subscribers this message was routed to.
    pub fn subscribers(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(|(name, _)| name.as_str())
    }

    /// Wait for every subscriber to settle its delivery.
    ///
    /// A subscriber that stops before settling is reported as abandoned.
    pub async fn wait(self) -> DeliveryReport {
        let mut report = DeliveryReport {
            message_id: self.message_id,
            ..DeliveryReport::default()
        };
        for (subscriber, receiver) in self.pending {
            match receiver.await {
                Ok(DeliveryOutcome::Acked) => report.acked.push(subscriber),
                Ok(DeliveryOutcome::Nacked(error)) => report.nacked.push((subscriber, error)),
                Err(_) => report.abandoned.push(subscriber),
            }
        }
        report
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message_id)
            .field("subscribers", &self.subscribers().collect::<Vec<_>>())
            .finish()
    }
}

/// Settled acknowledgements of one message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub message_id: String,
    pub acked: Vec<String>,
    pub nacked: Vec<(String, ErrorInfo)>,
    pub abandoned: Vec<String>,
}

impl DeliveryReport {
    /// Every live subscriber acked.
    #[must_use]
    pub fn is_fully_handled(&self) -> bool {
        self.nacked.is_empty() && self.abandoned.is_empty()
    }
}

/// Handle to a running subscription.
///
/// Dropping the handle does **not** stop the subscription. Call
/// [`stop()`](Self::stop) to detach from the bus and wait for the workers.
pub struct SubscriptionHandle {
    name: String,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        name: String,
        stop_tx: watch::Sender<bool>,
        tasks: Vec<JoinHandle<()>>,
        detach: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            name,
            stop_tx,
            tasks,
            detach: Some(detach),
        }
    }

    /// A handle with no workers, returned by buses that deliver nothing.
    #[must_use]
    pub fn detached(name: impl Into<String>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            stop_tx,
            tasks: Vec::new(),
            detach: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop receiving and wait for the workers to finish their current
    /// message. Queued deliveries are abandoned.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::WorkerPanicked`] if a worker task panicked.
    pub async fn stop(mut self) -> Result<(), BusError> {
        if let Some(detach) = self.detach.take() {
            detach();
        }
        let _ = self.stop_tx.send(true);
        let mut result = Ok(());
        for task in self.tasks.drain(..) {
            if task.await.is_err() {
                result = Err(BusError::WorkerPanicked);
            }
        }
        tracing::debug!(subscriber = %self.name, "subscription stopped");
        result
    }

    /// Check if any worker is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("name", &self.name)
            .field("workers", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

// ANCHOR: message_bus
/// Publish/subscribe transport for one message type.
pub trait MessageBus<M: Message>: Send + Sync {
    /// Route `message` to every matching subscriber.
    ///
    /// Waits for channel capacity when a subscriber is backlogged, but not
    /// for the handlers themselves; use the returned [`Delivery`] for that.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Closed`] once the bus no longer accepts messages.
    fn send(&self, message: M) -> impl Future<Output = Result<Delivery, BusError>> + Send + '_;

    /// Register `handler` for the messages `subscription` selects.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::DuplicateSubscriber`] if the subscription name is
    /// taken, or [`BusError::Closed`].
    fn subscribe<H>(
        &self,
        subscription: Subscription,
        handler: H,
    ) -> Result<SubscriptionHandle, BusError>
    where
        H: MessageHandler<M>;
}
// ANCHOR_END: message_bus

impl<M, T> MessageBus<M> for std::sync::Arc<T>
where
    M: Message,
    T: MessageBus<M> + ?Sized,
{
    fn send(&self, message: M) -> impl Future<Output = Result<Delivery, BusError>> + Send + '_ {
        (**self).send(message)
    }

    fn subscribe<H>(
        &self,
        subscription: Subscription,
        handler: H,
    ) -> Result<SubscriptionHandle, BusError>
    where
        H: MessageHandler<M>,
    {
        (**self).subscribe(subscription, handler)
    }
}

/// A bus that delivers nothing.
///
/// Used where publishing is optional, e.g. the state-event bus of a processor
/// that does not publish state events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoBus;

impl<M: Message> MessageBus<M> for NoBus {
    fn send(&self, message: M) -> impl Future<Output = Result<Delivery, BusError>> + Send + '_ {
        std::future::ready(Ok(Delivery::empty(message.message_id())))
    }

    fn subscribe<H>(
        &self,
        subscription: Subscription,
        _handler: H,
    ) -> Result<SubscriptionHandle, BusError>
    where
        H: MessageHandler<M>,
    {
        Ok(SubscriptionHandle::detached(subscription.name))
    }
}
