//! In-process [`MessageBus`].
//!
//! Every subscriber owns `partitions` bounded channels, each drained by one
//! worker task. A message goes to partition `hash(aggregate_id) % partitions`,
//! which keeps per-aggregate order while different aggregates proceed in
//! parallel. Full channels make [`send`](MessageBus::send) wait.
//!
//! Handlers run in their own task so a panic is contained and reported as a
//! nack. Failed deliveries are retried inline, which keeps the partition
//! ordered, up to `max_redeliveries` times. Deliveries that still fail are
//! logged and, if an [`ErrorRepository`] is attached, recorded for
//! compensation.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::{mpsc, oneshot, watch};

use super::{
    BusError, Delivery, DeliveryOutcome, HandlerError, MessageBus, MessageHandler, Subscription,
    SubscriptionHandle,
};
use crate::{
    compensation::{ErrorRecord, ErrorRepository},
    config::BusConfig,
    error::codes,
    id::AggregateId,
    message::Message,
};

struct Envelope<M> {
    message: M,
    ack: oneshot::Sender<DeliveryOutcome>,
}

struct Subscriber<M> {
    subscription: Subscription,
    partitions: Vec<mpsc::Sender<Envelope<M>>>,
}

struct Inner<M> {
    config: BusConfig,
    subscribers: RwLock<Vec<Arc<Subscriber<M>>>>,
    closed: AtomicBool,
    errors: Option<Arc<dyn ErrorRepository>>,
}

/// In-process bus for messages of type `M`.
///
/// Clones share the same subscribers.
pub struct InMemoryBus<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Clone for InMemoryBus<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Message> Default for InMemoryBus<M> {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl<M: Message> InMemoryBus<M> {
    /// Zero `buffer` or `partitions` are raised to one.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        let config = BusConfig {
            buffer: config.buffer.max(1),
            partitions: config.partitions.max(1),
            ..config
        };
        Self {
            inner: Arc::new(Inner {
                config,
                subscribers: RwLock::new(Vec::new()),
                closed: AtomicBool::new(false),
                errors: None,
            }),
        }
    }

    /// Record deliveries that exhaust their redeliveries in `errors`.
    ///
    /// Must be called before the first subscription.
    #[must_use]
    pub fn with_error_repository(self, errors: Arc<dyn ErrorRepository>) -> Self {
        let inner = Inner {
            config: self.inner.config.clone(),
            subscribers: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            errors: Some(errors),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .expect("bus subscribers lock poisoned")
            .len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop accepting messages.
    ///
    /// Subscribers are detached; their workers finish what is already queued
    /// and then exit.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let detached = std::mem::take(
            &mut *self
                .inner
                .subscribers
                .write()
                .expect("bus subscribers lock poisoned"),
        );
        tracing::debug!(subscribers = detached.len(), "message bus closed");
    }
}

fn partition_of(aggregate_id: &AggregateId, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    aggregate_id.hash(&mut hasher);
    let partitions = partitions as u64;
    usize::try_from(hasher.finish() % partitions).unwrap_or_default()
}

impl<M: Message> MessageBus<M> for InMemoryBus<M> {
    #[tracing::instrument(
        skip(self, message),
        fields(message_id = %message.message_id(), aggregate_id = %message.aggregate_id())
    )]
    async fn send(&self, message: M) -> Result<Delivery, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let targets: Vec<Arc<Subscriber<M>>> = {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .expect("bus subscribers lock poisoned");
            subscribers
                .iter()
                .filter(|subscriber| subscriber.subscription.matches(message.aggregate_id()))
                .cloned()
                .collect()
        };

        let partition = partition_of(message.aggregate_id(), self.inner.config.partitions);
        let mut pending = Vec::with_capacity(targets.len());
        for subscriber in targets {
            let (ack, receiver) = oneshot::channel();
            let envelope = Envelope {
                message: message.clone(),
                ack,
            };
            // A failed send drops the ack sender, so the delivery reads as
            // abandoned.
            if subscriber.partitions[partition].send(envelope).await.is_err() {
                tracing::warn!(
                    subscriber = subscriber.subscription.name(),
                    "subscriber stopped before delivery"
                );
            }
            pending.push((subscriber.subscription.name().to_string(), receiver));
        }

        tracing::trace!(partition, subscribers = pending.len(), "message routed");
        Ok(Delivery::new(message.message_id().to_string(), pending))
    }

    fn subscribe<H>(
        &self,
        subscription: Subscription,
        handler: H,
    ) -> Result<SubscriptionHandle, BusError>
    where
        H: MessageHandler<M>,
    {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .expect("bus subscribers lock poisoned");
        if subscribers
            .iter()
            .any(|existing| existing.subscription.name() == subscription.name())
        {
            return Err(BusError::DuplicateSubscriber(subscription.name().to_string()));
        }

        let handler = Arc::new(handler);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut senders = Vec::with_capacity(self.inner.config.partitions);
        let mut tasks = Vec::with_capacity(self.inner.config.partitions);
        for partition in 0..self.inner.config.partitions {
            let (sender, receiver) = mpsc::channel(self.inner.config.buffer);
            let worker = Worker {
                subscription: subscription.clone(),
                partition,
                handler: Arc::clone(&handler),
                max_redeliveries: self.inner.config.max_redeliveries,
                errors: self.inner.errors.clone(),
            };
            tasks.push(tokio::spawn(worker.run(receiver, stop_rx.clone())));
            senders.push(sender);
        }

        let subscriber = Arc::new(Subscriber {
            subscription: subscription.clone(),
            partitions: senders,
        });
        subscribers.push(Arc::clone(&subscriber));
        drop(subscribers);

        let inner = Arc::downgrade(&self.inner);
        let registered = Arc::downgrade(&subscriber);
        let detach = Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner
                    .subscribers
                    .write()
                    .expect("bus subscribers lock poisoned")
                    .retain(|existing| !std::ptr::eq(Arc::as_ptr(existing), registered.as_ptr()));
            }
        });

        tracing::debug!(
            subscriber = subscription.name(),
            partitions = tasks.len(),
            "subscribed"
        );
        Ok(SubscriptionHandle::new(
            subscription.name().to_string(),
            stop_tx,
            tasks,
            detach,
        ))
    }
}

struct Worker<H> {
    subscription: Subscription,
    partition: usize,
    handler: Arc<H>,
    max_redeliveries: u32,
    errors: Option<Arc<dyn ErrorRepository>>,
}

impl<H> Worker<H> {
    async fn run<M>(self, mut receiver: mpsc::Receiver<Envelope<M>>, mut stop: watch::Receiver<bool>)
    where
        M: Message,
        H: MessageHandler<M>,
    {
        loop {
            tokio::select! {
                biased;
                Ok(()) = stop.changed() => break,
                envelope = receiver.recv() => {
                    let Some(envelope) = envelope else {
                        break;
                    };
                    let outcome = self.deliver(&envelope.message).await;
                    let _ = envelope.ack.send(outcome);
                }
            }
        }
        tracing::trace!(
            subscriber = self.subscription.name(),
            partition = self.partition,
            "bus worker exited"
        );
    }

    async fn deliver<M>(&self, message: &M) -> DeliveryOutcome
    where
        M: Message,
        H: MessageHandler<M>,
    {
        let mut attempt = 0_u32;
        let error = loop {
            attempt += 1;
            let handler = Arc::clone(&self.handler);
            let delivered = message.clone();
            // `handle` itself may panic before returning a future.
            let result = match tokio::spawn(async move { handler.handle(delivered).await }).await {
                Ok(result) => result,
                Err(join) => Err(HandlerError::new(
                    codes::HANDLER_FAILED,
                    format!("handler panicked: {join}"),
                )),
            };
            match result {
                Ok(()) => return DeliveryOutcome::Acked,
                Err(error) if attempt <= self.max_redeliveries => {
                    tracing::warn!(
                        subscriber = self.subscription.name(),
                        message_id = message.message_id(),
                        attempt,
                        error = %error,
                        "handler failed, redelivering"
                    );
                }
                Err(error) => break error.into_info(),
            }
        };

        tracing::error!(
            subscriber = self.subscription.name(),
            message_id = message.message_id(),
            aggregate_id = %message.aggregate_id(),
            attempts = attempt,
            error = %error,
            "delivery failed"
        );
        if let Some(errors) = &self.errors {
            let record = ErrorRecord::from_message(
                self.subscription.name(),
                self.subscription.command_stage(),
                message,
                error.clone(),
            );
            if let Err(e) = errors.record(record).await {
                tracing::error!(error = %e, "failed to record delivery failure");
            }
        }
        DeliveryOutcome::Nacked(error)
    }
}
