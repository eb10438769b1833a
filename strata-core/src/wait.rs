//! Waiting for command stages.
//!
//! A caller registers interest in a stage of a command before sending it,
//! then awaits the matching [`CommandResult`]. Components that complete a
//! stage report it with [`CommandWaitRegistry::signal`]; bus handlers can be
//! wrapped with [`notify_stage`] to do so automatically.
//!
//! Timing out only ends the wait. The command keeps propagating.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::{
    bus::MessageHandler,
    command::{CommandResult, CommandStage},
    error::{ErrorCode, RecoverableType, codes},
    message::Message,
};

/// The stage (and optionally the reporting component) a caller waits for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaitingFor {
    pub stage: CommandStage,
    pub processor: Option<String>,
}

impl WaitingFor {
    #[must_use]
    pub const fn stage(stage: CommandStage) -> Self {
        Self {
            stage,
            processor: None,
        }
    }

    #[must_use]
    pub const fn processed() -> Self {
        Self::stage(CommandStage::Processed)
    }

    /// Only accept the signal of the named component.
    #[must_use]
    pub fn processor(mut self, processor: impl Into<String>) -> Self {
        self.processor = Some(processor.into());
        self
    }

    /// Whether `result` ends the wait: either it is the awaited signal, or
    /// an earlier stage failed and the awaited one will never come.
    #[must_use]
    pub fn is_completed_by(&self, result: &CommandResult) -> bool {
        if result.stage == self.stage {
            return self
                .processor
                .as_ref()
                .is_none_or(|processor| *processor == result.processor);
        }
        result.stage < self.stage && !result.is_succeeded()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out after {timeout:?} waiting for {stage} of command {command_id}")]
    Timeout {
        command_id: String,
        stage: CommandStage,
        timeout: Duration,
    },
    #[error("wait registry dropped before command {command_id} reached {stage}")]
    Closed {
        command_id: String,
        stage: CommandStage,
    },
}

impl ErrorCode for WaitError {
    fn error_code(&self) -> &str {
        codes::WAIT_TIMEOUT
    }

    fn recoverable(&self) -> RecoverableType {
        match self {
            Self::Timeout { .. } => RecoverableType::Recoverable,
            Self::Closed { .. } => RecoverableType::Unknown,
        }
    }
}

struct Waiter {
    id: u64,
    waiting_for: WaitingFor,
    sender: oneshot::Sender<CommandResult>,
}

#[derive(Default)]
struct Inner {
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
    next_id: AtomicU64,
}

/// In-process registry of callers waiting on command stages.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone, Default)]
pub struct CommandWaitRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CommandWaitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandWaitRegistry")
            .field("commands", &self.len())
            .finish()
    }
}

impl CommandWaitRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commands with at least one waiter.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .waiters
            .lock()
            .expect("wait registry lock poisoned")
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a waiter. Call before the command is sent so no signal is
    /// missed.
    pub fn register(&self, command_id: impl Into<String>, waiting_for: WaitingFor) -> WaitHandle {
        let command_id = command_id.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.inner
            .waiters
            .lock()
            .expect("wait registry lock poisoned")
            .entry(command_id.clone())
            .or_default()
            .push(Waiter {
                id,
                waiting_for: waiting_for.clone(),
                sender,
            });
        tracing::trace!(%command_id, stage = %waiting_for.stage, "waiter registered");
        WaitHandle {
            id,
            command_id,
            waiting_for,
            receiver,
            registry: self.clone(),
        }
    }

    /// Deliver a stage signal. Returns how many waiters it completed.
    pub fn signal(&self, result: &CommandResult) -> usize {
        let completed = {
            let mut waiters = self.inner.waiters.lock().expect("wait registry lock poisoned");
            let Some(pending) = waiters.get_mut(&result.command_id) else {
                return 0;
            };
            let (done, remaining): (Vec<Waiter>, Vec<Waiter>) = std::mem::take(pending)
                .into_iter()
                .partition(|waiter| waiter.waiting_for.is_completed_by(result));
            if remaining.is_empty() {
                waiters.remove(&result.command_id);
            } else {
                *pending = remaining;
            }
            done
        };

        let count = completed.len();
        for waiter in completed {
            let _ = waiter.sender.send(result.clone());
        }
        if count > 0 {
            tracing::debug!(
                command_id = %result.command_id,
                stage = %result.stage,
                succeeded = result.is_succeeded(),
                waiters = count,
                "stage signalled"
            );
        }
        count
    }

    fn remove(&self, command_id: &str, id: u64) {
        let mut waiters = self.inner.waiters.lock().expect("wait registry lock poisoned");
        if let Some(pending) = waiters.get_mut(command_id) {
            pending.retain(|waiter| waiter.id != id);
            if pending.is_empty() {
                waiters.remove(command_id);
            }
        }
    }
}

/// A pending wait created by [`CommandWaitRegistry::register`].
#[derive(Debug)]
pub struct WaitHandle {
    id: u64,
    command_id: String,
    waiting_for: WaitingFor,
    receiver: oneshot::Receiver<CommandResult>,
    registry: CommandWaitRegistry,
}

impl WaitHandle {
    #[must_use]
    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    #[must_use]
    pub const fn waiting_for(&self) -> &WaitingFor {
        &self.waiting_for
    }

    /// Withdraw the waiter without waiting.
    pub fn cancel(self) {
        self.registry.remove(&self.command_id, self.id);
    }

    /// Wait up to `timeout` for the awaited signal.
    ///
    /// The result may be a failure from an earlier stage; check
    /// [`CommandResult::is_succeeded`].
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Timeout`] if no completing signal arrives in
    /// time. The command itself is not cancelled.
    pub async fn wait(self, timeout: Duration) -> Result<CommandResult, WaitError> {
        let Self {
            id,
            command_id,
            waiting_for,
            receiver,
            registry,
        } = self;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(WaitError::Closed {
                command_id,
                stage: waiting_for.stage,
            }),
            Err(_) => {
                registry.remove(&command_id, id);
                tracing::debug!(%command_id, stage = %waiting_for.stage, ?timeout, "wait timed out");
                Err(WaitError::Timeout {
                    command_id,
                    stage: waiting_for.stage,
                    timeout,
                })
            }
        }
    }
}

/// Wrap a bus handler so it reports `stage` for the command behind each
/// message.
///
/// Only the final outcome of a delivery is reported. `max_redeliveries` must
/// match the bus the handler subscribes to: a failed attempt the bus will
/// redeliver is not signalled, and a failure is reported once redeliveries
/// are exhausted, ending the wait of callers waiting for this or a later
/// stage.
pub fn notify_stage<M, H>(
    registry: CommandWaitRegistry,
    stage: CommandStage,
    processor: impl Into<String>,
    max_redeliveries: u32,
    handler: H,
) -> impl MessageHandler<M>
where
    M: Message,
    H: MessageHandler<M>,
{
    let processor: Arc<str> = processor.into().into();
    // Failed attempts per message id, cleared on the final outcome.
    let failures: Arc<Mutex<HashMap<String, u32>>> = Arc::default();
    move |message: M| {
        let handled = handler.handle(message.clone());
        let registry = registry.clone();
        let processor = Arc::clone(&processor);
        let failures = Arc::clone(&failures);
        async move {
            let outcome = handled.await;
            let result = CommandResult::succeeded(stage, &*processor, &message);
            let mut failures = failures.lock().expect("stage failure counts poisoned");
            let result = match &outcome {
                Ok(()) => {
                    failures.remove(message.message_id());
                    Some(result)
                }
                Err(error) => {
                    let failed = failures.entry(message.message_id().to_string()).or_insert(0);
                    *failed += 1;
                    if *failed > max_redeliveries {
                        failures.remove(message.message_id());
                        Some(result.with_error(error.info().clone()))
                    } else {
                        tracing::trace!(
                            message_id = message.message_id(),
                            attempt = *failed,
                            "attempt failed, awaiting redelivery"
                        );
                        None
                    }
                }
            };
            drop(failures);
            if let Some(result) = result {
                registry.signal(&result);
            }
            outcome
        }
    }
}
