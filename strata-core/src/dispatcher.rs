//! Routes commands from the command bus to aggregate processors.

use std::{collections::HashMap, fmt, sync::Arc};

use thiserror::Error;

use crate::{
    bus::{BusError, HandlerError, MessageBus, Subscription, SubscriptionHandle},
    command::{CommandMessage, CommandResult, CommandStage},
    error::{ErrorCode, RecoverableType, codes},
    id::NamedAggregate,
    processor::CommandProcessor,
    wait::CommandWaitRegistry,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no processor registered for {0}")]
    NoProcessor(NamedAggregate),
    #[error("a processor for {0} is already registered")]
    DuplicateProcessor(NamedAggregate),
}

impl ErrorCode for DispatchError {
    fn error_code(&self) -> &str {
        match self {
            Self::NoProcessor(_) => codes::COMMAND_NOT_SUPPORTED,
            Self::DuplicateProcessor(_) => codes::ILLEGAL_ARGUMENT,
        }
    }

    fn recoverable(&self) -> RecoverableType {
        RecoverableType::Unrecoverable
    }
}

/// Maps each aggregate type to its processor and reports PROCESSED to the
/// wait registry.
///
/// ```ignore
/// let dispatcher = CommandDispatcher::new(waits.clone())
///     .register(order_processor)?
///     .register(account_processor)?;
/// let handle = dispatcher.start(&command_bus)?;
/// ```
#[derive(Clone)]
pub struct CommandDispatcher {
    name: String,
    processors: Arc<HashMap<NamedAggregate, Arc<dyn CommandProcessor>>>,
    waits: CommandWaitRegistry,
}

impl CommandDispatcher {
    #[must_use]
    pub fn new(waits: CommandWaitRegistry) -> Self {
        Self {
            name: "command-dispatcher".to_string(),
            processors: Arc::default(),
            waits,
        }
    }

    /// Subscriber name used on the command bus.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a processor.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::DuplicateProcessor`] if one is already
    /// registered for the same aggregate type.
    pub fn register<P: CommandProcessor>(mut self, processor: P) -> Result<Self, DispatchError> {
        let named = processor.named_aggregate().clone();
        let processors = Arc::make_mut(&mut self.processors);
        if processors.contains_key(&named) {
            return Err(DispatchError::DuplicateProcessor(named));
        }
        tracing::debug!(aggregate = %named, processor = processor.name(), "processor registered");
        processors.insert(named, Arc::new(processor));
        Ok(self)
    }

    #[must_use]
    pub fn aggregates(&self) -> Vec<NamedAggregate> {
        let mut aggregates: Vec<_> = self.processors.keys().cloned().collect();
        aggregates.sort();
        aggregates
    }

    /// Run `command` through its processor and signal the result.
    ///
    /// A command for an unregistered aggregate type still produces a failed
    /// PROCESSED result, so waiters do not hang.
    #[tracing::instrument(
        skip(self, command),
        fields(aggregate_id = %command.aggregate_id, command_id = %command.id)
    )]
    pub async fn dispatch(&self, command: &CommandMessage) -> CommandResult {
        let named = command.aggregate_id.named_aggregate();
        let result = match self.processors.get(named) {
            Some(processor) => processor.handle_command(command).await,
            None => {
                let error = DispatchError::NoProcessor(named.clone());
                tracing::warn!(error = %error, "command dropped");
                CommandResult::failed(CommandStage::Processed, self.name.as_str(), command, &error)
            }
        };
        self.waits.signal(&result);
        result
    }

    /// Consume `bus` until the returned handle is stopped.
    ///
    /// Every delivery is acknowledged: a failed command is reported through
    /// its [`CommandResult`], redelivering it would not change the outcome.
    ///
    /// # Errors
    ///
    /// Returns the bus error if the subscription is refused.
    pub fn start<CB>(&self, bus: &CB) -> Result<SubscriptionHandle, BusError>
    where
        CB: MessageBus<CommandMessage>,
    {
        let subscription = Subscription::new(self.name.as_str())
            .topics(self.aggregates())
            .stage(CommandStage::Processed);
        let dispatcher = self.clone();
        bus.subscribe(subscription, move |command: CommandMessage| {
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher.dispatch(&command).await;
                Ok::<_, HandlerError>(())
            }
        })
    }
}

impl fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("name", &self.name)
            .field("aggregates", &self.aggregates())
            .finish_non_exhaustive()
    }
}
