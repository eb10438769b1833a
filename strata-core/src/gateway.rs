//! Client entry point for commands.
//!
//! [`CommandGateway`] checks a command (idempotency, then validation), puts
//! it on the command bus and reports the SENT stage. With
//! [`send_and_wait`](CommandGateway::send_and_wait) the caller also waits
//! for a later stage, typically PROCESSED.

use std::{fmt, sync::Arc, time::Duration};

use thiserror::Error;

use crate::{
    bus::{BusError, MessageBus},
    command::{CommandMessage, CommandResult, CommandStage},
    config::Config,
    error::{DomainError, ErrorCode, RecoverableType, codes},
    id::AggregateId,
    idempotency::IdempotencyCheckers,
    wait::{CommandWaitRegistry, WaitError, WaitingFor},
};

/// Processor name the gateway reports SENT under.
pub const GATEWAY_PROCESSOR: &str = "command-gateway";

/// Rejects malformed commands before they reach the bus.
pub trait CommandValidator: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns the reason the command is invalid.
    fn validate(&self, command: &CommandMessage) -> Result<(), DomainError>;
}

impl<F> CommandValidator for F
where
    F: Fn(&CommandMessage) -> Result<(), DomainError> + Send + Sync + 'static,
{
    fn validate(&self, command: &CommandMessage) -> Result<(), DomainError> {
        self(command)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid command: {0}")]
    Validation(#[source] DomainError),
    #[error("request {request_id} was already sent to {aggregate_id}")]
    DuplicateRequestId {
        aggregate_id: AggregateId,
        request_id: String,
    },
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Wait(#[from] WaitError),
    /// The awaited stage, or an earlier one, reported a failure.
    #[error("command {} failed at {}: {}", .0.command_id, .0.stage, .0.error)]
    Failed(Box<CommandResult>),
}

impl GatewayError {
    /// The failed result, for [`GatewayError::Failed`].
    #[must_use]
    pub fn result(&self) -> Option<&CommandResult> {
        match self {
            Self::Failed(result) => Some(result.as_ref()),
            _ => None,
        }
    }
}

impl ErrorCode for GatewayError {
    fn error_code(&self) -> &str {
        match self {
            Self::Validation(e) => e.error_code(),
            Self::DuplicateRequestId { .. } => codes::DUPLICATE_REQUEST_ID,
            Self::Bus(e) => e.error_code(),
            Self::Wait(e) => e.error_code(),
            Self::Failed(result) => &result.error.error_code,
        }
    }

    fn recoverable(&self) -> RecoverableType {
        match self {
            Self::Validation(e) => e.recoverable(),
            Self::DuplicateRequestId { .. } => RecoverableType::Unrecoverable,
            Self::Bus(e) => e.recoverable(),
            Self::Wait(e) => e.recoverable(),
            Self::Failed(result) => result.error.recoverable,
        }
    }
}

/// Sends commands and, on request, waits for their results.
#[derive(Clone)]
pub struct CommandGateway<CB> {
    bus: CB,
    waits: CommandWaitRegistry,
    idempotency: IdempotencyCheckers,
    validator: Option<Arc<dyn CommandValidator>>,
    timeout: Duration,
}

impl<CB> CommandGateway<CB>
where
    CB: MessageBus<CommandMessage>,
{
    /// A gateway with default idempotency checkers, no validator and a 30 s
    /// wait timeout.
    pub fn new(bus: CB, waits: CommandWaitRegistry) -> Self {
        Self::with_config(bus, waits, &Config::default())
    }

    pub fn with_config(bus: CB, waits: CommandWaitRegistry, config: &Config) -> Self {
        Self {
            bus,
            waits,
            idempotency: IdempotencyCheckers::new(config.idempotency.clone()),
            validator: None,
            timeout: config.wait.timeout(),
        }
    }

    #[must_use]
    pub fn with_idempotency(mut self, idempotency: IdempotencyCheckers) -> Self {
        self.idempotency = idempotency;
        self
    }

    #[must_use]
    pub fn with_validator(mut self, validator: impl CommandValidator) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn wait_registry(&self) -> &CommandWaitRegistry {
        &self.waits
    }

    fn check(&self, command: &CommandMessage) -> Result<(), GatewayError> {
        let checker = self
            .idempotency
            .checker(command.aggregate_id.named_aggregate());
        if !checker.check(&command.request_id) {
            return Err(GatewayError::DuplicateRequestId {
                aggregate_id: command.aggregate_id.clone(),
                request_id: command.request_id.clone(),
            });
        }
        if let Some(validator) = &self.validator {
            validator.validate(command).map_err(GatewayError::Validation)?;
        }
        Ok(())
    }

    async fn dispatch(&self, command: CommandMessage) -> Result<CommandResult, GatewayError> {
        let sent = CommandResult::succeeded(CommandStage::Sent, GATEWAY_PROCESSOR, &command);
        self.bus.send(command).await?;
        self.waits.signal(&sent);
        Ok(sent)
    }

    /// Check `command` and put it on the bus.
    ///
    /// # Errors
    ///
    /// [`GatewayError::DuplicateRequestId`] if its request id was seen
    /// recently, [`GatewayError::Validation`] if the validator refuses it,
    /// and [`GatewayError::Bus`] if the bus does not accept it.
    #[tracing::instrument(
        skip(self, command),
        fields(aggregate_id = %command.aggregate_id, command_id = %command.id, request_id = %command.request_id)
    )]
    pub async fn send(&self, command: CommandMessage) -> Result<CommandResult, GatewayError> {
        self.check(&command).inspect_err(|error| {
            tracing::debug!(error = %error, "command refused");
        })?;
        self.dispatch(command).await
    }

    /// [`send`](Self::send), then wait for `waiting_for` with the gateway's
    /// timeout.
    ///
    /// # Errors
    ///
    /// Everything [`send`](Self::send) returns, plus
    /// [`GatewayError::Wait`] on timeout and [`GatewayError::Failed`] if the
    /// command failed on its way to the awaited stage.
    pub async fn send_and_wait(
        &self,
        command: CommandMessage,
        waiting_for: WaitingFor,
    ) -> Result<CommandResult, GatewayError> {
        self.send_and_wait_for(command, waiting_for, self.timeout).await
    }

    /// [`send_and_wait`](Self::send_and_wait) with an explicit timeout.
    ///
    /// # Errors
    ///
    /// See [`send_and_wait`](Self::send_and_wait).
    #[tracing::instrument(
        skip(self, command, waiting_for),
        fields(
            aggregate_id = %command.aggregate_id,
            command_id = %command.id,
            stage = %waiting_for.stage,
        )
    )]
    pub async fn send_and_wait_for(
        &self,
        command: CommandMessage,
        waiting_for: WaitingFor,
        timeout: Duration,
    ) -> Result<CommandResult, GatewayError> {
        self.check(&command)?;
        // Registered before sending: the bus may process the command before
        // `send` returns.
        let handle = self.waits.register(command.id.as_str(), waiting_for);
        if let Err(error) = self.dispatch(command).await {
            handle.cancel();
            return Err(error);
        }
        let result = handle.wait(timeout).await?;
        if result.is_succeeded() {
            Ok(result)
        } else {
            Err(GatewayError::Failed(Box::new(result)))
        }
    }
}

impl<CB> fmt::Debug for CommandGateway<CB> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandGateway")
            .field("idempotency", &self.idempotency)
            .field("validator", &self.validator.is_some())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        bus::{HandlerError, InMemoryBus, Subscription},
        id::NamedAggregate,
        wait::notify_stage,
    };

    struct Rename(&'static str);

    fn command(name: &'static str) -> CommandMessage {
        CommandMessage::new(NamedAggregate::new("crm", "contact").aggregate_id("c-1"), Rename(name))
    }

    fn gateway(bus: &InMemoryBus<CommandMessage>) -> CommandGateway<InMemoryBus<CommandMessage>> {
        CommandGateway::new(bus.clone(), CommandWaitRegistry::new())
    }

    #[tokio::test]
    async fn send_reports_sent_and_delivers() {
        let bus = InMemoryBus::<CommandMessage>::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _handle = bus
            .subscribe(Subscription::new("contacts"), move |command: CommandMessage| {
                sink.lock().unwrap().push(command.id.clone());
                std::future::ready(Ok::<_, HandlerError>(()))
            })
            .unwrap();

        let command = command("Ada");
        let id = command.id.clone();
        let sent = gateway(&bus).send(command).await.unwrap();
        assert_eq!(sent.stage, CommandStage::Sent);
        assert_eq!(sent.processor, GATEWAY_PROCESSOR);
        assert_eq!(sent.command_id, id);

        for _ in 0..200 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*seen.lock().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn repeated_request_ids_are_refused() {
        let bus = InMemoryBus::<CommandMessage>::default();
        let gateway = gateway(&bus);
        gateway.send(command("Ada").with_request_id("req-1")).await.unwrap();
        let err = gateway
            .send(command("Ada").with_request_id("req-1"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), codes::DUPLICATE_REQUEST_ID);
    }

    #[tokio::test]
    async fn validator_runs_before_the_bus() {
        let bus = InMemoryBus::<CommandMessage>::default();
        let gateway = gateway(&bus).with_validator(|command: &CommandMessage| {
            match command.body::<Rename>() {
                Some(Rename("")) => Err(DomainError::bad_request("name required")),
                _ => Ok(()),
            }
        });
        let err = gateway.send(command("")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert_eq!(err.error_code(), codes::BAD_REQUEST);
        gateway.send(command("Ada")).await.unwrap();
    }

    #[tokio::test]
    async fn send_and_wait_returns_the_awaited_stage() {
        let bus = InMemoryBus::<CommandMessage>::default();
        let gateway = gateway(&bus);
        let waits = gateway.wait_registry().clone();
        let _handle = bus
            .subscribe(
                Subscription::new("contacts"),
                notify_stage(
                    waits,
                    CommandStage::Processed,
                    "contact.processor",
                    crate::config::BusConfig::default().max_redeliveries,
                    |_: CommandMessage| std::future::ready(Ok::<_, HandlerError>(())),
                ),
            )
            .unwrap();

        let result = gateway
            .send_and_wait(command("Ada"), WaitingFor::processed())
            .await
            .unwrap();
        assert_eq!(result.stage, CommandStage::Processed);
        assert_eq!(result.processor, "contact.processor");
    }

    #[tokio::test]
    async fn failed_stage_is_an_error() {
        let bus = InMemoryBus::<CommandMessage>::new(crate::config::BusConfig {
            max_redeliveries: 0,
            ..crate::config::BusConfig::default()
        });
        let gateway = gateway(&bus);
        let waits = gateway.wait_registry().clone();
        let _handle = bus
            .subscribe(
                Subscription::new("contacts"),
                notify_stage(waits, CommandStage::Processed, "contact.processor", 0, |_: CommandMessage| {
                    std::future::ready(Err::<(), _>(HandlerError::from_error(&DomainError::bad_request("nope"))))
                }),
            )
            .unwrap();

        let err = gateway
            .send_and_wait(command("Ada"), WaitingFor::processed())
            .await
            .unwrap_err();
        let result = err.result().unwrap();
        assert_eq!(result.stage, CommandStage::Processed);
        assert_eq!(err.error_code(), codes::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_without_a_consumer() {
        let bus = InMemoryBus::<CommandMessage>::default();
        let gateway = gateway(&bus).with_timeout(Duration::from_millis(50));
        let err = gateway
            .send_and_wait(command("Ada"), WaitingFor::processed())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Wait(WaitError::Timeout { .. })));
        assert!(gateway.wait_registry().is_empty());
    }

    #[tokio::test]
    async fn bus_failure_withdraws_the_waiter() {
        let bus = InMemoryBus::<CommandMessage>::default();
        bus.close();
        let gateway = gateway(&bus);
        let err = gateway
            .send_and_wait(command("Ada"), WaitingFor::processed())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Bus(BusError::Closed)));
        assert!(gateway.wait_registry().is_empty());
    }
}
