//! Command-side domain primitives.
//!
//! This module defines the building blocks for aggregates: state reconstruction
//! (`Apply`), command handling (`Handle`), and the registration table
//! ([`AggregateMetadata`]) the processor dispatches through. Commands are
//! routed by their runtime type, events by their stored name; both tables are
//! built once, when the aggregate type is registered.

use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    fmt,
};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    error::ErrorCode,
    event::{DomainEvent, EventDecodeError, RaisedEvent, StoredEvent},
    id::NamedAggregate,
};

/// Command-side entities that produce domain events.
///
/// Aggregates rebuild their state from events (`Apply<E>`) and validate
/// commands via [`Handle<C>`]. State must be serialisable so it can be
/// snapshotted and published as a state event.
// ANCHOR: aggregate_trait
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Bounded context the aggregate lives in.
    const CONTEXT: &'static str;

    /// Aggregate type name, unique within its context: `"order"`,
    /// `"user-account"`, etc.
    const NAME: &'static str;

    /// Business error raised by command handlers.
    type Error: std::error::Error + ErrorCode + Send + Sync + 'static;

    #[must_use]
    fn named_aggregate() -> NamedAggregate {
        NamedAggregate::new(Self::CONTEXT, Self::NAME)
    }
}
// ANCHOR_END: aggregate_trait

/// Mutate an aggregate with a domain event.
///
/// `Apply<E>` is called while the repository rebuilds aggregate state, keeping
/// the domain logic focused on pure events rather than persistence concerns.
///
/// ```ignore
/// impl Apply<FundsDeposited> for Account {
///     fn apply(&mut self, event: &FundsDeposited) {
///         self.balance += event.amount;
///     }
/// }
/// ```
// ANCHOR: apply_trait
pub trait Apply<E> {
    fn apply(&mut self, event: &E);
}
// ANCHOR_END: apply_trait

/// Entry point for command handling.
///
/// Each command type gets its own implementation, letting the aggregate express
/// validation logic in a strongly typed way. Create commands are handled
/// against `Self::default()`.
///
/// ```ignore
/// impl Handle<DepositFunds> for Account {
///     fn handle(&self, command: &DepositFunds) -> Result<Vec<RaisedEvent>, Self::Error> {
///         if command.amount <= 0 {
///             return Err(DomainError::bad_request("amount must be positive"));
///         }
///         Ok(vec![FundsDeposited { amount: command.amount }.into()])
///     }
/// }
/// ```
// ANCHOR: handle_trait
pub trait Handle<C>: Aggregate {
    /// Handle a command and produce events.
    ///
    /// # Errors
    ///
    /// Returns `Self::Error` if the command is invalid for the current
    /// aggregate state.
    fn handle(&self, command: &C) -> Result<Vec<RaisedEvent>, Self::Error>;
}
// ANCHOR_END: handle_trait

/// How a registered command relates to the aggregate lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    /// Only valid against an aggregate that does not exist yet.
    Create,
    /// Valid against an existing, non-deleted aggregate.
    Change,
    /// Valid against a deleted aggregate.
    Recover,
}

/// How a registered event affects the lifecycle flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Regular,
    Deleted,
    Recovered,
}

type CommandFn<A> = Box<
    dyn Fn(&A, &(dyn Any + Send + Sync)) -> Option<Result<Vec<RaisedEvent>, <A as Aggregate>::Error>>
        + Send
        + Sync,
>;

type ApplyFn<A> = Box<dyn Fn(&mut A, &StoredEvent) -> Result<(), EventDecodeError> + Send + Sync>;

/// A command handler looked up by command type.
pub struct CommandRoute<A: Aggregate> {
    kind: CommandKind,
    name: &'static str,
    handle: CommandFn<A>,
}

impl<A: Aggregate> CommandRoute<A> {
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Rust type name of the command.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Invoke the handler. `None` if `body` is not the registered type.
    pub fn handle(
        &self,
        state: &A,
        body: &(dyn Any + Send + Sync),
    ) -> Option<Result<Vec<RaisedEvent>, A::Error>> {
        (self.handle)(state, body)
    }
}

/// An apply function looked up by event name.
pub struct EventRoute<A: Aggregate> {
    kind: EventKind,
    apply: ApplyFn<A>,
}

impl<A: Aggregate> EventRoute<A> {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    /// Decode `event` and fold it into `state`.
    ///
    /// # Errors
    ///
    /// Returns [`EventDecodeError`] when the stored body does not match the
    /// registered event type.
    pub fn apply(&self, state: &mut A, event: &StoredEvent) -> Result<(), EventDecodeError> {
        (self.apply)(state, event)
    }
}

/// Registration table of an aggregate type.
///
/// Built once and shared (behind an `Arc`) by the repository, processor and
/// snapshotter of the aggregate.
///
/// ```ignore
/// let metadata = AggregateMetadata::<Order>::builder()
///     .create::<CreateOrder>()
///     .command::<AddItem>()
///     .event::<OrderCreated>()
///     .event::<ItemAdded>()
///     .build();
/// ```
pub struct AggregateMetadata<A: Aggregate> {
    named_aggregate: NamedAggregate,
    commands: HashMap<TypeId, CommandRoute<A>>,
    events: HashMap<&'static str, EventRoute<A>>,
}

impl<A: Aggregate> AggregateMetadata<A> {
    #[must_use]
    pub fn builder() -> AggregateMetadataBuilder<A> {
        AggregateMetadataBuilder {
            metadata: Self {
                named_aggregate: A::named_aggregate(),
                commands: HashMap::new(),
                events: HashMap::new(),
            },
        }
    }

    #[must_use]
    pub const fn named_aggregate(&self) -> &NamedAggregate {
        &self.named_aggregate
    }

    /// Route for a command body of the given runtime type.
    #[must_use]
    pub fn command_route(&self, type_id: TypeId) -> Option<&CommandRoute<A>> {
        self.commands.get(&type_id)
    }

    /// Route for a stored event name.
    #[must_use]
    pub fn event_route(&self, name: &str) -> Option<&EventRoute<A>> {
        self.events.get(name)
    }

    /// Whether `C` is registered as a create command.
    #[must_use]
    pub fn is_create<C: Any>(&self) -> bool {
        self.command_route(TypeId::of::<C>())
            .is_some_and(|route| route.kind == CommandKind::Create)
    }

    /// Registered event names.
    pub fn event_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.events.keys().copied()
    }
}

impl<A: Aggregate> fmt::Debug for AggregateMetadata<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<_> = self.commands.values().map(|c| (c.name, c.kind)).collect();
        commands.sort_unstable_by_key(|(name, _)| *name);
        let mut events: Vec<_> = self.events.iter().map(|(n, e)| (*n, e.kind)).collect();
        events.sort_unstable_by_key(|(name, _)| *name);
        f.debug_struct("AggregateMetadata")
            .field("named_aggregate", &self.named_aggregate)
            .field("commands", &commands)
            .field("events", &events)
            .finish()
    }
}

/// Builder returned by [`AggregateMetadata::builder`].
pub struct AggregateMetadataBuilder<A: Aggregate> {
    metadata: AggregateMetadata<A>,
}

impl<A: Aggregate> AggregateMetadataBuilder<A> {
    fn with_command<C>(mut self, kind: CommandKind) -> Self
    where
        A: Handle<C>,
        C: Send + Sync + 'static,
    {
        let handle: CommandFn<A> = Box::new(|state: &A, body: &(dyn Any + Send + Sync)| {
            body.downcast_ref::<C>().map(|command| state.handle(command))
        });
        self.metadata.commands.insert(
            TypeId::of::<C>(),
            CommandRoute {
                kind,
                name: type_name::<C>(),
                handle,
            },
        );
        self
    }

    /// Register a command that creates the aggregate.
    #[must_use]
    pub fn create<C>(self) -> Self
    where
        A: Handle<C>,
        C: Send + Sync + 'static,
    {
        self.with_command::<C>(CommandKind::Create)
    }

    /// Register a command against an existing aggregate.
    #[must_use]
    pub fn command<C>(self) -> Self
    where
        A: Handle<C>,
        C: Send + Sync + 'static,
    {
        self.with_command::<C>(CommandKind::Change)
    }

    /// Register a command that may run against a deleted aggregate.
    #[must_use]
    pub fn recover<C>(self) -> Self
    where
        A: Handle<C>,
        C: Send + Sync + 'static,
    {
        self.with_command::<C>(CommandKind::Recover)
    }

    /// Register an event folded with [`Apply<E>`].
    #[must_use]
    pub fn event<E>(mut self) -> Self
    where
        A: Apply<E>,
        E: DomainEvent,
    {
        let apply: ApplyFn<A> = Box::new(|state: &mut A, stored: &StoredEvent| {
            let event = stored.decode::<E>()?;
            state.apply(&event);
            Ok(())
        });
        self.metadata.events.insert(
            E::NAME,
            EventRoute {
                kind: EventKind::Regular,
                apply,
            },
        );
        self
    }

    fn with_lifecycle_event<E: DomainEvent>(mut self, kind: EventKind) -> Self {
        let apply: ApplyFn<A> = Box::new(|_: &mut A, stored: &StoredEvent| {
            stored.decode::<E>().map(drop)
        });
        self.metadata
            .events
            .insert(E::NAME, EventRoute { kind, apply });
        self
    }

    /// Register an event that marks the aggregate deleted. State is left
    /// untouched.
    #[must_use]
    pub fn deleted<E: DomainEvent>(self) -> Self {
        self.with_lifecycle_event::<E>(EventKind::Deleted)
    }

    /// Register an event that clears the deleted flag.
    #[must_use]
    pub fn recovered<E: DomainEvent>(self) -> Self {
        self.with_lifecycle_event::<E>(EventKind::Recovered)
    }

    #[must_use]
    pub fn build(self) -> AggregateMetadata<A> {
        tracing::debug!(
            aggregate = %self.metadata.named_aggregate,
            commands = self.metadata.commands.len(),
            events = self.metadata.events.len(),
            "aggregate registered"
        );
        self.metadata
    }
}
