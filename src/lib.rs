#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use strata_core::test;
pub use strata_core::{
    aggregate,
    aggregate::{Aggregate, AggregateMetadata, Apply, Handle},
    command,
    command::{CommandMessage, CommandResult, CommandStage},
    compensation, concurrency, config,
    config::Config,
    dispatcher,
    dispatcher::CommandDispatcher,
    error,
    error::{DomainError, ErrorCode, ErrorInfo, RecoverableType},
    event,
    event::{DomainEvent, DomainEventStream, RaisedEvent, StoredEvent},
    gateway,
    gateway::CommandGateway,
    id,
    id::{AggregateId, NamedAggregate},
    idempotency, instrument, message, processor,
    processor::AggregateProcessor,
    repository,
    repository::StateAggregateRepository,
    snapshotter,
    state,
    state::{StateAggregate, StateEvent},
    wait,
    wait::{CommandWaitRegistry, WaitingFor},
};

pub mod store {

    pub use strata_core::store::{
        AppendError, EventStore, EventStreams, NonEmpty, RangeError, TimeRange, UNBOUNDED,
        VersionRange, collect_streams,
    };

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use strata_postgres::{Error, Store};
    }

    pub use strata_core::store::inmemory;
}

pub mod snapshot {

    pub use strata_core::snapshot::{
        NoSnapshots, Snapshot, SnapshotOffer, SnapshotPolicy, SnapshotRepository,
    };

    pub use strata_core::snapshot::inmemory;

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use strata_postgres::{Error, SnapshotStore};
    }
}

pub mod prepare {

    pub use strata_core::prepare::{
        InMemoryPrepareKey, PrepareError, PrepareKey, PrepareOutcome, PreparedValue,
    };

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use strata_postgres::{Error, PgPrepareKey};
    }
}

pub mod bus {

    pub use strata_core::bus::{
        BusError, Delivery, DeliveryOutcome, DeliveryReport, HandlerError, InMemoryBus,
        MessageBus, MessageHandler, NoBus, Subscription, SubscriptionHandle,
    };
}
