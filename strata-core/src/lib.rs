//! Core traits and types for the strata event-sourcing framework.
//!
//! This crate provides the command-side kernel of an event-sourced system:
//!
//! - [`event`] - Event streams (`DomainEventStream`, `StoredEvent`,
//!   `DomainEvent`)
//! - [`store`] - Event persistence with optimistic concurrency (`EventStore`)
//! - [`snapshot`] - Snapshot persistence and policies (`SnapshotRepository`)
//! - [`aggregate`] - Command-side primitives (`Aggregate`, `Apply`, `Handle`,
//!   `AggregateMetadata`)
//! - [`state`] / [`repository`] - State reconstruction
//!   (`StateAggregate`, `StateAggregateRepository`)
//! - [`processor`] - The command processing state machine
//!   (`AggregateProcessor`)
//! - [`bus`] - At-least-once, per-aggregate ordered message delivery
//!   (`MessageBus`)
//! - [`dispatcher`], [`gateway`], [`wait`] - Command routing, sending and
//!   waiting for results
//! - [`prepare`], [`idempotency`] - Unique-key claims and request
//!   de-duplication
//! - [`snapshotter`], [`compensation`] - Downstream consumers: snapshots and
//!   failed-delivery repair
//!
//! # Example
//!
//! ```
//! use strata_core::{repository::StateAggregateRepository, store::inmemory};
//!
//! // Create an in-memory store and repository
//! let store = inmemory::Store::new();
//! let repository = StateAggregateRepository::new(store);
//! ```
//!
//! Most users should depend on the [`strata`](https://docs.rs/strata) crate,
//! which re-exports these types.

pub mod aggregate;
pub mod bus;
pub mod command;
pub mod compensation;
pub mod concurrency;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod gateway;
pub mod id;
pub mod idempotency;
pub mod instrument;
pub mod message;
pub mod prepare;
pub mod processor;
pub mod repository;
pub mod snapshot;
pub mod snapshotter;
pub mod state;
pub mod store;
pub mod wait;
