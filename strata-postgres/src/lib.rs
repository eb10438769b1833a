//! Postgres-backed strata storage.
//!
//! This crate provides `PostgreSQL` implementations of the core strata storage
//! traits:
//!
//! - [`Store`] - An implementation of [`strata_core::store::EventStore`]
//! - [`SnapshotStore`] - An implementation of
//!   [`strata_core::snapshot::SnapshotRepository`]
//! - [`PgPrepareKey`] - An implementation of
//!   [`strata_core::prepare::PrepareKey`]
//!
//! All of them can share one connection pool. Each exposes an idempotent
//! `migrate()` that creates its tables.

mod error;
pub mod prepare;
pub mod snapshot;
mod store;

pub use error::Error;
pub use prepare::PgPrepareKey;
pub use snapshot::SnapshotStore;
pub use store::Store;
