//! Shared message plumbing: headers and the routing contract used by the
//! buses.

use std::{collections::BTreeMap, future::Future, pin::Pin};

use crate::id::AggregateId;

/// Key/value metadata attached to commands, streams and events.
pub type Header = BTreeMap<String, String>;

/// Header key carrying the acting principal.
pub const OPERATOR_HEADER: &str = "operator";
/// Header key set on streams that are re-sent by the compensator.
pub const COMPENSATION_ID_HEADER: &str = "compensation_id";

/// Boxed future for the few object-safe seams of the crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Anything that can travel over a [`MessageBus`](crate::bus::MessageBus).
///
/// The aggregate id is the partition key: two messages with the same id are
/// delivered to a subscriber in send order. Every message is caused by a
/// command; the command and request ids correlate wait signals and error
/// records.
pub trait Message: Clone + Send + Sync + 'static {
    fn message_id(&self) -> &str;

    fn aggregate_id(&self) -> &AggregateId;

    fn header(&self) -> &Header;

    fn command_id(&self) -> &str;

    fn request_id(&self) -> &str;

    /// Aggregate version after the causing command, when known.
    fn aggregate_version(&self) -> Option<u64> {
        None
    }

    /// Inclusive `(head, tail)` versions covered by the message. Defaults to
    /// the single [`aggregate_version`](Self::aggregate_version).
    fn version_range(&self) -> Option<(u64, u64)> {
        self.aggregate_version().map(|version| (version, version))
    }
}
