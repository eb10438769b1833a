//! Aggregate identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tenant used when multi-tenancy is not in play.
pub const DEFAULT_TENANT_ID: &str = "(0)";

/// Generate a new time-ordered identifier.
#[must_use]
pub fn generate_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// An aggregate type within a bounded context.
///
/// Used as the topic key on the message buses.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamedAggregate {
    pub context_name: String,
    pub aggregate_name: String,
}

impl NamedAggregate {
    pub fn new(context_name: impl Into<String>, aggregate_name: impl Into<String>) -> Self {
        Self {
            context_name: context_name.into(),
            aggregate_name: aggregate_name.into(),
        }
    }

    /// Identify an instance of this aggregate type in the default tenant.
    pub fn aggregate_id(&self, id: impl Into<String>) -> AggregateId {
        AggregateId::new(self.clone(), id)
    }
}

impl fmt::Display for NamedAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.context_name, self.aggregate_name)
    }
}

/// Globally unique aggregate instance key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateId {
    #[serde(flatten)]
    pub named_aggregate: NamedAggregate,
    pub tenant_id: String,
    pub id: String,
}

impl AggregateId {
    pub fn new(named_aggregate: NamedAggregate, id: impl Into<String>) -> Self {
        Self {
            named_aggregate,
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    #[must_use]
    pub const fn named_aggregate(&self) -> &NamedAggregate {
        &self.named_aggregate
    }

    #[must_use]
    pub fn context_name(&self) -> &str {
        &self.named_aggregate.context_name
    }

    #[must_use]
    pub fn aggregate_name(&self) -> &str {
        &self.named_aggregate.aggregate_name
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.named_aggregate, self.tenant_id, self.id)
    }
}
