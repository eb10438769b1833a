//! Shared test domain: a bank account.

#![allow(dead_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata::{
    Aggregate, AggregateId, AggregateMetadata, Apply, DomainError, DomainEvent, Handle,
    RaisedEvent,
};

/// Install a `tracing` subscriber once per test binary.
///
/// Controlled by `RUST_LOG`; silent by default.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Aggregate
// ============================================================================

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub owner: String,
    pub balance: i64,
    pub movements: u32,
}

impl Aggregate for Account {
    type Error = DomainError;

    const CONTEXT: &'static str = "bank";
    const NAME: &'static str = "account";
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opened {
    pub owner: String,
}

impl DomainEvent for Opened {
    const NAME: &'static str = "account_opened";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposited {
    pub amount: i64,
}

impl DomainEvent for Deposited {
    const NAME: &'static str = "funds_deposited";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawn {
    pub amount: i64,
}

impl DomainEvent for Withdrawn {
    const NAME: &'static str = "funds_withdrawn";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closed;

impl DomainEvent for Closed {
    const NAME: &'static str = "account_closed";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reopened;

impl DomainEvent for Reopened {
    const NAME: &'static str = "account_reopened";
}

impl Apply<Opened> for Account {
    fn apply(&mut self, event: &Opened) {
        self.owner.clone_from(&event.owner);
    }
}

impl Apply<Deposited> for Account {
    fn apply(&mut self, event: &Deposited) {
        self.balance += event.amount;
        self.movements += 1;
    }
}

impl Apply<Withdrawn> for Account {
    fn apply(&mut self, event: &Withdrawn) {
        self.balance -= event.amount;
        self.movements += 1;
    }
}

// ============================================================================
// Commands
// ============================================================================

pub struct Open {
    pub owner: String,
}

pub struct Deposit(pub i64);

pub struct Withdraw(pub i64);

pub struct Close;

pub struct Reopen;

impl Handle<Open> for Account {
    fn handle(&self, command: &Open) -> Result<Vec<RaisedEvent>, Self::Error> {
        if command.owner.is_empty() {
            return Err(DomainError::bad_request("owner required"));
        }
        Ok(vec![
            Opened {
                owner: command.owner.clone(),
            }
            .into(),
        ])
    }
}

impl Handle<Deposit> for Account {
    fn handle(&self, command: &Deposit) -> Result<Vec<RaisedEvent>, Self::Error> {
        if command.0 <= 0 {
            return Err(DomainError::bad_request("amount must be positive"));
        }
        Ok(vec![Deposited { amount: command.0 }.into()])
    }
}

impl Handle<Withdraw> for Account {
    fn handle(&self, command: &Withdraw) -> Result<Vec<RaisedEvent>, Self::Error> {
        if command.0 > self.balance {
            return Err(DomainError::new("InsufficientFunds", "insufficient funds"));
        }
        Ok(vec![Withdrawn { amount: command.0 }.into()])
    }
}

impl Handle<Close> for Account {
    fn handle(&self, _: &Close) -> Result<Vec<RaisedEvent>, Self::Error> {
        let mut events: Vec<RaisedEvent> = Vec::new();
        if self.balance > 0 {
            events.push(
                Withdrawn {
                    amount: self.balance,
                }
                .into(),
            );
        }
        events.push(Closed.into());
        Ok(events)
    }
}

impl Handle<Reopen> for Account {
    fn handle(&self, _: &Reopen) -> Result<Vec<RaisedEvent>, Self::Error> {
        Ok(vec![Reopened.into()])
    }
}

pub fn metadata() -> Arc<AggregateMetadata<Account>> {
    Arc::new(
        AggregateMetadata::builder()
            .create::<Open>()
            .command::<Deposit>()
            .command::<Withdraw>()
            .command::<Close>()
            .recover::<Reopen>()
            .event::<Opened>()
            .event::<Deposited>()
            .event::<Withdrawn>()
            .deleted::<Closed>()
            .recovered::<Reopened>()
            .build(),
    )
}

pub fn account_id(id: &str) -> AggregateId {
    Account::named_aggregate().aggregate_id(id)
}

pub fn open(owner: &str) -> Open {
    Open {
        owner: owner.to_string(),
    }
}
