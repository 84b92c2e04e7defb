//! Ports the reconciliation core depends on. Concrete adapters live in
//! `crate::adapters`.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::domain::{NewTransaction, Provider, Transaction};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("timed out waiting for row lock on {0}")]
    LockTimeout(String),

    /// Another CREATED row already holds the order for this provider.
    #[error("order {0} already has an active transaction")]
    ActiveOrderConflict(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(e: sqlx::Error) -> Self {
        RepositoryError::Database(e.to_string())
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Identity of a ledger row: the provider's own id, scoped by provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey {
    pub provider: Provider,
    pub provider_reference: String,
}

impl RowKey {
    pub fn new(provider: Provider, provider_reference: impl Into<String>) -> Self {
        Self {
            provider,
            provider_reference: provider_reference.into(),
        }
    }

    /// Stable string form, also used as the advisory-lock key.
    pub fn lock_key(&self) -> String {
        format!("{}:{}", self.provider, self.provider_reference)
    }
}

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Acquires the exclusive lock for `key`, waiting at most `timeout`.
    /// The lock is held until the returned unit of work is committed or
    /// dropped; dropping without commit discards every staged change.
    async fn lock(&self, key: &RowKey, timeout: Duration) -> RepositoryResult<Box<dyn LockedRow>>;

    async fn find(&self, key: &RowKey) -> RepositoryResult<Option<Transaction>>;

    /// Most recently created row for `order_reference` at `provider`.
    async fn latest_for_order(
        &self,
        provider: Provider,
        order_reference: &str,
    ) -> RepositoryResult<Option<Transaction>>;
}

/// Unit of work over one locked row.
#[async_trait]
pub trait LockedRow: Send {
    /// Row state as read under the lock, including staged writes.
    fn current(&self) -> Option<&Transaction>;

    /// CREATED row for the same order at the same provider, other than this one.
    async fn active_for_order(
        &mut self,
        provider: Provider,
        order_reference: &str,
    ) -> RepositoryResult<Option<Transaction>>;

    /// Cancels with reason Timeout every CREATED row for the same order at
    /// the same provider, other than this one, created before
    /// `stale_before_ms`. Returns the rows it cancelled. Like every other
    /// write here it only lands on commit.
    async fn expire_stale_for_order(
        &mut self,
        provider: Provider,
        order_reference: &str,
        stale_before_ms: i64,
        now_ms: i64,
    ) -> RepositoryResult<Vec<Transaction>>;

    async fn insert(&mut self, new: NewTransaction) -> RepositoryResult<Transaction>;

    async fn update(&mut self, tx: &Transaction) -> RepositoryResult<()>;

    /// Credits the beneficiary as part of this unit of work, so the credit
    /// lands if and only if the commit does.
    async fn credit(&mut self, account_id: i64, amount_major: i64) -> RepositoryResult<()>;

    async fn commit(self: Box<Self>) -> RepositoryResult<()>;
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("account {0} not found")]
    AccountNotFound(i64),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Unavailable(e.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Beneficiary balance owned by the wider platform.
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    async fn account_exists(&self, account_id: i64) -> LedgerResult<bool>;

    async fn credit(&self, account_id: i64, amount_major: i64) -> LedgerResult<()>;

    async fn balance(&self, account_id: i64) -> LedgerResult<i64>;
}

/// Wall clock in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: std::sync::atomic::AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: std::sync::atomic::AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now_ms
            .fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(std::sync::atomic::Ordering::SeqCst)
    }
}
