//! Provider-agnostic reconciliation core.
//!
//! Every read-then-write operation runs inside a [`LockedRow`] unit of work
//! keyed by `(provider, provider_reference)`. Nothing here knows about any
//! provider's wire vocabulary.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{
    is_whole_major, CancelReason, NewTransaction, OrderReference, Provider, Transaction,
    TransactionState,
};
use crate::ports::{
    BalanceLedger, Clock, LedgerError, LockedRow, RepositoryError, RowKey, TransactionRepository,
};

/// 12 hours.
pub const DEFAULT_EXPIRY_MS: i64 = 43_200_000;
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// 1 000 sum, in tiyin.
pub const DEFAULT_MIN_AMOUNT_MINOR: i64 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("transaction {0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transaction {0} expired before confirmation")]
    Expired(String),

    #[error("transaction {0} is cancelled")]
    AlreadyCancelled(String),

    #[error("transaction {0} is already confirmed")]
    AlreadyConfirmed(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid account: {0}")]
    InvalidAccount(String),

    #[error("lock timeout on {0}")]
    LockTimeout(String),

    #[error("storage unavailable: {0}")]
    Storage(String),
}

impl From<RepositoryError> for CoreError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::LockTimeout(key) => CoreError::LockTimeout(key),
            RepositoryError::ActiveOrderConflict(order) => {
                CoreError::Conflict(format!("order {} already has an active transaction", order))
            }
            RepositoryError::Ledger(e) => e.into(),
            RepositoryError::Database(msg) => CoreError::Storage(msg),
        }
    }
}

impl From<LedgerError> for CoreError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::AccountNotFound(id) => {
                CoreError::InvalidAccount(format!("account {} not found", id))
            }
            LedgerError::Unavailable(msg) => CoreError::Storage(msg),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IneligibleReason {
    InvalidAccount,
    InvalidAmount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eligibility {
    pub allowed: bool,
    pub reason: Option<IneligibleReason>,
}

impl Eligibility {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn denied(reason: IneligibleReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    pub expiry_ms: i64,
    pub lock_timeout: Duration,
    pub payme_min_amount_minor: i64,
    pub click_min_amount_minor: i64,
    pub uzum_min_amount_minor: i64,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            expiry_ms: DEFAULT_EXPIRY_MS,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            payme_min_amount_minor: DEFAULT_MIN_AMOUNT_MINOR,
            click_min_amount_minor: DEFAULT_MIN_AMOUNT_MINOR,
            uzum_min_amount_minor: DEFAULT_MIN_AMOUNT_MINOR,
        }
    }
}

impl ReconcilePolicy {
    pub fn min_amount_minor(&self, provider: Provider) -> i64 {
        match provider {
            Provider::Payme => self.payme_min_amount_minor,
            Provider::Click => self.click_min_amount_minor,
            Provider::Uzum => self.uzum_min_amount_minor,
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    repo: Arc<dyn TransactionRepository>,
    ledger: Arc<dyn BalanceLedger>,
    clock: Arc<dyn Clock>,
    policy: ReconcilePolicy,
}

impl Reconciler {
    pub fn new(
        repo: Arc<dyn TransactionRepository>,
        ledger: Arc<dyn BalanceLedger>,
        clock: Arc<dyn Clock>,
        policy: ReconcilePolicy,
    ) -> Self {
        Self {
            repo,
            ledger,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    /// Checks that the order names a known account and the amount clears the
    /// provider's minimum. Read only.
    pub async fn verify_eligibility(
        &self,
        order_reference: &str,
        amount_minor: i64,
        provider: Provider,
    ) -> CoreResult<Eligibility> {
        let Ok(order) = order_reference.parse::<OrderReference>() else {
            return Ok(Eligibility::denied(IneligibleReason::InvalidAccount));
        };
        if !self.ledger.account_exists(order.account_id()).await? {
            return Ok(Eligibility::denied(IneligibleReason::InvalidAccount));
        }
        if amount_minor < self.policy.min_amount_minor(provider) || !is_whole_major(amount_minor) {
            return Ok(Eligibility::denied(IneligibleReason::InvalidAmount));
        }
        Ok(Eligibility::allowed())
    }

    /// Idempotent create. A replay for a known `provider_reference` returns
    /// the stored row untouched. CREATED rows of the same order that are past
    /// the expiry window are expired here rather than blocking the order.
    pub async fn open(
        &self,
        order_reference: &str,
        provider_reference: &str,
        provider: Provider,
        amount_minor: i64,
    ) -> CoreResult<Transaction> {
        let order = order_reference
            .parse::<OrderReference>()
            .map_err(|e| CoreError::InvalidAccount(format!("{}: {}", order_reference, e)))?;
        if amount_minor <= 0 {
            return Err(CoreError::InvalidAmount(format!(
                "amount must be positive, got {}",
                amount_minor
            )));
        }
        // the ledger only takes whole sums
        if !is_whole_major(amount_minor) {
            return Err(CoreError::InvalidAmount(format!(
                "{} tiyin is not a whole number of sum",
                amount_minor
            )));
        }

        let key = RowKey::new(provider, provider_reference);
        let mut row = self.lock_row(&key).await?;
        let now = self.clock.now_ms();

        if let Some(existing) = row.current().cloned() {
            if existing.is_expired(now, self.policy.expiry_ms) {
                self.expire(row, existing, now).await?;
                return Err(CoreError::Expired(provider_reference.to_string()));
            }
            return Ok(existing);
        }

        if !self.ledger.account_exists(order.account_id()).await? {
            return Err(CoreError::InvalidAccount(format!(
                "account {} not found",
                order.account_id()
            )));
        }

        let expired = row
            .expire_stale_for_order(provider, order.as_str(), now - self.policy.expiry_ms, now)
            .await?;
        if let Some(active) = row.active_for_order(provider, order.as_str()).await? {
            return Err(CoreError::Conflict(format!(
                "order {} already has active transaction {}",
                order, active.provider_reference
            )));
        }

        let inserted = row
            .insert(NewTransaction {
                order,
                provider_reference: provider_reference.to_string(),
                provider,
                amount_minor,
                created_at_ms: now,
            })
            .await?;
        row.commit().await?;

        for stale in &expired {
            warn!(
                provider = %stale.provider,
                provider_reference = %stale.provider_reference,
                order_reference = %stale.order_reference,
                created_at_ms = stale.created_at_ms,
                "stale transaction expired by a newer attempt"
            );
        }
        info!(
            provider = %provider,
            provider_reference = %inserted.provider_reference,
            order_reference = %inserted.order_reference,
            amount_minor = inserted.amount_minor,
            "transaction opened"
        );
        Ok(inserted)
    }

    /// Credits the beneficiary exactly once. Replays on a CONFIRMED row
    /// return it unchanged.
    pub async fn confirm(&self, provider: Provider, provider_reference: &str) -> CoreResult<Transaction> {
        let (tx, _) = self.confirm_row(provider, provider_reference).await?;
        Ok(tx)
    }

    /// Like [`confirm`](Self::confirm), but only the call that moves the row
    /// to CONFIRMED succeeds. Every later call answers `AlreadyConfirmed`.
    pub async fn confirm_once(
        &self,
        provider: Provider,
        provider_reference: &str,
    ) -> CoreResult<Transaction> {
        match self.confirm_row(provider, provider_reference).await? {
            (tx, true) => Ok(tx),
            (_, false) => Err(CoreError::AlreadyConfirmed(provider_reference.to_string())),
        }
    }

    /// Returns the row and whether this call confirmed it.
    async fn confirm_row(
        &self,
        provider: Provider,
        provider_reference: &str,
    ) -> CoreResult<(Transaction, bool)> {
        let key = RowKey::new(provider, provider_reference);
        let mut row = self.lock_row(&key).await?;
        let mut tx = row
            .current()
            .cloned()
            .ok_or_else(|| CoreError::NotFound(key.lock_key()))?;
        let now = self.clock.now_ms();

        match tx.state {
            TransactionState::Created if tx.is_expired(now, self.policy.expiry_ms) => {
                self.expire(row, tx, now).await?;
                Err(CoreError::Expired(provider_reference.to_string()))
            }
            TransactionState::Created => {
                row.credit(tx.beneficiary_account_id, tx.amount_major()).await?;
                tx.confirm(now);
                row.update(&tx).await?;
                row.commit().await?;

                info!(
                    provider = %provider,
                    provider_reference = %tx.provider_reference,
                    account_id = tx.beneficiary_account_id,
                    amount_major = tx.amount_major(),
                    "transaction confirmed, beneficiary credited"
                );
                Ok((tx, true))
            }
            TransactionState::Confirmed => Ok((tx, false)),
            TransactionState::CancelledBeforeConfirm | TransactionState::CancelledAfterConfirm => {
                Err(CoreError::AlreadyCancelled(provider_reference.to_string()))
            }
        }
    }

    pub async fn inspect(&self, provider: Provider, provider_reference: &str) -> CoreResult<Transaction> {
        let key = RowKey::new(provider, provider_reference);
        self.repo
            .find(&key)
            .await?
            .ok_or_else(|| CoreError::NotFound(key.lock_key()))
    }

    /// Cancels a row. A CONFIRMED row keeps its credit: the balance is not
    /// clawed back here.
    pub async fn reverse(
        &self,
        provider: Provider,
        provider_reference: &str,
        reason: CancelReason,
    ) -> CoreResult<Transaction> {
        let key = RowKey::new(provider, provider_reference);
        let mut row = self.lock_row(&key).await?;
        let mut tx = row
            .current()
            .cloned()
            .ok_or_else(|| CoreError::NotFound(key.lock_key()))?;

        if tx.state.is_cancelled() {
            return Ok(tx);
        }

        let was_confirmed = tx.state == TransactionState::Confirmed;
        tx.cancel(self.clock.now_ms(), reason);
        row.update(&tx).await?;
        row.commit().await?;

        if was_confirmed {
            warn!(
                provider = %provider,
                provider_reference = %tx.provider_reference,
                account_id = tx.beneficiary_account_id,
                amount_major = tx.amount_major(),
                "confirmed transaction reversed; credited balance left in place"
            );
        } else {
            info!(
                provider = %provider,
                provider_reference = %tx.provider_reference,
                "transaction cancelled before confirmation"
            );
        }
        Ok(tx)
    }

    /// Cancels a row that is still CREATED. A CONFIRMED row is never
    /// touched and answers `AlreadyConfirmed`; a cancelled row is returned
    /// unchanged.
    pub async fn cancel_pending(
        &self,
        provider: Provider,
        provider_reference: &str,
        reason: CancelReason,
    ) -> CoreResult<Transaction> {
        let key = RowKey::new(provider, provider_reference);
        let mut row = self.lock_row(&key).await?;
        let mut tx = row
            .current()
            .cloned()
            .ok_or_else(|| CoreError::NotFound(key.lock_key()))?;
        let now = self.clock.now_ms();

        match tx.state {
            TransactionState::Created if tx.is_expired(now, self.policy.expiry_ms) => {
                self.expire(row, tx, now).await?;
                Err(CoreError::Expired(provider_reference.to_string()))
            }
            TransactionState::Created => {
                tx.cancel(now, reason);
                row.update(&tx).await?;
                row.commit().await?;
                info!(
                    provider = %provider,
                    provider_reference = %tx.provider_reference,
                    reason = ?reason,
                    "pending transaction cancelled"
                );
                Ok(tx)
            }
            TransactionState::Confirmed => {
                Err(CoreError::AlreadyConfirmed(provider_reference.to_string()))
            }
            TransactionState::CancelledBeforeConfirm | TransactionState::CancelledAfterConfirm => {
                Ok(tx)
            }
        }
    }

    pub async fn latest_for_order(
        &self,
        provider: Provider,
        order_reference: &str,
    ) -> CoreResult<Option<Transaction>> {
        Ok(self.repo.latest_for_order(provider, order_reference).await?)
    }

    async fn lock_row(&self, key: &RowKey) -> CoreResult<Box<dyn LockedRow>> {
        match self.repo.lock(key, self.policy.lock_timeout).await {
            Err(RepositoryError::LockTimeout(lock_key)) => {
                warn!(lock_key = %lock_key, "row lock timed out, retrying once");
                Ok(self.repo.lock(key, self.policy.lock_timeout).await?)
            }
            other => Ok(other?),
        }
    }

    async fn expire(&self, mut row: Box<dyn LockedRow>, mut tx: Transaction, now: i64) -> CoreResult<()> {
        tx.cancel(now, CancelReason::Timeout);
        row.update(&tx).await?;
        row.commit().await?;
        warn!(
            provider = %tx.provider,
            provider_reference = %tx.provider_reference,
            created_at_ms = tx.created_at_ms,
            "stale transaction expired"
        );
        Ok(())
    }
}
