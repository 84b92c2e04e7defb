//! Postgres implementation of TransactionRepository.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use std::time::Duration;

use crate::adapters::postgres_balance_ledger::credit_balance;
use crate::domain::{CancelReason, NewTransaction, Provider, Transaction, TransactionState};
use crate::ports::{LockedRow, RepositoryError, RepositoryResult, RowKey, TransactionRepository};

const LOCK_NOT_AVAILABLE: &str = "55P03";
const UNIQUE_VIOLATION: &str = "23505";
const ACTIVE_ORDER_INDEX: &str = "uq_payment_transactions_active_order";

const SELECT_COLUMNS: &str = r#"
    id, order_reference, provider_reference, provider, amount_minor, state,
    created_at_ms, confirmed_at_ms, cancelled_at_ms, cancel_reason, beneficiary_account_id
"#;

/// Postgres-backed transaction repository.
///
/// Row locks are transaction-scoped advisory locks on the row key, so a key
/// can be locked before its row exists (needed by `open`).
#[derive(Clone)]
pub struct PostgresTransactionRepository {
    pool: PgPool,
}

impl PostgresTransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn lock_error(key: &RowKey, e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) => {
            RepositoryError::LockTimeout(key.lock_key())
        }
        sqlx::Error::PoolTimedOut => RepositoryError::LockTimeout(key.lock_key()),
        _ => RepositoryError::from(e),
    }
}

#[async_trait]
impl TransactionRepository for PostgresTransactionRepository {
    async fn lock(&self, key: &RowKey, timeout: Duration) -> RepositoryResult<Box<dyn LockedRow>> {
        let mut tx = self.pool.begin().await.map_err(|e| lock_error(key, e))?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", timeout.as_millis().max(1)))
            .execute(&mut *tx)
            .await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(key.lock_key())
            .execute(&mut *tx)
            .await
            .map_err(|e| lock_error(key, e))?;

        let current = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM payment_transactions \
             WHERE provider = $1 AND provider_reference = $2 FOR UPDATE"
        ))
        .bind(key.provider.as_str())
        .bind(&key.provider_reference)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| lock_error(key, e))?
        .map(TransactionRow::into_domain)
        .transpose()?;

        Ok(Box::new(PostgresLockedRow {
            tx,
            key: key.clone(),
            current,
        }))
    }

    async fn find(&self, key: &RowKey) -> RepositoryResult<Option<Transaction>> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM payment_transactions \
             WHERE provider = $1 AND provider_reference = $2"
        ))
        .bind(key.provider.as_str())
        .bind(&key.provider_reference)
        .fetch_optional(&self.pool)
        .await?
        .map(TransactionRow::into_domain)
        .transpose()
    }

    async fn latest_for_order(
        &self,
        provider: Provider,
        order_reference: &str,
    ) -> RepositoryResult<Option<Transaction>> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM payment_transactions \
             WHERE provider = $1 AND order_reference = $2 \
             ORDER BY created_at_ms DESC, id DESC LIMIT 1"
        ))
        .bind(provider.as_str())
        .bind(order_reference)
        .fetch_optional(&self.pool)
        .await?
        .map(TransactionRow::into_domain)
        .transpose()
    }
}

struct PostgresLockedRow {
    tx: sqlx::Transaction<'static, Postgres>,
    key: RowKey,
    current: Option<Transaction>,
}

#[async_trait]
impl LockedRow for PostgresLockedRow {
    fn current(&self) -> Option<&Transaction> {
        self.current.as_ref()
    }

    async fn active_for_order(
        &mut self,
        provider: Provider,
        order_reference: &str,
    ) -> RepositoryResult<Option<Transaction>> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM payment_transactions \
             WHERE provider = $1 AND order_reference = $2 AND state = 1 \
             AND provider_reference <> $3 LIMIT 1"
        ))
        .bind(provider.as_str())
        .bind(order_reference)
        .bind(&self.key.provider_reference)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(TransactionRow::into_domain)
        .transpose()
    }

    async fn expire_stale_for_order(
        &mut self,
        provider: Provider,
        order_reference: &str,
        stale_before_ms: i64,
        now_ms: i64,
    ) -> RepositoryResult<Vec<Transaction>> {
        // Frees the partial unique index before the active-row check.
        sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            UPDATE payment_transactions
            SET state = $5, cancelled_at_ms = $6, cancel_reason = $7
            WHERE provider = $1 AND order_reference = $2 AND state = 1
              AND provider_reference <> $3 AND created_at_ms < $4
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(provider.as_str())
        .bind(order_reference)
        .bind(&self.key.provider_reference)
        .bind(stale_before_ms)
        .bind(TransactionState::CancelledBeforeConfirm.code())
        .bind(now_ms)
        .bind(CancelReason::Timeout.code())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| lock_error(&self.key, e))?
        .into_iter()
        .map(TransactionRow::into_domain)
        .collect()
    }

    async fn insert(&mut self, new: NewTransaction) -> RepositoryResult<Transaction> {
        let order_reference = new.order.as_str().to_string();
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            INSERT INTO payment_transactions (
                order_reference, provider_reference, provider, amount_minor, state,
                created_at_ms, beneficiary_account_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(&order_reference)
        .bind(&new.provider_reference)
        .bind(new.provider.as_str())
        .bind(new.amount_minor)
        .bind(TransactionState::Created.code())
        .bind(new.created_at_ms)
        .bind(new.order.account_id())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db)
                if db.code().as_deref() == Some(UNIQUE_VIOLATION)
                    && db.constraint() == Some(ACTIVE_ORDER_INDEX) =>
            {
                RepositoryError::ActiveOrderConflict(order_reference.clone())
            }
            _ => RepositoryError::from(e),
        })?;

        let inserted = row.into_domain()?;
        self.current = Some(inserted.clone());
        Ok(inserted)
    }

    async fn update(&mut self, tx: &Transaction) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            UPDATE payment_transactions
            SET state = $2, confirmed_at_ms = $3, cancelled_at_ms = $4, cancel_reason = $5
            WHERE id = $1
            "#,
        )
        .bind(tx.id)
        .bind(tx.state.code())
        .bind(tx.confirmed_at_ms)
        .bind(tx.cancelled_at_ms)
        .bind(tx.cancel_reason.map(|r| r.code()))
        .execute(&mut *self.tx)
        .await?;

        self.current = Some(tx.clone());
        Ok(())
    }

    async fn credit(&mut self, account_id: i64, amount_major: i64) -> RepositoryResult<()> {
        credit_balance(&mut *self.tx, account_id, amount_major).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> RepositoryResult<()> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }
}

/// Internal row type for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: i64,
    order_reference: String,
    provider_reference: String,
    provider: String,
    amount_minor: i64,
    state: i16,
    created_at_ms: i64,
    confirmed_at_ms: Option<i64>,
    cancelled_at_ms: Option<i64>,
    cancel_reason: Option<i16>,
    beneficiary_account_id: i64,
}

impl TransactionRow {
    fn into_domain(self) -> RepositoryResult<Transaction> {
        let provider = self
            .provider
            .parse::<Provider>()
            .map_err(RepositoryError::Database)?;
        let state = TransactionState::from_code(self.state).ok_or_else(|| {
            RepositoryError::Database(format!("row {} has unknown state {}", self.id, self.state))
        })?;

        Ok(Transaction {
            id: self.id,
            order_reference: self.order_reference,
            provider_reference: self.provider_reference,
            provider,
            amount_minor: self.amount_minor,
            state,
            created_at_ms: self.created_at_ms,
            confirmed_at_ms: self.confirmed_at_ms,
            cancelled_at_ms: self.cancelled_at_ms,
            cancel_reason: self.cancel_reason.map(|c| CancelReason::from_code(c.into())),
            beneficiary_account_id: self.beneficiary_account_id,
        })
    }
}
