use async_trait::async_trait;
use sqlx::{PgExecutor, PgPool};

use crate::ports::{BalanceLedger, LedgerError, LedgerResult};

/// Adds `amount_major` to an account. Shared by the ledger and by the
/// transaction repository, which runs it inside the confirming transaction.
pub(crate) async fn credit_balance<'e, E>(
    executor: E,
    account_id: i64,
    amount_major: i64,
) -> LedgerResult<()>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE beneficiary_accounts SET balance = balance + $2 WHERE id = $1",
    )
    .bind(account_id)
    .bind(amount_major)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(LedgerError::AccountNotFound(account_id));
    }
    Ok(())
}

#[derive(Clone)]
pub struct PostgresBalanceLedger {
    pool: PgPool,
}

impl PostgresBalanceLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BalanceLedger for PostgresBalanceLedger {
    async fn account_exists(&self, account_id: i64) -> LedgerResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM beneficiary_accounts WHERE id = $1)")
                .bind(account_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn credit(&self, account_id: i64, amount_major: i64) -> LedgerResult<()> {
        credit_balance(&self.pool, account_id, amount_major).await
    }

    async fn balance(&self, account_id: i64) -> LedgerResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT balance FROM beneficiary_accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::AccountNotFound(account_id))
    }
}
