use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::domain::{CancelReason, NewTransaction, Provider, Transaction, TransactionState};
use crate::ports::{
    BalanceLedger, LedgerError, LedgerResult, LockedRow, RepositoryError, RepositoryResult,
    RowKey, TransactionRepository,
};

type LockTable = std::sync::Mutex<HashMap<RowKey, Arc<Mutex<()>>>>;

#[derive(Default)]
struct Rows {
    by_id: HashMap<i64, Transaction>,
    by_key: HashMap<RowKey, i64>,
}

/// A thread-safe in-memory transaction repository.
///
/// Row locks are per-key `tokio::sync::Mutex`es, so distinct keys never wait
/// on each other. A key's mutex is forgotten once no unit of work holds or
/// waits on it. Credits go to the injected [`BalanceLedger`] at commit time,
/// while the row lock is still held.
#[derive(Clone)]
pub struct InMemoryTransactionRepository {
    rows: Arc<RwLock<Rows>>,
    locks: Arc<LockTable>,
    next_id: Arc<AtomicI64>,
    ledger: Arc<dyn BalanceLedger>,
}

impl InMemoryTransactionRepository {
    pub fn new(ledger: Arc<dyn BalanceLedger>) -> Self {
        Self {
            rows: Arc::default(),
            locks: Arc::default(),
            next_id: Arc::new(AtomicI64::new(1)),
            ledger,
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn row_lock(&self, key: &RowKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.clone()).or_default().clone()
    }
}

/// Drops `key` from the lock table when the table holds the only handle.
fn forget_if_idle(locks: &LockTable, key: &RowKey) {
    let mut locks = locks.lock().unwrap_or_else(PoisonError::into_inner);
    if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
        locks.remove(key);
    }
}

struct RowLockGuard {
    key: RowKey,
    locks: Arc<LockTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RowLockGuard {
    fn drop(&mut self) {
        // release first so our own handle is gone before the count check
        self.guard.take();
        forget_if_idle(&self.locks, &self.key);
    }
}

#[async_trait]
impl TransactionRepository for InMemoryTransactionRepository {
    async fn lock(&self, key: &RowKey, timeout: Duration) -> RepositoryResult<Box<dyn LockedRow>> {
        let row_lock = self.row_lock(key);
        let acquired = tokio::time::timeout(timeout, row_lock.lock_owned()).await;
        let guard = match acquired {
            Ok(guard) => guard,
            Err(_) => {
                forget_if_idle(&self.locks, key);
                return Err(RepositoryError::LockTimeout(key.lock_key()));
            }
        };
        let guard = RowLockGuard {
            key: key.clone(),
            locks: self.locks.clone(),
            guard: Some(guard),
        };

        let current = self.find(key).await?;
        Ok(Box::new(InMemoryLockedRow {
            repo: self.clone(),
            key: key.clone(),
            current,
            is_new: false,
            dirty: false,
            credits: Vec::new(),
            stale_before_ms: None,
            expired: Vec::new(),
            _guard: guard,
        }))
    }

    async fn find(&self, key: &RowKey) -> RepositoryResult<Option<Transaction>> {
        let rows = self.rows.read().await;
        Ok(rows
            .by_key
            .get(key)
            .and_then(|id| rows.by_id.get(id))
            .cloned())
    }

    async fn latest_for_order(
        &self,
        provider: Provider,
        order_reference: &str,
    ) -> RepositoryResult<Option<Transaction>> {
        let rows = self.rows.read().await;
        Ok(rows
            .by_id
            .values()
            .filter(|tx| tx.provider == provider && tx.order_reference == order_reference)
            .max_by_key(|tx| (tx.created_at_ms, tx.id))
            .cloned())
    }
}

struct InMemoryLockedRow {
    repo: InMemoryTransactionRepository,
    key: RowKey,
    current: Option<Transaction>,
    is_new: bool,
    dirty: bool,
    credits: Vec<(i64, i64)>,
    /// Rows of the same order created before this are expired, not active.
    stale_before_ms: Option<i64>,
    expired: Vec<Transaction>,
    _guard: RowLockGuard,
}

fn is_order_sibling(
    tx: &Transaction,
    provider: Provider,
    order_reference: &str,
    exclude: &RowKey,
) -> bool {
    tx.provider == provider
        && tx.order_reference == order_reference
        && tx.state == TransactionState::Created
        && tx.provider_reference != exclude.provider_reference
}

fn active_order_row<'a>(
    rows: &'a Rows,
    provider: Provider,
    order_reference: &str,
    exclude: &RowKey,
    stale_before_ms: Option<i64>,
) -> Option<&'a Transaction> {
    rows.by_id.values().find(|tx| {
        is_order_sibling(tx, provider, order_reference, exclude)
            && stale_before_ms.map_or(true, |cutoff| tx.created_at_ms >= cutoff)
    })
}

#[async_trait]
impl LockedRow for InMemoryLockedRow {
    fn current(&self) -> Option<&Transaction> {
        self.current.as_ref()
    }

    async fn active_for_order(
        &mut self,
        provider: Provider,
        order_reference: &str,
    ) -> RepositoryResult<Option<Transaction>> {
        let rows = self.repo.rows.read().await;
        let active = active_order_row(
            &rows,
            provider,
            order_reference,
            &self.key,
            self.stale_before_ms,
        );
        Ok(active.cloned())
    }

    async fn expire_stale_for_order(
        &mut self,
        provider: Provider,
        order_reference: &str,
        stale_before_ms: i64,
        now_ms: i64,
    ) -> RepositoryResult<Vec<Transaction>> {
        let rows = self.repo.rows.read().await;
        let expired: Vec<Transaction> = rows
            .by_id
            .values()
            .filter(|tx| {
                is_order_sibling(tx, provider, order_reference, &self.key)
                    && tx.created_at_ms < stale_before_ms
            })
            .cloned()
            .map(|mut tx| {
                tx.cancel(now_ms, CancelReason::Timeout);
                tx
            })
            .collect();
        drop(rows);

        self.stale_before_ms = Some(stale_before_ms);
        self.expired.extend(expired.iter().cloned());
        Ok(expired)
    }

    async fn insert(&mut self, new: NewTransaction) -> RepositoryResult<Transaction> {
        let id = self.repo.next_id.fetch_add(1, Ordering::SeqCst);
        let tx = new.into_transaction(id);
        self.current = Some(tx.clone());
        self.is_new = true;
        self.dirty = true;
        Ok(tx)
    }

    async fn update(&mut self, tx: &Transaction) -> RepositoryResult<()> {
        self.current = Some(tx.clone());
        self.dirty = true;
        Ok(())
    }

    async fn credit(&mut self, account_id: i64, amount_major: i64) -> RepositoryResult<()> {
        self.credits.push((account_id, amount_major));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> RepositoryResult<()> {
        let this = *self;
        let mut rows = this.repo.rows.write().await;

        // Two opens for one order can hold different row locks; the write
        // lock on `rows` is where they meet.
        if this.is_new {
            if let Some(tx) = &this.current {
                let active = active_order_row(
                    &rows,
                    tx.provider,
                    &tx.order_reference,
                    &this.key,
                    this.stale_before_ms,
                );
                if active.is_some() {
                    return Err(RepositoryError::ActiveOrderConflict(
                        tx.order_reference.clone(),
                    ));
                }
            }
        }

        for (account_id, amount_major) in &this.credits {
            this.repo.ledger.credit(*account_id, *amount_major).await?;
        }

        for tx in this.expired {
            // skip rows their own unit of work moved on in the meantime
            let still_created = rows
                .by_id
                .get(&tx.id)
                .is_some_and(|stored| stored.state == TransactionState::Created);
            if still_created {
                rows.by_id.insert(tx.id, tx);
            }
        }

        if let (true, Some(tx)) = (this.dirty, this.current) {
            rows.by_key.insert(this.key.clone(), tx.id);
            rows.by_id.insert(tx.id, tx);
        }
        Ok(())
    }
}

/// A thread-safe in-memory beneficiary ledger.
#[derive(Default, Clone)]
pub struct InMemoryBalanceLedger {
    balances: Arc<RwLock<HashMap<i64, i64>>>,
}

impl InMemoryBalanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open_account(&self, account_id: i64) {
        self.balances.write().await.entry(account_id).or_insert(0);
    }
}

#[async_trait]
impl BalanceLedger for InMemoryBalanceLedger {
    async fn account_exists(&self, account_id: i64) -> LedgerResult<bool> {
        Ok(self.balances.read().await.contains_key(&account_id))
    }

    async fn credit(&self, account_id: i64, amount_major: i64) -> LedgerResult<()> {
        let mut balances = self.balances.write().await;
        let balance = balances
            .get_mut(&account_id)
            .ok_or(LedgerError::AccountNotFound(account_id))?;
        *balance += amount_major;
        Ok(())
    }

    async fn balance(&self, account_id: i64) -> LedgerResult<i64> {
        self.balances
            .read()
            .await
            .get(&account_id)
            .copied()
            .ok_or(LedgerError::AccountNotFound(account_id))
    }
}
