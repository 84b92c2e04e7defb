//! Transaction domain entity.
//! Framework-agnostic representation of one payment attempt at one provider.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::order_reference::OrderReference;

/// Tiyin per sum.
pub const MINOR_PER_MAJOR: i64 = 100;

/// Column width of `provider_reference`.
pub const MAX_PROVIDER_REFERENCE_LEN: usize = 64;

/// Whether `amount_minor` converts to major units without a remainder.
pub fn is_whole_major(amount_minor: i64) -> bool {
    amount_minor % MINOR_PER_MAJOR == 0
}

/// Payment gateway that owns a transaction's `provider_reference`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Payme,
    Click,
    Uzum,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Payme => "payme",
            Provider::Click => "click",
            Provider::Uzum => "uzum",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "payme" => Ok(Provider::Payme),
            "click" => Ok(Provider::Click),
            "uzum" => Ok(Provider::Uzum),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// Lifecycle state. The numeric codes are the ones Payme reports on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Created,
    Confirmed,
    CancelledBeforeConfirm,
    CancelledAfterConfirm,
}

impl TransactionState {
    pub fn code(&self) -> i16 {
        match self {
            TransactionState::Created => 1,
            TransactionState::Confirmed => 2,
            TransactionState::CancelledBeforeConfirm => -1,
            TransactionState::CancelledAfterConfirm => -2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(TransactionState::Created),
            2 => Some(TransactionState::Confirmed),
            -1 => Some(TransactionState::CancelledBeforeConfirm),
            -2 => Some(TransactionState::CancelledAfterConfirm),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            TransactionState::CancelledBeforeConfirm | TransactionState::CancelledAfterConfirm
        )
    }

    /// Whether `self -> next` is a legal forward move.
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        matches!(
            (self, next),
            (TransactionState::Created, TransactionState::Confirmed)
                | (TransactionState::Created, TransactionState::CancelledBeforeConfirm)
                | (TransactionState::Confirmed, TransactionState::CancelledAfterConfirm)
        )
    }
}

impl Serialize for TransactionState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i16(self.code())
    }
}

/// Why a transaction was cancelled. Codes follow Payme's reason table, which
/// is the richest of the three providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    ReceiverNotFound,
    DebitError,
    ExecutionError,
    Timeout,
    Refund,
    Unknown,
}

impl CancelReason {
    pub fn code(&self) -> i16 {
        match self {
            CancelReason::ReceiverNotFound => 1,
            CancelReason::DebitError => 2,
            CancelReason::ExecutionError => 3,
            CancelReason::Timeout => 4,
            CancelReason::Refund => 5,
            CancelReason::Unknown => 10,
        }
    }

    /// Unrecognised codes collapse to `Unknown` rather than failing the cancel.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => CancelReason::ReceiverNotFound,
            2 => CancelReason::DebitError,
            3 => CancelReason::ExecutionError,
            4 => CancelReason::Timeout,
            5 => CancelReason::Refund,
            _ => CancelReason::Unknown,
        }
    }
}

impl Serialize for CancelReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i16(self.code())
    }
}

/// Domain entity representing a ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transaction {
    pub id: i64,
    pub order_reference: String,
    pub provider_reference: String,
    pub provider: Provider,
    pub amount_minor: i64,
    pub state: TransactionState,
    pub created_at_ms: i64,
    pub confirmed_at_ms: Option<i64>,
    pub cancelled_at_ms: Option<i64>,
    pub cancel_reason: Option<CancelReason>,
    pub beneficiary_account_id: i64,
}

impl Transaction {
    /// Amount credited to the beneficiary, in major units. Rows are only
    /// opened for whole major amounts, so nothing is lost here.
    pub fn amount_major(&self) -> i64 {
        self.amount_minor / MINOR_PER_MAJOR
    }

    pub fn is_expired(&self, now_ms: i64, expiry_ms: i64) -> bool {
        self.state == TransactionState::Created && now_ms - self.created_at_ms > expiry_ms
    }

    pub fn confirm(&mut self, now_ms: i64) {
        debug_assert!(self.state.can_transition_to(TransactionState::Confirmed));
        self.state = TransactionState::Confirmed;
        self.confirmed_at_ms = Some(now_ms);
    }

    /// Moves the row to the matching cancelled state. Already-cancelled rows
    /// are left untouched.
    pub fn cancel(&mut self, now_ms: i64, reason: CancelReason) {
        let next = match self.state {
            TransactionState::Created => TransactionState::CancelledBeforeConfirm,
            TransactionState::Confirmed => TransactionState::CancelledAfterConfirm,
            _ => return,
        };
        self.state = next;
        self.cancelled_at_ms = Some(now_ms);
        self.cancel_reason = Some(reason);
    }
}

/// Fields needed to insert a fresh CREATED row; the store assigns `id`.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub order: OrderReference,
    pub provider_reference: String,
    pub provider: Provider,
    pub amount_minor: i64,
    pub created_at_ms: i64,
}

impl NewTransaction {
    pub fn into_transaction(self, id: i64) -> Transaction {
        Transaction {
            id,
            beneficiary_account_id: self.order.account_id(),
            order_reference: self.order.into_string(),
            provider_reference: self.provider_reference,
            provider: self.provider,
            amount_minor: self.amount_minor,
            state: TransactionState::Created,
            created_at_ms: self.created_at_ms,
            confirmed_at_ms: None,
            cancelled_at_ms: None,
            cancel_reason: None,
        }
    }
}
