//! Parsed form of the caller-chosen order id, `<purpose>_<accountId>_<nonce>`.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const ORDER_REFERENCE_MAX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderReferenceError {
    #[error("order reference is empty")]
    Empty,
    #[error("order reference must be at most {ORDER_REFERENCE_MAX_LEN} characters")]
    TooLong,
    #[error("order reference must have exactly three '_' separated segments")]
    Shape,
    #[error("purpose must be ASCII alphanumeric")]
    Purpose,
    #[error("account id must be a positive integer without leading zeros")]
    AccountId,
    #[error("nonce must be ASCII digits")]
    Nonce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderReference {
    raw: String,
    purpose_len: usize,
    account_id: i64,
}

impl OrderReference {
    pub fn purpose(&self) -> &str {
        &self.raw[..self.purpose_len]
    }

    pub fn account_id(&self) -> i64 {
        self.account_id
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn into_string(self) -> String {
        self.raw
    }
}

impl FromStr for OrderReference {
    type Err = OrderReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(OrderReferenceError::Empty);
        }
        if s.len() > ORDER_REFERENCE_MAX_LEN {
            return Err(OrderReferenceError::TooLong);
        }

        let segments: Vec<&str> = s.split('_').collect();
        let [purpose, account, nonce] = segments.as_slice() else {
            return Err(OrderReferenceError::Shape);
        };

        if purpose.is_empty() || !purpose.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(OrderReferenceError::Purpose);
        }

        // "+7", "007" and "0" would all parse as integers; reject them so one
        // account has exactly one spelling.
        if account.is_empty()
            || account.starts_with('0')
            || !account.chars().all(|c| c.is_ascii_digit())
        {
            return Err(OrderReferenceError::AccountId);
        }
        let account_id = account
            .parse::<i64>()
            .map_err(|_| OrderReferenceError::AccountId)?;

        if nonce.is_empty() || !nonce.chars().all(|c| c.is_ascii_digit()) {
            return Err(OrderReferenceError::Nonce);
        }

        Ok(Self {
            raw: s.to_string(),
            purpose_len: purpose.len(),
            account_id,
        })
    }
}

impl fmt::Display for OrderReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
