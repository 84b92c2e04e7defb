//! Payment provider adapters.
//!
//! Each provider turns its own webhook protocol into calls on the
//! [`Reconciler`] and serializes the outcome back into the exact response
//! shape that provider expects. Adding a gateway means adding one more
//! [`PaymentProvider`] implementation and one route.

pub mod click;
pub mod payme;
pub mod uzum;

pub use click::ClickProvider;
pub use payme::PaymeProvider;
pub use uzum::UzumProvider;

use async_trait::async_trait;
use axum::http::HeaderMap;
use bigdecimal::{BigDecimal, ToPrimitive};
use serde::Serialize;
use std::str::FromStr;

use crate::domain::Provider;
use crate::services::Reconciler;

#[async_trait]
pub trait PaymentProvider: Send + Sync + 'static {
    type Request: Send;
    type Response: Serialize + Send;

    fn provider(&self) -> Provider;

    /// Decodes the raw webhook body. Undecodable input is answered in the
    /// provider's own error shape.
    fn parse_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<Self::Request, Self::Response>;

    /// Runs before any core call.
    fn verify_authenticity(
        &self,
        headers: &HeaderMap,
        request: &Self::Request,
    ) -> Result<(), Self::Response>;

    async fn respond(&self, core: &Reconciler, request: Self::Request) -> Self::Response;
}

/// Full webhook pipeline: parse, authenticate, then hand off to the core.
pub async fn process<P: PaymentProvider>(
    provider: &P,
    core: &Reconciler,
    headers: &HeaderMap,
    body: &[u8],
) -> P::Response {
    let request = match provider.parse_webhook(headers, body) {
        Ok(request) => request,
        Err(response) => {
            tracing::warn!(provider = %provider.provider(), "rejected undecodable webhook");
            return response;
        }
    };

    if let Err(response) = provider.verify_authenticity(headers, &request) {
        tracing::warn!(provider = %provider.provider(), "rejected webhook failing authenticity check");
        return response;
    }

    provider.respond(core, request).await
}

/// Converts a major-unit decimal string ("10000", "10000.00") to minor units.
/// Returns `None` for negative values or sub-tiyin precision.
pub(crate) fn major_to_minor(amount: &str) -> Option<i64> {
    let major = BigDecimal::from_str(amount.trim()).ok()?;
    let minor = major * BigDecimal::from(100);
    if minor < BigDecimal::from(0) || minor.with_scale(0) != minor {
        return None;
    }
    minor.to_i64()
}

/// Byte comparison whose running time does not depend on where inputs differ.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_major_to_minor() {
        assert_eq!(major_to_minor("10000"), Some(1_000_000));
        assert_eq!(major_to_minor("10000.00"), Some(1_000_000));
        assert_eq!(major_to_minor("1000.5"), Some(100_050));
        assert_eq!(major_to_minor(" 1 "), Some(100));
        assert_eq!(major_to_minor("0.001"), None);
        assert_eq!(major_to_minor("-5"), None);
        assert_eq!(major_to_minor("abc"), None);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
