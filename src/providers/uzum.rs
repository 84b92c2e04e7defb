//! Uzum merchant callbacks. Amounts arrive in major units (sum), either as a
//! JSON number or a string.

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{major_to_minor, PaymentProvider};
use crate::domain::{CancelReason, Provider, MAX_PROVIDER_REFERENCE_LEN};
use crate::services::reconciler::IneligibleReason;
use crate::services::{CoreError, Reconciler};

pub const ERR_INVALID_ACCOUNT: i32 = 10001;
pub const ERR_INVALID_AMOUNT: i32 = 10002;
pub const ERR_CONFLICT: i32 = 10003;
pub const ERR_CANCELLED: i32 = 10004;
pub const ERR_TRANSIENT: i32 = 10005;
pub const ERR_UNKNOWN_REQUEST: i32 = 999;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UzumRequest {
    #[serde(default)]
    pub service_id: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub amount: Option<Value>,
    #[serde(default)]
    pub trans_id: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Check,
    Payment,
    Reverse,
}

impl UzumRequest {
    /// `status` wins; `action` is the older field name for the same thing.
    fn operation(&self) -> Option<Operation> {
        match self.status.as_deref() {
            Some("CREATED") => return Some(Operation::Check),
            Some("CONFIRMED") => return Some(Operation::Payment),
            Some("REVERSED") => return Some(Operation::Reverse),
            _ => {}
        }
        match self.action.as_deref() {
            Some("check") => Some(Operation::Check),
            Some("payment") => Some(Operation::Payment),
            Some("reverse") => Some(Operation::Reverse),
            _ => None,
        }
    }

    /// `None` when missing or longer than a stored reference can be.
    fn trans_id(&self) -> Option<String> {
        scalar_string(self.trans_id.as_ref()?).filter(|id| id.len() <= MAX_PROVIDER_REFERENCE_LEN)
    }

    fn amount_minor(&self) -> Option<i64> {
        major_to_minor(&scalar_string(self.amount.as_ref()?)?)
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UzumResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
}

impl UzumResponse {
    pub fn ok() -> Self {
        Self {
            status: "OK",
            error_code: None,
        }
    }

    pub fn failed(code: i32) -> Self {
        Self {
            status: "FAILED",
            error_code: Some(code),
        }
    }
}

fn core_error_code(e: &CoreError) -> i32 {
    match e {
        CoreError::InvalidAccount(_) => ERR_INVALID_ACCOUNT,
        CoreError::InvalidAmount(_) => ERR_INVALID_AMOUNT,
        CoreError::Conflict(_) | CoreError::AlreadyConfirmed(_) => ERR_CONFLICT,
        CoreError::Expired(_) | CoreError::AlreadyCancelled(_) => ERR_CANCELLED,
        CoreError::NotFound(_) => ERR_UNKNOWN_REQUEST,
        CoreError::LockTimeout(_) | CoreError::Storage(_) => {
            tracing::error!(error = %e, "uzum request failed on a transient error");
            ERR_TRANSIENT
        }
    }
}

#[derive(Debug, Default)]
pub struct UzumProvider;

impl UzumProvider {
    pub fn new() -> Self {
        Self
    }

    async fn check(&self, core: &Reconciler, request: &UzumRequest) -> UzumResponse {
        let Some(order_id) = request.order_id.as_deref() else {
            return UzumResponse::failed(ERR_INVALID_ACCOUNT);
        };
        let Some(amount_minor) = request.amount_minor() else {
            return UzumResponse::failed(ERR_INVALID_AMOUNT);
        };

        match core
            .verify_eligibility(order_id, amount_minor, Provider::Uzum)
            .await
        {
            Ok(eligibility) => match eligibility.reason {
                None => UzumResponse::ok(),
                Some(IneligibleReason::InvalidAccount) => UzumResponse::failed(ERR_INVALID_ACCOUNT),
                Some(IneligibleReason::InvalidAmount) => UzumResponse::failed(ERR_INVALID_AMOUNT),
            },
            Err(e) => UzumResponse::failed(core_error_code(&e)),
        }
    }

    /// Uzum has no separate create step: the payment callback opens the row
    /// if needed and confirms it in one go.
    async fn payment(&self, core: &Reconciler, request: &UzumRequest) -> UzumResponse {
        let Some(trans_id) = request.trans_id() else {
            return UzumResponse::failed(ERR_UNKNOWN_REQUEST);
        };
        let Some(order_id) = request.order_id.as_deref() else {
            return UzumResponse::failed(ERR_INVALID_ACCOUNT);
        };
        let Some(amount_minor) = request.amount_minor() else {
            return UzumResponse::failed(ERR_INVALID_AMOUNT);
        };

        let opened = match core.open(order_id, &trans_id, Provider::Uzum, amount_minor).await {
            Ok(tx) => tx,
            Err(e) => return UzumResponse::failed(core_error_code(&e)),
        };
        if opened.amount_minor != amount_minor || opened.order_reference != order_id {
            tracing::warn!(
                trans_id = %trans_id,
                stored_amount_minor = opened.amount_minor,
                amount_minor,
                "uzum payment does not match the stored transaction"
            );
            return UzumResponse::failed(ERR_INVALID_AMOUNT);
        }

        match core.confirm(Provider::Uzum, &trans_id).await {
            Ok(_) => UzumResponse::ok(),
            Err(e) => UzumResponse::failed(core_error_code(&e)),
        }
    }

    async fn reverse(&self, core: &Reconciler, request: &UzumRequest) -> UzumResponse {
        let Some(trans_id) = request.trans_id() else {
            return UzumResponse::ok();
        };

        match core
            .reverse(Provider::Uzum, &trans_id, CancelReason::Refund)
            .await
        {
            Ok(_) | Err(CoreError::NotFound(_)) => UzumResponse::ok(),
            Err(e) => UzumResponse::failed(core_error_code(&e)),
        }
    }
}

#[async_trait]
impl PaymentProvider for UzumProvider {
    type Request = UzumRequest;
    type Response = UzumResponse;

    fn provider(&self) -> Provider {
        Provider::Uzum
    }

    fn parse_webhook(&self, _headers: &HeaderMap, body: &[u8]) -> Result<UzumRequest, UzumResponse> {
        serde_json::from_slice(body).map_err(|e| {
            tracing::debug!(error = %e, "uzum body is not valid JSON");
            UzumResponse::failed(ERR_UNKNOWN_REQUEST)
        })
    }

    // Authenticity is enforced at the transport layer.
    fn verify_authenticity(&self, _headers: &HeaderMap, _request: &UzumRequest) -> Result<(), UzumResponse> {
        Ok(())
    }

    async fn respond(&self, core: &Reconciler, request: UzumRequest) -> UzumResponse {
        let response = match request.operation() {
            Some(Operation::Check) => self.check(core, &request).await,
            Some(Operation::Payment) => self.payment(core, &request).await,
            Some(Operation::Reverse) => self.reverse(core, &request).await,
            None => UzumResponse::failed(ERR_UNKNOWN_REQUEST),
        };

        if let Some(code) = response.error_code {
            tracing::info!(
                order_id = request.order_id.as_deref().unwrap_or(""),
                status = request.status.as_deref().unwrap_or(""),
                action = request.action.as_deref().unwrap_or(""),
                error_code = code,
                "uzum request rejected"
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(body: Value) -> UzumRequest {
        UzumProvider::new()
            .parse_webhook(&HeaderMap::new(), body.to_string().as_bytes())
            .unwrap()
    }

    #[test]
    fn test_trans_id_length_is_bounded() {
        let longest = "7".repeat(MAX_PROVIDER_REFERENCE_LEN);
        assert_eq!(parse(json!({ "transId": longest.clone() })).trans_id(), Some(longest));
        assert_eq!(parse(json!({ "transId": "7".repeat(65) })).trans_id(), None);
        assert_eq!(parse(json!({ "transId": 9001 })).trans_id(), Some("9001".to_string()));
    }

    #[test]
    fn test_status_takes_precedence_over_action() {
        let request = parse(json!({ "status": "REVERSED", "action": "payment" }));
        assert_eq!(request.operation(), Some(Operation::Reverse));

        let request = parse(json!({ "action": "check" }));
        assert_eq!(request.operation(), Some(Operation::Check));

        let request = parse(json!({ "status": "PENDING" }));
        assert_eq!(request.operation(), None);
    }

    #[test]
    fn test_amount_accepts_number_or_string() {
        assert_eq!(parse(json!({ "amount": 15000 })).amount_minor(), Some(1_500_000));
        assert_eq!(parse(json!({ "amount": "15000.50" })).amount_minor(), Some(1_500_050));
        assert_eq!(parse(json!({ "amount": true })).amount_minor(), None);
        assert_eq!(parse(json!({})).amount_minor(), None);
    }

    #[test]
    fn test_numeric_trans_id() {
        assert_eq!(parse(json!({ "transId": 991 })).trans_id(), Some("991".to_string()));
        assert_eq!(parse(json!({ "transId": "" })).trans_id(), None);
    }

    #[test]
    fn test_response_shape() {
        assert_eq!(serde_json::to_value(UzumResponse::ok()).unwrap(), json!({ "status": "OK" }));
        assert_eq!(
            serde_json::to_value(UzumResponse::failed(ERR_UNKNOWN_REQUEST)).unwrap(),
            json!({ "status": "FAILED", "errorCode": 999 })
        );
    }

    #[test]
    fn test_bad_json_is_unknown_request() {
        let response = UzumProvider::new()
            .parse_webhook(&HeaderMap::new(), b"nope")
            .unwrap_err();
        assert_eq!(response, UzumResponse::failed(ERR_UNKNOWN_REQUEST));
    }
}
