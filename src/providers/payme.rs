//! Payme merchant API: a single JSON-RPC endpoint guarded by HTTP Basic auth.

use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{constant_time_eq, PaymentProvider};
use crate::domain::{
    CancelReason, Provider, Transaction, TransactionState, MAX_PROVIDER_REFERENCE_LEN,
};
use crate::services::reconciler::{CoreError, IneligibleReason};
use crate::services::Reconciler;

pub const ERR_PARSE: i32 = -32700;
pub const ERR_INVALID_REQUEST: i32 = -32600;
pub const ERR_METHOD_NOT_FOUND: i32 = -32601;
pub const ERR_ACCESS_DENIED: i32 = -32504;
pub const ERR_SYSTEM: i32 = -32400;
pub const ERR_INVALID_AMOUNT: i32 = -31001;
pub const ERR_TRANSACTION_NOT_FOUND: i32 = -31003;
pub const ERR_CANNOT_PERFORM: i32 = -31008;
pub const ERR_INVALID_ACCOUNT: i32 = -31050;

#[derive(Debug, Deserialize)]
pub struct PaymeRequest {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymeError {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PaymeError>,
    pub id: Value,
}

impl PaymeResponse {
    fn result(id: Value, result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            id,
        }
    }

    fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(PaymeError {
                code,
                message: message.into(),
            }),
            id,
        }
    }
}

type MethodResult = Result<Value, PaymeError>;

fn fail(code: i32, message: impl Into<String>) -> PaymeError {
    PaymeError {
        code,
        message: message.into(),
    }
}

fn core_error(e: CoreError) -> PaymeError {
    match e {
        CoreError::NotFound(_) => fail(ERR_TRANSACTION_NOT_FOUND, "Transaction not found"),
        CoreError::Conflict(_) => fail(ERR_INVALID_ACCOUNT, "Order has an active transaction"),
        CoreError::Expired(_) => fail(ERR_CANNOT_PERFORM, "Transaction expired"),
        CoreError::AlreadyCancelled(_) => fail(ERR_CANNOT_PERFORM, "Transaction cancelled"),
        CoreError::AlreadyConfirmed(_) => fail(ERR_CANNOT_PERFORM, "Transaction already confirmed"),
        CoreError::InvalidAmount(_) => fail(ERR_INVALID_AMOUNT, "Invalid amount"),
        CoreError::InvalidAccount(_) => fail(ERR_INVALID_ACCOUNT, "Account not found"),
        CoreError::LockTimeout(_) | CoreError::Storage(_) => {
            tracing::error!(error = %e, "payme request failed on a transient error");
            fail(ERR_SYSTEM, "System error")
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Account {
    order_id: Option<String>,
}

impl Account {
    fn order_id(&self) -> Result<&str, PaymeError> {
        self.order_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| fail(ERR_INVALID_ACCOUNT, "Account field order_id not found"))
    }
}

#[derive(Debug, Deserialize)]
struct CheckPerformParams {
    amount: i64,
    #[serde(default)]
    account: Account,
}

#[derive(Debug, Deserialize)]
struct CreateParams {
    id: String,
    amount: i64,
    #[serde(default)]
    account: Account,
}

#[derive(Debug, Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CancelParams {
    id: String,
    #[serde(default)]
    reason: Option<i64>,
}

fn params<T: DeserializeOwned>(value: Value) -> Result<T, PaymeError> {
    serde_json::from_value(value).map_err(|e| fail(ERR_INVALID_REQUEST, format!("Invalid params: {}", e)))
}

pub struct PaymeProvider {
    key: String,
}

impl PaymeProvider {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    async fn check_perform_transaction(&self, core: &Reconciler, params: CheckPerformParams) -> MethodResult {
        let order_id = params.account.order_id()?;
        let eligibility = core
            .verify_eligibility(order_id, params.amount, Provider::Payme)
            .await
            .map_err(core_error)?;

        match eligibility.reason {
            None => Ok(json!({ "allow": true })),
            Some(IneligibleReason::InvalidAccount) => Err(fail(ERR_INVALID_ACCOUNT, "Account not found")),
            Some(IneligibleReason::InvalidAmount) => Err(fail(ERR_INVALID_AMOUNT, "Invalid amount")),
        }
    }

    async fn create_transaction(&self, core: &Reconciler, params: CreateParams) -> MethodResult {
        if params.id.is_empty() || params.id.len() > MAX_PROVIDER_REFERENCE_LEN {
            return Err(fail(ERR_INVALID_REQUEST, "Invalid transaction id"));
        }
        let order_id = params.account.order_id()?;
        self.check_perform_transaction(
            core,
            CheckPerformParams {
                amount: params.amount,
                account: Account {
                    order_id: Some(order_id.to_string()),
                },
            },
        )
        .await?;

        let tx = core
            .open(order_id, &params.id, Provider::Payme, params.amount)
            .await
            .map_err(core_error)?;

        if tx.state != TransactionState::Created {
            return Err(fail(ERR_CANNOT_PERFORM, "Transaction already processed"));
        }

        Ok(json!({
            "create_time": tx.created_at_ms,
            "transaction": tx.id.to_string(),
            "state": tx.state.code(),
        }))
    }

    async fn perform_transaction(&self, core: &Reconciler, params: IdParams) -> MethodResult {
        let tx = core
            .confirm(Provider::Payme, &params.id)
            .await
            .map_err(core_error)?;

        Ok(json!({
            "transaction": tx.id.to_string(),
            "perform_time": tx.confirmed_at_ms.unwrap_or(0),
            "state": tx.state.code(),
        }))
    }

    async fn check_transaction(&self, core: &Reconciler, params: IdParams) -> MethodResult {
        let tx = core
            .inspect(Provider::Payme, &params.id)
            .await
            .map_err(core_error)?;
        Ok(check_transaction_result(&tx))
    }

    async fn cancel_transaction(&self, core: &Reconciler, params: CancelParams) -> MethodResult {
        let reason = params
            .reason
            .map(CancelReason::from_code)
            .unwrap_or(CancelReason::Unknown);
        let tx = core
            .reverse(Provider::Payme, &params.id, reason)
            .await
            .map_err(core_error)?;

        Ok(json!({
            "transaction": tx.id.to_string(),
            "cancel_time": tx.cancelled_at_ms.unwrap_or(0),
            "state": tx.state.code(),
        }))
    }
}

fn check_transaction_result(tx: &Transaction) -> Value {
    json!({
        "create_time": tx.created_at_ms,
        "perform_time": tx.confirmed_at_ms.unwrap_or(0),
        "cancel_time": tx.cancelled_at_ms.unwrap_or(0),
        "transaction": tx.id.to_string(),
        "state": tx.state.code(),
        "reason": tx.cancel_reason.map(|r| r.code()),
    })
}

/// Password half of a `Basic base64(login:password)` header.
fn basic_auth_password(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (_, password) = credentials.split_once(':')?;
    Some(password.to_string())
}

#[async_trait]
impl PaymentProvider for PaymeProvider {
    type Request = PaymeRequest;
    type Response = PaymeResponse;

    fn provider(&self) -> Provider {
        Provider::Payme
    }

    fn parse_webhook(&self, _headers: &HeaderMap, body: &[u8]) -> Result<PaymeRequest, PaymeResponse> {
        serde_json::from_slice(body).map_err(|e| {
            tracing::debug!(error = %e, "payme body is not valid JSON-RPC");
            PaymeResponse::error(Value::Null, ERR_PARSE, "Parse error")
        })
    }

    fn verify_authenticity(&self, headers: &HeaderMap, request: &PaymeRequest) -> Result<(), PaymeResponse> {
        match basic_auth_password(headers) {
            Some(password) if constant_time_eq(password.as_bytes(), self.key.as_bytes()) => Ok(()),
            _ => Err(PaymeResponse::error(request.id.clone(), ERR_ACCESS_DENIED, "Access denied")),
        }
    }

    async fn respond(&self, core: &Reconciler, request: PaymeRequest) -> PaymeResponse {
        let PaymeRequest { method, params: raw, id } = request;
        let Some(method) = method else {
            return PaymeResponse::error(id, ERR_INVALID_REQUEST, "Method is required");
        };

        tracing::debug!(method = %method, "payme request");
        let outcome = match method.as_str() {
            "CheckPerformTransaction" => match params(raw) {
                Ok(p) => self.check_perform_transaction(core, p).await,
                Err(e) => Err(e),
            },
            "CreateTransaction" => match params(raw) {
                Ok(p) => self.create_transaction(core, p).await,
                Err(e) => Err(e),
            },
            "PerformTransaction" => match params(raw) {
                Ok(p) => self.perform_transaction(core, p).await,
                Err(e) => Err(e),
            },
            "CheckTransaction" => match params(raw) {
                Ok(p) => self.check_transaction(core, p).await,
                Err(e) => Err(e),
            },
            "CancelTransaction" => match params(raw) {
                Ok(p) => self.cancel_transaction(core, p).await,
                Err(e) => Err(e),
            },
            // key rotation is handled out of band
            "ChangePassword" => Ok(json!({ "success": true })),
            _ => Err(fail(ERR_METHOD_NOT_FOUND, "Method not found")),
        };

        match outcome {
            Ok(result) => PaymeResponse::result(id, result),
            Err(error) => {
                tracing::info!(method = %method, code = error.code, message = %error.message, "payme request rejected");
                PaymeResponse {
                    result: None,
                    error: Some(error),
                    id,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn basic(login: &str, password: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let token = STANDARD.encode(format!("{}:{}", login, password));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", token)).unwrap(),
        );
        headers
    }

    fn request(id: i64) -> PaymeRequest {
        PaymeRequest {
            method: Some("CheckTransaction".to_string()),
            params: json!({ "id": "p1" }),
            id: json!(id),
        }
    }

    #[test]
    fn test_basic_auth_accepts_provisioned_key() {
        let provider = PaymeProvider::new("s3cret");
        assert!(provider
            .verify_authenticity(&basic("Paycom", "s3cret"), &request(1))
            .is_ok());
    }

    #[test]
    fn test_basic_auth_rejects_wrong_or_missing_key() {
        let provider = PaymeProvider::new("s3cret");

        let wrong = provider
            .verify_authenticity(&basic("Paycom", "guess"), &request(7))
            .unwrap_err();
        assert_eq!(wrong.error.unwrap().code, ERR_ACCESS_DENIED);
        assert_eq!(wrong.id, json!(7));

        let missing = provider
            .verify_authenticity(&HeaderMap::new(), &request(8))
            .unwrap_err();
        assert_eq!(missing.error.unwrap().code, ERR_ACCESS_DENIED);
    }

    #[test]
    fn test_parse_error_has_null_id() {
        let provider = PaymeProvider::new("k");
        let response = provider.parse_webhook(&HeaderMap::new(), b"{not json").unwrap_err();
        assert_eq!(response.error.unwrap().code, ERR_PARSE);
        assert_eq!(response.id, Value::Null);
    }

    #[test]
    fn test_error_response_omits_result() {
        let response = PaymeResponse::error(json!(3), ERR_SYSTEM, "System error");
        let body = serde_json::to_value(&response).unwrap();
        assert!(body.get("result").is_none());
        assert_eq!(body["error"]["code"], ERR_SYSTEM);
        assert_eq!(body["id"], 3);
    }
}
