//! Click SHOP API: form-encoded Prepare (`action=0`) and Complete
//! (`action=1`) callbacks signed with an MD5 digest over the shared secret.

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use super::{constant_time_eq, major_to_minor, PaymentProvider};
use crate::domain::{
    CancelReason, Provider, Transaction, TransactionState, MAX_PROVIDER_REFERENCE_LEN,
};
use crate::services::{CoreError, Reconciler};

pub const SUCCESS: i32 = 0;
pub const ERR_SIGN_CHECK: i32 = -1;
pub const ERR_AMOUNT: i32 = -2;
pub const ERR_ACTION_NOT_FOUND: i32 = -3;
pub const ERR_ALREADY_PAID: i32 = -4;
pub const ERR_USER_NOT_FOUND: i32 = -5;
pub const ERR_TRANSACTION_NOT_FOUND: i32 = -6;
pub const ERR_REQUEST: i32 = -8;
pub const ERR_CANCELLED: i32 = -9;

const ACTION_PREPARE: &str = "0";
const ACTION_COMPLETE: &str = "1";

fn error_note(code: i32) -> &'static str {
    match code {
        SUCCESS => "Success",
        ERR_SIGN_CHECK => "SIGN CHECK FAILED!",
        ERR_AMOUNT => "Incorrect parameter amount",
        ERR_ACTION_NOT_FOUND => "Action not found",
        ERR_ALREADY_PAID => "Already paid",
        ERR_USER_NOT_FOUND => "User does not exist",
        ERR_TRANSACTION_NOT_FOUND => "Transaction does not exist",
        ERR_CANCELLED => "Transaction cancelled",
        _ => "Error in request from click",
    }
}

/// Callback fields, kept as the exact strings Click sent so the signature
/// can be recomputed byte for byte.
#[derive(Debug, Clone, Default)]
pub struct ClickRequest {
    pub click_trans_id: String,
    pub service_id: String,
    pub click_paydoc_id: String,
    pub merchant_trans_id: String,
    pub merchant_prepare_id: Option<String>,
    pub amount: String,
    pub action: String,
    pub error: String,
    pub error_note: String,
    pub sign_time: String,
    pub sign_string: String,
}

impl ClickRequest {
    fn from_form(body: &[u8]) -> Result<Self, (Self, &'static str)> {
        let mut fields: HashMap<String, String> = url::form_urlencoded::parse(body)
            .into_owned()
            .collect();
        let mut take = |name: &str| fields.remove(name).filter(|v| !v.is_empty());

        let request = Self {
            click_trans_id: take("click_trans_id").unwrap_or_default(),
            service_id: take("service_id").unwrap_or_default(),
            click_paydoc_id: take("click_paydoc_id").unwrap_or_default(),
            merchant_trans_id: take("merchant_trans_id").unwrap_or_default(),
            merchant_prepare_id: take("merchant_prepare_id"),
            amount: take("amount").unwrap_or_default(),
            action: take("action").unwrap_or_default(),
            error: take("error").unwrap_or_else(|| "0".to_string()),
            error_note: take("error_note").unwrap_or_default(),
            sign_time: take("sign_time").unwrap_or_default(),
            sign_string: take("sign_string").unwrap_or_default(),
        };

        let missing = [
            ("click_trans_id", &request.click_trans_id),
            ("service_id", &request.service_id),
            ("merchant_trans_id", &request.merchant_trans_id),
            ("amount", &request.amount),
            ("action", &request.action),
            ("sign_time", &request.sign_time),
            ("sign_string", &request.sign_string),
        ]
        .into_iter()
        .find(|(_, value)| value.is_empty())
        .map(|(name, _)| name);

        if let Some(name) = missing {
            return Err((request, name));
        }
        if !is_click_id(&request.click_trans_id) {
            return Err((request, "click_trans_id"));
        }
        Ok(request)
    }

    /// Click reports its own side's failure as a negative `error`.
    fn reports_failure(&self) -> bool {
        self.error.trim().parse::<i64>().map(|e| e < 0).unwrap_or(false)
    }
}

/// Click transaction ids are decimal integers; anything else cannot be one.
fn is_click_id(id: &str) -> bool {
    id.len() <= MAX_PROVIDER_REFERENCE_LEN && id.bytes().all(|b| b.is_ascii_digit())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClickResponse {
    pub click_trans_id: Value,
    pub merchant_trans_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_prepare_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_confirm_id: Option<i64>,
    pub error: i32,
    pub error_note: String,
}

impl ClickResponse {
    fn new(request: &ClickRequest, error: i32) -> Self {
        // Click ids are numeric; echo them back as numbers when they are.
        let click_trans_id = request
            .click_trans_id
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(request.click_trans_id.clone()));

        Self {
            click_trans_id,
            merchant_trans_id: request.merchant_trans_id.clone(),
            merchant_prepare_id: None,
            merchant_confirm_id: None,
            error,
            error_note: error_note(error).to_string(),
        }
    }

    fn prepared(request: &ClickRequest, error: i32, tx: &Transaction) -> Self {
        Self {
            merchant_prepare_id: Some(tx.id),
            ..Self::new(request, error)
        }
    }

    fn completed(request: &ClickRequest, error: i32, tx: &Transaction) -> Self {
        Self {
            merchant_confirm_id: Some(tx.id),
            ..Self::new(request, error)
        }
    }
}

fn core_error_code(e: &CoreError) -> i32 {
    match e {
        CoreError::NotFound(_) => ERR_TRANSACTION_NOT_FOUND,
        CoreError::AlreadyConfirmed(_) => ERR_ALREADY_PAID,
        CoreError::Conflict(_) => ERR_REQUEST,
        CoreError::Expired(_) | CoreError::AlreadyCancelled(_) => ERR_CANCELLED,
        CoreError::InvalidAmount(_) => ERR_AMOUNT,
        CoreError::InvalidAccount(_) => ERR_USER_NOT_FOUND,
        CoreError::LockTimeout(_) | CoreError::Storage(_) => {
            tracing::error!(error = %e, "click request failed on a transient error");
            ERR_REQUEST
        }
    }
}

pub struct ClickProvider {
    service_id: String,
    secret_key: String,
}

impl ClickProvider {
    pub fn new(service_id: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            secret_key: secret_key.into(),
        }
    }

    /// `md5(click_trans_id service_id secret merchant_trans_id
    /// [merchant_prepare_id] amount action sign_time)`, lowercase hex.
    pub fn sign(&self, request: &ClickRequest) -> String {
        let mut raw = String::new();
        raw.push_str(&request.click_trans_id);
        raw.push_str(&request.service_id);
        raw.push_str(&self.secret_key);
        raw.push_str(&request.merchant_trans_id);
        if request.action == ACTION_COMPLETE {
            if let Some(prepare_id) = &request.merchant_prepare_id {
                raw.push_str(prepare_id);
            }
        }
        raw.push_str(&request.amount);
        raw.push_str(&request.action);
        raw.push_str(&request.sign_time);

        hex::encode(md5::compute(raw.as_bytes()).0)
    }

    async fn prepare(&self, core: &Reconciler, request: &ClickRequest) -> ClickResponse {
        let min = core.policy().min_amount_minor(Provider::Click);
        let amount_minor = match major_to_minor(&request.amount) {
            Some(minor) if minor >= min => minor,
            _ => return ClickResponse::new(request, ERR_AMOUNT),
        };

        match core
            .latest_for_order(Provider::Click, &request.merchant_trans_id)
            .await
        {
            Ok(Some(latest)) if latest.state == TransactionState::Confirmed => {
                return ClickResponse::prepared(request, ERR_ALREADY_PAID, &latest);
            }
            Ok(_) => {}
            Err(e) => return ClickResponse::new(request, core_error_code(&e)),
        }

        match core
            .open(
                &request.merchant_trans_id,
                &request.click_trans_id,
                Provider::Click,
                amount_minor,
            )
            .await
        {
            Ok(tx) => match tx.state {
                TransactionState::Created => ClickResponse::prepared(request, SUCCESS, &tx),
                TransactionState::Confirmed => ClickResponse::prepared(request, ERR_ALREADY_PAID, &tx),
                _ => ClickResponse::prepared(request, ERR_CANCELLED, &tx),
            },
            Err(e) => ClickResponse::new(request, core_error_code(&e)),
        }
    }

    async fn complete(&self, core: &Reconciler, request: &ClickRequest) -> ClickResponse {
        // Unlocked read: it only screens the request. The locked core calls
        // below decide the outcome.
        let tx = match core.inspect(Provider::Click, &request.click_trans_id).await {
            Ok(tx) => tx,
            Err(e) => return ClickResponse::new(request, core_error_code(&e)),
        };

        if let Some(prepare_id) = &request.merchant_prepare_id {
            if prepare_id.parse::<i64>().ok() != Some(tx.id) {
                return ClickResponse::new(request, ERR_TRANSACTION_NOT_FOUND);
            }
        }

        match tx.state {
            TransactionState::Confirmed => return ClickResponse::completed(request, ERR_ALREADY_PAID, &tx),
            state if state.is_cancelled() => return ClickResponse::completed(request, ERR_CANCELLED, &tx),
            _ => {}
        }

        if major_to_minor(&request.amount) != Some(tx.amount_minor) {
            return ClickResponse::new(request, ERR_AMOUNT);
        }

        if request.reports_failure() {
            tracing::info!(
                click_trans_id = %request.click_trans_id,
                error = %request.error,
                error_note = %request.error_note,
                "click reported payment failure, cancelling"
            );
            return match core
                .cancel_pending(Provider::Click, &request.click_trans_id, CancelReason::DebitError)
                .await
            {
                Ok(tx) => ClickResponse::completed(request, ERR_CANCELLED, &tx),
                Err(CoreError::AlreadyConfirmed(_)) => {
                    ClickResponse::completed(request, ERR_ALREADY_PAID, &tx)
                }
                Err(e) => ClickResponse::new(request, core_error_code(&e)),
            };
        }

        match core.confirm_once(Provider::Click, &request.click_trans_id).await {
            Ok(tx) => ClickResponse::completed(request, SUCCESS, &tx),
            Err(CoreError::AlreadyConfirmed(_)) => ClickResponse::completed(request, ERR_ALREADY_PAID, &tx),
            Err(e) => ClickResponse::new(request, core_error_code(&e)),
        }
    }
}

#[async_trait]
impl PaymentProvider for ClickProvider {
    type Request = ClickRequest;
    type Response = ClickResponse;

    fn provider(&self) -> Provider {
        Provider::Click
    }

    fn parse_webhook(&self, _headers: &HeaderMap, body: &[u8]) -> Result<ClickRequest, ClickResponse> {
        ClickRequest::from_form(body).map_err(|(partial, missing)| {
            tracing::debug!(field = missing, "click callback is missing a required field");
            ClickResponse::new(&partial, ERR_REQUEST)
        })
    }

    fn verify_authenticity(&self, _headers: &HeaderMap, request: &ClickRequest) -> Result<(), ClickResponse> {
        let expected = self.sign(request);
        let signed = constant_time_eq(
            expected.as_bytes(),
            request.sign_string.to_ascii_lowercase().as_bytes(),
        );
        if request.service_id != self.service_id || !signed {
            return Err(ClickResponse::new(request, ERR_SIGN_CHECK));
        }
        Ok(())
    }

    async fn respond(&self, core: &Reconciler, request: ClickRequest) -> ClickResponse {
        let response = match request.action.as_str() {
            ACTION_PREPARE => self.prepare(core, &request).await,
            ACTION_COMPLETE => self.complete(core, &request).await,
            _ => ClickResponse::new(&request, ERR_ACTION_NOT_FOUND),
        };

        if response.error != SUCCESS {
            tracing::info!(
                click_trans_id = %request.click_trans_id,
                merchant_trans_id = %request.merchant_trans_id,
                action = %request.action,
                error = response.error,
                "click request rejected"
            );
        }
        response
    }
}
