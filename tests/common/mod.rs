#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

use tolov_core::adapters::{InMemoryBalanceLedger, InMemoryTransactionRepository};
use tolov_core::config::{Config, LogFormat};
use tolov_core::ports::{BalanceLedger, ManualClock};
use tolov_core::providers::ClickProvider;
use tolov_core::services::Reconciler;
use tolov_core::{create_app, AppState};

pub const PAYME_KEY: &str = "payme-test-key";
pub const CLICK_SERVICE_ID: &str = "77";
pub const CLICK_SECRET: &str = "click-test-secret";
pub const ADMIN_KEY: &str = "admin-test-key";
pub const START_MS: i64 = 1_700_000_000_000;

pub struct TestApp {
    pub app: Router,
    pub core: Reconciler,
    pub ledger: InMemoryBalanceLedger,
    pub repo: InMemoryTransactionRepository,
    pub clock: Arc<ManualClock>,
}

pub fn test_config() -> Config {
    Config {
        server_port: 0,
        database_url: "postgres://unused".to_string(),
        payme_key: PAYME_KEY.to_string(),
        click_service_id: CLICK_SERVICE_ID.to_string(),
        click_secret_key: CLICK_SECRET.to_string(),
        admin_api_key: ADMIN_KEY.to_string(),
        payment_expiry_ms: 43_200_000,
        lock_timeout_ms: 500,
        payme_min_amount: 100_000,
        click_min_amount: 100_000,
        uzum_min_amount: 100_000,
        log_format: LogFormat::Text,
    }
}

/// Router over the in-memory store with the given beneficiary accounts open.
pub async fn spawn_app(accounts: &[i64]) -> TestApp {
    let config = test_config();
    let ledger = InMemoryBalanceLedger::new();
    for id in accounts {
        ledger.open_account(*id).await;
    }
    let repo = InMemoryTransactionRepository::new(Arc::new(ledger.clone()));
    let clock = Arc::new(ManualClock::new(START_MS));
    let core = Reconciler::new(
        Arc::new(repo.clone()),
        Arc::new(ledger.clone()),
        clock.clone(),
        config.reconcile_policy(),
    );
    let app = create_app(AppState::new(&config, core.clone(), None));

    TestApp {
        app,
        core,
        ledger,
        repo,
        clock,
    }
}

impl TestApp {
    pub async fn balance(&self, account_id: i64) -> i64 {
        self.ledger.balance(account_id).await.unwrap()
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        };
        (status, body)
    }

    pub async fn payme(&self, body: Value) -> Value {
        self.payme_with_key(PAYME_KEY, body).await
    }

    pub async fn payme_with_key(&self, key: &str, body: Value) -> Value {
        let token = STANDARD.encode(format!("Paycom:{}", key));
        let request = Request::builder()
            .method("POST")
            .uri("/payme")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Basic {}", token))
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, body) = self.send(request).await;
        assert_eq!(status, StatusCode::OK);
        body
    }

    pub async fn click(&self, fields: &[(&str, String)]) -> Value {
        call(self.app.clone(), click_request(fields)).await
    }

    pub async fn uzum(&self, body: Value) -> Value {
        let request = Request::builder()
            .method("POST")
            .uri("/uzum")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, body) = self.send(request).await;
        assert_eq!(status, StatusCode::OK);
        body
    }
}

/// Sends one request through `app` and decodes the JSON answer. Takes the
/// router by value so it can run inside a spawned task.
pub async fn call(app: Router, request: Request<Body>) -> Value {
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn click_request(fields: &[(&str, String)]) -> Request<Body> {
    let form = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields.iter().map(|(k, v)| (*k, v.as_str())))
        .finish();
    Request::builder()
        .method("POST")
        .uri("/click")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form))
        .unwrap()
}

/// Builds a correctly signed Click callback.
pub fn click_fields(
    action: &str,
    click_trans_id: &str,
    merchant_trans_id: &str,
    amount: &str,
    merchant_prepare_id: Option<&str>,
    error: &str,
) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("click_trans_id", click_trans_id.to_string()),
        ("service_id", CLICK_SERVICE_ID.to_string()),
        ("click_paydoc_id", "9001".to_string()),
        ("merchant_trans_id", merchant_trans_id.to_string()),
        ("amount", amount.to_string()),
        ("action", action.to_string()),
        ("error", error.to_string()),
        ("error_note", "Success".to_string()),
        ("sign_time", "2024-01-01 10:00:00".to_string()),
    ];
    if let Some(id) = merchant_prepare_id {
        fields.push(("merchant_prepare_id", id.to_string()));
    }

    let request = tolov_core::providers::click::ClickRequest {
        click_trans_id: click_trans_id.to_string(),
        service_id: CLICK_SERVICE_ID.to_string(),
        merchant_trans_id: merchant_trans_id.to_string(),
        merchant_prepare_id: merchant_prepare_id.map(str::to_string),
        amount: amount.to_string(),
        action: action.to_string(),
        sign_time: "2024-01-01 10:00:00".to_string(),
        ..Default::default()
    };
    let sign = ClickProvider::new(CLICK_SERVICE_ID, CLICK_SECRET).sign(&request);
    fields.push(("sign_string", sign));
    fields
}
