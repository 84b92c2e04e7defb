pub mod adapters;
pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod ports;
pub mod providers;
pub mod services;
pub mod startup;
pub mod utils;

use axum::{
    extract::FromRef,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

use crate::config::Config;
use crate::handlers::webhook::{get_transaction, webhook};
use crate::providers::{ClickProvider, PaymeProvider, UzumProvider};
use crate::services::Reconciler;

/// Webhook payloads are a few hundred bytes.
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Reconciler,
    pub payme: Arc<PaymeProvider>,
    pub click: Arc<ClickProvider>,
    pub uzum: Arc<UzumProvider>,
    pub admin_api_key: Arc<str>,
    pub db: Option<sqlx::PgPool>,
}

impl AppState {
    pub fn new(config: &Config, reconciler: Reconciler, db: Option<sqlx::PgPool>) -> Self {
        Self {
            reconciler,
            payme: Arc::new(PaymeProvider::new(config.payme_key.clone())),
            click: Arc::new(ClickProvider::new(
                config.click_service_id.clone(),
                config.click_secret_key.clone(),
            )),
            uzum: Arc::new(UzumProvider::new()),
            admin_api_key: Arc::from(config.admin_api_key.as_str()),
            db,
        }
    }
}

impl FromRef<AppState> for Reconciler {
    fn from_ref(state: &AppState) -> Self {
        state.reconciler.clone()
    }
}

impl FromRef<AppState> for Arc<PaymeProvider> {
    fn from_ref(state: &AppState) -> Self {
        state.payme.clone()
    }
}

impl FromRef<AppState> for Arc<ClickProvider> {
    fn from_ref(state: &AppState) -> Self {
        state.click.clone()
    }
}

impl FromRef<AppState> for Arc<UzumProvider> {
    fn from_ref(state: &AppState) -> Self {
        state.uzum.clone()
    }
}

pub fn create_app(state: AppState) -> Router {
    let admin = Router::new()
        .route("/transactions/:provider/:reference", get(get_transaction))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::admin_auth,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/payme", post(webhook::<PaymeProvider>))
        .route("/click", post(webhook::<ClickProvider>))
        .route("/uzum", post(webhook::<UzumProvider>))
        .merge(admin)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(axum_middleware::from_fn(
            middleware::request_logger::request_logger_middleware,
        ))
        .with_state(state)
}
