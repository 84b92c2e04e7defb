use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;

use crate::domain::{Provider, Transaction};
use crate::error::AppError;
use crate::providers::{self, PaymentProvider};
use crate::services::Reconciler;

/// Shared entry point for every provider route. The body is handed to the
/// provider raw: Click signs the exact form bytes, Payme and Uzum send JSON.
/// Always answers 200 with the provider's own response shape.
pub async fn webhook<P: PaymentProvider>(
    State(provider): State<Arc<P>>,
    State(core): State<Reconciler>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<P::Response> {
    Json(providers::process(provider.as_ref(), &core, &headers, &body).await)
}

pub async fn get_transaction(
    State(core): State<Reconciler>,
    Path((provider, reference)): Path<(String, String)>,
) -> Result<Json<Transaction>, AppError> {
    let provider: Provider = provider.parse().map_err(AppError::Validation)?;
    let tx = core.inspect(provider, &reference).await?;
    Ok(Json(tx))
}
