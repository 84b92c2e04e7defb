use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::providers::constant_time_eq;
use crate::AppState;

/// Bearer-key guard for the admin endpoints. An empty configured key locks
/// the endpoints entirely.
pub async fn admin_auth(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let expected = state.admin_api_key.as_bytes();
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match presented {
        Some(key) if !expected.is_empty() && constant_time_eq(key.as_bytes(), expected) => {
            Ok(next.run(req).await)
        }
        _ => {
            tracing::warn!(uri = %req.uri(), "admin request rejected");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
