//! Request middleware.
//!
//! Layer order, outermost first:
//!
//! ```text
//! CORS ─▶ process time ─▶ request monitor ─▶ /api/v1 API key ─▶ handler
//! ```
//!
//! | Middleware | Scope | Effect |
//! |------------|-------|--------|
//! | [`cors_layer`] | all routes | origins matching `server.client_origins_regex`, credentials allowed |
//! | [`process_time`] | all routes | `X-Process-Time` header, one log line per request |
//! | [`monitor_requests`] | all routes | records `(session, path, status)` for `/api/v1/*` calls |
//! | [`require_api_key`] | `/api/v1/*` | SHA-256 of `X-API-Key` must be an active key |

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::{header, request::Parts, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::server::AppState;

pub const X_API_KEY: &str = "x-api-key";
pub const X_SESSION_ID: &str = "x-session-id";
pub const X_PROCESS_TIME: &str = "x-process-time";
pub const X_CONVERSATION_ID: &str = "x-conversation-id";
pub const X_MESSAGE_ID: &str = "x-message-id";

// ============ CORS ============

/// Origins must fully match `client_origins_regex`; an empty regex allows
/// no cross-origin caller.
pub fn cors_layer(server: &ServerConfig) -> Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .expose_headers([
            HeaderName::from_static(X_PROCESS_TIME),
            HeaderName::from_static(X_CONVERSATION_ID),
            HeaderName::from_static(X_MESSAGE_ID),
        ]);

    if server.client_origins_regex.is_empty() {
        return Ok(layer);
    }
    let re = Regex::new(&format!("^(?:{})$", server.client_origins_regex))
        .with_context(|| "server.client_origins_regex is not a valid regex")?;
    let re = Arc::new(re);
    Ok(layer.allow_origin(AllowOrigin::predicate(
        move |origin: &HeaderValue, _parts: &Parts| {
            origin.to_str().map(|o| re.is_match(o)).unwrap_or(false)
        },
    )))
}

// ============ Process time ============

pub async fn process_time(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let span = info_span!("http_request", method = %method, path = %path);
    async move {
        let mut response = next.run(req).await;
        let elapsed = started.elapsed();
        if let Ok(value) = HeaderValue::from_str(&elapsed.as_secs_f64().to_string()) {
            response.headers_mut().insert(X_PROCESS_TIME, value);
        }
        info!(
            origin = %origin,
            status = response.status().as_u16(),
            latency_ms = elapsed.as_millis() as u64,
            "request finished"
        );
        response
    }
    .instrument(span)
    .await
}

// ============ API key ============

pub async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !state.config.server.require_api_key {
        return next.run(req).await;
    }
    let key = req
        .headers()
        .get(X_API_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty());
    let Some(key) = key else {
        return ApiError::Unauthorized.into_response();
    };

    let digest = Sha256::digest(key.as_bytes());
    match state.metadata.check_api_key(digest.as_slice()).await {
        Ok(true) => next.run(req).await,
        Ok(false) => ApiError::Unauthorized.into_response(),
        Err(e) => {
            error!(error = %e, "api key lookup failed");
            ApiError::Unauthorized.into_response()
        }
    }
}

// ============ Request monitor ============

pub async fn monitor_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let session_id = req
        .headers()
        .get(X_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s.trim()).ok());
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    let api_prefix = format!("{}/", state.config.server.api_v1_prefix.trim_end_matches('/'));
    match session_id {
        Some(session_id) if path.starts_with(&api_prefix) => {
            let metadata = Arc::clone(&state.metadata);
            let http_code = response.status().as_u16();
            tokio::spawn(async move {
                if let Err(e) = metadata.register_endpoint(session_id, &path, http_code).await {
                    error!(endpoint = %path, error = %e, "failed to register endpoint");
                }
            });
        }
        _ => warn!(endpoint = %path, "No X-Session-ID header provided"),
    }
    response
}
