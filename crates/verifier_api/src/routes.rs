//! HTTP surface of the verification service
//!
//! One batch endpoint: `POST /` takes a JSON array of addresses and
//! answers with a `{status, message, emails}` envelope. Authentication and
//! payload failures are reported inside the envelope with HTTP 200, so
//! clients only ever parse one shape. A small `GET /health` reports
//! version and cache occupancy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use verifier_core::{BatchEngine, MxCache, VerdictCache};

/// Shared application state
pub struct AppState {
    pub engine: BatchEngine,
    pub password: String,
    pub result_cache: Option<Arc<VerdictCache>>,
    pub mx_cache: Option<Arc<MxCache>>,
}

/// Response envelope shared by every outcome of the batch endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchEnvelope {
    pub status: String,
    pub message: String,
    pub emails: Option<HashMap<String, String>>,
}

impl BatchEnvelope {
    fn error(message: &str) -> Self {
        Self {
            status: "error".to_string(),
            message: message.to_string(),
            emails: None,
        }
    }

    fn success(message: String, emails: HashMap<String, String>) -> Self {
        Self {
            status: "success".to_string(),
            message,
            emails: Some(emails),
        }
    }
}

/// Build the application router.
pub fn build_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(verify_batch_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// POST /
///
/// Verifies a JSON array of candidate addresses and returns one verdict per
/// distinct address. The body is read raw so a malformed payload produces
/// the envelope error instead of a framework rejection.
pub async fn verify_batch_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<BatchEnvelope> {
    let started = Instant::now();

    if !state.password.is_empty() {
        let supplied = headers
            .get(AUTHORIZATION)
            .map(|value| value.as_bytes())
            .unwrap_or_default();
        if supplied != state.password.as_bytes() {
            warn!("batch request rejected: bad authorization");
            return Json(BatchEnvelope::error("Invalid password"));
        }
    }

    let emails: Vec<String> = match serde_json::from_slice(&body) {
        Ok(emails) => emails,
        Err(err) => {
            warn!(error = %err, "batch request rejected: undecodable body");
            return Json(BatchEnvelope::error("Invalid payload"));
        }
    };

    debug!(submitted = emails.len(), "batch accepted");
    let verdicts = state.engine.run(emails).await;
    let verified = verdicts.len();
    let elapsed = started.elapsed();
    info!(verified, ?elapsed, "batch completed");

    Json(BatchEnvelope::success(
        format!("Request completed, verified {verified} emails in {elapsed:?}"),
        verdicts,
    ))
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub cached_verdicts: usize,
    pub cached_domains: usize,
}

/// GET /health
///
/// Reports liveness, the build version, and how full the caches are.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cached_verdicts: state.result_cache.as_ref().map(|c| c.len()).unwrap_or(0),
        cached_domains: state.mx_cache.as_ref().map(|c| c.len()).unwrap_or(0),
    })
}
