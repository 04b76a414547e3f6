mod auth;
mod server;
mod sessions;

use axum::{
    http::{request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use harbor_signing::Rejection;
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error};

use crate::orchestrator::SessionError;
use crate::state::AppState;

pub use auth::Signed;
pub use server::*;
pub use sessions::*;

pub const DROPLET_NOT_FOUND: &str = "Droplet not found in database.";

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/sessions/start", post(start_session))
        .route("/sessions/join", post(join_session))
        .route("/server/end", post(end_session))
        .route("/server/heartbeat", post(server_heartbeat))
        .with_state(state)
}

/// Explicit origins plus any `http(s)://localhost` or `127.0.0.1` origin on any port.
pub fn cors_layer(origins: Vec<String>) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts: &Parts| {
                allowed.iter().any(|candidate| candidate == origin)
                    || origin.to_str().map(is_local_origin).unwrap_or(false)
            },
        ))
        .allow_methods(Any)
        .allow_headers(Any)
}

fn is_local_origin(origin: &str) -> bool {
    let Some(rest) = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
    else {
        return false;
    };
    let (host, port) = match rest.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (rest, None),
    };
    let port_ok = port
        .map(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(true);
    matches!(host, "localhost" | "127.0.0.1") && port_ok
}

async fn health_check() -> &'static str {
    "ok"
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Caller-facing failures. Messages are fixed strings; internal causes are
/// logged where the error is produced and never echoed back.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Stale,
    Unavailable,
    NotFound(&'static str),
    BadRequest(String),
    Internal(&'static str),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    detail: String,
}

impl ApiError {
    fn parts(self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid HMAC signature.".to_string(),
            ),
            ApiError::Stale => (
                StatusCode::UNAUTHORIZED,
                "stale",
                "Stale HMAC signature.".to_string(),
            ),
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                "Internal endpoint unavailable.".to_string(),
            ),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                msg.to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, detail) = self.parts();
        (status, Json(ApiErrorBody { error, detail })).into_response()
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Unavailable => ApiError::Unavailable,
            Rejection::Unauthorized => ApiError::Unauthorized,
            Rejection::Stale => ApiError::Stale,
        }
    }
}

/// Maps an orchestrator failure; `failure` is the message shown for anything
/// other than a plain miss.
fn session_error(err: SessionError, failure: &'static str) -> ApiError {
    match err {
        SessionError::NotFound(key) => {
            debug!(%key, "session lookup missed");
            ApiError::NotFound(DROPLET_NOT_FOUND)
        }
        other => {
            error!(error = %other, "{failure}");
            ApiError::Internal(failure)
        }
    }
}
