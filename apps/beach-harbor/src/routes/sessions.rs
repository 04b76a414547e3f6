use axum::{
    extract::{Query, State},
    http::Uri,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::orchestrator::StartOutcome;
use crate::state::AppState;

use super::{session_error, ApiError, ApiResult};

pub const MSG_REUSING_DROPLET: &str = "Reusing existing droplet";

#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
    pub ip_address: String,
    pub share_tag: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinSessionQuery {
    pub game_tag: String,
}

#[derive(Debug, Serialize)]
pub struct JoinSessionResponse {
    pub ip_address: String,
}

/// POST /sessions/start - hand out an idle droplet or provision a new one
pub async fn start_session(State(state): State<AppState>) -> ApiResult<StartSessionResponse> {
    let outcome = state
        .orchestrator()
        .start_session()
        .await
        .map_err(|err| session_error(err, "Session provisioning failed."))?;

    let message = matches!(outcome, StartOutcome::Reused { .. }).then_some(MSG_REUSING_DROPLET);
    Ok(Json(StartSessionResponse {
        message,
        ip_address: outcome.address().to_string(),
        share_tag: outcome.share_tag().to_string(),
    }))
}

/// POST /sessions/join?game_tag=TAG - resolve a share tag to its droplet
pub async fn join_session(State(state): State<AppState>, uri: Uri) -> ApiResult<JoinSessionResponse> {
    let Query(query) = Query::<JoinSessionQuery>::try_from_uri(&uri)
        .map_err(|err| ApiError::BadRequest(err.body_text()))?;

    let ip_address = state
        .orchestrator()
        .join_session(&query.game_tag)
        .await
        .map_err(|err| session_error(err, "Session lookup failed."))?;
    Ok(Json(JoinSessionResponse { ip_address }))
}
