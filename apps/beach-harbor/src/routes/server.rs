//! Callbacks made by the game servers themselves. Both routes require a valid
//! request signature; see [`Signed`].

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::orchestrator::EndOutcome;
use crate::state::AppState;

use super::{session_error, ApiError, ApiResult, Signed};

pub const MSG_DROPLET_DELETED: &str = "Game session ended and DigitalOcean droplet deleted.";
pub const MSG_LOCAL_ENTRY_REMOVED: &str =
    "Game session ended and local session entry removed (no DigitalOcean droplet).";
pub const MSG_HEARTBEAT_UPDATED: &str = "Heartbeat updated successfully.";
pub const MSG_BAD_HEARTBEAT: &str = "Invalid heartbeat payload.";

#[derive(Debug, Deserialize)]
pub struct EndSessionQuery {
    pub droplet_ip: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub droplet_ip: String,
    pub connected_clients: u32,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub message: &'static str,
    pub ip_address: String,
    pub connected_clients: u32,
    pub last_heartbeat: DateTime<Utc>,
}

/// POST /server/end?droplet_ip=IP - drop the record and reclaim its droplet
pub async fn end_session(State(state): State<AppState>, signed: Signed) -> ApiResult<MessageResponse> {
    let Query(query) = Query::<EndSessionQuery>::try_from_uri(&signed.uri)
        .map_err(|err| ApiError::BadRequest(err.body_text()))?;

    let outcome = state
        .orchestrator()
        .end_session(&query.droplet_ip)
        .await
        .map_err(|err| session_error(err, "Session teardown failed."))?;

    let message = match outcome {
        EndOutcome::InstanceDestroyed(_) => MSG_DROPLET_DELETED,
        EndOutcome::LocalRecordRemoved => MSG_LOCAL_ENTRY_REMOVED,
    };
    Ok(Json(MessageResponse { message }))
}

/// POST /server/heartbeat - record the droplet's current client count
pub async fn server_heartbeat(
    State(state): State<AppState>,
    signed: Signed,
) -> ApiResult<HeartbeatResponse> {
    let request: HeartbeatRequest = serde_json::from_slice(&signed.body).map_err(|err| {
        debug!(error = %err, "rejected heartbeat payload");
        ApiError::BadRequest(MSG_BAD_HEARTBEAT.to_string())
    })?;

    let record = state
        .orchestrator()
        .heartbeat(&request.droplet_ip, request.connected_clients)
        .await
        .map_err(|err| session_error(err, "Heartbeat could not be recorded."))?;

    Ok(Json(HeartbeatResponse {
        message: MSG_HEARTBEAT_UPDATED,
        ip_address: record.address,
        connected_clients: record.connected_clients,
        last_heartbeat: record.last_seen,
    }))
}
