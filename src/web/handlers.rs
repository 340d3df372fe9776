//! HTTP request handlers.

use super::AppState;
use crate::device::{Coordinates, DeviceProfile};
use crate::packet::{build_login_packet, build_position_report_packet};
use crate::session::SessionError;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

fn session_error(e: SessionError) -> axum::response::Response {
    let status = match &e {
        SessionError::Validation(_) => StatusCode::BAD_REQUEST,
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::NotActive(_) | SessionError::Busy(_) => StatusCode::CONFLICT,
    };
    (status, e.to_string()).into_response()
}

// ============================================================================
// API: Transmission
// ============================================================================

pub async fn handle_start_transmission(
    State(state): State<AppState>,
    Json(profile): Json<DeviceProfile>,
) -> impl IntoResponse {
    let (config, targets) = match profile.into_parts() {
        Ok(parts) => parts,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    match state.manager.start_all(config, targets).await {
        Ok(started) => Json(json!({
            "started": started,
            "transport": state.manager.transport_kind(),
        }))
        .into_response(),
        Err(e) => session_error(e),
    }
}

pub async fn handle_stop_transmission(State(state): State<AppState>) -> impl IntoResponse {
    let stopped = state.manager.stop_all_sessions().await;
    Json(json!({ "stopped": stopped }))
}

pub async fn handle_stop_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let stopped = state.manager.stop_session(&id).await;
    Json(json!({ "stopped": stopped }))
}

pub async fn handle_send_packet(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: String,
) -> impl IntoResponse {
    let text = body.trim();
    if text.is_empty() {
        return (StatusCode::BAD_REQUEST, "Packet body is empty").into_response();
    }

    match state.manager.send_custom(&id, text).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => session_error(e),
    }
}

pub async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.get_status().await)
}

// ============================================================================
// API: Device state
// ============================================================================

pub async fn handle_get_device(State(state): State<AppState>) -> impl IntoResponse {
    match state.manager.current_device() {
        Some(config) => Json(config).into_response(),
        None => (StatusCode::NOT_FOUND, "No device configured").into_response(),
    }
}

pub async fn handle_update_device(
    State(state): State<AppState>,
    Json(profile): Json<DeviceProfile>,
) -> impl IntoResponse {
    let result = profile
        .device_config()
        .and_then(|config| state.manager.update_device(config));

    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

pub async fn handle_update_position(
    State(state): State<AppState>,
    Json(coordinates): Json<Coordinates>,
) -> impl IntoResponse {
    match state.manager.update_position(coordinates) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PacketPreview {
    pub login: String,
    pub position_report: String,
}

pub async fn handle_preview_packets(
    State(state): State<AppState>,
    Json(profile): Json<DeviceProfile>,
) -> impl IntoResponse {
    let config = match profile.device_config() {
        Ok(config) => config,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let live = state.manager.current_position();

    Json(PacketPreview {
        login: build_login_packet(&config, live).into_string(),
        position_report: build_position_report_packet(&config, live).into_string(),
    })
    .into_response()
}

// ============================================================================
// API: Records
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    /// Only records with a larger id
    #[serde(default)]
    pub after: Option<u64>,
}

pub async fn handle_get_records(
    State(state): State<AppState>,
    Query(query): Query<RecordsQuery>,
) -> impl IntoResponse {
    let log = state.manager.log();
    match query.after {
        Some(after) => Json(log.records_after(after)),
        None => Json(log.records()),
    }
}

pub async fn handle_clear_records(State(state): State<AppState>) -> impl IntoResponse {
    let cleared = state.manager.log().clear();
    Json(json!({ "cleared": cleared }))
}

pub async fn handle_record_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.log().stats())
}

pub async fn handle_export_records(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.manager.log().export_text(),
    )
}
