//! HTTP route handlers. Each one is a thin adapter over `SessionCoordinator`.

use std::convert::Infallible;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::Json;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use relay_core::{RelayError, SessionId, StreamEvent};

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn path_session(raw: String) -> Result<SessionId, ApiError> {
    if raw.trim().is_empty() {
        return Err(RelayError::MalformedRequest("session id is required".into()).into());
    }
    Ok(SessionId::from_raw(raw))
}

fn to_sse(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.event_type())
        .data(event.to_wire().to_string())
}

/// `GET /events/{session_id}`
pub async fn events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session_id = path_session(session_id)?;
    info!(session_id = %session_id, "event stream requested");
    let stream = state.coordinator.attach_stream(&session_id);
    Ok(Sse::new(stream.into_stream().map(|event| Ok(to_sse(&event)))))
}

/// `POST /chat`
pub async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    let message = request
        .message
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| RelayError::MalformedRequest("message is required".into()))?;
    let session_id = request
        .session_id
        .filter(|s| !s.trim().is_empty())
        .map(SessionId::from_raw);

    let receipt = state.coordinator.submit_user_message(
        session_id.as_ref(),
        request.user_id.as_deref(),
        &message,
    )?;

    Ok(Json(json!({
        "success": true,
        "type": "chat_started",
        "sessionId": receipt.session_id,
        "messageId": receipt.user_message.id(),
        "content": format!("Generating responses... ({} total)", receipt.total_responses),
        "messageCount": receipt.message_count,
        "totalResponses": receipt.total_responses,
        "processStatus": receipt.process_status,
        "timestamp": receipt.user_message.timestamp(),
    })))
}

/// `GET /sessions`
pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let overview = state.coordinator.list_sessions()?;
    Ok(Json(json!({
        "sessions": overview.sessions,
        "activeConnections": overview.active_connections,
        "persisted": overview.persisted,
        "total": overview.total,
        "timestamp": Utc::now(),
    })))
}

/// `GET /sessions/{id}/messages`
pub async fn session_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = path_session(session_id)?;
    let messages = state.coordinator.get_history(&session_id)?;
    Ok(Json(json!({
        "success": true,
        "sessionId": session_id,
        "messages": messages,
        "timestamp": Utc::now(),
    })))
}

/// `DELETE /sessions/{id}`
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = path_session(session_id)?;
    let existed = state.coordinator.delete_session(&session_id).await?;
    Ok(Json(json!({
        "success": true,
        "sessionId": session_id,
        "existed": existed,
        "timestamp": Utc::now(),
    })))
}

/// `POST /sessions/{id}/process/advance`
pub async fn advance_process(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = path_session(session_id)?;
    let status = state.coordinator.advance_process_status(&session_id)?;
    Ok(Json(json!({
        "success": true,
        "sessionId": session_id,
        "processStatus": status,
    })))
}

/// `DELETE /sessions/{id}/stream`
pub async fn detach_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = path_session(session_id)?;
    let detached = state.coordinator.detach_stream(&session_id);
    Ok(Json(json!({
        "success": true,
        "sessionId": session_id,
        "detached": detached,
    })))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "activeConnections": state.coordinator.registry().streaming_count(),
        "parkedChannels": state.coordinator.registry().parked_count(),
        "sessions": state.coordinator.session_count(),
        "timestamp": Utc::now(),
    }))
}
