//! Chat session routes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use chatdesk_core::db::{ChatSession, Message, NewMessage};
use chatdesk_core::SessionAttachment;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/conversations/{conversation_id}/messages",
            post(attach_message),
        )
        .route("/conversations/{conversation_id}/sessions", get(list_sessions))
        .route(
            "/conversations/{conversation_id}/sessions/{session_id}/messages",
            get(session_messages),
        )
        .route(
            "/conversations/{conversation_id}/sessions/{session_id}/close",
            post(close_session),
        )
        .route(
            "/conversations/{conversation_id}/sessions/{session_id}/metadata",
            patch(update_metadata),
        )
}

/// Attach an inbound message, opening or rolling over the session as needed
async fn attach_message(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Json(message): Json<NewMessage>,
) -> ApiResult<(StatusCode, Json<SessionAttachment>)> {
    if message.content.trim().is_empty() {
        return Err(ApiError::BadRequest("message content must not be empty".into()));
    }

    let attachment = state
        .sessions
        .attach_message_to_session(message, conversation_id)
        .await?;

    Ok((StatusCode::CREATED, Json(attachment)))
}

/// All sessions of a conversation, newest first
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
) -> ApiResult<Json<Vec<ChatSession>>> {
    Ok(Json(state.sessions.list_sessions(conversation_id)?))
}

/// Messages of one session; 404 when the session belongs to another conversation
async fn session_messages(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, session_id)): Path<(i64, i64)>,
) -> ApiResult<Json<Vec<Message>>> {
    Ok(Json(state.sessions.session_messages(conversation_id, session_id)?))
}

async fn close_session(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, session_id)): Path<(i64, i64)>,
) -> ApiResult<Json<ChatSession>> {
    Ok(Json(
        state.sessions.close_session(conversation_id, session_id).await?,
    ))
}

/// Merge keys into the session metadata; `null` removes a key
async fn update_metadata(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, session_id)): Path<(i64, i64)>,
    Json(patch): Json<Map<String, Value>>,
) -> ApiResult<Json<ChatSession>> {
    Ok(Json(
        state
            .sessions
            .update_metadata(conversation_id, session_id, patch)
            .await?,
    ))
}
