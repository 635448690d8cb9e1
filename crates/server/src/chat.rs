//! Chat endpoints.
//!
//! - `POST /chat/message` — process one user turn; unknown or
//!   client-generated `temp-` session ids get a fresh anonymous session
//! - `GET  /chat/history/{session_id}?limit=1..200` — stored
//!   request/response pairs, oldest first

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use leadline_agent::runtime::ConversationRuntime;
use leadline_core::domain::history::ChatTurn;
use leadline_core::domain::session::{SessionId, SessionRecord};
use leadline_db::repositories::{ChatHistoryRepository, SessionRepository};

use crate::rate_limit::RateLimiter;

const DEFAULT_HISTORY_LIMIT: u32 = 50;
const MAX_HISTORY_LIMIT: u32 = 200;

#[derive(Clone)]
pub struct ChatState {
    runtime: Arc<ConversationRuntime>,
    sessions: Arc<dyn SessionRepository>,
    history: Arc<dyn ChatHistoryRepository>,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl ChatState {
    pub fn new(
        runtime: Arc<ConversationRuntime>,
        sessions: Arc<dyn SessionRepository>,
        history: Arc<dyn ChatHistoryRepository>,
        rate_limiter: Option<Arc<RateLimiter>>,
    ) -> Self {
        Self { runtime, sessions, history, rate_limiter }
    }
}

pub fn router(state: ChatState) -> Router {
    Router::new()
        .route("/chat/message", post(chat_message))
        .route("/chat/history/{session_id}", get(chat_history))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ChatMessageRequest {
    pub message: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatMessageResponse {
    pub response: String,
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub session_id: String,
    pub count: usize,
    pub history: Vec<ChatTurn>,
}

type ErrorReply = (StatusCode, Json<ApiError>);

fn internal_error() -> ErrorReply {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError { error: "Something went wrong. Please try again.".to_string() }),
    )
}

async fn chat_message(
    State(state): State<ChatState>,
    Json(request): Json<ChatMessageRequest>,
) -> Result<Json<ChatMessageResponse>, ErrorReply> {
    if let Some(limiter) = &state.rate_limiter {
        let key = request.session_id.as_deref().unwrap_or("anonymous");
        if !limiter.try_acquire(key) {
            return Err((
                StatusCode::TOO_MANY_REQUESTS,
                Json(ApiError {
                    error: "Too many requests. Please slow down and try again.".to_string(),
                }),
            ));
        }
    }

    let session = resolve_session(&state, request.session_id.as_deref()).await?;
    let response = state.runtime.process_message(&session, &request.message).await;

    Ok(Json(ChatMessageResponse { response, session_id: session.session_id.0 }))
}

/// Looks up the caller's session; unknown ids and `temp-` placeholders get
/// a fresh anonymous session.
async fn resolve_session(
    state: &ChatState,
    raw: Option<&str>,
) -> Result<SessionRecord, ErrorReply> {
    if let Some(raw) = raw {
        let id = SessionId(raw.to_string());
        if !id.is_placeholder() {
            match state.sessions.find(&id).await {
                Ok(Some(record)) => {
                    if let Err(error) = state.sessions.touch(&id).await {
                        warn!(
                            event_name = "server.session_touch_failed",
                            session_id = %id,
                            error = %error,
                            "failed to update session activity"
                        );
                    }
                    return Ok(record);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(
                        event_name = "server.session_lookup_failed",
                        session_id = %id,
                        error = %error,
                        "session lookup failed"
                    );
                    return Err(internal_error());
                }
            }
        }
    }

    let record = SessionRecord::anonymous();
    if let Err(error) = state.sessions.create(record.clone()).await {
        warn!(
            event_name = "server.session_create_failed",
            error = %error,
            "failed to create anonymous session"
        );
        return Err(internal_error());
    }
    info!(
        event_name = "server.session_created",
        session_id = %record.session_id,
        "anonymous session created"
    );
    Ok(record)
}

async fn chat_history(
    State(state): State<ChatState>,
    Path(session_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ErrorReply> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
    let id = SessionId(session_id);

    match state.history.recent_turns(&id, limit).await {
        Ok(turns) => {
            Ok(Json(HistoryResponse { session_id: id.0, count: turns.len(), history: turns }))
        }
        Err(error) => {
            warn!(
                event_name = "server.history_fetch_failed",
                session_id = %id,
                error = %error,
                "history fetch failed"
            );
            Err(internal_error())
        }
    }
}
