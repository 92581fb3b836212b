//! HTTP server for the relay.
//!
//! This module provides an Axum-based HTTP server exposing the streaming
//! endpoint. It is only available when the `server` feature is enabled.

use crate::error::{EndpointError, ErrorResponse};
use crate::registry::SessionRecord;
use crate::relay::Relay;
use crate::request::ChatRequest;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chatrelay_core::{RelayError, SessionId};
use futures::StreamExt;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Header carrying the session ID on streaming responses.
pub const SESSION_HEADER: &str = "x-session-id";

/// Server error types.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind the listener.
    #[error("Failed to bind to address: {0}")]
    Bind(String),
    /// The server stopped with an error.
    #[error("Server error: {0}")]
    Serve(String),
}

impl Relay {
    /// Create an Axum router for the relay endpoints.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/chat/stream", post(chat_stream))
            .route("/v1/sessions/{session_id}", get(get_session))
            .route("/v1/sessions/{session_id}/cancel", post(cancel_session))
            .route("/health", get(health_check))
            .with_state(Arc::new(self.clone()))
    }

    /// Start serving on the given address.
    ///
    /// Runs until the server fails.
    pub async fn serve(self, addr: impl Into<SocketAddr>) -> Result<(), ServerError> {
        let addr = addr.into();
        let router = self.router();

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()))?;
        tracing::info!(%addr, upstream = %self.config().upstream_url, "relay listening");

        axum::serve(listener, router)
            .await
            .map_err(|e| ServerError::Serve(e.to_string()))?;

        Ok(())
    }
}

impl IntoResponse for EndpointError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(ErrorResponse::from(&self))).into_response();

        if let Some(RelayError::RateLimited {
            retry_after: Some(after),
        }) = self.relay_error()
        {
            if let Ok(value) = HeaderValue::from_str(&after.as_secs().to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

// Handler implementations

/// POST /v1/chat/stream - Relay a streaming completion
async fn chat_stream(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, EndpointError> {
    let stream = relay.open(bearer_token(&headers), request).await?;
    let session_id = stream.session_id().clone();

    // Dropping this stream (client disconnect) closes the channel, which
    // cancels the session and drops the upstream body.
    let (events, _task) = stream.into_parts();
    let events = events.filter_map(|event| async move {
        event
            .to_payload()
            .map(|payload| Ok::<Event, Infallible>(Event::default().data(payload)))
    });

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    if let Ok(value) = HeaderValue::from_str(session_id.as_str()) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    Ok(response)
}

/// GET /v1/sessions/{session_id} - Get session state
async fn get_session(
    State(relay): State<Arc<Relay>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionRecord>, (StatusCode, Json<ErrorResponse>)> {
    relay
        .registry()
        .get(&SessionId::from_string(session_id.clone()))
        .map(Json)
        .ok_or_else(|| not_found(&session_id))
}

/// POST /v1/sessions/{session_id}/cancel - Stop a live session
async fn cancel_session(
    State(relay): State<Arc<Relay>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let id = SessionId::from_string(session_id.clone());
    match relay.registry().get(&id) {
        None => Err(not_found(&session_id)),
        Some(_) if relay.registry().cancel(&id) => Ok(StatusCode::ACCEPTED),
        Some(record) => Err((
            StatusCode::CONFLICT,
            Json(error_body(
                "already_finished",
                format!("Session already finished: {}", record.state),
            )),
        )),
    }
}

/// GET /health - Health check endpoint
async fn health_check(State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "chatrelay",
        "active_sessions": relay.registry().active_count(),
    }))
}

fn not_found(session_id: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(error_body(
            "not_found",
            format!("Session not found: {}", session_id),
        )),
    )
}

fn error_body(kind: &str, message: String) -> ErrorResponse {
    ErrorResponse {
        error: crate::error::ErrorBody {
            kind: kind.to_string(),
            message,
            fallback: false,
        },
    }
}
