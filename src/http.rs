//! REST surface and shared application state
//!
//! Thin endpoints around the core: presence lookup, out-of-band send, and
//! the undelivered-message fetch/delete/check triple. Everything except the
//! status probe is bearer-token authenticated; the user is always the token
//! subject, never a request field.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::dispatch::InboundDispatcher;
use crate::gateway;
use crate::message::{ChatRequest, MessageEnvelope};
use crate::presence::PresenceDirectory;
use crate::registry::SessionRegistry;
use crate::router::DeliveryRouter;
use crate::store::UndeliveredStore;

/// Everything the handlers and the gateway share
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub verifier: Arc<TokenVerifier>,
    pub sessions: Arc<SessionRegistry>,
    pub presence: Arc<dyn PresenceDirectory>,
    pub store: Arc<dyn UndeliveredStore>,
    pub router: Arc<DeliveryRouter>,
    pub dispatcher: Arc<InboundDispatcher>,
}

/// REST/WS error
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing or invalid authorization")]
    Unauthorized,

    #[error("user offline")]
    Offline,

    #[error("delivery failed")]
    DeliveryFailed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::Offline => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::DeliveryFailed => (StatusCode::CONFLICT, self.to_string()),
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };
        let body = json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

/// Extract and verify the bearer token, returning the subject
fn bearer_user(headers: &HeaderMap, verifier: &TokenVerifier) -> Result<String, ApiError> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    let token = raw.strip_prefix("Bearer ").ok_or(ApiError::Unauthorized)?;
    verifier.verify(token.trim()).map_err(|e| {
        warn!(error = %e, "bearer token rejected");
        ApiError::Unauthorized
    })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(gateway::ws_handler))
        .route("/health", get(health))
        .route("/v1/websocket/user-status/:user_id", get(user_status))
        .route("/v1/websocket/send-message", post(send_message))
        .route(
            "/v1/messages/undelivered",
            get(fetch_undelivered).delete(delete_undelivered),
        )
        .route("/v1/messages/undelivered/check", get(check_undelivered))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
pub struct UserStatusResponse {
    pub online: bool,
    pub pod: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UndeliveredMessagesResponse {
    pub messages: Vec<MessageEnvelope>,
    pub total_count: usize,
    pub has_messages: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckUndeliveredResponse {
    pub has_messages: bool,
    pub receiver_id: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /v1/websocket/user-status/{userId}
async fn user_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<UserStatusResponse> {
    let pod = state.presence.lookup(&user_id).await.unwrap_or_else(|e| {
        error!(user_id = %user_id, error = %e, "presence lookup failed");
        None
    });
    let online = pod.is_some();
    info!(user_id = %user_id, online, pod = pod.as_deref().unwrap_or(""), "user status");
    Json(UserStatusResponse { online, pod })
}

/// POST /v1/websocket/send-message
///
/// The sender is the token subject. Offline targets are a 404: the HTTP
/// contract makes the caller run the offline flow itself.
async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let from_user_id = bearer_user(&headers, &state.verifier)?;
    let target_user_id = request.receiver_id.clone();
    let body = request.actual_message.clone();

    info!(
        from = %from_user_id,
        target = %target_user_id,
        bytes = body.len(),
        "http send-message"
    );

    let online = state
        .presence
        .contains(&target_user_id)
        .await
        .unwrap_or(false);
    if !online {
        info!(target = %target_user_id, "target offline, returning 404");
        return Err(ApiError::Offline);
    }

    if state
        .router
        .deliver_http(&from_user_id, &target_user_id, &body)
        .await
    {
        Ok(Json(json!({ "message": "Delivered or relayed" })))
    } else {
        warn!(from = %from_user_id, target = %target_user_id, "http delivery failed");
        Err(ApiError::DeliveryFailed)
    }
}

/// GET /v1/messages/undelivered
///
/// Fetch-then-delete: retrieval is at-most-once. A crash between the fetch
/// and the delete loses messages; that trade is accepted.
async fn fetch_undelivered(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UndeliveredMessagesResponse>, ApiError> {
    let user_id = bearer_user(&headers, &state.verifier)?;

    let messages = state
        .store
        .fetch(&user_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    if !messages.is_empty() {
        if let Err(e) = state.store.delete_all(&user_id).await {
            // the messages are already on their way to the client
            error!(user_id = %user_id, error = %e, "post-fetch delete failed");
        }
    }

    info!(user_id = %user_id, count = messages.len(), "undelivered messages fetched");
    Ok(Json(UndeliveredMessagesResponse {
        total_count: messages.len(),
        has_messages: !messages.is_empty(),
        messages,
    }))
}

/// DELETE /v1/messages/undelivered
async fn delete_undelivered(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = bearer_user(&headers, &state.verifier)?;

    state
        .store
        .delete_all(&user_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    info!(user_id = %user_id, "undelivered messages deleted");
    Ok(Json(json!({
        "message": "Undelivered messages deleted successfully",
        "status": "success"
    })))
}

/// GET /v1/messages/undelivered/check
async fn check_undelivered(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CheckUndeliveredResponse>, ApiError> {
    let user_id = bearer_user(&headers, &state.verifier)?;

    let has_messages = state
        .store
        .has(&user_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(CheckUndeliveredResponse {
        has_messages,
        receiver_id: user_id,
    }))
}
