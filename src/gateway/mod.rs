//! HTTP API for the support console.
//!
//! Bearer-token REST endpoints for the presentation layer, a server-sent
//! event stream of domain events, and the signed webhook through which a
//! transport bridge reports WhatsApp traffic.

mod api;
mod events;

use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};

use crate::auth::Principal;
use crate::bus::{RateLimited, TransportEvent};
use crate::console::Console;
use crate::errors::ZapdeskError;

type HmacSha256 = Hmac<Sha256>;

/// Max transport webhook payload size: 1 MB.
const WEBHOOK_MAX_BODY: usize = 1_048_576;

/// Shared state of every handler.
#[derive(Clone)]
pub struct GatewayState {
    console: Arc<Console>,
}

impl GatewayState {
    pub fn new(console: Arc<Console>) -> Self {
        Self { console }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

/// A [`ZapdeskError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ZapdeskError);

impl From<ZapdeskError> for ApiError {
    fn from(e: ZapdeskError) -> Self {
        Self(e)
    }
}

pub(crate) fn status_for(error: &ZapdeskError) -> StatusCode {
    match error {
        ZapdeskError::Config(_) | ZapdeskError::Validation(_) => StatusCode::BAD_REQUEST,
        ZapdeskError::Auth(_) => StatusCode::UNAUTHORIZED,
        ZapdeskError::Forbidden(_) => StatusCode::FORBIDDEN,
        ZapdeskError::NotFound { .. } => StatusCode::NOT_FOUND,
        ZapdeskError::CapacityExceeded { .. }
        | ZapdeskError::AgentUnavailable { .. }
        | ZapdeskError::InvalidTransition { .. }
        | ZapdeskError::InvalidState(_) => StatusCode::CONFLICT,
        ZapdeskError::CredentialTimeout => StatusCode::GATEWAY_TIMEOUT,
        ZapdeskError::CredentialRejected { .. } => StatusCode::BAD_GATEWAY,
        ZapdeskError::ConnectionLost { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ZapdeskError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let error = if let ZapdeskError::Internal(e) = &self.0 {
            error!("request failed: {:#}", e);
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        (
            status,
            Json(ErrorResponse {
                error,
                code: self.0.code(),
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// The authenticated caller of a request.
///
/// The token comes from `Authorization: Bearer ..`, or from a `token`
/// query parameter for clients that cannot set headers (`EventSource`).
pub struct Caller {
    pub principal: Principal,
    token: String,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn query_token(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.to_string())
        .filter(|t| !t.is_empty())
}

impl FromRequestParts<GatewayState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &GatewayState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .or_else(|| query_token(parts.uri.query()))
            .ok_or_else(|| ZapdeskError::Auth("missing bearer token".into()))?;
        let principal = state.console.auth().authenticate(&token)?;
        Ok(Self { principal, token })
    }
}

/// Build the HTTP API router.
pub(crate) fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/auth/login", post(api::login))
        .route("/api/auth/logout", post(api::logout))
        .route("/api/auth/me", get(api::me).patch(api::update_me))
        .route("/api/conversations", get(api::list_conversations))
        .route("/api/conversations/{id}", get(api::get_conversation))
        .route("/api/conversations/{id}/assign", post(api::assign))
        .route("/api/conversations/{id}/reassign", post(api::reassign))
        .route("/api/conversations/{id}/unassign", post(api::unassign))
        .route("/api/conversations/{id}/close", post(api::close))
        .route("/api/conversations/{id}/reopen", post(api::reopen))
        .route("/api/conversations/{id}/read", post(api::mark_read))
        .route("/api/conversations/{id}/labels", post(api::add_label))
        .route(
            "/api/conversations/{id}/labels/{label}",
            delete(api::remove_label),
        )
        .route(
            "/api/conversations/{id}/messages",
            get(api::list_messages).post(api::send_message),
        )
        .route("/api/messages/{id}/status", post(api::update_message_status))
        .route("/api/agents", get(api::list_agents).post(api::create_agent))
        .route(
            "/api/agents/{id}",
            get(api::get_agent)
                .put(api::update_agent)
                .delete(api::delete_agent),
        )
        .route("/api/agents/{id}/presence", put(api::set_presence))
        .route("/api/labels", get(api::list_labels).post(api::create_label))
        .route("/api/labels/{id}", delete(api::delete_label))
        .route("/api/session", get(api::session_status))
        .route("/api/session/connect", post(api::connect_session))
        .route("/api/session/disconnect", post(api::disconnect_session))
        .route("/api/session/credential", get(api::session_credential))
        .route(
            "/api/settings",
            get(api::get_settings).put(api::update_settings),
        )
        .route("/api/events", get(events::stream_events))
        .route("/api/transport/events", post(transport_webhook_handler))
        .with_state(state)
}

/// GET /api/health: liveness plus the WhatsApp session state.
async fn health_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
        "session": state.console.session().state(),
    }))
}

/// Validate HMAC-SHA256 signature against a payload.
pub(crate) fn validate_webhook_signature(secret: &str, signature: &str, body: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    // Raw hex or "sha256=..." (GitHub-style)
    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    expected.as_bytes().ct_eq(sig.as_bytes()).into()
}

/// POST /api/transport/events: events reported by the transport bridge.
async fn transport_webhook_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let secret = &state.console.config().gateway.webhook_secret;
    if secret.is_empty() {
        debug!("transport webhook: no secret configured");
        return StatusCode::NOT_FOUND.into_response();
    }

    if body.len() > WEBHOOK_MAX_BODY {
        warn!("transport webhook: payload too large ({} bytes)", body.len());
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    let Some(signature) = headers
        .get("X-Signature-256")
        .and_then(|v| v.to_str().ok())
    else {
        warn!("transport webhook: missing signature header");
        return StatusCode::FORBIDDEN.into_response();
    };
    if !validate_webhook_signature(secret, signature, &body) {
        warn!("transport webhook: invalid signature");
        return StatusCode::FORBIDDEN.into_response();
    }

    let event: TransportEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!("transport webhook: malformed event: {}", e);
            return ApiError(ZapdeskError::Validation(format!("malformed event: {e}")))
                .into_response();
        }
    };

    let kind = event.kind();
    if let Err(e) = state.console.bus().lock().await.publish(event).await {
        warn!("transport webhook: event not queued: kind={} error={:#}", kind, e);
        let status = if e.downcast_ref::<RateLimited>().is_some() {
            StatusCode::TOO_MANY_REQUESTS
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        return status.into_response();
    }
    debug!("transport webhook: queued kind={}", kind);
    StatusCode::ACCEPTED.into_response()
}

/// Start the HTTP API server.
pub async fn start(
    console: Arc<Console>,
    host: &str,
    port: u16,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = build_router(GatewayState::new(console));
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP API listening on {}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP API server error: {}", e);
        }
    });
    Ok(handle)
}
