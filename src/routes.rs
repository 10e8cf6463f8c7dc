use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::auth;
use crate::hub::{ExtraData, HubError, Platform};
use crate::state::AppState;

/// WebSocket close codes:
/// 4001 = token expired
/// 4002 = token invalid
const CLOSE_TOKEN_EXPIRED: u16 = 4001;
const CLOSE_TOKEN_INVALID: u16 = 4002;

/// Build the hub gateway router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_upgrade))
        .route("/events", get(sse_events))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "connections": state.hub.connection_count(),
    }))
}

/// Query parameters for hub connections.
/// Auth is via query param ?token=JWT — WebSocket clients cannot set
/// arbitrary headers from browsers.
#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub token: String,
}

/// GET /ws?token=JWT
/// WebSocket upgrade endpoint. On auth failure, upgrades then immediately
/// closes with the appropriate close code so browser clients can read it.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<SessionQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = match auth::validate_session_token(&state.session_secret, &params.token) {
        Ok(claims) => claims,
        Err(err) => {
            let (close_code, reason) = match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    (CLOSE_TOKEN_EXPIRED, "Token expired")
                }
                _ => (CLOSE_TOKEN_INVALID, "Token invalid"),
            };
            tracing::warn!(close_code, reason, "WebSocket auth failed");
            return ws.on_upgrade(move |mut socket| async move {
                let close_frame = CloseFrame {
                    code: close_code,
                    reason: reason.into(),
                };
                let _ = socket.send(Message::Close(Some(close_frame))).await;
            });
        }
    };

    let (user_id, platform, line_id) = identity_from_claims(claims);
    tracing::info!(
        user_id = %user_id,
        line_id = %line_id,
        platform = platform.as_str(),
        "WebSocket connection authenticated"
    );

    match state.hub.upgrade_websocket(
        user_id,
        platform,
        line_id,
        ExtraData::default(),
        &headers,
        ws,
    ) {
        Ok(response) => response,
        Err(e) => hub_error_response(e),
    }
}

/// GET /events?token=JWT
/// SSE endpoint for simplex clients. Auth failures are plain HTTP errors
/// since no upgrade is involved.
async fn sse_events(
    State(state): State<AppState>,
    Query(params): Query<SessionQuery>,
) -> Response {
    let claims = match auth::validate_session_token(&state.session_secret, &params.token) {
        Ok(claims) => claims,
        Err(err) => {
            tracing::warn!(error = %err, "SSE auth failed");
            return (StatusCode::UNAUTHORIZED, "Invalid session token").into_response();
        }
    };

    let (user_id, platform, line_id) = identity_from_claims(claims);
    tracing::info!(
        user_id = %user_id,
        line_id = %line_id,
        platform = platform.as_str(),
        "SSE connection authenticated"
    );

    match state
        .hub
        .serve_sse(user_id, platform, line_id, ExtraData::default())
    {
        Ok(sse) => sse.into_response(),
        Err(e) => hub_error_response(e),
    }
}

fn identity_from_claims(claims: auth::SessionClaims) -> (String, Platform, String) {
    let platform = Platform::from_str(&claims.platform).unwrap_or(Platform::Unknown);
    // Tokens without a line id get a generated one: each such connection
    // is its own line.
    let line_id = if claims.line.is_empty() {
        uuid::Uuid::now_v7().to_string()
    } else {
        claims.line
    };
    (claims.sub, platform, line_id)
}

fn hub_error_response(err: HubError) -> Response {
    let status = match err {
        HubError::OriginRejected => StatusCode::FORBIDDEN,
        HubError::EmptyUserId | HubError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        HubError::Closed | HubError::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    tracing::warn!(error = %err, "Hub refused connection");
    (status, err.to_string()).into_response()
}
