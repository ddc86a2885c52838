//! The HTTP face of the server.
//!
//! Three POST endpoints drive the two-phase credential flow, a GET
//! endpoint upgrades a join token to the duplex transport, and
//! `/health` reports a liveness snapshot.

use crate::error::AuthError;
use crate::server::ServerContext;
use crate::ws::WsTransport;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::Path;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use huddle_crypto::PublicKey;
use huddle_types::RoomId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Body of `POST /api/login`. The auth proof itself is out of scope;
/// the supplied key becomes (or matches) the durable user identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    /// URL-safe base64 Ed25519 public key.
    pub public_key: String,
}

/// Token reply of the credential endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    #[serde(default)]
    pub room_id: Option<RoomId>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    rooms: usize,
    peers: usize,
    users: usize,
    outstanding_tokens: usize,
}

/// HTTP-mapped failure.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        let status = match error {
            AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::ExpiredToken => StatusCode::GONE,
            AuthError::RoomNotFound => StatusCode::NOT_FOUND,
            AuthError::Forbidden => StatusCode::FORBIDDEN,
            AuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AuthError::InvalidKey => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Build the router with every endpoint attached.
pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/api/login", post(login))
        .route("/api/session", post(create_session))
        .route("/api/session/:room_id", post(join_session))
        .route("/api/session/join/:token", get(join_ws))
        .route("/health", get(health))
        .layer(Extension(ctx))
}

async fn login(
    Extension(ctx): Extension<Arc<ServerContext>>,
    Json(body): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let key = PublicKey::from_b64(&body.public_key).map_err(|_| AuthError::InvalidKey)?;
    ctx.limits.check_login(&key.fingerprint())?;

    let user = ctx.users.login(&body.name, body.email.as_deref(), key);
    let ticket = ctx.credentials.mint_login(user.id);
    Ok((
        StatusCode::CREATED,
        Json(TokenResponse {
            token: ticket.token,
            room_id: None,
        }),
    ))
}

async fn create_session(
    Extension(ctx): Extension<Arc<ServerContext>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let token = bearer(&headers)?;
    let user_id = ctx.credentials.redeem_login(token)?;
    ctx.limits.check_session(&user_id)?;

    let ticket = ctx.credentials.mint_join(user_id, RoomId::random(), true);
    Ok((
        StatusCode::CREATED,
        Json(TokenResponse {
            token: ticket.token,
            room_id: ticket.room_id,
        }),
    ))
}

async fn join_session(
    Extension(ctx): Extension<Arc<ServerContext>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let room_id: RoomId = room_id.parse().map_err(|_| AuthError::RoomNotFound)?;
    let token = bearer(&headers)?;
    let user_id = ctx.credentials.redeem_login(token)?;
    ctx.limits.check_session(&user_id)?;

    let room = ctx.rooms.room(&room_id).ok_or(AuthError::RoomNotFound)?;
    if !room.permissions.allow_guests {
        return Err(AuthError::Forbidden.into());
    }

    let ticket = ctx.credentials.mint_join(user_id, room_id, false);
    Ok((
        StatusCode::OK,
        Json(TokenResponse {
            token: ticket.token,
            room_id: ticket.room_id,
        }),
    ))
}

async fn join_ws(
    Extension(ctx): Extension<Arc<ServerContext>>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    // Reject before the upgrade so invalid tokens surface as HTTP
    // statuses; the token is consumed once the socket is up.
    ctx.credentials.check_join(&token)?;

    Ok(ws.on_upgrade(move |socket| async move {
        let grant = match ctx.credentials.redeem_join(&token) {
            Ok(grant) => grant,
            Err(e) => {
                tracing::info!("join token vanished before upgrade completed: {e}");
                return;
            }
        };
        let transport = Arc::new(WsTransport::new(socket));
        if let Err(e) = ctx.accept_transport(transport, grant).await {
            tracing::info!("connection rejected: {e}");
        }
    }))
}

async fn health(Extension(ctx): Extension<Arc<ServerContext>>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        rooms: ctx.rooms.room_count(),
        peers: ctx.rooms.peer_count(),
        users: ctx.users.len(),
        outstanding_tokens: ctx.credentials.outstanding(),
    })
}

fn bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| AuthError::InvalidToken.into())
}
