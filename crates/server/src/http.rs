//! HTTP and WebSocket front end.
//!
//! Three routes: `POST /auth` exchanges the long-lived token for a session
//! credential, `GET /health` reports server status, and `GET /terminal`
//! upgrades to the streaming protocol handled by the gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{debug, info, warn};

use termlink_protocol::{AuthErrorBody, AuthRequest, AuthResponse, HealthResponse};

use crate::gateway::Gateway;

/// Shared application state behind the router.
pub struct AppState {
    pub gateway: Gateway,
    /// The configured long-lived token.
    pub token: String,
    pub started: Instant,
}

/// Build the router with all routes attached.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth", post(exchange_token))
        .route("/health", get(health))
        .route("/terminal", get(upgrade_terminal))
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves.
pub async fn serve(
    state: Arc<AppState>,
    listener: tokio::net::TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn exchange_token(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(req): Json<AuthRequest>,
) -> impl IntoResponse {
    if !state.gateway.trust().is_trusted(peer.ip()) {
        warn!(peer = %peer, "credential exchange from untrusted origin");
        return (
            StatusCode::FORBIDDEN,
            Json(AuthErrorBody {
                error: "Untrusted origin".to_string(),
            }),
        )
            .into_response();
    }

    if req.token != state.token {
        info!(peer = %peer, "credential exchange with invalid token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(AuthErrorBody {
                error: "Invalid token".to_string(),
            }),
        )
            .into_response();
    }

    debug!(peer = %peer, "issued session credential");
    Json(AuthResponse {
        session_token: state.gateway.issuer().issue(peer.ip()),
        expires_in: state.gateway.issuer().ttl_secs(),
    })
    .into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        hostname: state.gateway.hostname().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime: state.started.elapsed().as_secs(),
        sessions: state.gateway.registry().count().await,
    })
}

async fn upgrade_terminal(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        state.gateway.handle_connection(socket, peer).await;
    })
}
