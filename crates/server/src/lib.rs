//! # Termlink Server
//!
//! Headless server exposing interactive terminal sessions over an
//! authenticated WebSocket protocol, intended for trusted overlay networks
//! (e.g. Tailscale).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   HTTP front end (/auth, /health, ws)    │  http
//! ├──────────────────────────────────────────┤
//! │   Per-connection state machine           │  gateway
//! ├──────────────────────────────────────────┤
//! │   Session registry + multiplexer facade  │  session
//! ├──────────────────────────────────────────┤
//! │   PTY / piped process sessions           │  session::pty
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`auth`]: session credentials and the trusted-origin policy
//! - [`session`]: process sessions, registry, multiplexer facade
//! - [`gateway`]: the streaming protocol state machine
//! - [`http`]: axum router and listener

pub mod auth;
pub mod config;
pub mod gateway;
pub mod http;
pub mod session;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{info, warn};

use crate::auth::{TokenIssuer, TrustPolicy};
use crate::config::Config;
use crate::gateway::Gateway;
use crate::http::AppState;
use crate::session::{MemoryMultiplexer, Multiplexer, SessionRegistry, TmuxMultiplexer};

/// Build the full application state from a validated configuration.
pub fn build_state(config: &Config) -> Arc<AppState> {
    let secret = if config.auth.secret.is_empty() {
        warn!("no signing secret configured, credentials will not survive a restart");
        TokenIssuer::random_secret()
    } else {
        config.auth.secret.clone()
    };
    let issuer = TokenIssuer::new(secret, config.auth.credential_ttl_secs);
    let trust = TrustPolicy::new(config.auth.trusted_prefixes.clone());

    let mux: Arc<dyn Multiplexer> = match TmuxMultiplexer::detect() {
        Some(tmux) => {
            info!("using tmux for persistent sessions");
            Arc::new(tmux)
        }
        None => {
            warn!("tmux not found, persistent sessions will not survive a restart");
            Arc::new(MemoryMultiplexer::new())
        }
    };
    let registry = Arc::new(SessionRegistry::new(mux, config.session.max_sessions));

    let gateway = Gateway::new(
        registry,
        issuer,
        trust,
        config.hostname(),
        Duration::from_secs(config.auth.auth_timeout_secs),
        config.session.default_shell.clone(),
        config.session.default_cwd.clone(),
    );

    Arc::new(AppState {
        gateway,
        token: config.auth.token.clone(),
        started: Instant::now(),
    })
}

/// Run the server until a shutdown signal arrives.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = build_state(&config);
    let sweep = state.gateway.registry().start_sweep_task();

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    http::serve(state.clone(), listener, wait_for_shutdown_signal())
        .await
        .context("server error")?;

    sweep.abort();
    state.gateway.registry().destroy_all().await;
    info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}
