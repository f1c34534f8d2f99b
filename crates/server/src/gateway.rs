//! Per-connection protocol state machine.
//!
//! Every WebSocket connection walks AwaitingAuth -> Authenticated -> Closed.
//! Exactly one session is bound per connection; the first accepted message
//! must be `auth`, and it must arrive within the configured timeout. Close
//! codes in the 4000 range tell the client which handshake step failed.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use tracing::{debug, info, warn};

use termlink_protocol::{
    ClientMessage, ServerMessage, CLEAR_SEQUENCE, CLOSE_AUTH_FAILED, CLOSE_AUTH_TIMEOUT,
    CLOSE_UNTRUSTED, CMD_CLEAR, CMD_INTERRUPT, CMD_SESSIONS, INTERRUPT_BYTE,
};

use crate::auth::{TokenIssuer, TrustPolicy};
use crate::session::{
    CreateOptions, ProcessSession, RegistryError, SessionEvent, SessionRegistry,
};

/// Shared state for all gateway connections.
pub struct Gateway {
    registry: Arc<SessionRegistry>,
    issuer: TokenIssuer,
    trust: TrustPolicy,
    hostname: String,
    auth_timeout: Duration,
    default_shell: String,
    default_cwd: String,
    next_conn: AtomicU64,
}

struct AuthParams {
    token: String,
    cols: u16,
    rows: u16,
    session_name: Option<String>,
    shell: Option<String>,
    cwd: Option<String>,
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SessionRegistry>,
        issuer: TokenIssuer,
        trust: TrustPolicy,
        hostname: String,
        auth_timeout: Duration,
        default_shell: String,
        default_cwd: String,
    ) -> Self {
        Self {
            registry,
            issuer,
            trust,
            hostname,
            auth_timeout,
            default_shell,
            default_cwd,
            next_conn: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    pub fn trust(&self) -> &TrustPolicy {
        &self.trust
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Drive one connection from accept to close.
    pub async fn handle_connection(&self, mut socket: WebSocket, peer: SocketAddr) {
        if !self.trust.is_trusted(peer.ip()) {
            warn!(peer = %peer, "rejected untrusted connection");
            close(&mut socket, CLOSE_UNTRUSTED, "untrusted origin").await;
            return;
        }

        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        debug!(conn, peer = %peer, "connection accepted, awaiting auth");

        // AwaitingAuth: only `auth` advances the state machine; anything
        // else gets an error without dropping the connection.
        let params = match tokio::time::timeout(self.auth_timeout, await_auth(&mut socket)).await {
            Ok(Some(params)) => params,
            Ok(None) => {
                debug!(conn, "peer closed before authenticating");
                return;
            }
            Err(_) => {
                info!(conn, peer = %peer, "authentication timed out");
                close(&mut socket, CLOSE_AUTH_TIMEOUT, "authentication timeout").await;
                return;
            }
        };

        if let Err(e) = self.issuer.verify(&params.token) {
            info!(conn, peer = %peer, error = %e, "authentication failed");
            send(
                &mut socket,
                &ServerMessage::AuthFailed {
                    message: "Invalid token".to_string(),
                },
            )
            .await;
            close(&mut socket, CLOSE_AUTH_FAILED, "authentication failed").await;
            return;
        }

        let opts = CreateOptions {
            shell: params.shell.unwrap_or_else(|| self.default_shell.clone()),
            cwd: params.cwd.unwrap_or_else(|| self.default_cwd.clone()),
            cols: params.cols,
            rows: params.rows,
        };
        let outcome = match self
            .registry
            .create_or_attach(conn, params.session_name.as_deref(), opts)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(conn, error = %e, "session binding failed");
                let message = match &e {
                    RegistryError::CapacityExceeded { .. } => {
                        "Session limit reached".to_string()
                    }
                    RegistryError::SessionBusy { name } => {
                        format!("Session '{name}' is attached elsewhere")
                    }
                    _ => "Failed to create session".to_string(),
                };
                send(&mut socket, &ServerMessage::AuthFailed { message }).await;
                close(&mut socket, CLOSE_AUTH_FAILED, "session unavailable").await;
                return;
            }
        };

        let session = outcome.session;
        let mut events = session.subscribe();
        let session_id = session.id().to_string();
        info!(conn, session_id = %session_id, attached = outcome.attached, "connection authenticated");

        send(
            &mut socket,
            &ServerMessage::AuthSuccess {
                session_id: session_id.clone(),
                hostname: self.hostname.clone(),
                session_name: params.session_name.clone(),
                attached: outcome.attached,
            },
        )
        .await;

        // Authenticated: pump client messages and session events until
        // either side goes away.
        loop {
            tokio::select! {
                msg = socket.recv() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_message(&mut socket, &session, &text).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(conn, session_id = %session_id, "peer closed");
                            self.registry.detach(conn, &session_id).await;
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(conn, session_id = %session_id, error = %e, "socket error");
                            self.registry.detach(conn, &session_id).await;
                            return;
                        }
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(SessionEvent::Output(bytes)) => {
                            send(
                                &mut socket,
                                &ServerMessage::Output {
                                    data: String::from_utf8_lossy(&bytes).into_owned(),
                                },
                            )
                            .await;
                        }
                        Ok(SessionEvent::Exit { exit_code, signal }) => {
                            info!(conn, session_id = %session_id, ?exit_code, "session exited");
                            send(&mut socket, &ServerMessage::Exit { exit_code, signal }).await;
                            let _ = socket.send(Message::Close(None)).await;
                            self.registry.detach(conn, &session_id).await;
                            return;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(conn, session_id = %session_id, dropped = n, "output lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            self.registry.detach(conn, &session_id).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_message(
        &self,
        socket: &mut WebSocket,
        session: &Arc<ProcessSession>,
        text: &str,
    ) {
        let msg = match ClientMessage::from_json(text) {
            Ok(msg) => msg,
            Err(_) => {
                send_error(socket, "Invalid message").await;
                return;
            }
        };
        match msg {
            ClientMessage::Auth { .. } => {
                send_error(socket, "Already authenticated").await;
            }
            ClientMessage::Input { data } => {
                if let Err(e) = session.write(data.as_bytes()).await {
                    debug!(session_id = %session.id(), error = %e, "input write failed");
                    send_error(socket, "Session is not running").await;
                }
            }
            ClientMessage::Resize { cols, rows } => {
                if let Err(e) = session.resize(cols, rows).await {
                    debug!(session_id = %session.id(), error = %e, "resize failed");
                    send_error(socket, "Session is not running").await;
                }
            }
            ClientMessage::Command { command } => {
                self.handle_command(socket, session, &command).await;
            }
        }
    }

    async fn handle_command(
        &self,
        socket: &mut WebSocket,
        session: &Arc<ProcessSession>,
        command: &str,
    ) {
        match command {
            CMD_INTERRUPT => {
                if session.write(INTERRUPT_BYTE).await.is_err() {
                    send_error(socket, "Session is not running").await;
                }
            }
            CMD_CLEAR => {
                // Emitted directly so the screen clears even when the
                // shell does not echo.
                send(
                    socket,
                    &ServerMessage::Output {
                        data: CLEAR_SEQUENCE.to_string(),
                    },
                )
                .await;
            }
            CMD_SESSIONS => match self.registry.list_mux().await {
                Ok(data) => send(socket, &ServerMessage::Sessions { data }).await,
                Err(e) => {
                    warn!(error = %e, "session listing failed");
                    send_error(socket, "Failed to list sessions").await;
                }
            },
            other => {
                send_error(socket, &format!("Unknown command: {other}")).await;
            }
        }
    }
}

/// Read frames until an `auth` message or the peer goes away.
async fn await_auth(socket: &mut WebSocket) -> Option<AuthParams> {
    loop {
        match socket.recv().await? {
            Ok(Message::Text(text)) => match ClientMessage::from_json(&text) {
                Ok(ClientMessage::Auth {
                    token,
                    cols,
                    rows,
                    session_name,
                    shell,
                    cwd,
                }) => {
                    return Some(AuthParams {
                        token,
                        cols,
                        rows,
                        session_name,
                        shell,
                        cwd,
                    });
                }
                Ok(_) => {
                    send_error(socket, "Authentication required").await;
                }
                Err(_) => {
                    send_error(socket, "Invalid message").await;
                }
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) {
    match msg.to_json() {
        Ok(json) => {
            if let Err(e) = socket.send(Message::Text(json)).await {
                debug!(error = %e, "send failed");
            }
        }
        Err(e) => warn!(error = %e, "message serialization failed"),
    }
}

async fn send_error(socket: &mut WebSocket, message: &str) {
    send(
        socket,
        &ServerMessage::Error {
            message: message.to_string(),
        },
    )
    .await;
}

async fn close(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })))
        .await;
}
