//! Connection controller: the client-side protocol state machine.
//!
//! Drives the two-step handshake (credential exchange over HTTP, then the
//! streaming `auth` message), pumps server messages through a single reader
//! task so output order is preserved, and reassembles output fragments into
//! display lines for the application.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use termlink_protocol::{AuthRequest, AuthResponse, ClientMessage, MuxSessionInfo, ServerMessage};

use crate::lines::{DisplayLine, LineAssembler, LineKind};

/// Bound on the HTTP credential exchange and the streaming handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection lifecycle states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

/// Errors surfaced by the controller.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

/// How to reach a server and what session to ask for.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// HTTP base, e.g. `http://100.64.0.7:8787`.
    pub server_url: String,
    /// The long-lived token for the credential exchange.
    pub token: String,
    pub cols: u16,
    pub rows: u16,
    /// Persistent session to create or re-attach; None for ephemeral.
    pub session_name: Option<String>,
    pub shell: Option<String>,
    pub cwd: Option<String>,
}

/// What the server told us on a successful handshake.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub hostname: String,
    pub attached: bool,
}

/// Events delivered to the application, in server order.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A complete display line.
    Line(DisplayLine),
    /// A raw output fragment, for renderers that track escape state
    /// themselves.
    Output(String),
    /// The remote process exited.
    Exited {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    /// The persistent-session listing arrived.
    SessionList(Vec<MuxSessionInfo>),
    /// The connection ended.
    Disconnected,
}

struct Inner {
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

/// Client connection controller. One controller drives one session at a
/// time; reconnecting tears the previous connection down first.
pub struct Controller {
    config: ConnectionConfig,
    inner: Mutex<Inner>,
    assembler: Mutex<LineAssembler>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Controller {
    /// Create a controller and the event stream the application consumes.
    pub fn new(config: ConnectionConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                config,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    outbound: None,
                    reader: None,
                    writer: None,
                }),
                assembler: Mutex::new(LineAssembler::new()),
                events,
            }),
            rx,
        )
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state.clone()
    }

    /// Connect and authenticate.
    ///
    /// On failure the state moves to `Failed` with the reason; calling
    /// again retries from scratch.
    pub async fn connect(self: &Arc<Self>) -> Result<SessionInfo, ClientError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == ConnectionState::Connected {
                return Err(ClientError::ConnectionFailed(
                    "already connected".to_string(),
                ));
            }
            inner.state = ConnectionState::Connecting;
        }

        match self.connect_inner().await {
            Ok(info) => Ok(info),
            Err(e) => {
                self.teardown(ConnectionState::Failed(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn connect_inner(self: &Arc<Self>) -> Result<SessionInfo, ClientError> {
        let credential = self.fetch_credential().await?;

        let ws_url = ws_url(&self.config.server_url);
        let (ws, _) = timeout(HANDSHAKE_TIMEOUT, connect_async(&ws_url))
            .await
            .map_err(|_| ClientError::Timeout("websocket connect".to_string()))?
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let auth = ClientMessage::Auth {
            token: credential,
            cols: self.config.cols,
            rows: self.config.rows,
            session_name: self.config.session_name.clone(),
            shell: self.config.shell.clone(),
            cwd: self.config.cwd.clone(),
        };
        let json = auth
            .to_json()
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
        sink.send(Message::Text(json))
            .await
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;

        // Wait for the handshake verdict before handing the stream to the
        // reader task.
        let info = timeout(HANDSHAKE_TIMEOUT, async {
            loop {
                let frame = stream
                    .next()
                    .await
                    .ok_or_else(|| {
                        ClientError::ConnectionFailed("closed during handshake".to_string())
                    })?
                    .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
                let Message::Text(text) = frame else { continue };
                match ServerMessage::from_json(&text) {
                    Ok(ServerMessage::AuthSuccess {
                        session_id,
                        hostname,
                        attached,
                        ..
                    }) => {
                        return Ok(SessionInfo {
                            session_id,
                            hostname,
                            attached,
                        });
                    }
                    Ok(ServerMessage::AuthFailed { message }) => {
                        return Err(ClientError::AuthenticationFailed(message));
                    }
                    _ => continue,
                }
            }
        })
        .await
        .map_err(|_| ClientError::Timeout("authentication".to_string()))??;

        info!(session_id = %info.session_id, attached = info.attached, "connected");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let controller = Arc::clone(self);
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match ServerMessage::from_json(&text) {
                        Ok(msg) => controller.handle_server_message(msg).await,
                        Err(e) => debug!(error = %e, "undecodable server message"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            controller.on_stream_ended().await;
        });

        let mut inner = self.inner.lock().await;
        inner.state = ConnectionState::Connected;
        inner.outbound = Some(out_tx);
        inner.reader = Some(reader);
        inner.writer = Some(writer);
        Ok(info)
    }

    async fn fetch_credential(&self) -> Result<String, ClientError> {
        let client = reqwest::Client::new();
        let resp = timeout(
            HANDSHAKE_TIMEOUT,
            client
                .post(format!("{}/auth", self.config.server_url.trim_end_matches('/')))
                .json(&AuthRequest {
                    token: self.config.token.clone(),
                })
                .send(),
        )
        .await
        .map_err(|_| ClientError::Timeout("credential exchange".to_string()))?
        .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            return Err(ClientError::AuthenticationFailed(format!(
                "credential exchange returned {status}"
            )));
        }
        let body: AuthResponse = resp
            .json()
            .await
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
        Ok(body.session_token)
    }

    async fn handle_server_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Output { data } => {
                self.emit(ClientEvent::Output(data.clone()));
                let lines = self.assembler.lock().await.feed(&data);
                for line in lines {
                    self.emit(ClientEvent::Line(DisplayLine::new(line, LineKind::Output)));
                }
            }
            ServerMessage::Error { message } => {
                self.emit(ClientEvent::Line(DisplayLine::new(message, LineKind::Error)));
            }
            ServerMessage::Exit { exit_code, signal } => {
                if let Some(partial) = self.assembler.lock().await.force_flush() {
                    self.emit(ClientEvent::Line(DisplayLine::new(
                        partial,
                        LineKind::Output,
                    )));
                }
                let notice = match exit_code {
                    Some(code) => format!("Session exited with code {code}"),
                    None => "Session exited".to_string(),
                };
                self.emit(ClientEvent::Line(DisplayLine::new(notice, LineKind::System)));
                self.emit(ClientEvent::Exited { exit_code, signal });
            }
            ServerMessage::Sessions { data } => {
                self.emit(ClientEvent::SessionList(data));
            }
            ServerMessage::AuthSuccess { .. } | ServerMessage::AuthFailed { .. } => {
                // Handshake messages after the handshake are noise.
                warn!("unexpected handshake message after connect");
            }
        }
    }

    async fn on_stream_ended(&self) {
        debug!("server stream ended");
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Connected {
            inner.state = ConnectionState::Disconnected;
        }
        inner.outbound = None;
        drop(inner);
        self.emit(ClientEvent::Disconnected);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn send_message(&self, msg: &ClientMessage) {
        let inner = self.inner.lock().await;
        if inner.state != ConnectionState::Connected {
            debug!("dropping send while not connected");
            return;
        }
        let Some(outbound) = &inner.outbound else {
            return;
        };
        match msg.to_json() {
            Ok(json) => {
                let _ = outbound.send(Message::Text(json));
            }
            Err(e) => warn!(error = %e, "message serialization failed"),
        }
    }

    /// Send keystrokes. Flushes any pending partial output line first so
    /// the echo appears after what was already on screen, then echoes the
    /// input locally.
    pub async fn send_input(&self, data: &str) {
        if self.state().await != ConnectionState::Connected {
            return;
        }
        if let Some(partial) = self.assembler.lock().await.force_flush() {
            self.emit(ClientEvent::Line(DisplayLine::new(
                partial,
                LineKind::Output,
            )));
        }
        self.emit(ClientEvent::Line(DisplayLine::new(
            data.trim_end_matches('\n').to_string(),
            LineKind::Input,
        )));
        self.send_message(&ClientMessage::Input {
            data: data.to_string(),
        })
        .await;
    }

    /// Report a new terminal size.
    pub async fn resize(&self, cols: u16, rows: u16) {
        self.send_message(&ClientMessage::Resize { cols, rows }).await;
    }

    /// Send the interrupt command (Ctrl-C).
    pub async fn send_interrupt(&self) {
        self.send_message(&ClientMessage::Command {
            command: termlink_protocol::CMD_INTERRUPT.to_string(),
        })
        .await;
    }

    /// Ask the server to clear the screen. Any pending partial line is
    /// flushed to the transcript first so it is not lost.
    pub async fn send_clear(&self) {
        if let Some(partial) = self.assembler.lock().await.force_flush() {
            self.emit(ClientEvent::Line(DisplayLine::new(
                partial,
                LineKind::Output,
            )));
        }
        self.send_message(&ClientMessage::Command {
            command: termlink_protocol::CMD_CLEAR.to_string(),
        })
        .await;
    }

    /// Request the persistent-session listing.
    pub async fn request_sessions(&self) {
        self.send_message(&ClientMessage::Command {
            command: termlink_protocol::CMD_SESSIONS.to_string(),
        })
        .await;
    }

    /// Tear the connection down. Safe to call in any state, any number of
    /// times.
    pub async fn disconnect(&self) {
        self.teardown(ConnectionState::Disconnected).await;
    }

    /// Full teardown followed by a fresh connect.
    pub async fn reconnect(self: &Arc<Self>) -> Result<SessionInfo, ClientError> {
        self.disconnect().await;
        self.connect().await
    }

    async fn teardown(&self, final_state: ConnectionState) {
        let mut inner = self.inner.lock().await;
        inner.state = final_state;
        // Dropping the outbound sender lets the writer task close the sink.
        inner.outbound = None;
        if let Some(reader) = inner.reader.take() {
            reader.abort();
        }
        if let Some(writer) = inner.writer.take() {
            // Writer finishes on its own once the channel closes.
            drop(writer);
        }
        drop(inner);
        self.assembler.lock().await.clear();
    }
}

/// Derive the streaming endpoint from the HTTP base URL.
fn ws_url(server_url: &str) -> String {
    let base = server_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base}")
    };
    format!("{ws_base}/terminal")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            server_url: "http://127.0.0.1:1".to_string(),
            token: "t".to_string(),
            cols: 80,
            rows: 24,
            session_name: None,
            shell: None,
            cwd: None,
        }
    }

    #[test]
    fn test_ws_url_derivation() {
        assert_eq!(
            ws_url("http://100.64.0.7:8787"),
            "ws://100.64.0.7:8787/terminal"
        );
        assert_eq!(ws_url("https://host/"), "wss://host/terminal");
        assert_eq!(ws_url("host:8787"), "ws://host:8787/terminal");
    }

    #[tokio::test]
    async fn test_initial_state_is_disconnected() {
        let (controller, _events) = Controller::new(config());
        assert_eq!(controller.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_connect_sets_failed_state() {
        // Port 1 on loopback refuses connections.
        let (controller, _events) = Controller::new(config());
        let err = controller.connect().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::ConnectionFailed(_) | ClientError::Timeout(_)
        ));
        assert!(matches!(
            controller.state().await,
            ConnectionState::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (controller, _events) = Controller::new(config());
        controller.disconnect().await;
        controller.disconnect().await;
        assert_eq!(controller.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_sends_dropped_while_disconnected() {
        let (controller, mut events) = Controller::new(config());
        controller.send_input("ls\n").await;
        controller.send_interrupt().await;
        controller.resize(100, 30).await;
        // Nothing was emitted or queued.
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_output_messages_assemble_into_lines() {
        let (controller, mut events) = Controller::new(config());
        controller
            .handle_server_message(ServerMessage::Output {
                data: "hel".to_string(),
            })
            .await;
        controller
            .handle_server_message(ServerMessage::Output {
                data: "lo\n".to_string(),
            })
            .await;

        let mut line = None;
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::Line(l) = event {
                line = Some(l);
            }
        }
        let line = line.expect("no line emitted");
        assert_eq!(line.text, "hello");
        assert_eq!(line.kind, LineKind::Output);
    }

    #[tokio::test]
    async fn test_exit_flushes_partial_and_notifies() {
        let (controller, mut events) = Controller::new(config());
        controller
            .handle_server_message(ServerMessage::Output {
                data: "no newline".to_string(),
            })
            .await;
        controller
            .handle_server_message(ServerMessage::Exit {
                exit_code: Some(0),
                signal: None,
            })
            .await;

        let mut lines = Vec::new();
        let mut exited = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ClientEvent::Line(l) => lines.push(l),
                ClientEvent::Exited { exit_code, .. } => {
                    exited = true;
                    assert_eq!(exit_code, Some(0));
                }
                _ => {}
            }
        }
        assert!(exited);
        assert!(lines.iter().any(|l| l.text == "no newline"));
        assert!(lines
            .iter()
            .any(|l| l.kind == LineKind::System && l.text.contains("exited")));
    }

    #[tokio::test]
    async fn test_clear_flushes_pending_partial_line() {
        let (controller, mut events) = Controller::new(config());
        controller
            .handle_server_message(ServerMessage::Output {
                data: "prompt$ ".to_string(),
            })
            .await;
        controller.send_clear().await;

        let mut line = None;
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::Line(l) = event {
                line = Some(l);
            }
        }
        let line = line.expect("pending prompt was not flushed");
        assert_eq!(line.text, "prompt$ ");
        assert_eq!(line.kind, LineKind::Output);
    }

    #[tokio::test]
    async fn test_error_message_becomes_error_line() {
        let (controller, mut events) = Controller::new(config());
        controller
            .handle_server_message(ServerMessage::Error {
                message: "Unknown command: x".to_string(),
            })
            .await;
        match events.try_recv().expect("no event") {
            ClientEvent::Line(line) => assert_eq!(line.kind, LineKind::Error),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
