//! Protocol message definitions for Termlink.
//!
//! All streaming messages are JSON objects carrying a `type` tag. They are
//! decoded once at the transport boundary into the closed enums below; the
//! connection state machine dispatches on the variant, never on raw strings.

use serde::{Deserialize, Serialize};

/// Messages sent by the client over the streaming connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Begins the handshake. Must be the first accepted message.
    Auth {
        /// Short-lived session credential from the `/auth` exchange.
        token: String,
        /// Initial terminal width in columns.
        cols: u16,
        /// Initial terminal height in rows.
        rows: u16,
        /// Name of a persistent session to create or re-attach to.
        /// Omitted for an ephemeral session.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_name: Option<String>,
        /// Optional shell override.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
        /// Optional working directory override.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },

    /// Raw keystrokes forwarded to the process input.
    Input { data: String },

    /// Resize the pseudo-terminal. No-op for pipe-backed sessions.
    Resize { cols: u16, rows: u16 },

    /// Dispatch a named built-in command.
    Command { command: String },
}

/// Messages sent by the server over the streaming connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake complete; a session is bound to this connection.
    AuthSuccess {
        /// Identifier of the bound session.
        session_id: String,
        /// Hostname of the serving machine.
        hostname: String,
        /// Echo of the persistent session name, if one was requested.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_name: Option<String>,
        /// True when an existing persistent session was re-attached
        /// rather than freshly created.
        attached: bool,
    },

    /// Handshake rejected; the server closes the connection afterwards.
    AuthFailed { message: String },

    /// A raw fragment of process output, in production order.
    Output { data: String },

    /// The process terminated; the server closes the connection afterwards.
    Exit {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },

    /// Non-fatal protocol error; the connection stays open.
    Error { message: String },

    /// Response to the `sessions` built-in command.
    Sessions { data: Vec<MuxSessionInfo> },
}

/// One entry of a persistent-session listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxSessionInfo {
    /// Multiplexer session name.
    pub name: String,
    /// Creation time, Unix epoch seconds.
    pub created_at: u64,
    /// Whether some connection is currently attached to it.
    pub attached: bool,
}

// ============================================================================
// Credential exchange (HTTP, prior to streaming)
// ============================================================================

/// Body of `POST /auth`: exchanges the long-lived token for a short-lived
/// session credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// The static long-lived token configured on the server.
    pub token: String,
}

/// Successful `/auth` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    /// Short-lived credential to present in the streaming `auth` message.
    pub session_token: String,
    /// Credential validity in seconds.
    pub expires_in: u64,
}

/// Structured `/auth` failure body. The HTTP status distinguishes an
/// untrusted origin (403) from an invalid token (401).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthErrorBody {
    pub error: String,
}

/// `GET /health` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub hostname: String,
    pub version: String,
    /// Seconds since the server started.
    pub uptime: u64,
    /// Number of live sessions.
    pub sessions: usize,
}

// ============================================================================
// Close codes
// ============================================================================

/// Transport close code: credential rejected.
pub const CLOSE_AUTH_FAILED: u16 = 4001;

/// Transport close code: no valid auth message arrived within the bound.
pub const CLOSE_AUTH_TIMEOUT: u16 = 4002;

/// Transport close code: peer address outside the trusted network.
pub const CLOSE_UNTRUSTED: u16 = 4003;

// ============================================================================
// Built-in command names and byte sequences
// ============================================================================

/// `command` value that sends the interrupt byte to the process.
pub const CMD_INTERRUPT: &str = "interrupt";

/// `command` value that clears the client screen.
pub const CMD_CLEAR: &str = "clear";

/// `command` value that requests a persistent-session listing.
pub const CMD_SESSIONS: &str = "sessions";

/// The interrupt byte (Ctrl-C) written to process input.
pub const INTERRUPT_BYTE: &[u8] = b"\x03";

/// Clear-screen-and-home escape sequence.
pub const CLEAR_SEQUENCE: &str = "\x1b[2J\x1b[H";

impl ClientMessage {
    /// Serialize to the JSON text frame sent on the wire.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a JSON text frame.
    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerMessage {
    /// Serialize to the JSON text frame sent on the wire.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a JSON text frame.
    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
