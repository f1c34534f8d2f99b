//! # Termlink Protocol Library
//!
//! Wire protocol shared by the Termlink server and client.
//!
//! The protocol has two stages:
//!
//! 1. **Credential exchange** over HTTP: the client POSTs its long-lived
//!    token to `/auth` and receives a short-lived session credential.
//! 2. **Streaming** over a WebSocket: JSON text frames, each a `type`-tagged
//!    object. The first accepted client message must be `auth`; everything
//!    else before that is rejected without closing the connection.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   ClientMessage / ServerMessage (JSON)  │
//! ├─────────────────────────────────────────┤
//! │        WebSocket text frames            │
//! ├─────────────────────────────────────────┤
//! │   Trusted overlay network (e.g. 100.*)  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Close codes in the 4000 range signal handshake outcomes:
//! [`CLOSE_AUTH_FAILED`], [`CLOSE_AUTH_TIMEOUT`], [`CLOSE_UNTRUSTED`].

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    AuthErrorBody, AuthRequest, AuthResponse, ClientMessage, HealthResponse, MuxSessionInfo,
    ServerMessage, CLEAR_SEQUENCE, CLOSE_AUTH_FAILED, CLOSE_AUTH_TIMEOUT, CLOSE_UNTRUSTED,
    CMD_CLEAR, CMD_INTERRUPT, CMD_SESSIONS, INTERRUPT_BYTE,
};
