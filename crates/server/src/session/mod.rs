//! Session management: process spawning, the session registry, and the
//! persistent-session multiplexer facade.

pub mod mux;
pub mod pty;
pub mod registry;

pub use mux::{MemoryMultiplexer, Multiplexer, TmuxMultiplexer};
pub use pty::{detect_shell, ProcessSession, SessionEvent, SpawnSpec};
pub use registry::{
    AttachOutcome, ConnectionId, CreateOptions, RegistryError, SessionRegistry, SessionSummary,
};

use thiserror::Error;

/// Errors from the process-session layer.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Spawning the session process failed.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// The session process has already exited.
    #[error("process gone: {session_id}")]
    ProcessGone {
        /// The affected session identifier.
        session_id: String,
    },

    /// Writing to the process input failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Resizing the pseudo-terminal failed.
    #[error("resize failed: {0}")]
    ResizeFailed(String),

    /// The external multiplexer returned an error.
    #[error("multiplexer failed: {0}")]
    MultiplexerFailed(String),
}
