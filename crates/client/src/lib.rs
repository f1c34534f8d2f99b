//! # Termlink Client Library
//!
//! Client-side building blocks for Termlink terminals:
//!
//! - [`controller`]: connection lifecycle, handshake, and the ordered
//!   event stream
//! - [`lines`]: output line assembly and bounded scrollback
//! - [`ansi`]: SGR escape-sequence rendering into styled spans
//!
//! A UI embeds these three pieces: the controller produces raw output
//! fragments and display lines, the ANSI parser turns fragments into
//! styled spans, and the scrollback holds the visible transcript.

pub mod ansi;
pub mod controller;
pub mod lines;

pub use ansi::{AnsiParser, Color, Parsed, Span, Style};
pub use controller::{
    ClientError, ClientEvent, ConnectionConfig, ConnectionState, Controller, SessionInfo,
};
pub use lines::{DisplayLine, LineAssembler, LineKind, Scrollback, DEFAULT_SCROLLBACK};
