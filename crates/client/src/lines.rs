//! Display lines, output line assembly, and bounded scrollback.

use std::collections::VecDeque;
use std::time::SystemTime;

/// Maximum lines kept in scrollback before the oldest are dropped.
pub const DEFAULT_SCROLLBACK: usize = 1000;

/// Who produced a display line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Local echo of something the user sent.
    Input,
    /// Process output.
    Output,
    /// Server-reported error.
    Error,
    /// Client-generated notice (connected, session exited, ...).
    System,
}

/// One line of the terminal transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayLine {
    pub text: String,
    pub kind: LineKind,
    pub timestamp: SystemTime,
}

impl DisplayLine {
    pub fn new(text: impl Into<String>, kind: LineKind) -> Self {
        Self {
            text: text.into(),
            kind,
            timestamp: SystemTime::now(),
        }
    }
}

/// Reassembles streamed output fragments into whole lines.
///
/// Fragments split mid-line are carried until their newline arrives;
/// carriage returns are stripped. A forced flush turns whatever is carried
/// into a line immediately (used when the user sends input or clears the
/// screen, so a pending prompt is not lost).
#[derive(Debug, Default)]
pub struct LineAssembler {
    partial: String,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The carried partial line, if any.
    pub fn partial(&self) -> &str {
        &self.partial
    }

    /// Feed a fragment; returns the lines it completed.
    pub fn feed(&mut self, fragment: &str) -> Vec<String> {
        let mut lines = Vec::new();
        for ch in fragment.chars() {
            match ch {
                '\n' => lines.push(std::mem::take(&mut self.partial)),
                '\r' => {}
                _ => self.partial.push(ch),
            }
        }
        lines
    }

    /// Emit the carried partial line, if non-empty, as a complete line.
    pub fn force_flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.partial))
        }
    }

    /// Discard any carried partial line. Only for teardown; a user-facing
    /// clear goes through [`force_flush`](Self::force_flush) so the carried
    /// text still reaches the transcript.
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

/// FIFO-bounded transcript of display lines.
#[derive(Debug)]
pub struct Scrollback {
    lines: VecDeque<DisplayLine>,
    capacity: usize,
}

impl Default for Scrollback {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK)
    }
}

impl Scrollback {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&mut self, line: DisplayLine) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DisplayLine> {
        self.lines.iter()
    }

    /// Drop the whole transcript.
    pub fn clear(&mut self) {
        self.lines.clear();
    }
}
