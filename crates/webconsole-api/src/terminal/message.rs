//! Browser terminal protocol messages
//!
//! Every WebSocket text frame carries one JSON `TerminalMessage`. Output uses
//! the capitalized field names the browser client expects; input also accepts
//! the lower-case forms.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Terminal protocol operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    /// Attach this connection to a session id
    Bind,
    /// Keystrokes from the browser
    Stdin,
    /// Terminal window size change
    Resize,
    /// Process output
    Stdout,
    /// Out-of-band notice shown to the user
    Toast,
    /// Anything the protocol does not define
    #[serde(other)]
    Unknown,
}

/// One terminal protocol frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalMessage {
    /// Operation
    #[serde(rename = "Op", alias = "op")]
    pub op: Op,
    /// Payload for stdin, stdout and toast
    #[serde(rename = "Data", alias = "data", default)]
    pub data: String,
    /// Session id for bind
    #[serde(rename = "SessionID", alias = "sessionId", alias = "sessionID", default)]
    pub session_id: String,
    /// Rows for resize
    #[serde(rename = "Rows", alias = "rows", default)]
    pub rows: u16,
    /// Columns for resize
    #[serde(rename = "Cols", alias = "cols", default)]
    pub cols: u16,
}

impl TerminalMessage {
    fn with_data(op: Op, data: impl Into<String>) -> Self {
        Self {
            op,
            data: data.into(),
            session_id: String::new(),
            rows: 0,
            cols: 0,
        }
    }

    /// Process output frame
    pub fn stdout(data: impl Into<String>) -> Self {
        Self::with_data(Op::Stdout, data)
    }

    /// Server notice frame
    pub fn toast(data: impl Into<String>) -> Self {
        Self::with_data(Op::Toast, data)
    }

    /// Keystroke frame
    pub fn stdin(data: impl Into<String>) -> Self {
        Self::with_data(Op::Stdin, data)
    }

    /// Bind frame
    pub fn bind(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::with_data(Op::Bind, "")
        }
    }

    /// Resize frame
    pub fn resize(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            ..Self::with_data(Op::Resize, "")
        }
    }

    /// Parse a text frame
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::ProtocolViolation(format!("malformed terminal message: {}", e)))
    }

    /// Encode as a text frame
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Internal(format!("failed to encode terminal message: {}", e)))
    }
}
