use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionState;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatErrorCategory {
    /// Invalid input, unknown conversation, or other caller mistake.
    Config,
    /// Handshake rejected by the credential. Fatal for the session.
    Auth,
    /// Socket or handshake failure. Retried with backoff.
    Connection,
    /// History request/response failure. Not retried by the engine.
    HistoryFetch,
    /// Publish attempted without a live session.
    Send,
    /// Undecodable inbound payload.
    Malformed,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ChatError {
    /// High-level error category.
    pub category: ChatErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ChatError {
    /// Construct a new chat error.
    pub fn new(
        category: ChatErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ChatErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while connection is {current:?}"),
        )
    }

    /// Publish attempted while the session is not `Connected`.
    pub fn not_connected(action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ChatErrorCategory::Send,
            "not_connected",
            format!("cannot run '{action}': broker session is not connected"),
        )
    }

    /// Inbound payload could not be decoded.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Malformed, "malformed_frame", message)
    }

    /// Whether the connection loop should schedule another attempt.
    ///
    /// A rejected credential and a broken invariant are final; everything
    /// else is retried.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self.category,
            ChatErrorCategory::Auth | ChatErrorCategory::Internal
        )
    }
}

/// Map HTTP status codes to chat error categories.
pub fn classify_http_status(status: u16) -> ChatErrorCategory {
    match status {
        401 | 403 => ChatErrorCategory::Auth,
        408 | 429 => ChatErrorCategory::Connection,
        400..=499 => ChatErrorCategory::Config,
        500..=599 => ChatErrorCategory::Connection,
        _ => ChatErrorCategory::Internal,
    }
}
