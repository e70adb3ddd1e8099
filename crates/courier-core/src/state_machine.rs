use crate::{
    error::ChatError,
    types::{ChatEvent, ConnectionState},
};

/// Broker session lifecycle: `Disconnected -> Connecting -> Connected`, with
/// every failure returning to `Disconnected`.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn begin_connect(&mut self) -> Result<ChatEvent, ChatError> {
        self.transition_from_state(
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            "begin_connect",
        )
    }

    pub fn on_handshake_complete(&mut self) -> Result<ChatEvent, ChatError> {
        self.transition_from_state(
            ConnectionState::Connecting,
            ConnectionState::Connected,
            "handshake_complete",
        )
    }

    /// Socket closed, handshake failed, or deliberate shutdown.
    ///
    /// Returns `None` when already disconnected.
    pub fn on_closed(&mut self, retry_in_ms: Option<u64>) -> Option<ChatEvent> {
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        self.state = ConnectionState::Disconnected;
        Some(ChatEvent::ConnectionChanged {
            state: ConnectionState::Disconnected,
            retry_in_ms,
        })
    }

    /// Guard for operations that need a live session.
    pub fn ensure_connected(&self, action: &str) -> Result<(), ChatError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ChatError::not_connected(action))
        }
    }

    fn transition_from_state(
        &mut self,
        expected: ConnectionState,
        next: ConnectionState,
        action: &str,
    ) -> Result<ChatEvent, ChatError> {
        if self.state != expected {
            return Err(ChatError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(ChatEvent::ConnectionChanged {
            state: next,
            retry_in_ms: None,
        })
    }
}
