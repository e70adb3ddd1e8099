//! Broker-facing half of the chat client.
//!
//! Speaks STOMP 1.2 over a WebSocket to the message broker, loads
//! conversation history over HTTP, and runs the single-task chat runtime
//! that feeds both into the reconciliation engine from `courier-core`.

/// Broker session lifecycle, publish path and reconnection loop.
pub mod connection;
/// STOMP frame codec.
pub mod frame;
/// Conversation history loading.
pub mod history;
/// Command/event runtime.
pub mod runtime;
/// Frame transports.
pub mod transport;

#[cfg(test)]
mod test_support;

pub use connection::{
    ConnectionConfig, ConnectionManager, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_RECONNECT_DELAY,
    PRIVATE_QUEUE, PRIVATE_SUBSCRIPTION_ID,
};
pub use frame::{FrameError, StompFrame};
pub use history::{
    DEFAULT_HISTORY_PAGE_SIZE, HistoryLoader, HistoryRequest, HttpHistoryLoader,
    bounded_page_size, parse_history_body,
};
pub use runtime::{
    ChatRuntimeHandle, DEFAULT_INBOUND_QUEUE_CAPACITY, RuntimeConfig, spawn_runtime,
    spawn_runtime_with,
};
pub use transport::{FrameLink, FrameTransport, WebSocketTransport};
