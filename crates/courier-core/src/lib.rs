//! Core chat contract shared between the broker runtime and frontend consumers.
//!
//! This crate holds the command/event protocol, the connection lifecycle
//! model, the retry policy, and the reconciliation engine that merges
//! history, optimistic and live records into one conversation timeline.
//! It performs no I/O.

/// Async command/event channel primitives.
pub mod channel;
/// Inbound frame routing.
pub mod dispatcher;
/// Open conversation state and ingestion operations.
pub mod engine;
/// Stable chat error types and HTTP classification helpers.
pub mod error;
/// Wire record normalization and publish-outcome events.
pub mod normalization;
/// Optimistic send path.
pub mod outbound;
/// Backoff policy used by the reconnection loop.
pub mod retry;
/// Broker session lifecycle state machine.
pub mod state_machine;
/// Per-conversation ordered message list.
pub mod timeline;
/// Frontend-facing protocol types (commands, events, records).
pub mod types;

pub use channel::{ChatChannelError, ChatChannels, EventStream, InboundFrames, inbound_queue};
pub use dispatcher::{DispatchStats, Dispatched, Dispatcher};
pub use engine::{HistoryTicket, ReconciliationEngine};
pub use error::{ChatError, ChatErrorCategory, classify_http_status};
pub use normalization::{
    decode_message_record, normalize_fatal_error, normalize_history_records,
    normalize_message_value, normalize_send_failure,
};
pub use outbound::{
    OutboundSender, PRIVATE_SEND_DESTINATION, Publisher, SendReceipt, room_send_destination,
};
pub use retry::RetryPolicy;
pub use state_machine::ConnectionStateMachine;
pub use timeline::{ConversationTimeline, DEFAULT_ECHO_WINDOW_MS};
pub use types::{
    ChatCommand, ChatEvent, ConnectionState, ConversationKey, DraftMessage, InboundFrame,
    LiveOutcome, MessageRecord, OutboundPrivateMessage, OutboundRoomMessage, TimelineChange,
};
