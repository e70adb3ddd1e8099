use std::fmt;

use serde::{Deserialize, Serialize};

/// Broker session lifecycle reported to the frontend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket; a retry may be scheduled.
    Disconnected,
    /// Socket open or handshake in flight.
    Connecting,
    /// Handshake accepted and the private subscription is active.
    Connected,
}

/// Unordered participant pair identifying a 1:1 conversation.
///
/// `ConversationKey::new("a", "b") == ConversationKey::new("b", "a")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    low: String,
    high: String,
}

impl ConversationKey {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        let a = a.into();
        let b = b.into();
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    /// Both participants in canonical (sorted) order.
    pub fn participants(&self) -> (&str, &str) {
        (&self.low, &self.high)
    }

    pub fn contains(&self, participant: &str) -> bool {
        self.low == participant || self.high == participant
    }

    /// The other participant, when `local` is part of this conversation.
    pub fn counterpart_of(&self, local: &str) -> Option<&str> {
        if self.low == local {
            Some(&self.high)
        } else if self.high == local {
            Some(&self.low)
        } else {
            None
        }
    }

    /// Whether a sender/recipient pair belongs here, in either order.
    pub fn matches(&self, sender: &str, recipient: &str) -> bool {
        (self.low == sender && self.high == recipient)
            || (self.low == recipient && self.high == sender)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.low, self.high)
    }
}

/// One message in a conversation timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    /// Server-assigned ID; `None` until the broker has echoed the message.
    pub id: Option<String>,
    /// Client-generated ID for locally created records. Never sent on the wire.
    pub correlation_id: Option<String>,
    pub conversation_key: ConversationKey,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    /// Creation time in milliseconds since Unix epoch.
    pub timestamp_ms: u64,
    /// `true` once the broker acknowledged the message (echo or history).
    pub confirmed: bool,
    /// `true` when the send attempt could not be delivered.
    pub failed: bool,
}

impl MessageRecord {
    /// Build a broker-confirmed record.
    pub fn confirmed(
        id: Option<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
        timestamp_ms: u64,
    ) -> Self {
        let sender = sender.into();
        let recipient = recipient.into();
        Self {
            id,
            correlation_id: None,
            conversation_key: ConversationKey::new(sender.clone(), recipient.clone()),
            sender,
            recipient,
            content: content.into(),
            timestamp_ms,
            confirmed: true,
            failed: false,
        }
    }

    /// Whether this is an in-flight optimistic record.
    pub fn is_pending(&self) -> bool {
        !self.confirmed && !self.failed
    }
}

/// User-authored message before it enters a timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftMessage {
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub timestamp_ms: u64,
}

impl DraftMessage {
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(self.sender.clone(), self.recipient.clone())
    }

    pub(crate) fn into_optimistic(self, correlation_id: String) -> MessageRecord {
        MessageRecord {
            id: None,
            correlation_id: Some(correlation_id),
            conversation_key: self.conversation_key(),
            sender: self.sender,
            recipient: self.recipient,
            content: self.content,
            timestamp_ms: self.timestamp_ms,
            confirmed: false,
            failed: false,
        }
    }
}

/// Result of merging one live record into the active conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LiveOutcome {
    /// The `id` was already present; nothing changed.
    Duplicate { index: usize },
    /// An optimistic record was confirmed in place.
    Confirmed { index: usize },
    /// The record was appended at the end.
    Appended { index: usize },
    /// History is still loading; the record will be replayed afterwards.
    Buffered,
    /// The record does not belong to the active conversation.
    NotActive,
}

impl LiveOutcome {
    /// List position affected by the merge, when any.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Duplicate { index } | Self::Confirmed { index } | Self::Appended { index } => {
                Some(*index)
            }
            Self::Buffered | Self::NotActive => None,
        }
    }

    /// Whether the visible list changed.
    pub fn changed_list(&self) -> bool {
        matches!(self, Self::Confirmed { .. } | Self::Appended { .. })
    }
}

/// Incremental timeline change used for render diffing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimelineChange {
    /// A record was added at `index` (always the end of the list).
    Appended { index: usize, record: MessageRecord },
    /// The record at `index` was replaced (optimistic record confirmed).
    Replaced { index: usize, record: MessageRecord },
    /// Flags on the record at `index` changed (for example `failed`).
    Updated { index: usize, record: MessageRecord },
}

/// A frame body delivered on the private subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Destination header of the broker frame, when present.
    pub destination: Option<String>,
    /// Raw frame body, expected to be a JSON message record.
    pub body: String,
}

impl InboundFrame {
    pub fn new(destination: Option<String>, body: impl Into<String>) -> Self {
        Self {
            destination,
            body: body.into(),
        }
    }
}

/// Wire payload for a 1:1 send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundPrivateMessage {
    pub recipient_phone_number: String,
    pub content: String,
}

/// Wire payload for a room send. The sender is derived from the broker principal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundRoomMessage {
    pub content: String,
}

/// Command channel input accepted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatCommand {
    /// Open (or join) the broker session.
    Connect,
    /// Tear down the broker session and cancel reconnection.
    Disconnect,
    /// Replace the active conversation with one against `counterpart`.
    SelectConversation { counterpart: String },
    /// Discard the active conversation.
    CloseConversation,
    /// Send a 1:1 text message.
    SendText { recipient: String, content: String },
    /// Send a room message (no optimistic record is kept).
    SendRoomText { room_id: String, content: String },
}

/// Event channel output emitted by the runtime and the broker session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatEvent {
    /// Broker session transition.
    ConnectionChanged {
        state: ConnectionState,
        /// Delay before the next automatic attempt, when one is scheduled.
        retry_in_ms: Option<u64>,
    },
    /// Handshake accepted and subscription active.
    SessionReady { principal: String },
    /// Full replacement of the active conversation list.
    TimelineReset {
        counterpart: String,
        items: Vec<MessageRecord>,
        /// `true` while the history fetch is still pending.
        loading: bool,
        /// Set when the history fetch failed.
        history_error: Option<String>,
    },
    /// Incremental change to the active conversation list.
    TimelineChanged {
        counterpart: String,
        change: TimelineChange,
    },
    /// A message for a conversation that is not open.
    Notification { from: String, record: MessageRecord },
    /// An optimistic send could not be delivered.
    SendFailed {
        correlation_id: Option<String>,
        code: String,
    },
    /// Runtime or session error surfaced to the frontend.
    FatalError {
        code: String,
        message: String,
        /// Indicates whether retrying may recover.
        recoverable: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_key_ignores_participant_order() {
        let ab = ConversationKey::new("+100", "+200");
        let ba = ConversationKey::new("+200", "+100");
        assert_eq!(ab, ba);
        assert_eq!(ab.participants(), ("+100", "+200"));
        assert!(ab.matches("+200", "+100"));
        assert!(!ab.matches("+100", "+300"));
    }

    #[test]
    fn counterpart_lookup_requires_membership() {
        let key = ConversationKey::new("+100", "+200");
        assert_eq!(key.counterpart_of("+100"), Some("+200"));
        assert_eq!(key.counterpart_of("+200"), Some("+100"));
        assert_eq!(key.counterpart_of("+300"), None);
    }

    #[test]
    fn outbound_private_payload_uses_wire_field_names() {
        let payload = OutboundPrivateMessage {
            recipient_phone_number: "+200".into(),
            content: "hi".into(),
        };
        let json = serde_json::to_value(&payload).expect("payload should serialize");
        assert_eq!(
            json,
            serde_json::json!({ "recipientPhoneNumber": "+200", "content": "hi" })
        );
    }

    #[test]
    fn live_outcome_reports_affected_index() {
        assert_eq!(LiveOutcome::Confirmed { index: 3 }.index(), Some(3));
        assert_eq!(LiveOutcome::Buffered.index(), None);
        assert!(!LiveOutcome::Duplicate { index: 0 }.changed_list());
        assert!(LiveOutcome::Appended { index: 0 }.changed_list());
    }
}
