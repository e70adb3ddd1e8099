use tracing::{debug, warn};

use crate::{
    engine::ReconciliationEngine,
    error::{ChatError, ChatErrorCategory},
    types::{DraftMessage, OutboundPrivateMessage, OutboundRoomMessage},
};

/// Broker endpoint for 1:1 sends.
pub const PRIVATE_SEND_DESTINATION: &str = "/app/private.sendMessage";

/// Broker endpoint for a room send.
pub fn room_send_destination(room_id: &str) -> String {
    format!("/app/room.sendMessage/{room_id}")
}

/// Fire-and-forget publish primitive of the broker session.
pub trait Publisher {
    fn publish(&self, destination: &str, payload: &str) -> Result<(), ChatError>;
}

/// What happened to one user send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub correlation_id: String,
    /// Position of the optimistic record.
    pub index: usize,
    /// Publish error; the record has been marked failed.
    pub failure: Option<ChatError>,
}

/// Turns user send actions into optimistic records plus publish calls.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    local_user: String,
}

impl OutboundSender {
    pub fn new(local_user: impl Into<String>) -> Self {
        Self {
            local_user: local_user.into(),
        }
    }

    /// Append an optimistic record, then publish. A failed publish marks the
    /// record failed; it is never retried here.
    pub fn send<P>(
        &self,
        engine: &mut ReconciliationEngine,
        publisher: &P,
        recipient: &str,
        content: &str,
        now_ms: u64,
    ) -> Result<SendReceipt, ChatError>
    where
        P: Publisher + ?Sized,
    {
        ensure_content(content)?;

        let draft = DraftMessage {
            sender: self.local_user.clone(),
            recipient: recipient.to_owned(),
            content: content.to_owned(),
            timestamp_ms: now_ms,
        };
        let (correlation_id, index) = engine.ingest_optimistic(draft)?;

        let failure = encode(&OutboundPrivateMessage {
            recipient_phone_number: recipient.to_owned(),
            content: content.to_owned(),
        })
        .and_then(|payload| publisher.publish(PRIVATE_SEND_DESTINATION, &payload))
        .err();

        if let Some(err) = &failure {
            warn!(%correlation_id, error = %err, "publish failed; marking record failed");
            engine.mark_failed(&correlation_id);
        } else {
            debug!(%correlation_id, %recipient, "private message published");
        }

        Ok(SendReceipt {
            correlation_id,
            index,
            failure,
        })
    }

    /// Publish a room message. No optimistic record is kept for rooms.
    pub fn send_room<P>(&self, publisher: &P, room_id: &str, content: &str) -> Result<(), ChatError>
    where
        P: Publisher + ?Sized,
    {
        ensure_content(content)?;
        if room_id.trim().is_empty() {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "invalid_room_id",
                "room id must not be empty",
            ));
        }

        let payload = encode(&OutboundRoomMessage {
            content: content.to_owned(),
        })?;
        publisher.publish(&room_send_destination(room_id), &payload)
    }
}

fn ensure_content(content: &str) -> Result<(), ChatError> {
    if content.trim().is_empty() {
        return Err(ChatError::new(
            ChatErrorCategory::Config,
            "empty_message",
            "message content must not be blank",
        ));
    }
    Ok(())
}

fn encode<T: serde::Serialize>(payload: &T) -> Result<String, ChatError> {
    serde_json::to_string(payload).map_err(|err| {
        ChatError::new(
            ChatErrorCategory::Internal,
            "payload_encode_error",
            err.to_string(),
        )
    })
}
