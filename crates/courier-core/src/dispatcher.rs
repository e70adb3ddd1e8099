use tracing::{debug, warn};

use crate::{
    engine::ReconciliationEngine,
    error::ChatError,
    normalization::decode_message_record,
    types::{InboundFrame, LiveOutcome, MessageRecord},
};

/// Where one inbound frame ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Merged into the active conversation.
    Live {
        outcome: LiveOutcome,
        record: MessageRecord,
    },
    /// Belongs to a conversation that is not open.
    Notification(MessageRecord),
    /// Undecodable payload; dropped.
    Dropped(ChatError),
}

/// Running totals, logged by the runtime on shutdown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub live: u64,
    pub notifications: u64,
    pub dropped: u64,
}

/// Routes decoded broker frames to the engine or the notification side channel.
#[derive(Debug, Default)]
pub struct Dispatcher {
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn dispatch(
        &mut self,
        engine: &mut ReconciliationEngine,
        frame: &InboundFrame,
        received_at_ms: u64,
    ) -> Dispatched {
        let record = match decode_message_record(&frame.body, received_at_ms) {
            Ok(record) => record,
            Err(err) => {
                self.stats.dropped += 1;
                warn!(
                    destination = ?frame.destination,
                    error = %err,
                    "dropping malformed inbound frame"
                );
                return Dispatched::Dropped(err);
            }
        };

        let is_active = engine
            .active_key()
            .is_some_and(|key| key.matches(&record.sender, &record.recipient));
        if !is_active {
            self.stats.notifications += 1;
            debug!(
                sender = %record.sender,
                recipient = %record.recipient,
                "inbound message for inactive conversation"
            );
            return Dispatched::Notification(record);
        }

        self.stats.live += 1;
        let outcome = engine.ingest_live(record.clone());
        Dispatched::Live { outcome, record }
    }
}
