//! Reconciliation of history, optimistic and live records for the open
//! conversation.

use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    error::{ChatError, ChatErrorCategory},
    timeline::{ConversationTimeline, DEFAULT_ECHO_WINDOW_MS},
    types::{ConversationKey, DraftMessage, LiveOutcome, MessageRecord},
};

/// Identifies the activation a history fetch was issued for.
///
/// A result carrying a ticket from an earlier activation is stale and is
/// discarded, even when the same counterpart was selected again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTicket {
    key: ConversationKey,
    generation: u64,
}

impl HistoryTicket {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone)]
enum HistoryPhase {
    Pending { buffered: Vec<MessageRecord> },
    Loaded,
    Failed { message: String },
}

#[derive(Debug, Clone)]
struct ActiveConversation {
    counterpart: String,
    generation: u64,
    timeline: ConversationTimeline,
    phase: HistoryPhase,
}

/// Holds the authoritative message list of the one open conversation.
///
/// All ingestion methods take `&mut self`; callers serialize them on a single
/// task so merges never interleave.
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    local_user: String,
    echo_window_ms: u64,
    next_generation: u64,
    active: Option<ActiveConversation>,
}

impl ReconciliationEngine {
    pub fn new(local_user: impl Into<String>) -> Self {
        Self {
            local_user: local_user.into(),
            echo_window_ms: DEFAULT_ECHO_WINDOW_MS,
            next_generation: 0,
            active: None,
        }
    }

    /// Override the optimistic echo match window.
    pub fn with_echo_window_ms(mut self, echo_window_ms: u64) -> Self {
        self.echo_window_ms = echo_window_ms;
        self
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    /// Replace the active conversation and return the ticket for its history
    /// fetch. The previous list and any buffered live records are dropped.
    pub fn activate(&mut self, counterpart: impl Into<String>) -> HistoryTicket {
        let counterpart = counterpart.into();
        self.next_generation += 1;
        let key = ConversationKey::new(self.local_user.clone(), counterpart.clone());
        debug!(%key, generation = self.next_generation, "activating conversation");

        self.active = Some(ActiveConversation {
            counterpart,
            generation: self.next_generation,
            timeline: ConversationTimeline::new(
                key.clone(),
                self.local_user.clone(),
                self.echo_window_ms,
            ),
            phase: HistoryPhase::Pending {
                buffered: Vec::new(),
            },
        });

        HistoryTicket {
            key,
            generation: self.next_generation,
        }
    }

    /// Close the active conversation, if any.
    pub fn deactivate(&mut self) -> Option<ConversationKey> {
        self.active
            .take()
            .map(|active| active.timeline.key().clone())
    }

    pub fn active_key(&self) -> Option<&ConversationKey> {
        self.active.as_ref().map(|active| active.timeline.key())
    }

    pub fn active_counterpart(&self) -> Option<&str> {
        self.active
            .as_ref()
            .map(|active| active.counterpart.as_str())
    }

    /// Current list of the active conversation (empty when none is open).
    pub fn items(&self) -> &[MessageRecord] {
        self.active
            .as_ref()
            .map(|active| active.timeline.items())
            .unwrap_or(&[])
    }

    pub fn is_history_pending(&self) -> bool {
        matches!(
            self.active.as_ref().map(|active| &active.phase),
            Some(HistoryPhase::Pending { .. })
        )
    }

    pub fn history_error(&self) -> Option<&str> {
        match self.active.as_ref().map(|active| &active.phase) {
            Some(HistoryPhase::Failed { message }) => Some(message),
            _ => None,
        }
    }

    /// Whether `ticket` still refers to the active activation.
    pub fn is_current(&self, ticket: &HistoryTicket) -> bool {
        self.active.as_ref().is_some_and(|active| {
            active.generation == ticket.generation && *active.timeline.key() == ticket.key
        })
    }

    /// Install fetched history and replay live records buffered meanwhile.
    ///
    /// Records sent locally while the fetch was pending are kept after the
    /// history unless the history already holds their echo. Returns the
    /// outcomes of the replayed live records.
    pub fn ingest_history(
        &mut self,
        ticket: &HistoryTicket,
        records: Vec<MessageRecord>,
    ) -> Result<Vec<LiveOutcome>, ChatError> {
        let active = self.current_mut(ticket)?;
        let key = active.timeline.key().clone();

        let (records, foreign): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|record| key.matches(&record.sender, &record.recipient));
        if !foreign.is_empty() {
            warn!(%key, dropped = foreign.len(), "history contained records of another conversation");
        }

        let local = active.timeline.take_local_records();
        active.timeline.replace_with_history(records);
        active.timeline.restore_local_records(local);
        debug!(%key, len = active.timeline.len(), "history installed");

        Ok(self.finish_history(HistoryPhase::Loaded))
    }

    /// Record a failed history fetch: the list keeps only local sends, the
    /// error flag is set, and buffered live records are replayed.
    pub fn fail_history(
        &mut self,
        ticket: &HistoryTicket,
        message: impl Into<String>,
    ) -> Result<Vec<LiveOutcome>, ChatError> {
        let message = message.into();
        let active = self.current_mut(ticket)?;
        warn!(key = %active.timeline.key(), %message, "history fetch failed");
        Ok(self.finish_history(HistoryPhase::Failed { message }))
    }

    /// Append an optimistic record and return its correlation ID and position.
    pub fn ingest_optimistic(&mut self, draft: DraftMessage) -> Result<(String, usize), ChatError> {
        let Some(active) = self.active.as_mut() else {
            return Err(conversation_not_active(&draft.recipient));
        };
        if draft.sender != self.local_user || !active.timeline.key().contains(&draft.recipient) {
            return Err(conversation_not_active(&draft.recipient));
        }

        let correlation_id = Uuid::new_v4().to_string();
        let index = active
            .timeline
            .push_optimistic(draft, correlation_id.clone());
        trace!(%correlation_id, index, "optimistic record appended");
        Ok((correlation_id, index))
    }

    /// Merge one confirmed record from the broker.
    pub fn ingest_live(&mut self, record: MessageRecord) -> LiveOutcome {
        let Some(active) = self.active.as_mut() else {
            return LiveOutcome::NotActive;
        };
        if !active.timeline.key().matches(&record.sender, &record.recipient) {
            return LiveOutcome::NotActive;
        }

        match &mut active.phase {
            HistoryPhase::Pending { buffered } => {
                trace!(id = ?record.id, "buffering live record until history completes");
                buffered.push(record);
                LiveOutcome::Buffered
            }
            HistoryPhase::Loaded | HistoryPhase::Failed { .. } => {
                active.timeline.merge_live(record)
            }
        }
    }

    /// Flag an optimistic record as undeliverable; returns its position.
    pub fn mark_failed(&mut self, correlation_id: &str) -> Option<usize> {
        self.active
            .as_mut()?
            .timeline
            .mark_failed(correlation_id)
    }

    fn current_mut(&mut self, ticket: &HistoryTicket) -> Result<&mut ActiveConversation, ChatError> {
        if !self.is_current(ticket) {
            debug!(
                key = %ticket.key,
                generation = ticket.generation,
                "discarding stale history result"
            );
            return Err(ChatError::new(
                ChatErrorCategory::HistoryFetch,
                "stale_history",
                format!("conversation {} is no longer active", ticket.key),
            ));
        }
        self.active
            .as_mut()
            .ok_or_else(|| conversation_not_active(&ticket.key.to_string()))
    }

    fn finish_history(&mut self, next: HistoryPhase) -> Vec<LiveOutcome> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        let previous = std::mem::replace(&mut active.phase, next);
        let buffered = match previous {
            HistoryPhase::Pending { buffered } => buffered,
            HistoryPhase::Loaded | HistoryPhase::Failed { .. } => Vec::new(),
        };

        buffered
            .into_iter()
            .map(|record| self.ingest_live(record))
            .collect()
    }
}

fn conversation_not_active(target: &str) -> ChatError {
    ChatError::new(
        ChatErrorCategory::Config,
        "conversation_not_active",
        format!("no open conversation with {target}"),
    )
}
