use std::collections::HashSet;

use tracing::trace;

use crate::types::{ConversationKey, DraftMessage, LiveOutcome, MessageRecord};

/// Default tolerance between an optimistic record and its broker echo.
pub const DEFAULT_ECHO_WINDOW_MS: u64 = 3_000;

/// Ordered message list of one conversation.
///
/// Holds at most one record per server `id` and keeps records in insertion
/// order; confirmation replaces an optimistic record in place.
#[derive(Debug, Clone)]
pub struct ConversationTimeline {
    key: ConversationKey,
    local_user: String,
    echo_window_ms: u64,
    items: Vec<MessageRecord>,
}

impl ConversationTimeline {
    pub fn new(key: ConversationKey, local_user: impl Into<String>, echo_window_ms: u64) -> Self {
        Self {
            key,
            local_user: local_user.into(),
            echo_window_ms,
            items: Vec::new(),
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// Current items in display order.
    pub fn items(&self) -> &[MessageRecord] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Replace the list with confirmed history, ordered by timestamp.
    ///
    /// Overlapping pages may repeat an `id`; the first occurrence wins.
    pub fn replace_with_history(&mut self, records: Vec<MessageRecord>) {
        let mut seen_ids = HashSet::new();
        let mut records: Vec<MessageRecord> = records
            .into_iter()
            .filter(|record| match record.id.as_deref() {
                Some(id) => seen_ids.insert(id.to_owned()),
                None => true,
            })
            .map(|mut record| {
                record.confirmed = true;
                record.failed = false;
                record
            })
            .collect();
        records.sort_by_key(|record| record.timestamp_ms);
        self.items = records;
    }

    /// Remove and return every record that has no server `id` yet.
    pub(crate) fn take_local_records(&mut self) -> Vec<MessageRecord> {
        let (local, confirmed): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|record| record.id.is_none() && !record.confirmed);
        self.items = confirmed;
        local
    }

    /// Put back records taken by [`Self::take_local_records`] after new
    /// history was installed. A pending record whose echo is already in that
    /// history is folded into the confirmed entry instead of being kept twice.
    pub(crate) fn restore_local_records(&mut self, records: Vec<MessageRecord>) {
        let history_len = self.items.len();
        let mut claimed = HashSet::new();
        for local in records {
            let echo = local
                .is_pending()
                .then(|| {
                    (0..history_len).find(|index| {
                        !claimed.contains(index)
                            && self.items[*index].sender == self.local_user
                            && self.is_echo_of(&local, &self.items[*index])
                    })
                })
                .flatten();

            match echo {
                Some(index) => {
                    claimed.insert(index);
                    trace!(
                        id = ?self.items[index].id,
                        index,
                        "pending record already confirmed by history"
                    );
                    if self.items[index].correlation_id.is_none() {
                        self.items[index].correlation_id = local.correlation_id;
                    }
                }
                None => self.items.push(local),
            }
        }
    }

    /// Append an optimistic record built from `draft`; returns its position.
    pub fn push_optimistic(&mut self, draft: DraftMessage, correlation_id: String) -> usize {
        self.items.push(draft.into_optimistic(correlation_id));
        self.items.len() - 1
    }

    /// Merge one broker-confirmed record.
    ///
    /// 1. a known `id` is a no-op;
    /// 2. an own message confirms the oldest matching pending record in place;
    /// 3. anything else is appended.
    pub fn merge_live(&mut self, record: MessageRecord) -> LiveOutcome {
        if let Some(id) = record.id.as_deref()
            && let Some(index) = self.position_of_id(id)
        {
            trace!(%id, index, "live record already present");
            return LiveOutcome::Duplicate { index };
        }

        if record.sender == self.local_user
            && let Some(index) = self.position_of_echo_candidate(&record)
        {
            let correlation_id = self.items[index].correlation_id.take();
            self.items[index] = MessageRecord {
                correlation_id,
                confirmed: true,
                failed: false,
                ..record
            };
            return LiveOutcome::Confirmed { index };
        }

        self.items.push(MessageRecord {
            confirmed: true,
            failed: false,
            ..record
        });
        LiveOutcome::Appended {
            index: self.items.len() - 1,
        }
    }

    /// Flag a pending optimistic record as undeliverable.
    pub fn mark_failed(&mut self, correlation_id: &str) -> Option<usize> {
        let index = self.items.iter().position(|item| {
            !item.confirmed && item.correlation_id.as_deref() == Some(correlation_id)
        })?;
        self.items[index].failed = true;
        Some(index)
    }

    fn position_of_id(&self, id: &str) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.id.as_deref() == Some(id))
    }

    fn position_of_echo_candidate(&self, record: &MessageRecord) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.is_pending() && self.is_echo_of(item, record))
    }

    fn is_echo_of(&self, pending: &MessageRecord, confirmed: &MessageRecord) -> bool {
        pending.sender == confirmed.sender
            && pending.recipient == confirmed.recipient
            && pending.content == confirmed.content
            && pending.timestamp_ms.abs_diff(confirmed.timestamp_ms) <= self.echo_window_ms
    }
}
