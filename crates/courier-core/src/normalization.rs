use chrono::{DateTime, Local, NaiveDateTime};
use serde::Deserialize;
use serde_json::Value;
use tracing::{trace, warn};

use crate::{
    error::ChatError,
    types::{ChatEvent, MessageRecord},
};

/// Server message record as it appears in history responses and broker frames.
///
/// Both naming variants are accepted; `sender` and `timeStamp` win over
/// `senderPhoneNumber` and `timestamp` when a payload carries both.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessageRecord {
    id: Option<Value>,
    sender: Option<String>,
    sender_phone_number: Option<String>,
    recipient: Option<String>,
    recipient_phone_number: Option<String>,
    content: Option<String>,
    time_stamp: Option<Value>,
    timestamp: Option<Value>,
}

/// Decode one broker frame body into a confirmed record.
pub fn decode_message_record(body: &str, received_at_ms: u64) -> Result<MessageRecord, ChatError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| ChatError::malformed(format!("frame body is not JSON: {err}")))?;
    normalize_message_value(value, received_at_ms)
}

/// Normalize one JSON record, falling back to `received_at_ms` when the
/// payload has no usable timestamp.
pub fn normalize_message_value(
    value: Value,
    received_at_ms: u64,
) -> Result<MessageRecord, ChatError> {
    let wire: WireMessageRecord = serde_json::from_value(value)
        .map_err(|err| ChatError::malformed(format!("unexpected record shape: {err}")))?;

    let sender = non_empty(wire.sender)
        .or_else(|| non_empty(wire.sender_phone_number))
        .ok_or_else(|| ChatError::malformed("record has no sender"))?;
    let recipient = non_empty(wire.recipient)
        .or_else(|| non_empty(wire.recipient_phone_number))
        .ok_or_else(|| ChatError::malformed("record has no recipient"))?;
    let content = wire
        .content
        .ok_or_else(|| ChatError::malformed("record has no content"))?;

    let id = wire.id.as_ref().and_then(id_to_string);
    let timestamp_ms = wire
        .time_stamp
        .as_ref()
        .and_then(parse_timestamp_ms)
        .or_else(|| wire.timestamp.as_ref().and_then(parse_timestamp_ms))
        .unwrap_or_else(|| {
            trace!(?id, "record has no usable timestamp; using receive time");
            received_at_ms
        });

    Ok(MessageRecord::confirmed(
        id,
        sender,
        recipient,
        content,
        timestamp_ms,
    ))
}

/// Normalize a history page, skipping records that cannot be decoded.
pub fn normalize_history_records(values: Vec<Value>, received_at_ms: u64) -> Vec<MessageRecord> {
    values
        .into_iter()
        .enumerate()
        .filter_map(
            |(position, value)| match normalize_message_value(value, received_at_ms) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(position, error = %err, "skipping undecodable history record");
                    None
                }
            },
        )
        .collect()
}

/// Event reported when a publish could not be handed to the broker.
pub fn normalize_send_failure(correlation_id: Option<String>, error: ChatError) -> ChatEvent {
    ChatEvent::SendFailed {
        correlation_id,
        code: error.code,
    }
}

/// Convert an error into a `FatalError` event.
pub fn normalize_fatal_error(error: ChatError, recoverable: bool) -> ChatEvent {
    ChatEvent::FatalError {
        code: error.code,
        message: error.message,
        recoverable,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Accepts epoch millis, RFC 3339, or a zone-less ISO date-time, which the
/// server writes in the client's local time.
fn parse_timestamp_ms(value: &Value) -> Option<u64> {
    let millis = match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64))?,
        Value::String(text) => match DateTime::parse_from_rfc3339(text) {
            Ok(parsed) => parsed.timestamp_millis(),
            Err(_) => local_millis(text.parse::<NaiveDateTime>().ok()?),
        },
        _ => return None,
    };
    u64::try_from(millis).ok()
}

/// Earliest instant for a local wall-clock time; times skipped by a DST
/// jump fall back to UTC.
fn local_millis(naive: NaiveDateTime) -> i64 {
    naive
        .and_local_timezone(Local)
        .earliest()
        .map_or_else(|| naive.and_utc().timestamp_millis(), |local| local.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatErrorCategory;

    const RECEIVED_AT: u64 = 9_999;

    #[test]
    fn accepts_history_field_names() {
        let record = decode_message_record(
            r#"{"id":17,"senderPhoneNumber":"+100","recipientPhoneNumber":"+200","content":"hi","timestamp":"2024-05-01T10:00:00"}"#,
            RECEIVED_AT,
        )
        .expect("history shape should decode");

        assert_eq!(record.id.as_deref(), Some("17"));
        assert_eq!(record.sender, "+100");
        assert_eq!(record.recipient, "+200");
        assert_eq!(record.timestamp_ms, 1_714_557_600_000);
        assert!(record.confirmed);
    }

    #[test]
    fn prefers_primary_names_over_aliases() {
        let record = decode_message_record(
            r#"{"id":"m1","sender":"+100","senderPhoneNumber":"+999","recipient":"+200","content":"x","timeStamp":"2024-05-01T10:00:00.250Z","timestamp":1}"#,
            RECEIVED_AT,
        )
        .expect("frame should decode");

        assert_eq!(record.sender, "+100");
        assert_eq!(record.timestamp_ms, 1_714_557_600_250);
    }

    #[test]
    fn falls_back_to_receive_time_for_bad_timestamps() {
        let record = decode_message_record(
            r#"{"id":"m1","sender":"+100","recipientPhoneNumber":"+200","content":"x","timeStamp":"yesterday"}"#,
            RECEIVED_AT,
        )
        .expect("frame should decode");
        assert_eq!(record.timestamp_ms, RECEIVED_AT);

        let record = decode_message_record(
            r#"{"sender":"+100","recipientPhoneNumber":"+200","content":"x","timestamp":1714557600000}"#,
            RECEIVED_AT,
        )
        .expect("frame should decode");
        assert_eq!(record.timestamp_ms, 1_714_557_600_000);
        assert_eq!(record.id, None);
    }

    #[test]
    fn rejects_non_json_and_incomplete_records() {
        let err = decode_message_record("not json", RECEIVED_AT).expect_err("must fail");
        assert_eq!(err.category, ChatErrorCategory::Malformed);

        let err = decode_message_record(r#"{"sender":"+100","content":"x"}"#, RECEIVED_AT)
            .expect_err("missing recipient must fail");
        assert_eq!(err.code, "malformed_frame");

        let err = decode_message_record(r#"[1,2,3]"#, RECEIVED_AT).expect_err("array must fail");
        assert_eq!(err.code, "malformed_frame");
    }

    #[test]
    fn history_skips_undecodable_entries() {
        let values = vec![
            serde_json::json!({"id": 1, "senderPhoneNumber": "+100", "recipientPhoneNumber": "+200", "content": "a"}),
            serde_json::json!({"id": 2, "content": "orphan"}),
            serde_json::json!("garbage"),
        ];
        let records = normalize_history_records(values, RECEIVED_AT);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id.as_deref(), Some("1"));
    }

    #[test]
    fn zone_less_timestamps_are_local_time() {
        let record = decode_message_record(
            r#"{"sender":"+100","recipient":"+200","content":"x","timeStamp":"2024-05-01T17:00:00"}"#,
            RECEIVED_AT,
        )
        .expect("frame should decode");

        let expected = NaiveDateTime::parse_from_str("2024-05-01 17:00:00", "%Y-%m-%d %H:%M:%S")
            .expect("fixture should parse")
            .and_local_timezone(Local)
            .earliest()
            .expect("fixture is not inside a DST gap")
            .timestamp_millis();
        assert_eq!(record.timestamp_ms, expected as u64);

        let record = decode_message_record(
            r#"{"sender":"+100","recipient":"+200","content":"x","timeStamp":"2024-05-01T17:00:00Z"}"#,
            RECEIVED_AT,
        )
        .expect("frame should decode");
        assert_eq!(record.timestamp_ms, 1_714_582_800_000);
    }

    #[test]
    fn publish_failure_maps_to_send_failed_event() {
        let event = normalize_send_failure(
            Some("corr-1".into()),
            ChatError::not_connected("publish"),
        );
        assert_eq!(
            event,
            ChatEvent::SendFailed {
                correlation_id: Some("corr-1".into()),
                code: "not_connected".into(),
            }
        );
    }
}
