use std::time::Duration;

use async_trait::async_trait;
use courier_core::{
    ChatError, ChatErrorCategory, MessageRecord, classify_http_status, normalize_history_records,
};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::runtime::now_millis;

pub const DEFAULT_HISTORY_PAGE_SIZE: u16 = 50;
const HISTORY_PAGE_SIZE_CAP: u16 = 100;

/// One page of a private conversation's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub local_user: String,
    pub counterpart: String,
    pub page: u32,
    pub page_size: u16,
}

impl HistoryRequest {
    pub fn first_page(local_user: &str, counterpart: &str, page_size: u16) -> Self {
        Self {
            local_user: local_user.to_owned(),
            counterpart: counterpart.to_owned(),
            page: 0,
            page_size: bounded_page_size(page_size),
        }
    }
}

pub fn bounded_page_size(requested: u16) -> u16 {
    requested.clamp(1, HISTORY_PAGE_SIZE_CAP)
}

/// Request/response history source. Failures are reported, never retried.
#[async_trait]
pub trait HistoryLoader: Send + Sync {
    async fn fetch(&self, request: HistoryRequest) -> Result<Vec<MessageRecord>, ChatError>;
}

/// REST history endpoint authenticated with the session bearer token.
#[derive(Debug, Clone)]
pub struct HttpHistoryLoader {
    client: Client,
    base_url: Url,
    credential: String,
}

impl HttpHistoryLoader {
    pub fn new(base_url: Url, credential: impl Into<String>) -> Result<Self, ChatError> {
        if base_url.cannot_be_a_base() {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "invalid_rest_url",
                format!("'{base_url}' cannot carry a path"),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| {
                ChatError::new(
                    ChatErrorCategory::Config,
                    "http_client_build_failed",
                    err.to_string(),
                )
            })?;
        Ok(Self {
            client,
            base_url,
            credential: credential.into(),
        })
    }

    /// `{base}/chat-history/private/{local}/{counterpart}?page=&size=`
    pub fn history_url(&self, request: &HistoryRequest) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend([
                "chat-history",
                "private",
                request.local_user.as_str(),
                request.counterpart.as_str(),
            ]);
        }
        url.query_pairs_mut()
            .clear()
            .append_pair("page", &request.page.to_string())
            .append_pair("size", &request.page_size.to_string());
        url
    }
}

#[async_trait]
impl HistoryLoader for HttpHistoryLoader {
    async fn fetch(&self, request: HistoryRequest) -> Result<Vec<MessageRecord>, ChatError> {
        let url = self.history_url(&request);
        debug!(%url, "fetching conversation history");

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.credential)
            .send()
            .await
            .map_err(|err| history_error("history_request_failed", err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let code = match classify_http_status(status.as_u16()) {
                ChatErrorCategory::Auth => "history_unauthorized",
                _ => "history_http_error",
            };
            return Err(history_error(
                code,
                format!("history request failed with HTTP {status}"),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|err| history_error("history_read_failed", err.to_string()))?;
        parse_history_body(&body, now_millis())
    }
}

/// Decode a history response: a JSON array of records, or a page object
/// carrying the array under `content`. Any other shape yields an empty page.
pub fn parse_history_body(body: &str, received_at_ms: u64) -> Result<Vec<MessageRecord>, ChatError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| history_error("history_decode_failed", err.to_string()))?;

    let values = match value {
        Value::Array(values) => values,
        Value::Object(mut page) => match page.remove("content") {
            Some(Value::Array(values)) => values,
            _ => {
                warn!("history response object has no content array");
                Vec::new()
            }
        },
        other => {
            warn!(kind = json_kind(&other), "history response is not a list");
            Vec::new()
        }
    };

    Ok(normalize_history_records(values, received_at_ms))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn history_error(code: &str, message: impl Into<String>) -> ChatError {
    ChatError::new(ChatErrorCategory::HistoryFetch, code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader(base: &str) -> HttpHistoryLoader {
        HttpHistoryLoader::new(Url::parse(base).expect("base url should parse"), "tok")
            .expect("loader should build")
    }

    #[test]
    fn page_size_is_bounded() {
        assert_eq!(bounded_page_size(0), 1);
        assert_eq!(bounded_page_size(50), 50);
        assert_eq!(bounded_page_size(500), 100);
        assert_eq!(HistoryRequest::first_page("+100", "+200", 0).page_size, 1);
    }

    #[test]
    fn builds_history_url_under_base_path() {
        let request = HistoryRequest::first_page("+100", "+200", DEFAULT_HISTORY_PAGE_SIZE);

        let with_slash = loader("http://chat.local/api/v1/").history_url(&request);
        let without_slash = loader("http://chat.local/api/v1").history_url(&request);

        assert_eq!(
            with_slash.as_str(),
            "http://chat.local/api/v1/chat-history/private/+100/+200?page=0&size=50"
        );
        assert_eq!(with_slash, without_slash);
    }

    #[test]
    fn rejects_non_hierarchical_base_url() {
        let err = HttpHistoryLoader::new(
            Url::parse("mailto:ops@chat.local").expect("url should parse"),
            "tok",
        )
        .expect_err("mailto base must be rejected");
        assert_eq!(err.code, "invalid_rest_url");
    }

    #[test]
    fn parses_array_with_field_aliases() {
        let body = r#"[
            {"id": 1, "senderPhoneNumber": "+200", "recipientPhoneNumber": "+100",
             "content": "hi", "timestamp": 1000},
            {"id": "2", "sender": "+100", "recipient": "+200",
             "content": "yo", "timeStamp": "2024-05-01T10:00:00"},
            {"id": "3", "content": "no sender"}
        ]"#;

        let records = parse_history_body(body, 5_000).expect("body should parse");

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id.as_deref(), Some("1"));
        assert_eq!(records[0].sender, "+200");
        assert_eq!(records[0].timestamp_ms, 1_000);
        assert_eq!(records[1].timestamp_ms, 1_714_557_600_000);
        assert!(records.iter().all(|record| record.confirmed));
    }

    #[test]
    fn accepts_page_objects_and_tolerates_other_shapes() {
        let page = r#"{"content":[{"id":"1","sender":"+200","recipient":"+100","content":"a"}],"totalPages":1}"#;
        assert_eq!(parse_history_body(page, 0).expect("page should parse").len(), 1);
        assert!(parse_history_body("null", 0).expect("null should parse").is_empty());
        assert!(parse_history_body(r#"{"error":"x"}"#, 0).expect("object should parse").is_empty());
    }

    #[test]
    fn undecodable_body_is_a_history_error() {
        let err = parse_history_body("<html>", 0).expect_err("html must fail");
        assert_eq!(err.category, ChatErrorCategory::HistoryFetch);
        assert_eq!(err.code, "history_decode_failed");
    }
}
