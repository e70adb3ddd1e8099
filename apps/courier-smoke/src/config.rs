//! Environment-backed configuration for `courier-smoke`.

use std::{env, time::Duration};

use courier_core::DEFAULT_ECHO_WINDOW_MS;
use courier_stomp::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HISTORY_PAGE_SIZE, DEFAULT_INBOUND_QUEUE_CAPACITY,
    DEFAULT_RECONNECT_DELAY, RuntimeConfig,
};
use thiserror::Error;
use url::Url;

const DEFAULT_BROKER_URL: &str = "ws://localhost:8080/ws";
const DEFAULT_REST_URL: &str = "http://localhost:8080/api";

/// Smoke run configuration.
#[derive(Debug, Clone)]
pub struct SmokeConfig {
    pub runtime: RuntimeConfig,
    /// Conversation to open after connecting.
    pub counterpart: Option<String>,
    /// Text to send to `counterpart` once its history is loaded.
    pub send_text: Option<String>,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let broker_url = parse_url("COURIER_BROKER_URL", DEFAULT_BROKER_URL, &["ws", "wss"], &mut lookup)?;
        let rest_base_url = parse_url("COURIER_REST_URL", DEFAULT_REST_URL, &["http", "https"], &mut lookup)?;
        let credential = required_env("COURIER_TOKEN", &mut lookup)?;
        let local_user = required_env("COURIER_USER", &mut lookup)?;

        let reconnect_delay_ms = parse_optional_u64_with_default(
            "COURIER_RECONNECT_DELAY_MS",
            DEFAULT_RECONNECT_DELAY.as_millis() as u64,
            &mut lookup,
        )?;
        let heartbeat_ms = parse_optional_u64_with_default(
            "COURIER_HEARTBEAT_MS",
            DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            &mut lookup,
        )?;
        let history_page_size = parse_optional_u16_with_default(
            "COURIER_HISTORY_PAGE_SIZE",
            DEFAULT_HISTORY_PAGE_SIZE,
            &mut lookup,
        )?;
        let echo_window_ms = parse_optional_u64_with_default(
            "COURIER_ECHO_WINDOW_MS",
            DEFAULT_ECHO_WINDOW_MS,
            &mut lookup,
        )?;

        if reconnect_delay_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "COURIER_RECONNECT_DELAY_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if history_page_size == 0 || history_page_size > 100 {
            return Err(ConfigError::InvalidValue {
                key: "COURIER_HISTORY_PAGE_SIZE",
                value: history_page_size.to_string(),
                reason: "must be between 1 and 100".to_owned(),
            });
        }

        let counterpart = optional_trimmed_env("COURIER_COUNTERPART", &mut lookup);
        let send_text = optional_trimmed_env("COURIER_SEND_TEXT", &mut lookup);
        if send_text.is_some() && counterpart.is_none() {
            return Err(ConfigError::Missing {
                key: "COURIER_COUNTERPART",
            });
        }

        let mut runtime = RuntimeConfig::new(broker_url, rest_base_url, credential, local_user);
        runtime.reconnect_delay = Duration::from_millis(reconnect_delay_ms);
        runtime.heartbeat_interval = Duration::from_millis(heartbeat_ms);
        runtime.history_page_size = history_page_size;
        runtime.echo_window_ms = echo_window_ms;
        runtime.inbound_queue_capacity = DEFAULT_INBOUND_QUEUE_CAPACITY;

        Ok(Self {
            runtime,
            counterpart,
            send_text,
        })
    }
}

/// Errors produced while parsing smoke configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required {key}")]
    Missing { key: &'static str },
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required_env<F>(key: &'static str, lookup: &mut F) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed_env(key, lookup).ok_or(ConfigError::Missing { key })
}

fn parse_url<F>(
    key: &'static str,
    default: &str,
    schemes: &[&str],
    lookup: &mut F,
) -> Result<Url, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let value = optional_trimmed_env(key, lookup).unwrap_or_else(|| default.to_owned());
    let url = Url::parse(&value).map_err(|err| ConfigError::InvalidValue {
        key,
        value: value.clone(),
        reason: err.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidValue {
            key,
            value,
            reason: format!("scheme must be one of {}", schemes.join(", ")),
        });
    }
    Ok(url)
}

fn parse_optional_u16_with_default<F>(
    key: &'static str,
    default: u16,
    lookup: &mut F,
) -> Result<u16, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<u16>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64_with_default<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SmokeConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SmokeConfig::from_lookup(|key| map.get(key).cloned())
    }

    const CREDENTIALS: [(&str, &str); 2] = [("COURIER_TOKEN", "tok"), ("COURIER_USER", "+100")];

    #[test]
    fn parses_required_fields_and_defaults() {
        let cfg = config_from_pairs(&CREDENTIALS).expect("config should parse");

        assert_eq!(cfg.runtime.broker_url.as_str(), DEFAULT_BROKER_URL);
        assert_eq!(cfg.runtime.rest_base_url.as_str(), DEFAULT_REST_URL);
        assert_eq!(cfg.runtime.credential, "tok");
        assert_eq!(cfg.runtime.local_user, "+100");
        assert_eq!(cfg.runtime.reconnect_delay, Duration::from_millis(5_000));
        assert_eq!(cfg.runtime.heartbeat_interval, Duration::from_millis(4_000));
        assert_eq!(cfg.runtime.history_page_size, 50);
        assert_eq!(cfg.runtime.echo_window_ms, 3_000);
        assert_eq!(cfg.counterpart, None);
    }

    #[test]
    fn token_and_user_are_required() {
        assert_eq!(
            config_from_pairs(&[("COURIER_USER", "+100")]).expect_err("token is required"),
            ConfigError::Missing {
                key: "COURIER_TOKEN"
            }
        );
        assert_eq!(
            config_from_pairs(&[("COURIER_TOKEN", "tok"), ("COURIER_USER", "  ")])
                .expect_err("blank user is missing"),
            ConfigError::Missing { key: "COURIER_USER" }
        );
    }

    #[test]
    fn parses_tuning_overrides() {
        let mut pairs = CREDENTIALS.to_vec();
        pairs.extend([
            ("COURIER_BROKER_URL", "wss://chat.example.org/ws"),
            ("COURIER_RECONNECT_DELAY_MS", "250"),
            ("COURIER_HEARTBEAT_MS", "0"),
            ("COURIER_HISTORY_PAGE_SIZE", "20"),
            ("COURIER_ECHO_WINDOW_MS", "1500"),
            ("COURIER_COUNTERPART", "+200"),
            ("COURIER_SEND_TEXT", "hello"),
        ]);

        let cfg = config_from_pairs(&pairs).expect("config should parse");

        assert_eq!(cfg.runtime.broker_url.scheme(), "wss");
        assert_eq!(cfg.runtime.reconnect_delay, Duration::from_millis(250));
        assert!(cfg.runtime.heartbeat_interval.is_zero());
        assert_eq!(cfg.runtime.history_page_size, 20);
        assert_eq!(cfg.runtime.echo_window_ms, 1_500);
        assert_eq!(cfg.counterpart.as_deref(), Some("+200"));
        assert_eq!(cfg.send_text.as_deref(), Some("hello"));
    }

    #[test]
    fn rejects_wrong_url_scheme() {
        let mut pairs = CREDENTIALS.to_vec();
        pairs.push(("COURIER_BROKER_URL", "http://chat.example.org/ws"));

        let err = config_from_pairs(&pairs).expect_err("http broker url must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "COURIER_BROKER_URL",
                ..
            }
        ));
    }

    #[test]
    fn rejects_invalid_numbers() {
        let mut pairs = CREDENTIALS.to_vec();
        pairs.push(("COURIER_HISTORY_PAGE_SIZE", "0"));
        let err = config_from_pairs(&pairs).expect_err("zero page size must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "COURIER_HISTORY_PAGE_SIZE",
                ..
            }
        ));

        let mut pairs = CREDENTIALS.to_vec();
        pairs.push(("COURIER_RECONNECT_DELAY_MS", "soon"));
        let err = config_from_pairs(&pairs).expect_err("non-numeric delay must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "COURIER_RECONNECT_DELAY_MS",
                ..
            }
        ));
    }

    #[test]
    fn send_text_needs_a_counterpart() {
        let mut pairs = CREDENTIALS.to_vec();
        pairs.push(("COURIER_SEND_TEXT", "hello"));
        assert_eq!(
            config_from_pairs(&pairs).expect_err("send text without counterpart must fail"),
            ConfigError::Missing {
                key: "COURIER_COUNTERPART"
            }
        );
    }
}
