//! Tracing bootstrap for the smoke binary. Output goes to stderr.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,courier_smoke=debug,courier_stomp=debug,courier_core=info";

/// Line format selected with `COURIER_LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(format) if format.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Compact,
        }
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    let lookup = |key: &str| env::var(key).ok();
    let directives = filter_directives(lookup);
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    let _ = match LogFormat::parse(lookup("COURIER_LOG_FORMAT").as_deref()) {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
}

/// First usable filter of `RUST_LOG`, then `COURIER_LOG`, then the default.
fn filter_directives<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ["RUST_LOG", "COURIER_LOG"]
        .into_iter()
        .filter_map(&lookup)
        .map(|value| value.trim().to_owned())
        .find(|value| !value.is_empty() && EnvFilter::try_new(value).is_ok())
        .unwrap_or_else(|| DEFAULT_FILTER.to_owned())
}
