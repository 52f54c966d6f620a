//! Logging setup.
//!
//! stdout is reserved for the run summary or JSON report; every log line
//! goes to stderr, human-readable by default or one JSON object per line.

use std::io::IsTerminal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::ENV_LOG;

/// Filter used when neither `DEVICE_HARNESS_LOG` nor `RUST_LOG` is set
pub const DEFAULT_FILTER: &str = "device_harness=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// Pick the filter directive: our own variable first, then `RUST_LOG`.
pub fn filter_directive<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    [ENV_LOG, "RUST_LOG"]
        .iter()
        .filter_map(|key| lookup(*key))
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Initialize the global subscriber. Later calls are no-ops.
pub fn init_logging(format: LogFormat) {
    let directive = filter_directive(|key| std::env::var(key).ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let result = match format {
        LogFormat::Human => {
            let use_ansi = std::io::stderr().is_terminal();
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(false)
                        .with_ansi(use_ansi),
                )
                .try_init()
        }
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(false),
            )
            .try_init(),
    };

    if let Err(err) = result {
        eprintln!("Warning: logging already initialized: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_filter_precedence() {
        assert_eq!(filter_directive(lookup(&[])), DEFAULT_FILTER);
        assert_eq!(filter_directive(lookup(&[("RUST_LOG", "debug")])), "debug");
        assert_eq!(
            filter_directive(lookup(&[("RUST_LOG", "debug"), (ENV_LOG, "device_harness=trace")])),
            "device_harness=trace"
        );
        assert_eq!(filter_directive(lookup(&[(ENV_LOG, " "), ("RUST_LOG", "warn")])), "warn");
    }
}
