//! Logging setup.
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! embedding application's call. [`init_tracing`] is provided for binaries
//! and tests that want the standard setup.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::errors::PipewrightError;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Plain,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = PipewrightError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "text" | "pretty" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            other => Err(PipewrightError::Config(format!("unknown log format '{other}'"))),
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs a global subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns `false` if a subscriber was already installed, in which case
/// nothing changes.
pub fn init_tracing(format: LogFormat) -> bool {
    let layer = match format {
        LogFormat::Plain => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter())
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_filter(env_filter())
            .boxed(),
    };
    tracing_subscriber::registry().with(layer).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("plain".parse::<LogFormat>().unwrap(), LogFormat::Plain);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        init_tracing(LogFormat::Plain);
        assert!(!init_tracing(LogFormat::Json));
    }
}
