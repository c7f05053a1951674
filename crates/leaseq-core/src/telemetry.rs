//! Tracing subscriber setup for binaries embedding the queue.
//!
//! The filter is read from `LEASEQ_LOG` (same syntax as `RUST_LOG`) and
//! defaults to `info`.

use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::filter::{FromEnvError, LevelFilter};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub const LOG_ENV_VAR: &str = "LEASEQ_LOG";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format `{other}`")),
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid LEASEQ_LOG filter: {0}")]
    Filter(#[from] FromEnvError),

    #[error("tracing subscriber already installed: {0}")]
    Init(#[from] TryInitError),
}

fn env_filter() -> Result<EnvFilter, FromEnvError> {
    EnvFilter::builder()
        .with_env_var(LOG_ENV_VAR)
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()
}

/// Install the global subscriber. Fails if one is already set.
pub fn init_tracing(format: LogFormat) -> Result<(), TelemetryError> {
    let builder = FmtSubscriber::builder().with_env_filter(env_filter()?);
    match format {
        LogFormat::Pretty => builder.pretty().finish().try_init()?,
        LogFormat::Compact => builder.compact().finish().try_init()?,
        LogFormat::Json => builder.json().finish().try_init()?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("pretty", LogFormat::Pretty)]
    #[case("JSON", LogFormat::Json)]
    #[case("compact", LogFormat::Compact)]
    fn parses_format(#[case] raw: &str, #[case] expected: LogFormat) {
        assert_eq!(raw.parse::<LogFormat>().unwrap(), expected);
    }

    #[test]
    fn rejects_unknown_format() {
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
