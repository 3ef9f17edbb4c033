//! Tracing subscriber setup for the `pipewright` binary.
//!
//! Log lines go to stderr so the run summary on stdout stays parseable.
//! `RUST_LOG` overrides the default filter.

use std::str::FromStr;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::errors::PipewrightError;

/// Output format of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable single lines.
    #[default]
    Plain,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = PipewrightError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "plain" | "text" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            other => Err(PipewrightError::Config(format!(
                "unknown log format '{other}', expected 'plain' or 'json'"
            ))),
        }
    }
}

/// Installs the global subscriber.
///
/// `default_filter` applies when `RUST_LOG` is unset, e.g. `"info"` or
/// `"pipewright=debug"`.
pub fn init_tracing(format: LogFormat, default_filter: &str) -> Result<(), PipewrightError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| PipewrightError::Config(format!("invalid log filter: {e}")))?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Plain => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    result.map_err(|e| PipewrightError::Internal(format!("tracing already initialised: {e}")))
}
