//! Tracing subscriber bootstrap for binaries embedding the engine.

use std::{io, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::{Subscriber, level_filters::LevelFilter};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, MakeWriter},
};

/// Output format of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, colored when writing to a terminal.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Installs the global subscriber writing to stderr. `RUST_LOG` wins over
/// `level` when set.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(level: &str, format: LogFormat) -> bool {
    let builder = fmt::fmt()
        .with_env_filter(build_env_filter(level))
        .with_writer(io::stderr)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    match format {
        LogFormat::Json => builder.json().with_ansi(false).try_init().is_ok(),
        LogFormat::Text => builder.with_ansi(true).try_init().is_ok(),
    }
}

/// Subscriber writing to `writer` at exactly `level`, ignoring `RUST_LOG`.
pub fn subscriber_with_writer<W>(
    level: &str,
    format: LogFormat,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let builder = fmt::fmt()
        .with_max_level(parse_level(level))
        .with_writer(writer)
        .with_target(false)
        .with_ansi(false);

    match format {
        LogFormat::Json => Box::new(builder.json().finish()),
        LogFormat::Text => Box::new(builder.finish()),
    }
}

fn parse_level(level: &str) -> LevelFilter {
    level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO)
}

fn build_env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(parse_level(level).into())
            .from_env_lossy()
    })
}
