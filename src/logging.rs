//! Logging setup for binaries and tests.
//!
//! Two modes:
//! - Pretty-printed human-readable logs (default)
//! - JSON lines for log aggregation
//!
//! Set `NANO_SPECDEC_LOG_FORMAT=json` for JSON output.
//! Set `RUST_LOG` to control log levels (default: info).
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! up to the embedding program.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Error, Result};

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "NANO_SPECDEC_LOG_FORMAT";

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-printed human-readable logs.
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parse a format name; anything but `json` is pretty.
    pub fn parse(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }

    /// Detect the format from the environment.
    pub fn from_env() -> Self {
        Self::parse(&std::env::var(LOG_FORMAT_ENV).unwrap_or_default())
    }
}

/// Install the global subscriber with the environment's format.
///
/// `level` is used when `RUST_LOG` is unset.
pub fn init(level: &str) -> Result<()> {
    init_with_format(level, LogFormat::from_env())
}

/// Install the global subscriber with an explicit format.
///
/// Fails if a global subscriber is already installed.
pub fn init_with_format(level: &str, format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init(),
    };
    installed.map_err(|e| Error::Config(format!("logging subscriber init failed: {e}")))
}
