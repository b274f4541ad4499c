//! Shared tracing setup for the upbot processes.

use std::env::var;

use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{Layer, filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format selected through `RUST_LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    fn from_env() -> Self {
        match var("RUST_LOG_FORMAT") {
            Ok(value) => Self::parse(&value),
            Err(_) => Self::Compact,
        }
    }

    /// Anything other than `json` falls back to the compact format.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            "" | "compact" | "text" => Self::Compact,
            other => {
                warn!("Unknown RUST_LOG_FORMAT {other:?}, using compact output");
                Self::Compact
            }
        }
    }
}

/// Initialize tracing for a named process at `info` level.
///
/// `RUST_LOG` overrides the level per target, `RUST_LOG_FORMAT=json` switches
/// to structured output.
pub fn init_tracing(process: &str) {
    initialize_tracing(process, LevelFilter::INFO, LogFormat::from_env());
}

fn initialize_tracing(process: &str, level: LevelFilter, format: LogFormat) {
    let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

    let log_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Compact => {
            tracing_subscriber::fmt::layer().compact().with_target(true).with_filter(env_filter).boxed()
        }
    };

    // A second init (tests, embedded use) keeps the first subscriber.
    if tracing_subscriber::registry().with(log_layer).try_init().is_ok() {
        info!(process, ?format, "tracing initialized");
    }
}
