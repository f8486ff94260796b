//! Structured logging bootstrap.
//!
//! A `tracing-subscriber` registry with an env-filter and a choice of human
//! or JSON output, trimmed to the two formats this crate's CLI binary
//! actually exposes. No `tracing-log` compatibility layer is installed —
//! the `env_logger` boot line and the `tracing` subscriber run side by
//! side rather than bridged.

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable, ANSI-colored (development).
    Pretty,
    /// Structured JSON (production / log aggregation).
    Json,
}

/// Tracing bootstrap options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Minimum level to emit absent an explicit `RUST_LOG` override.
    pub level: Level,
    /// Output format.
    pub format: OutputFormat,
    /// Whether span enter/exit/close events are emitted.
    pub with_span_events: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
        }
    }
}

/// Installs the global tracing subscriber. Must be called once, before any
/// scheduler component is constructed.
pub fn init(config: &TracingConfig) -> Result<(), anyhow::Error> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    let span_events = if config.with_span_events {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.format {
        OutputFormat::Pretty => {
            registry
                .with(
                    fmt::layer()
                        .with_span_events(span_events)
                        .with_target(true),
                )
                .try_init()?;
        }
        OutputFormat::Json => {
            registry
                .with(fmt::layer().json().with_span_events(span_events))
                .try_init()?;
        }
    }
    Ok(())
}
