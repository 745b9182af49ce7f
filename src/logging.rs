//! Logging setup.
//!
//! Progress goes through `tracing`, to stderr. Output format comes from
//! config; levels from `RUST_LOG` (default `info`).

use std::io;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event, for log shipping off the worker.
    Json,
    /// Human-readable lines.
    #[default]
    Pretty,
}

/// Initialize the global subscriber. Later calls are no-ops.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(io::stderr))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_target(false).with_writer(io::stderr))
                    .init();
            }
        }
    });
}

/// Span for one pass over the recipe catalog.
#[must_use]
pub fn pass_span(prefix: &str, run_id: &str) -> Span {
    tracing::info_span!("pass", prefix = prefix, run_id = run_id)
}

/// Span for one recipe within a pass.
#[must_use]
pub fn recipe_span(recipe: &str) -> Span {
    tracing::info_span!("recipe", recipe = recipe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn spans_can_be_entered() {
        let span = pass_span("amzn-2023_graviton-3", "run-1");
        let _guard = span.enter();
        let inner = recipe_span("zlib-1.3.eb");
        let _inner = inner.enter();
        tracing::info!("inside recipe span");
    }
}
