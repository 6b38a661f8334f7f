//! Logging integration for quarry.
//!
//! Provides helpers for configuring [`tracing`]-based logging from
//! [`Settings`](crate::settings::Settings) and for creating the span each
//! query runs in.

use crate::settings::Settings;

/// Sets up the global tracing subscriber based on the given settings.
///
/// The filter is read from `settings.log_level` (e.g. "debug", "info",
/// "quarry_db=trace"). In debug mode a pretty, human-readable format is used;
/// otherwise a structured JSON format is used. If a subscriber is already
/// installed this is a no-op.
pub fn setup_logging(settings: &Settings) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if settings.debug {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .pretty()
            .try_init()
            .ok();
    } else {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init()
            .ok();
    }
}

/// Creates a tracing span for one terminal query operation.
///
/// # Examples
///
/// ```
/// use quarry_core::logging::query_span;
///
/// let span = query_span("Todo", "all");
/// let _guard = span.enter();
/// tracing::debug!("compiling");
/// ```
pub fn query_span(model: &str, operation: &str) -> tracing::Span {
    tracing::debug_span!("query", model = model, op = operation)
}
