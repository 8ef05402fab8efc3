use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::settings::LogSettings;

/// Filter directive in effect: a non-empty `RUST_LOG` wins over the
/// configured level.
pub fn filter_directive(settings: &LogSettings, rust_log: Option<&str>) -> String {
    match rust_log.map(str::trim) {
        Some(directive) if !directive.is_empty() => directive.to_string(),
        _ => settings.level.clone(),
    }
}

/// Install the global subscriber. Call once at startup; later calls are
/// ignored so tests and embedders can call it freely.
pub fn init_logging(settings: &LogSettings) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let directive = filter_directive(settings, rust_log.as_deref());
    let env_filter = EnvFilter::try_new(&directive).unwrap_or_else(|e| {
        eprintln!("invalid log filter {:?}: {}, falling back to info", directive, e);
        EnvFilter::new("info")
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if settings.json {
        registry.with(fmt::layer().json().with_current_span(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };

    if result.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
