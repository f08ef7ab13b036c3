use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::log_format::TargetFirstFormat;

/// Build version from git metadata, falling back to the crate version
pub const VERSION: &str = match option_env!("VERGEN_GIT_DESCRIBE") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};

/// Keeps the Sentry client alive; events are flushed when this is dropped
pub struct TelemetryGuard {
    _sentry: Option<sentry::ClientInitGuard>,
}

/// Logging settings resolved from the command line
#[derive(Debug, Clone, Default)]
pub struct LogSettings<'a> {
    /// Append plain-text logs here instead of the console
    pub log_file: Option<&'a Path>,
    pub sentry_dsn: Option<&'a str>,
    pub environment: Option<&'a str>,
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` controls filtering (default `info`). With a Sentry DSN, error
/// events are also reported to Sentry.
pub fn init(settings: &LogSettings<'_>) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let sentry_guard = settings.sentry_dsn.map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: Some(VERSION.into()),
                environment: settings.environment.map(|e| e.to_string().into()),
                ..Default::default()
            },
        ))
    });

    let fmt_layer = match settings.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            fmt::layer()
                .event_format(TargetFirstFormat::plain())
                .with_writer(Mutex::new(file))
                .boxed()
        }
        None => fmt::layer()
            .event_format(TargetFirstFormat::console())
            .boxed(),
    };

    let sentry_layer = sentry_guard.as_ref().map(|_| sentry_tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(sentry_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    info!("message-log {} starting", VERSION);
    if let Some(path) = settings.log_file {
        info!("Logging to {}", path.display());
    }

    Ok(TelemetryGuard {
        _sentry: sentry_guard,
    })
}
