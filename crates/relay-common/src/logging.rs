//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Shared primitives and utilities for the relay services."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
use std::path::Path;

use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "RELAY_LOG";

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Output format of the stdout log stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Install the process-wide subscriber for one relay role.
///
/// Every role (consumer, broadcaster, publisher, transformer) logs to stdout;
/// `logging.directory` adds a daily JSON file named after the role. Calling
/// it twice keeps the first subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = STDOUT_GUARD.set(stdout_guard);

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };
    let file_layer = match &config.directory {
        Some(directory) => Some(role_file_layer(service_name, config, directory)?),
        None => None,
    };

    let installed = tracing_subscriber::registry()
        .with(role_filter(std::env::var(LOG_ENV).ok()))
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    info!(
        service = %service_name,
        format = ?config.format,
        log_dir = ?config.directory,
        installed,
        "relay logging ready"
    );
    Ok(())
}

/// `RELAY_LOG` wins over `RUST_LOG`; an unusable directive falls back to `info`.
fn role_filter(relay_log: Option<String>) -> EnvFilter {
    match relay_log {
        Some(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("ignoring {LOG_ENV}={directive:?} ({err}); logging at info");
            EnvFilter::new("info")
        }),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

fn role_file_layer<S>(
    service_name: &str,
    config: &LoggingConfig,
    directory: &Path,
) -> Result<Box<dyn Layer<S> + Send + Sync>>
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    std::fs::create_dir_all(directory)?;
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
    let appender = daily(directory, format!("{prefix}-{service_name}.log"));
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(file_guard);
    Ok(fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_with_file_directory_creates_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs = dir.path().join("logs");
        let config = LoggingConfig {
            format: LogFormat::Pretty,
            directory: Some(logs.clone()),
            file_prefix: Some("test".into()),
        };
        init_tracing("relay-test", &config).expect("init tracing");
        init_tracing("relay-test", &config).expect("second init is a no-op");
        assert!(logs.is_dir());
    }

    #[test]
    fn unusable_relay_directive_falls_back_to_info() {
        let filter = role_filter(Some("rumqttc=loud".into()));
        assert_eq!(filter.to_string(), "info");

        let filter = role_filter(Some("debug,rumqttc=warn".into()));
        assert!(filter.to_string().contains("rumqttc=warn"));
    }

    #[test]
    fn log_format_uses_kebab_case() {
        let parsed: LoggingConfig = toml::from_str(r#"format = "structured-json""#).expect("parse");
        assert_eq!(parsed.format, LogFormat::StructuredJson);
    }
}
