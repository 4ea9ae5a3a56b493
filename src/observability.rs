//! Logging for pipeline runs.
//!
//! Events are written to stderr and always carry `component` and `event`
//! fields. Batch runs whose logs are collected should use the JSON format.

use std::env;
use std::io;

use thiserror::Error;
use tracing::dispatcher::{self, Dispatch, SetGlobalDefaultError};
use tracing::info;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

pub const LOG_FILTER_VAR: &str = "CHURN_LOG_LEVEL";
pub const LOG_FORMAT_VAR: &str = "CHURN_LOG_FORMAT";
pub const LOG_TARGET_VAR: &str = "CHURN_LOG_TARGET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Multi-line, colored; for interactive runs.
    Pretty,
    /// Single-line text.
    Compact,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
            Self::Compact => "compact",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            "compact" | "text" => Some(Self::Compact),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `info` or `churnfeat=debug,warn`.
    pub filter: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Compact,
            include_target: false,
        }
    }
}

impl LoggingConfig {
    pub fn env_filter(&self) -> Result<EnvFilter, LoggingInitError> {
        EnvFilter::try_new(&self.filter).map_err(|source| LoggingInitError::InvalidFilter {
            filter: self.filter.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("invalid log filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: ParseError,
    },
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] SetGlobalDefaultError),
}

/// Unset, blank or unparseable variables keep the defaults. The filter is
/// only validated when the subscriber is built.
pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();
    if let Some(filter) = env_value(LOG_FILTER_VAR) {
        config.filter = filter;
    }
    if let Some(format) = env_value(LOG_FORMAT_VAR).and_then(|raw| LogFormat::parse(&raw)) {
        config.format = format;
    }
    if let Some(include_target) = env_bool(LOG_TARGET_VAR) {
        config.include_target = include_target;
    }
    config
}

/// Builds the subscriber for `config` over `make_writer` without installing
/// it, so callers can scope it with `tracing::dispatcher::with_default`.
pub fn logging_dispatch<W>(config: &LoggingConfig, make_writer: W) -> Result<Dispatch, LoggingInitError>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter()?)
        .with_target(config.include_target)
        .with_writer(make_writer);

    let dispatch = match config.format {
        LogFormat::Json => Dispatch::new(builder.with_ansi(false).json().finish()),
        LogFormat::Pretty => Dispatch::new(builder.with_ansi(true).pretty().finish()),
        LogFormat::Compact => Dispatch::new(builder.with_ansi(false).compact().finish()),
    };
    Ok(dispatch)
}

/// Installs the process-wide subscriber writing to stderr and emits
/// `logging.ready`. Fails if a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let dispatch = logging_dispatch(config, io::stderr)?;
    dispatcher::set_global_default(dispatch)?;
    log_logging_ready(config);
    Ok(())
}

/// Baseline event, also for embedders that install their own subscriber.
pub fn log_logging_ready(config: &LoggingConfig) {
    info!(
        component = "churnfeat",
        event = "logging.ready",
        log_filter = %config.filter,
        log_format = config.format.as_str(),
        include_target = config.include_target,
        version = env!("CARGO_PKG_VERSION")
    );
}

/// Trimmed value of `key`; unset and blank are both `None`.
pub(crate) fn env_value(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    env_value(key).and_then(|raw| parse_bool(&raw))
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::with_env_vars;
    use super::*;

    fn logging_env(
        filter: Option<&'static str>,
        format: Option<&'static str>,
        target: Option<&'static str>,
    ) -> LoggingConfig {
        with_env_vars(
            &[
                (LOG_FILTER_VAR, filter),
                (LOG_FORMAT_VAR, format),
                (LOG_TARGET_VAR, target),
            ],
            logging_config_from_env,
        )
    }

    #[test]
    fn batch_defaults_are_compact_info_without_targets() {
        let cfg = logging_env(None, None, None);
        assert_eq!(cfg, LoggingConfig::default());
        assert_eq!(cfg.format, LogFormat::Compact);
        assert!(!cfg.include_target);
    }

    #[test]
    fn reads_filter_format_and_target() {
        let cfg = logging_env(Some(" churnfeat=debug,warn "), Some("JSON"), Some("on"));
        assert_eq!(cfg.filter, "churnfeat=debug,warn");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(cfg.include_target);
        assert!(cfg.env_filter().is_ok());
    }

    #[test]
    fn unusable_values_keep_defaults() {
        let cfg = logging_env(Some("  "), Some("yaml"), Some("maybe"));
        assert_eq!(cfg, LoggingConfig::default());
    }

    #[test]
    fn malformed_filters_are_rejected_when_building() {
        let cfg = LoggingConfig {
            filter: "churnfeat=loud".to_string(),
            ..LoggingConfig::default()
        };
        let err = logging_dispatch(&cfg, io::sink).expect_err("filter should not parse");
        assert!(
            matches!(err, LoggingInitError::InvalidFilter { ref filter, .. } if filter == "churnfeat=loud")
        );
    }

    #[test]
    fn formats_round_trip_through_their_names() {
        for format in [LogFormat::Json, LogFormat::Pretty, LogFormat::Compact] {
            assert_eq!(LogFormat::parse(format.as_str()), Some(format));
        }
        assert_eq!(LogFormat::parse("text"), Some(LogFormat::Compact));
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("2"), None);
    }
}
