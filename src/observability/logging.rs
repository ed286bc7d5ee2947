//! Structured logging configuration.

use crate::config::LoggingSettings;
use chrono::NaiveDate;
use std::path::PathBuf;

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Parses a format name; anything but `json` is pretty.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Subscriber configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// `EnvFilter` directive.
    pub filter: String,
    /// Log file, with `{date}` already expanded.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            filter: "info".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Builds logging configuration from config settings with env overrides.
    ///
    /// The filter comes from `STOWAGE_LOG`, then `RUST_LOG`, then `debug` when
    /// `verbose`, then the configured level, then `info`.
    #[must_use]
    pub fn from_settings(settings: Option<&LoggingSettings>, verbose: bool) -> Self {
        Self::from_settings_with(settings, verbose, |key| std::env::var(key).ok(), today())
    }

    /// Same as [`from_settings`](Self::from_settings) with an injected
    /// environment and date.
    #[must_use]
    pub fn from_settings_with<F>(
        settings: Option<&LoggingSettings>,
        verbose: bool,
        lookup: F,
        date: NaiveDate,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_filter = lookup("STOWAGE_LOG")
            .or_else(|| lookup("RUST_LOG"))
            .filter(|v| !v.trim().is_empty());

        let filter = match (env_filter, verbose) {
            (Some(directive), _) => directive,
            (None, true) => "debug".to_string(),
            (None, false) => settings
                .and_then(|s| s.level.clone())
                .unwrap_or_else(|| "info".to_string()),
        };

        let format = settings
            .and_then(|s| s.format.as_deref())
            .map(LogFormat::parse)
            .unwrap_or_default();

        let file = settings
            .and_then(|s| s.file.as_deref())
            .map(|path| PathBuf::from(expand_date(path, date)));

        Self {
            format,
            filter,
            file,
        }
    }
}

/// Replaces every `{date}` in a path template with `YYYYMMDD`.
#[must_use]
pub fn expand_date(template: &str, date: NaiveDate) -> String {
    template.replace("{date}", &date.format("%Y%m%d").to_string())
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}
