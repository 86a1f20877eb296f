//! Prefixed logger with log levels, backed by `tracing`.

use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{filter::FilterFn, prelude::*, Layer};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug = 0,
    #[default]
    Info = 1,
    Warn = 2,
    Error = 3,
    None = 4,
}

#[derive(Debug, Clone)]
pub struct Logger {
    level: LogLevel,
    prefix: String,
}

impl Logger {
    pub fn new(level: LogLevel, prefix: impl Into<String>) -> Self {
        Self {
            level,
            prefix: prefix.into(),
        }
    }

    pub fn debug(&self, message: &str) {
        if self.level <= LogLevel::Debug {
            tracing::debug!(target: "bulk_mailer", "{}{}", self.prefix, message);
        }
    }

    pub fn info(&self, message: &str) {
        if self.level <= LogLevel::Info {
            tracing::info!(target: "bulk_mailer", "{}{}", self.prefix, message);
        }
    }

    pub fn warn(&self, message: &str) {
        if self.level <= LogLevel::Warn {
            tracing::warn!(target: "bulk_mailer", "{}{}", self.prefix, message);
        }
    }

    pub fn error(&self, message: &str) {
        if self.level <= LogLevel::Error {
            tracing::error!(target: "bulk_mailer", "{}{}", self.prefix, message);
        }
    }
}

/// Install a global fmt subscriber for this crate's events.
///
/// The level comes from `LOG_LEVEL`, falling back to TRACE in debug builds
/// and INFO otherwise. Calling it twice is harmless.
pub fn init() {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    let level = std::env::var("LOG_LEVEL").map_or(default, |level| {
        LevelFilter::from_str(level.as_str()).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    });

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_ansi(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("bulk_mailer")
                })),
        )
        .try_init();
}
