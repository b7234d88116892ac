//! Logging setup
//!
//! The resolver logs through `tracing`. Applications that do not install their
//! own subscriber can call [`init`], which reads:
//!
//! - `SIGNPOST_LOG_LEVEL=trace|debug|info|warn|error|off` - minimum level
//! - `SIGNPOST_LOG_FORMAT=pretty|compact|json` - output format
//! - `SIGNPOST_LOG_COLOR=1|0` - enable/disable ANSI colors
//!
//! `RUST_LOG` overrides the level when set.

use std::env;
use std::str::FromStr;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Filter directive, e.g. `info` or `signpost_discovery=debug`
    pub level: String,
    pub format: LogFormat,
    pub color: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            color: false,
        }
    }
}

impl LogSettings {
    /// Read settings from `SIGNPOST_LOG_*` variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let level = lookup("SIGNPOST_LOG_LEVEL")
            .map(|s| s.to_lowercase())
            .filter(|s| matches!(s.as_str(), "trace" | "debug" | "info" | "warn" | "error" | "off"))
            .unwrap_or(defaults.level);

        let format = lookup("SIGNPOST_LOG_FORMAT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.format);

        let color = lookup("SIGNPOST_LOG_COLOR")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(format != LogFormat::Json && lookup("NO_COLOR").is_none());

        Self { level, format, color }
    }
}

/// Install a global subscriber built from the environment.
///
/// Returns `false` if a subscriber was already installed.
pub fn init() -> bool {
    init_with(&LogSettings::from_env())
}

/// Install a global subscriber built from `settings`
pub fn init_with(settings: &LogSettings) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match settings.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_ansi(settings.color))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_ansi(settings.color))
            .try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };

    installed.is_ok()
}
