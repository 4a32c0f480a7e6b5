//! Logging setup shared by the Plurwatch binaries
//!
//! Logs always go to stderr so stdout stays clean for JSON output.
//!
//! ```no_run
//! use libplurwatch::logging::{LogFormat, LoggingConfig};
//!
//! // Explicit settings
//! LoggingConfig::new(LogFormat::Json, "info".to_string(), false).init();
//!
//! // Or from PLURWATCH_LOG_FORMAT / PLURWATCH_LOG_LEVEL
//! libplurwatch::logging::init_default();
//! ```

use std::str::FromStr;
use tracing_subscriber::EnvFilter;

pub const FORMAT_ENV: &str = "PLURWATCH_LOG_FORMAT";
pub const LEVEL_ENV: &str = "PLURWATCH_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Plain text without colors, for piping and journald
    Text,
    /// One JSON object per line
    Json,
    /// Multi-line with colors, for development
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!(
                "Invalid log format: '{}'. Valid options: text, json, pretty",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
            LogFormat::Pretty => write!(f, "pretty"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
    /// Forces `debug` unless `RUST_LOG` says otherwise
    pub verbose: bool,
}

impl LoggingConfig {
    pub fn new(format: LogFormat, level: String, verbose: bool) -> Self {
        Self {
            format,
            level,
            verbose,
        }
    }

    /// Settings from `PLURWATCH_LOG_FORMAT` and `PLURWATCH_LOG_LEVEL`,
    /// defaulting to text at info level
    pub fn from_env() -> Self {
        let format = std::env::var(FORMAT_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(LogFormat::Text);
        let level = std::env::var(LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
        Self::new(format, level, false)
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn filter(&self) -> EnvFilter {
        let level = if self.verbose { "debug" } else { self.level.as_str() };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    }

    /// Install the global subscriber. Returns false if one was already set.
    pub fn init(&self) -> bool {
        let filter = self.filter();

        let installed = match self.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .flatten_event(true)
                .with_target(true)
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true)
                .try_init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(false)
                .try_init(),
        };

        installed.is_ok()
    }
}

/// Initialize logging from the environment
pub fn init_default() -> bool {
    LoggingConfig::from_env().init()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);

        let err = "xml".parse::<LogFormat>().unwrap_err();
        assert!(err.contains("Invalid log format: 'xml'"));
    }

    #[test]
    fn test_log_format_display_round_trip() {
        for format in [LogFormat::Text, LogFormat::Json, LogFormat::Pretty] {
            assert_eq!(format.to_string().parse::<LogFormat>().unwrap(), format);
        }
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var(FORMAT_ENV, "json");
        std::env::set_var(LEVEL_ENV, "warn");
        let config = LoggingConfig::from_env();
        std::env::remove_var(FORMAT_ENV);
        std::env::remove_var(LEVEL_ENV);

        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "warn");
        assert!(!config.verbose);
    }

    #[test]
    #[serial]
    fn test_from_env_defaults_on_garbage() {
        std::env::set_var(FORMAT_ENV, "yaml");
        std::env::remove_var(LEVEL_ENV);
        let config = LoggingConfig::from_env();
        std::env::remove_var(FORMAT_ENV);

        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_second_init_is_refused() {
        let config = LoggingConfig::new(LogFormat::Text, "error".to_string(), false);
        config.init();
        assert!(!config.init());
    }
}
