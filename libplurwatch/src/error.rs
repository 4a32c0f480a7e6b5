//! Error types for Plurwatch

use thiserror::Error;

use crate::classifier::{Classification, ErrorKind, Severity};

pub type Result<T> = std::result::Result<T, PlurwatchError>;

#[derive(Error, Debug)]
pub enum PlurwatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The platform's circuit breaker rejected the call before it was made.
    #[error("Circuit breaker open for {platform}: calls suspended until recovery")]
    CircuitOpen { platform: String },

    /// A terminal failure from the retry executor, carrying the classification
    /// it was given so callers don't have to re-derive it.
    #[error("{source} ({kind}/{severity}, {retry_count} retries, {platform}.{operation})")]
    Classified {
        platform: String,
        operation: String,
        kind: ErrorKind,
        severity: Severity,
        retry_count: u32,
        source: Box<PlurwatchError>,
    },
}

impl PlurwatchError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PlurwatchError::InvalidInput(_) => 3,
            PlurwatchError::Platform(PlatformError::Authentication(_)) => 2,
            PlurwatchError::Classified {
                kind: ErrorKind::Authentication,
                ..
            } => 2,
            PlurwatchError::Classified { source, .. } => source.exit_code(),
            PlurwatchError::Platform(_) => 1,
            PlurwatchError::CircuitOpen { .. } => 1,
            PlurwatchError::Config(_) => 1,
            PlurwatchError::Database(_) => 1,
        }
    }

    /// Wrap this error with the classification the executor gave it
    pub fn classified(
        self,
        platform: &str,
        operation: &str,
        classification: Classification,
        retry_count: u32,
    ) -> Self {
        PlurwatchError::Classified {
            platform: platform.to_string(),
            operation: operation.to_string(),
            kind: classification.kind,
            severity: classification.severity,
            retry_count,
            source: Box::new(self),
        }
    }

    /// Classification metadata attached by the retry executor, if any
    pub fn classification(&self) -> Option<(Classification, u32)> {
        match self {
            PlurwatchError::Classified {
                kind,
                severity,
                retry_count,
                ..
            } => Some((Classification::new(*kind, *severity), *retry_count)),
            _ => None,
        }
    }

    /// The underlying error with any classification wrappers removed
    pub fn root(&self) -> &PlurwatchError {
        match self {
            PlurwatchError::Classified { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self.root(), PlurwatchError::CircuitOpen { .. })
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Failures reported by platform clients and fetchers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Quota exhausted: {0}")]
    Quota(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("API error: {0}")]
    Api(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),
}

impl PlatformError {
    /// HTTP status code, when the failure came with one
    pub fn status(&self) -> Option<u16> {
        match self {
            PlatformError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classified(kind: ErrorKind, source: PlurwatchError) -> PlurwatchError {
        source.classified(
            "mastodon",
            "fetch_mentions",
            Classification::new(kind, Severity::High),
            2,
        )
    }

    #[test]
    fn test_exit_code_invalid_input() {
        let error = PlurwatchError::InvalidInput("Unknown connection".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_authentication_error() {
        let error = PlurwatchError::Platform(PlatformError::Authentication(
            "Token revoked".to_string(),
        ));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_classified_authentication() {
        let error = classified(
            ErrorKind::Authentication,
            PlatformError::Http {
                status: 401,
                message: "Unauthorized".to_string(),
            }
            .into(),
        );
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_classified_defers_to_source() {
        let error = classified(
            ErrorKind::ContentValidation,
            PlurwatchError::InvalidInput("bad id".to_string()),
        );
        assert_eq!(error.exit_code(), 3);

        let error = classified(
            ErrorKind::Network,
            PlatformError::Network("reset".to_string()).into(),
        );
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_exit_code_circuit_open() {
        let error = PlurwatchError::CircuitOpen {
            platform: "bluesky".to_string(),
        };
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_exit_code_config_and_database() {
        let config_error = ConfigError::MissingField("database.path".to_string());
        assert_eq!(PlurwatchError::Config(config_error).exit_code(), 1);

        let db_error = DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "File not found",
        ));
        assert_eq!(PlurwatchError::Database(db_error).exit_code(), 1);
    }

    #[test]
    fn test_error_message_formatting_platform() {
        let error = PlurwatchError::Platform(PlatformError::RateLimit(
            "Too many requests".to_string(),
        ));
        assert_eq!(
            error.to_string(),
            "Platform error: Rate limit exceeded: Too many requests"
        );
    }

    #[test]
    fn test_http_error_formatting_and_status() {
        let error = PlatformError::Http {
            status: 503,
            message: "Service Unavailable".to_string(),
        };
        assert_eq!(error.to_string(), "HTTP 503: Service Unavailable");
        assert_eq!(error.status(), Some(503));
        assert_eq!(PlatformError::Network("x".to_string()).status(), None);
    }

    #[test]
    fn test_classified_message_keeps_original_error() {
        let error = classified(
            ErrorKind::RateLimit,
            PlatformError::RateLimit("slow down".to_string()).into(),
        );
        let message = error.to_string();
        assert!(message.contains("Rate limit exceeded: slow down"));
        assert!(message.contains("rate_limit/high"));
        assert!(message.contains("2 retries"));
        assert!(message.contains("mastodon.fetch_mentions"));
    }

    #[test]
    fn test_classification_accessor() {
        let error = classified(
            ErrorKind::Network,
            PlatformError::Network("dns".to_string()).into(),
        );
        let (classification, retries) = error.classification().unwrap();
        assert_eq!(classification.kind, ErrorKind::Network);
        assert_eq!(classification.severity, Severity::High);
        assert_eq!(retries, 2);

        let plain = PlurwatchError::InvalidInput("x".to_string());
        assert!(plain.classification().is_none());
    }

    #[test]
    fn test_root_unwraps_classification() {
        let error = classified(
            ErrorKind::Unknown,
            PlurwatchError::CircuitOpen {
                platform: "nostr".to_string(),
            },
        );
        assert!(matches!(error.root(), PlurwatchError::CircuitOpen { .. }));
        assert!(error.is_circuit_open());
    }

    #[test]
    fn test_source_chain_is_exposed() {
        use std::error::Error as _;

        let error = classified(
            ErrorKind::Network,
            PlatformError::Network("connection refused".to_string()).into(),
        );
        let source = error.source().expect("classified errors expose their source");
        assert!(source.to_string().contains("connection refused"));
    }

    #[test]
    fn test_error_conversion_from_platform_error() {
        let platform_error = PlatformError::Api("boom".to_string());
        let error: PlurwatchError = platform_error.into();
        assert!(matches!(error, PlurwatchError::Platform(_)));
    }

    #[test]
    fn test_platform_error_clone() {
        // Retried operations hand the same scripted error out more than once
        let original = PlatformError::Network("Connection failed".to_string());
        let cloned = original.clone();
        assert_eq!(original, cloned);
    }

    #[test]
    fn test_config_error_invalid_value_formatting() {
        let error = ConfigError::InvalidValue {
            field: "rate_limit.max_requests".to_string(),
            reason: "must be greater than zero".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid value for rate_limit.max_requests: must be greater than zero"
        );
    }
}
