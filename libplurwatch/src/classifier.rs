//! Failure classification for platform calls
//!
//! Every failed attempt is mapped to an [`ErrorKind`] (which drives the retry
//! policy) and a [`Severity`] (informational, surfaced in health reports).
//!
//! Matching order:
//!
//! 1. HTTP status, when the failure carries one
//! 2. The structured [`PlatformError`] variant, then substrings of the message
//! 3. Platform-specific overrides, which win regardless of status
//! 4. `Unknown`/`Medium`
//!
//! The substring rules live behind the [`ErrorClassifier`] trait so they can
//! be replaced by structured error codes without touching the executor.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{PlatformError, PlurwatchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Authentication,
    Network,
    ApiError,
    ContentValidation,
    QuotaExceeded,
    TemporaryFailure,
    PermanentFailure,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::RateLimit,
        ErrorKind::Authentication,
        ErrorKind::Network,
        ErrorKind::ApiError,
        ErrorKind::ContentValidation,
        ErrorKind::QuotaExceeded,
        ErrorKind::TemporaryFailure,
        ErrorKind::PermanentFailure,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Network => "network",
            ErrorKind::ApiError => "api_error",
            ErrorKind::ContentValidation => "content_validation",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::TemporaryFailure => "temporary_failure",
            ErrorKind::PermanentFailure => "permanent_failure",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        ErrorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("Unknown error kind: '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Kind and severity assigned to one failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub severity: Severity,
}

impl Classification {
    pub const fn new(kind: ErrorKind, severity: Severity) -> Self {
        Self { kind, severity }
    }

    pub const UNKNOWN: Classification = Classification::new(ErrorKind::Unknown, Severity::Medium);
}

/// Maps a failed call on a platform to a [`Classification`].
///
/// Implementations must be pure and must never panic: the executor calls
/// this on every failed attempt.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, platform: &str, error: &PlurwatchError) -> Classification;
}

const RATE_LIMIT: Classification = Classification::new(ErrorKind::RateLimit, Severity::High);
const AUTHENTICATION: Classification =
    Classification::new(ErrorKind::Authentication, Severity::Critical);
const NETWORK: Classification = Classification::new(ErrorKind::Network, Severity::Medium);
const CONTENT_VALIDATION: Classification =
    Classification::new(ErrorKind::ContentValidation, Severity::Low);
const QUOTA: Classification = Classification::new(ErrorKind::QuotaExceeded, Severity::High);
const TEMPORARY: Classification =
    Classification::new(ErrorKind::TemporaryFailure, Severity::Medium);
const API_ERROR: Classification = Classification::new(ErrorKind::ApiError, Severity::Medium);
const PERMANENT: Classification =
    Classification::new(ErrorKind::PermanentFailure, Severity::High);

/// Classify by HTTP status code alone
pub fn classify_status(status: u16) -> Option<Classification> {
    match status {
        429 => Some(RATE_LIMIT),
        401 | 403 => Some(AUTHENTICATION),
        400 | 422 => Some(CONTENT_VALIDATION),
        500..=599 => Some(TEMPORARY),
        400..=499 => Some(API_ERROR),
        _ => None,
    }
}

/// Classify by substrings of a lowercased error message
pub fn classify_message(message: &str) -> Option<Classification> {
    let matches_any = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

    if matches_any(&["rate limit", "too many requests"]) {
        Some(RATE_LIMIT)
    } else if matches_any(&["timeout", "timed out", "connection", "network", "dns"]) {
        Some(NETWORK)
    } else if matches_any(&["unauthorized", "expired", "invalid token"]) {
        Some(AUTHENTICATION)
    } else if matches_any(&["quota", "limit exceeded"]) {
        Some(QUOTA)
    } else {
        None
    }
}

fn classify_variant(error: &PlatformError) -> Option<Classification> {
    match error {
        PlatformError::RateLimit(_) => Some(RATE_LIMIT),
        PlatformError::Authentication(_) => Some(AUTHENTICATION),
        PlatformError::Network(_) => Some(NETWORK),
        PlatformError::Validation(_) => Some(CONTENT_VALIDATION),
        PlatformError::Quota(_) => Some(QUOTA),
        PlatformError::Permanent(_) => Some(PERMANENT),
        PlatformError::Http { .. } | PlatformError::Api(_) => None,
    }
}

#[derive(Debug, Clone)]
struct Override {
    needle: String,
    classification: Classification,
}

/// Rule-based classifier: status codes, error variants, message substrings
/// and per-platform overrides.
#[derive(Debug, Clone)]
pub struct RuleClassifier {
    /// Overrides checked for every platform
    common: Vec<Override>,
    /// Overrides keyed by lowercase platform name
    platforms: HashMap<String, Vec<Override>>,
}

impl Default for RuleClassifier {
    fn default() -> Self {
        Self::empty()
            .with_common_override("duplicate content", CONTENT_VALIDATION)
            .with_common_override("not found", CONTENT_VALIDATION)
            .with_override("nostr", "duplicate:", CONTENT_VALIDATION)
            .with_override("nostr", "blocked:", CONTENT_VALIDATION)
            .with_override("mastodon", "has already been taken", CONTENT_VALIDATION)
            .with_override("bluesky", "record already exists", CONTENT_VALIDATION)
            .with_override("bluesky", "duplicate post", CONTENT_VALIDATION)
    }
}

impl RuleClassifier {
    /// A classifier with no overrides at all
    pub fn empty() -> Self {
        Self {
            common: Vec::new(),
            platforms: HashMap::new(),
        }
    }

    /// Add an override applied to every platform
    pub fn with_common_override(mut self, needle: &str, classification: Classification) -> Self {
        self.common.push(Override {
            needle: needle.to_lowercase(),
            classification,
        });
        self
    }

    /// Add an override applied only to `platform`
    pub fn with_override(
        mut self,
        platform: &str,
        needle: &str,
        classification: Classification,
    ) -> Self {
        self.platforms
            .entry(platform.to_lowercase())
            .or_default()
            .push(Override {
                needle: needle.to_lowercase(),
                classification,
            });
        self
    }

    fn override_for(&self, platform: &str, message: &str) -> Option<Classification> {
        let specific = self
            .platforms
            .get(&platform.to_lowercase())
            .into_iter()
            .flatten();

        specific
            .chain(self.common.iter())
            .find(|o| message.contains(&o.needle))
            .map(|o| o.classification)
    }
}

impl ErrorClassifier for RuleClassifier {
    fn classify(&self, platform: &str, error: &PlurwatchError) -> Classification {
        let error = error.root();
        let message = error.to_string().to_lowercase();

        let base = match error {
            PlurwatchError::Platform(platform_error) => platform_error
                .status()
                .and_then(classify_status)
                .or_else(|| classify_variant(platform_error)),
            _ => None,
        }
        .or_else(|| classify_message(&message));

        if let Some(overridden) = self.override_for(platform, &message) {
            return overridden;
        }

        base.unwrap_or(Classification::UNKNOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(platform: &str, error: PlatformError) -> Classification {
        RuleClassifier::default().classify(platform, &error.into())
    }

    fn http(status: u16, message: &str) -> PlatformError {
        PlatformError::Http {
            status,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(classify("mastodon", http(429, "Slow down")), RATE_LIMIT);
        assert_eq!(classify("mastodon", http(401, "Nope")), AUTHENTICATION);
        assert_eq!(classify("mastodon", http(403, "Forbidden")), AUTHENTICATION);
        assert_eq!(classify("mastodon", http(400, "Bad Request")), CONTENT_VALIDATION);
        assert_eq!(classify("mastodon", http(422, "Unprocessable")), CONTENT_VALIDATION);
        assert_eq!(classify("mastodon", http(502, "Bad Gateway")), TEMPORARY);
        assert_eq!(classify("mastodon", http(410, "Gone")), API_ERROR);
    }

    #[test]
    fn test_status_wins_over_message() {
        // The message mentions a timeout, but the status says rate limit
        assert_eq!(
            classify("mastodon", http(429, "gateway timeout upstream")),
            RATE_LIMIT
        );
    }

    #[test]
    fn test_structured_variants() {
        assert_eq!(
            classify("nostr", PlatformError::RateLimit("x".to_string())),
            RATE_LIMIT
        );
        assert_eq!(
            classify("nostr", PlatformError::Authentication("x".to_string())),
            AUTHENTICATION
        );
        assert_eq!(
            classify("nostr", PlatformError::Network("x".to_string())),
            NETWORK
        );
        assert_eq!(
            classify("nostr", PlatformError::Validation("x".to_string())),
            CONTENT_VALIDATION
        );
        assert_eq!(
            classify("nostr", PlatformError::Quota("x".to_string())),
            QUOTA
        );
        assert_eq!(
            classify("nostr", PlatformError::Permanent("x".to_string())),
            PERMANENT
        );
    }

    #[test]
    fn test_message_heuristics() {
        let api = |m: &str| classify("bluesky", PlatformError::Api(m.to_string()));

        assert_eq!(api("Too Many Requests"), RATE_LIMIT);
        assert_eq!(api("request timeout after 30s"), NETWORK);
        assert_eq!(api("Connection reset by peer"), NETWORK);
        assert_eq!(api("DNS lookup failed"), NETWORK);
        assert_eq!(api("token expired"), AUTHENTICATION);
        assert_eq!(api("Invalid token supplied"), AUTHENTICATION);
        assert_eq!(api("monthly quota reached"), QUOTA);
        assert_eq!(api("daily limit exceeded"), QUOTA);
    }

    #[test]
    fn test_rate_limit_checked_before_quota() {
        let api = |m: &str| classify("bluesky", PlatformError::Api(m.to_string()));
        assert_eq!(api("rate limit exceeded"), RATE_LIMIT);
    }

    #[test]
    fn test_common_overrides_win_regardless_of_status() {
        assert_eq!(
            classify("mastodon", http(404, "Not Found")),
            CONTENT_VALIDATION
        );
        assert_eq!(
            classify("bluesky", http(500, "duplicate content detected")),
            CONTENT_VALIDATION
        );
    }

    #[test]
    fn test_platform_specific_overrides() {
        let relay_reply = PlatformError::Api("duplicate: already have this event".to_string());
        assert_eq!(classify("nostr", relay_reply.clone()), CONTENT_VALIDATION);
        // Only nostr relays speak this dialect
        assert_eq!(classify("mastodon", relay_reply), Classification::UNKNOWN);

        assert_eq!(
            classify("Mastodon", http(422, "Validation failed: Text has already been taken")),
            CONTENT_VALIDATION
        );
    }

    #[test]
    fn test_custom_override() {
        let classifier = RuleClassifier::empty().with_override(
            "mastodon",
            "account suspended",
            PERMANENT,
        );
        let error = PlatformError::Http {
            status: 403,
            message: "Account suspended".to_string(),
        };
        assert_eq!(classifier.classify("mastodon", &error.into()), PERMANENT);
    }

    #[test]
    fn test_default_is_unknown_medium() {
        assert_eq!(
            classify("ssb", PlatformError::Api("something odd".to_string())),
            Classification::UNKNOWN
        );
        let error = PlurwatchError::InvalidInput("weird".to_string());
        assert_eq!(
            RuleClassifier::default().classify("ssb", &error),
            Classification::UNKNOWN
        );
    }

    #[test]
    fn test_non_platform_errors_use_message() {
        let error = PlurwatchError::InvalidInput("connection string malformed".to_string());
        assert_eq!(RuleClassifier::default().classify("ssb", &error), NETWORK);
    }

    #[test]
    fn test_classified_wrapper_is_transparent() {
        let inner: PlurwatchError = http(429, "later").into();
        let wrapped = inner.classified("mastodon", "post", Classification::UNKNOWN, 3);
        assert_eq!(
            RuleClassifier::default().classify("mastodon", &wrapped),
            RATE_LIMIT
        );
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = RuleClassifier::default();
        let error: PlurwatchError = PlatformError::Api("connection refused".to_string()).into();
        let first = classifier.classify("mastodon", &error);
        for _ in 0..10 {
            assert_eq!(classifier.classify("mastodon", &error), first);
        }
    }

    #[test]
    fn test_error_kind_round_trips_through_str() {
        for kind in ErrorKind::ALL {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
        assert_eq!("Rate-Limit".parse::<ErrorKind>().unwrap(), ErrorKind::RateLimit);
        assert!("bogus".parse::<ErrorKind>().is_err());
    }
}
