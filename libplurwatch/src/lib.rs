//! Plurwatch - resilient platform calls and mention polling
//!
//! This library wraps outbound calls to rate-limited social platforms with
//! error classification, per-kind retry policies and per-platform circuit
//! breakers, and drives incremental, rate-limited mention polling on top of
//! that.

pub mod circuit_breaker;
pub mod classifier;
pub mod config;
pub mod credentials;
pub mod cursor;
pub mod db;
pub mod error;
pub mod executor;
pub mod health;
pub mod journal;
pub mod logging;
pub mod platforms;
pub mod policy;
pub mod polling;
pub mod rate_limiter;
pub mod types;

// Re-export commonly used types
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use classifier::{Classification, ErrorClassifier, ErrorKind, RuleClassifier, Severity};
pub use config::Config;
pub use cursor::PollCursorStore;
pub use db::Database;
pub use error::{PlatformError, PlurwatchError, Result};
pub use executor::{CallContext, RetryExecutor};
pub use health::HealthStatus;
pub use journal::{ErrorContext, ErrorJournal};
pub use policy::{BackoffStrategy, RetryPolicy, RetryPolicyTable};
pub use polling::PollingOrchestrator;
pub use rate_limiter::{DistributedRateLimiter, RateLimitConfig};
pub use types::{Connection, Mention, PollOutcome, PollResult, PollSummary};
