//! Retry executor for outbound platform calls
//!
//! [`RetryExecutor::execute`] wraps one async platform operation with the
//! circuit breaker, the classifier, the retry policy table and the error
//! journal:
//!
//! 1. An open circuit fails fast with [`PlurwatchError::CircuitOpen`]. If it
//!    opened while retrying, the last failure is returned instead
//! 2. Success is reported to the breaker and returned
//! 3. A failure is classified, journaled and reported to the breaker
//! 4. If the policy allows, the task sleeps for the backoff and retries
//! 5. Otherwise the original error is returned wrapped with its
//!    classification
//!
//! Cancellation is drop-based. Dropping the returned future while it sleeps
//! or while the operation is in flight records nothing against the breaker.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::classifier::{Classification, ErrorClassifier, ErrorKind, RuleClassifier};
use crate::config::Config;
use crate::error::{PlurwatchError, Result};
use crate::health::HealthStatus;
use crate::journal::{ErrorContext, ErrorJournal};
use crate::policy::RetryPolicyTable;

/// Caller identity attached to every [`ErrorContext`] of one call
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub user_id: Option<String>,
    pub content_id: Option<String>,
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl CallContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_content(mut self, content_id: impl Into<String>) -> Self {
        self.content_id = Some(content_id.into());
        self
    }

    pub fn with_extra(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

pub struct RetryExecutor {
    classifier: Arc<dyn ErrorClassifier>,
    policies: RetryPolicyTable,
    breakers: Arc<CircuitBreakerRegistry>,
    journal: Arc<ErrorJournal>,
    summary_window: Duration,
}

impl RetryExecutor {
    /// Create an executor with the rule classifier and default policies
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, journal: Arc<ErrorJournal>) -> Self {
        Self {
            classifier: Arc::new(RuleClassifier::default()),
            policies: RetryPolicyTable::default(),
            breakers,
            journal,
            summary_window: Duration::from_secs(3600),
        }
    }

    /// Build the executor and its registry and journal from configuration
    pub fn from_config(config: &Config) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.to_breaker_config(),
        ));
        let journal = Arc::new(ErrorJournal::new(config.journal.capacity));

        Self::new(breakers, journal)
            .with_policies(RetryPolicyTable::from_overrides(&config.retry))
            .with_summary_window(Duration::from_secs(config.journal.summary_window_secs))
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_policies(mut self, policies: RetryPolicyTable) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_summary_window(mut self, window: Duration) -> Self {
        self.summary_window = window;
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn journal(&self) -> &Arc<ErrorJournal> {
        &self.journal
    }

    pub fn policies(&self) -> &RetryPolicyTable {
        &self.policies
    }

    pub fn is_call_allowed(&self, platform: &str) -> bool {
        self.breakers.is_call_allowed(platform)
    }

    /// Breaker state per platform plus a summary of recent errors
    pub fn health_status(&self) -> HealthStatus {
        HealthStatus::collect(&self.breakers, &self.journal, self.summary_window)
    }

    /// Whether the attempt described by `context` may be retried
    pub fn should_retry(&self, context: &ErrorContext) -> bool {
        let policy = self.policies.get(context.kind);
        if context.retry_count >= policy.max_retries {
            return false;
        }

        match context.kind {
            ErrorKind::PermanentFailure => false,
            ErrorKind::ContentValidation | ErrorKind::Authentication => context.retry_count == 0,
            _ => true,
        }
    }

    /// Run `operation` against `platform` with retries.
    ///
    /// `operation` is called once per attempt and must produce a fresh
    /// future each time.
    pub async fn execute<T, F, Fut>(&self, platform: &str, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_context(platform, operation, &CallContext::default(), op)
            .await
    }

    pub async fn execute_with_context<T, F, Fut>(
        &self,
        platform: &str,
        operation: &str,
        call: &CallContext,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry_count = 0u32;
        // Failure that led to the pending retry, with its classification
        let mut last_failure: Option<(PlurwatchError, Classification, u32)> = None;

        loop {
            if !self.breakers.is_call_allowed(platform) {
                if let Some((error, classification, attempt)) = last_failure {
                    warn!(
                        platform,
                        operation,
                        kind = %classification.kind,
                        retries = attempt,
                        "Circuit opened while retrying, giving up: {}",
                        error
                    );
                    return Err(error.classified(platform, operation, classification, attempt));
                }
                warn!(platform, operation, "Circuit open, failing fast");
                return Err(PlurwatchError::CircuitOpen {
                    platform: platform.to_string(),
                });
            }

            let error = match op().await {
                Ok(value) => {
                    self.breakers.record_success(platform);
                    if retry_count > 0 {
                        info!(
                            platform,
                            operation,
                            retries = retry_count,
                            "Succeeded after retrying"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let classification = self.classifier.classify(platform, &error);
            let context = ErrorContext::new(
                platform,
                operation,
                classification,
                retry_count,
                error.to_string(),
            )
            .with_user(call.user_id.clone())
            .with_content(call.content_id.clone())
            .with_extra(call.extra.clone());

            self.journal.record(context.clone());
            self.breakers.record_failure(platform, &context);

            if !self.should_retry(&context) {
                warn!(
                    platform,
                    operation,
                    kind = %classification.kind,
                    severity = %classification.severity,
                    retries = retry_count,
                    "Giving up: {}",
                    error
                );
                return Err(error.classified(platform, operation, classification, retry_count));
            }

            let delay = self.policies.get(classification.kind).delay_for(retry_count);
            warn!(
                platform,
                operation,
                kind = %classification.kind,
                attempt = retry_count + 1,
                "Attempt failed: {}. Retrying in {}",
                error,
                humantime::format_duration(delay)
            );

            last_failure = Some((error, classification, retry_count));
            sleep(delay).await;
            retry_count += 1;
            debug!(platform, operation, attempt = retry_count + 1, "Retrying");
        }
    }
}
