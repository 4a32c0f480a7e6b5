//! Per-platform circuit breakers
//!
//! One breaker per platform name, created lazily on first use:
//!
//! ```text
//! Closed --failure_count >= failure_threshold--> Open
//! Open   --recovery_timeout elapsed, next check--> HalfOpen
//! HalfOpen --success_count >= success_threshold--> Closed
//! HalfOpen --any failure--> Open
//! ```
//!
//! In `Closed`, successes decay the failure count by one so that sporadic
//! failures spread over a long period never trip the breaker.
//!
//! Each breaker has its own lock; the registry map is only locked long
//! enough to look a breaker up or insert it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::journal::ErrorContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(300),
            success_threshold: 3,
        }
    }
}

/// State of one platform's breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerState {
    pub platform: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<Instant>,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

impl CircuitBreakerState {
    pub fn new(platform: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            platform: platform.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout,
            success_threshold: config.success_threshold,
        }
    }

    /// Whether a call may go out now. Moves an expired `Open` breaker to
    /// `HalfOpen` and lets this call through as the first trial.
    fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = self
                    .last_failure_at
                    .map_or(true, |at| now.saturating_duration_since(at) >= self.recovery_timeout);
                if expired {
                    self.state = CircuitState::HalfOpen;
                    self.success_count = 0;
                    info!(
                        platform = %self.platform,
                        "Circuit breaker half-open, allowing trial call"
                    );
                }
                expired
            }
        }
    }

    fn on_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = self.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.success_threshold {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                    info!(platform = %self.platform, "Circuit breaker closed, platform recovered");
                }
            }
            // A call admitted before the breaker opened finished late
            CircuitState::Open => {}
        }
    }

    fn on_failure(&mut self, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_at = Some(now);

        match self.state {
            CircuitState::Closed => {
                if self.failure_count >= self.failure_threshold {
                    self.state = CircuitState::Open;
                    warn!(
                        platform = %self.platform,
                        failures = self.failure_count,
                        recovery_secs = self.recovery_timeout.as_secs(),
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.success_count = 0;
                warn!(platform = %self.platform, "Trial call failed, circuit breaker re-opened");
            }
            CircuitState::Open => {}
        }
    }
}

/// Registry holding one breaker per platform.
///
/// Constructed once per process and shared (usually behind an `Arc`) by
/// everything that calls out to platforms.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<Mutex<CircuitBreakerState>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    pub fn is_call_allowed(&self, platform: &str) -> bool {
        let breaker = self.breaker(platform);
        let allowed = lock(&breaker).allow(Instant::now());
        if !allowed {
            debug!(platform, "Call rejected by open circuit breaker");
        }
        allowed
    }

    pub fn record_success(&self, platform: &str) {
        let breaker = self.breaker(platform);
        lock(&breaker).on_success();
    }

    pub fn record_failure(&self, platform: &str, context: &ErrorContext) {
        let breaker = self.breaker(platform);
        let mut state = lock(&breaker);
        state.on_failure(Instant::now());
        debug!(
            platform,
            operation = %context.operation,
            kind = %context.kind,
            failures = state.failure_count,
            state = %state.state,
            "Recorded platform failure"
        );
    }

    /// Current state of `platform`'s breaker (a fresh closed state if the
    /// platform has never been called)
    pub fn state(&self, platform: &str) -> CircuitBreakerState {
        let existing = self.map().get(platform).cloned();
        match existing {
            Some(breaker) => lock(&breaker).clone(),
            None => CircuitBreakerState::new(platform, self.config),
        }
    }

    /// All known breakers, sorted by platform name
    pub fn snapshot(&self) -> Vec<CircuitBreakerState> {
        let breakers: Vec<_> = self.map().values().cloned().collect();
        let mut states: Vec<_> = breakers.iter().map(|b| lock(b).clone()).collect();
        states.sort_by(|a, b| a.platform.cmp(&b.platform));
        states
    }

    /// Force a breaker back to `Closed` with cleared counters
    pub fn reset(&self, platform: &str) {
        let breaker = self.breaker(platform);
        *lock(&breaker) = CircuitBreakerState::new(platform, self.config);
        info!(platform, "Circuit breaker reset");
    }

    fn breaker(&self, platform: &str) -> Arc<Mutex<CircuitBreakerState>> {
        let config = self.config;
        let mut map = self.map();
        Arc::clone(map.entry(platform.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(CircuitBreakerState::new(platform, config)))
        }))
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<CircuitBreakerState>>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock(breaker: &Mutex<CircuitBreakerState>) -> MutexGuard<'_, CircuitBreakerState> {
    breaker.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classification, ErrorKind, Severity};

    fn failure(platform: &str) -> ErrorContext {
        ErrorContext::new(
            platform,
            "fetch_mentions",
            Classification::new(ErrorKind::Network, Severity::Medium),
            0,
            "connection reset",
        )
    }

    fn fail(registry: &CircuitBreakerRegistry, platform: &str, times: u32) {
        for _ in 0..times {
            registry.record_failure(platform, &failure(platform));
        }
    }

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_failures() {
        let registry = registry();
        fail(&registry, "mastodon", 4);
        assert_eq!(registry.state("mastodon").state, CircuitState::Closed);
        assert!(registry.is_call_allowed("mastodon"));

        fail(&registry, "mastodon", 1);
        let state = registry.state("mastodon");
        assert_eq!(state.state, CircuitState::Open);
        assert!(state.last_failure_at.is_some());
        assert!(!registry.is_call_allowed("mastodon"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_open_before_recovery_timeout() {
        let registry = registry();
        fail(&registry, "mastodon", 5);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!registry.is_call_allowed("mastodon"));
        assert_eq!(registry.state("mastodon").state, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_opens_after_recovery_timeout() {
        let registry = registry();
        fail(&registry, "mastodon", 5);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(registry.is_call_allowed("mastodon"));
        let state = registry.state("mastodon");
        assert_eq!(state.state, CircuitState::HalfOpen);
        assert_eq!(state.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_success_threshold() {
        let registry = registry();
        fail(&registry, "mastodon", 5);
        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(registry.is_call_allowed("mastodon"));

        registry.record_success("mastodon");
        registry.record_success("mastodon");
        assert_eq!(registry.state("mastodon").state, CircuitState::HalfOpen);
        assert_eq!(registry.state("mastodon").success_count, 2);

        registry.record_success("mastodon");
        let state = registry.state("mastodon");
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_immediately() {
        let registry = registry();
        fail(&registry, "mastodon", 5);
        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(registry.is_call_allowed("mastodon"));
        registry.record_success("mastodon");
        registry.record_success("mastodon");

        fail(&registry, "mastodon", 1);
        let state = registry.state("mastodon");
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.success_count, 0);
        assert!(!registry.is_call_allowed("mastodon"));

        // The recovery clock restarts from the trial failure
        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!registry.is_call_allowed("mastodon"));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(registry.is_call_allowed("mastodon"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_decays_failure_count() {
        let registry = registry();
        fail(&registry, "nostr", 3);
        registry.record_success("nostr");
        assert_eq!(registry.state("nostr").failure_count, 2);

        for _ in 0..10 {
            registry.record_success("nostr");
        }
        assert_eq!(registry.state("nostr").failure_count, 0);

        // Sporadic failures interleaved with successes never trip it
        for _ in 0..20 {
            fail(&registry, "nostr", 1);
            registry.record_success("nostr");
        }
        assert_eq!(registry.state("nostr").state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_platforms_are_isolated() {
        let registry = registry();
        fail(&registry, "mastodon", 5);
        assert!(!registry.is_call_allowed("mastodon"));
        assert!(registry.is_call_allowed("bluesky"));
        assert_eq!(registry.state("bluesky").failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_thresholds() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(10),
            success_threshold: 1,
        });
        fail(&registry, "ssb", 2);
        assert!(!registry.is_call_allowed("ssb"));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(registry.is_call_allowed("ssb"));
        registry.record_success("ssb");
        assert_eq!(registry.state("ssb").state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_and_snapshot() {
        let registry = registry();
        fail(&registry, "mastodon", 5);
        registry.record_success("bluesky");

        let snapshot = registry.snapshot();
        let names: Vec<_> = snapshot.iter().map(|s| s.platform.as_str()).collect();
        assert_eq!(names, vec!["bluesky", "mastodon"]);

        registry.reset("mastodon");
        let state = registry.state("mastodon");
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
    }

    #[test]
    fn test_unknown_platform_state_is_closed() {
        let registry = registry();
        let state = registry.state("never-called");
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_threshold, 5);
        assert_eq!(state.recovery_timeout, Duration::from_secs(300));
        assert_eq!(state.success_threshold, 3);
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_are_not_lost() {
        let registry = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1000,
            ..Default::default()
        }));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    for _ in 0..100 {
                        registry.record_failure("mastodon", &failure("mastodon"));
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.state("mastodon").failure_count, 800);
    }
}
