//! Health report for the operational status surface

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use crate::journal::{ErrorJournal, ErrorSummary};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformHealth {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub seconds_since_last_failure: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub platforms: BTreeMap<String, PlatformHealth>,
    pub recent_errors: ErrorSummary,
}

impl HealthStatus {
    pub fn collect(
        breakers: &CircuitBreakerRegistry,
        journal: &ErrorJournal,
        window: Duration,
    ) -> Self {
        let now = Instant::now();
        let platforms = breakers
            .snapshot()
            .into_iter()
            .map(|state| {
                let health = PlatformHealth {
                    state: state.state,
                    failure_count: state.failure_count,
                    success_count: state.success_count,
                    seconds_since_last_failure: state
                        .last_failure_at
                        .map(|at| now.saturating_duration_since(at).as_secs()),
                };
                (state.platform, health)
            })
            .collect();

        Self {
            platforms,
            recent_errors: journal.summary(window),
        }
    }

    /// True when no breaker is open or half-open
    pub fn is_healthy(&self) -> bool {
        self.platforms
            .values()
            .all(|p| p.state == CircuitState::Closed)
    }

    /// Platforms whose breaker is currently rejecting calls
    pub fn open_platforms(&self) -> Vec<&str> {
        self.platforms
            .iter()
            .filter(|(_, p)| p.state == CircuitState::Open)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
