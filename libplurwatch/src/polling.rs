//! Mention polling across all active connections
//!
//! For each connection one poll does:
//!
//! 1. Skip it if it was checked within `min_interval` (unless forced)
//! 2. Take one request from the tenant's shared rate budget, or skip
//! 3. Fetch mentions since the cursor through the retry executor
//! 4. Sort them oldest first, drop stale and repeated ids, store the rest
//! 5. Advance the cursor and write an audit entry
//!
//! A failing connection is audited and reported in the summary; it never
//! stops the sweep over the others.

use futures::stream::{self, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::credentials::CredentialProvider;
use crate::cursor::{sort_chronologically, CursorSession, PollCursorStore};
use crate::db::Database;
use crate::error::{PlurwatchError, Result};
use crate::executor::{CallContext, RetryExecutor};
use crate::platforms::{MentionSource, SourceRegistry};
use crate::rate_limiter::{DistributedRateLimiter, RateLimitConfig};
use crate::types::{AuditEntry, Connection, Mention, PollOutcome, PollResult, PollSummary};

pub const POLL_ACTION: &str = "poll_mentions";
pub const FETCH_OPERATION: &str = "fetch_mentions";

pub struct PollingOrchestrator {
    db: Database,
    cursors: PollCursorStore,
    limiter: DistributedRateLimiter,
    executor: Arc<RetryExecutor>,
    sources: SourceRegistry,
    credentials: Arc<dyn CredentialProvider>,
    min_interval: Duration,
    max_concurrency: usize,
}

impl PollingOrchestrator {
    pub fn new(
        db: Database,
        executor: Arc<RetryExecutor>,
        sources: SourceRegistry,
        credentials: Arc<dyn CredentialProvider>,
        rate_limit: RateLimitConfig,
    ) -> Self {
        Self {
            cursors: PollCursorStore::new(db.clone()),
            limiter: DistributedRateLimiter::new(db.clone(), rate_limit),
            db,
            executor,
            sources,
            credentials,
            min_interval: Duration::ZERO,
            max_concurrency: 4,
        }
    }

    pub fn from_config(
        db: Database,
        config: &Config,
        executor: Arc<RetryExecutor>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self::new(
            db,
            executor,
            SourceRegistry::from_config(config),
            credentials,
            config.rate_limit.to_limiter_config(),
        )
        .with_min_interval(config.polling.min_interval())
        .with_max_concurrency(config.polling.max_concurrency)
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn executor(&self) -> &Arc<RetryExecutor> {
        &self.executor
    }

    pub fn limiter(&self) -> &DistributedRateLimiter {
        &self.limiter
    }

    /// Poll every active connection.
    ///
    /// With `force`, connections checked within `min_interval` are polled
    /// anyway. Only a failure to list connections is returned as an error.
    pub async fn poll_all(&self, force: bool) -> Result<PollSummary> {
        let connections = self.db.list_connections(true).await?;

        let results: Vec<PollResult> = stream::iter(connections)
            .map(|connection| async move { self.poll_connection(&connection, force).await })
            .buffered(self.max_concurrency)
            .collect()
            .await;

        let summary = PollSummary::from_results(results);
        info!(
            connections = summary.connections,
            polled = summary.polled,
            skipped = summary.skipped,
            failed = summary.failed,
            new_mentions = summary.new_mentions,
            "Poll sweep finished"
        );
        Ok(summary)
    }

    /// Poll one connection now, ignoring `min_interval`.
    ///
    /// Still draws on the tenant's rate budget.
    pub async fn poll_one(&self, connection_id: &str) -> Result<PollResult> {
        let connection = self
            .db
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| {
                PlurwatchError::InvalidInput(format!("Unknown connection: {}", connection_id))
            })?;

        if !connection.active {
            return Err(PlurwatchError::InvalidInput(format!(
                "Connection {} is disabled",
                connection_id
            )));
        }

        Ok(self.poll_connection(&connection, true).await)
    }

    async fn poll_connection(&self, connection: &Connection, force: bool) -> PollResult {
        if !force {
            match self.is_due(connection).await {
                Ok(true) => {}
                Ok(false) => return PollResult::skipped(connection, PollOutcome::NotDue),
                Err(e) => return self.fail(connection, PollOutcome::Failed, &e).await,
            }
        }

        let Some(source) = self.sources.get(&connection.platform) else {
            let error = PlurwatchError::InvalidInput(format!(
                "No mention source configured for platform {}",
                connection.platform
            ));
            return self.fail(connection, PollOutcome::Failed, &error).await;
        };

        match self.limiter.try_acquire(&connection.tenant_id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    connection_id = %connection.id,
                    tenant_id = %connection.tenant_id,
                    "Rate budget exhausted, skipping this cycle"
                );
                let result = PollResult::skipped(connection, PollOutcome::RateLimited);
                self.audit(connection, &result, json!({"reason": "rate_limited"}))
                    .await;
                return result;
            }
            Err(e) => return self.fail(connection, PollOutcome::Failed, &e).await,
        }

        match self.fetch_and_store(connection, source.as_ref()).await {
            Ok(result) => {
                self.audit(
                    connection,
                    &result,
                    json!({
                        "new_mentions": result.new_mentions,
                        "duplicates": result.duplicates,
                        "since_id": result.since_id,
                    }),
                )
                .await;
                result
            }
            Err(e) => {
                let outcome = if e.is_circuit_open() {
                    PollOutcome::CircuitOpen
                } else {
                    PollOutcome::Failed
                };
                self.fail(connection, outcome, &e).await
            }
        }
    }

    async fn is_due(&self, connection: &Connection) -> Result<bool> {
        if self.min_interval.is_zero() {
            return Ok(true);
        }
        let cursor = self.cursors.load(&connection.id).await?;
        let now = chrono::Utc::now().timestamp();
        Ok(match cursor.last_checked_at {
            Some(checked_at) => {
                now.saturating_sub(checked_at) >= self.min_interval.as_secs() as i64
            }
            None => true,
        })
    }

    async fn fetch_and_store(
        &self,
        connection: &Connection,
        source: &dyn MentionSource,
    ) -> Result<PollResult> {
        let mut session = self.cursors.begin(&connection.id).await?;
        let since_id = session.since_id().map(str::to_string);

        let call = CallContext::for_user(&connection.tenant_id)
            .with_extra("connection_id", json!(connection.id));
        let credentials = &self.credentials;

        let mut mentions = self
            .executor
            .execute_with_context(&connection.platform, FETCH_OPERATION, &call, || {
                let since_id = since_id.clone();
                async move {
                    let token = credentials.token(connection).await?;
                    source
                        .fetch_mentions(connection, &token, since_id.as_deref())
                        .await
                }
            })
            .await?;

        sort_chronologically(&mut mentions);
        let (new_mentions, duplicates) = match self.store_batch(&mut session, &mentions).await {
            Ok(counts) => counts,
            Err(e) => {
                // Keep what was stored so the next run resumes after it
                if let Err(save_error) = self.cursors.save_progress(&session).await {
                    warn!(
                        connection_id = %connection.id,
                        "Failed to save cursor progress: {}",
                        save_error
                    );
                }
                return Err(e);
            }
        };

        let now = chrono::Utc::now().timestamp();
        let stored_since_id = self.cursors.commit(&session, now).await?;

        info!(
            connection_id = %connection.id,
            platform = %connection.platform,
            fetched = mentions.len(),
            new_mentions,
            duplicates,
            "Polled mentions"
        );

        Ok(PollResult {
            connection_id: connection.id.clone(),
            platform: connection.platform.clone(),
            outcome: PollOutcome::Completed,
            new_mentions,
            duplicates,
            since_id: stored_since_id,
            error: None,
        })
    }

    /// Store a sorted batch. Returns (new, duplicate) counts.
    async fn store_batch(
        &self,
        session: &mut CursorSession,
        mentions: &[Mention],
    ) -> Result<(usize, usize)> {
        let mut new_mentions = 0;
        let mut duplicates = 0;
        let received_at = chrono::Utc::now().timestamp();

        for mention in mentions {
            if session.should_skip(&mention.id) {
                duplicates += 1;
                continue;
            }

            let inserted = self
                .db
                .store_mention(session.connection_id(), mention, received_at)
                .await?;
            if inserted {
                new_mentions += 1;
            } else {
                duplicates += 1;
            }
            session.mark_processed(&mention.id);
        }

        Ok((new_mentions, duplicates))
    }

    async fn fail(
        &self,
        connection: &Connection,
        outcome: PollOutcome,
        error: &PlurwatchError,
    ) -> PollResult {
        warn!(
            connection_id = %connection.id,
            platform = %connection.platform,
            outcome = %outcome,
            "Poll failed: {}",
            error
        );

        let mut result = PollResult::skipped(connection, outcome);
        result.error = Some(error.to_string());

        let mut metadata = json!({ "error": error.to_string() });
        if let Some((classification, retry_count)) = error.classification() {
            metadata["kind"] = json!(classification.kind);
            metadata["severity"] = json!(classification.severity);
            metadata["retry_count"] = json!(retry_count);
        }
        self.audit(connection, &result, metadata).await;
        result
    }

    async fn audit(
        &self,
        connection: &Connection,
        result: &PollResult,
        metadata: serde_json::Value,
    ) {
        let mut metadata = metadata;
        metadata["outcome"] = json!(result.outcome);

        let status = result.outcome.audit_status();
        let entry = AuditEntry::new(POLL_ACTION, &connection.platform, status)
            .for_connection(&connection.id)
            .with_metadata(metadata);

        if let Err(e) = self.db.record_audit(&entry).await {
            warn!(connection_id = %connection.id, "Failed to write audit entry: {}", e);
        }
    }
}
