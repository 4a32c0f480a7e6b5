//! Sliding-window rate limiting shared across processes
//!
//! Each admitted request is a timestamped row in `rate_limit_entries`. Since
//! every worker process opens the same SQLite file, the count seen by one
//! process includes requests made by all the others.
//!
//! Two ways to use it:
//! - [`DistributedRateLimiter::allow`] then [`DistributedRateLimiter::record`].
//!   Two separate statements, so racing callers can slightly over-admit.
//! - [`DistributedRateLimiter::try_acquire`], which checks and records in one
//!   conditional INSERT and never over-admits.
//!
//! Every tenant also has a row in `rate_limit_keys` whose expiry is pushed
//! forward on each request. Expired tenants and their entries are purged
//! lazily on the next check.

use std::time::Duration;
use tracing::debug;

use crate::db::Database;
use crate::error::{DbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
    /// Headroom a check must leave: admitted iff `count + burst_allowance <= max_requests`.
    /// Values below 1 are treated as 1, since the request being admitted counts too.
    pub burst_allowance: u32,
    /// How long past the window an idle tenant's key is kept
    pub key_ttl_slack: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(900),
            max_requests: 75,
            burst_allowance: 1,
            key_ttl_slack: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct DistributedRateLimiter {
    db: Database,
    config: RateLimitConfig,
}

impl DistributedRateLimiter {
    pub fn new(db: Database, config: RateLimitConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Whether `tenant_id` has budget left for one more request right now
    pub async fn allow(&self, tenant_id: &str) -> Result<bool> {
        self.allow_at(tenant_id, now_ms()).await
    }

    pub async fn allow_at(&self, tenant_id: &str, now_ms: i64) -> Result<bool> {
        purge_expired_keys(&self.db, now_ms).await?;

        let cutoff = self.window_start(now_ms);
        prune_entries(&self.db, tenant_id, cutoff).await?;
        let count = count_entries(&self.db, tenant_id, cutoff).await?;

        let allowed = count + self.headroom() <= i64::from(self.config.max_requests);
        if !allowed {
            debug!(
                tenant_id,
                count,
                max_requests = self.config.max_requests,
                "Rate limit reached"
            );
        }
        Ok(allowed)
    }

    /// Count `n` requests against `tenant_id`
    pub async fn record(&self, tenant_id: &str, n: u32) -> Result<()> {
        self.record_at(tenant_id, n, now_ms()).await
    }

    pub async fn record_at(&self, tenant_id: &str, n: u32, now_ms: i64) -> Result<()> {
        if n == 0 {
            return Ok(());
        }

        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;
        for _ in 0..n {
            sqlx::query("INSERT INTO rate_limit_entries (tenant_id, requested_at_ms) VALUES (?, ?)")
                .bind(tenant_id)
                .bind(now_ms)
                .execute(&mut *tx)
                .await
                .map_err(DbError::SqlxError)?;
        }
        tx.commit().await.map_err(DbError::SqlxError)?;

        touch_key(&self.db, tenant_id, self.key_expiry(now_ms)).await
    }

    /// Check and record one request atomically
    pub async fn try_acquire(&self, tenant_id: &str) -> Result<bool> {
        self.try_acquire_at(tenant_id, now_ms()).await
    }

    pub async fn try_acquire_at(&self, tenant_id: &str, now_ms: i64) -> Result<bool> {
        purge_expired_keys(&self.db, now_ms).await?;

        let cutoff = self.window_start(now_ms);
        prune_entries(&self.db, tenant_id, cutoff).await?;

        // The count and the insert run in one statement, under SQLite's
        // write lock, so concurrent acquirers serialize.
        let result = sqlx::query(
            r#"
            INSERT INTO rate_limit_entries (tenant_id, requested_at_ms)
            SELECT ?, ?
            WHERE (
                SELECT COUNT(*) FROM rate_limit_entries
                WHERE tenant_id = ? AND requested_at_ms > ?
            ) + ? <= ?
            "#,
        )
        .bind(tenant_id)
        .bind(now_ms)
        .bind(tenant_id)
        .bind(cutoff)
        .bind(self.headroom())
        .bind(i64::from(self.config.max_requests))
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let acquired = result.rows_affected() == 1;
        if acquired {
            touch_key(&self.db, tenant_id, self.key_expiry(now_ms)).await?;
        } else {
            debug!(tenant_id, "Rate limit reached, request not admitted");
        }
        Ok(acquired)
    }

    /// Requests `tenant_id` could still make in the current window
    pub async fn remaining(&self, tenant_id: &str) -> Result<u32> {
        self.remaining_at(tenant_id, now_ms()).await
    }

    pub async fn remaining_at(&self, tenant_id: &str, now_ms: i64) -> Result<u32> {
        let count = count_entries(&self.db, tenant_id, self.window_start(now_ms)).await?;
        let left = i64::from(self.config.max_requests) - count;
        Ok(left.clamp(0, i64::from(u32::MAX)) as u32)
    }

    /// Drop tenants idle past their key expiry. Returns how many were purged.
    pub async fn purge_expired(&self) -> Result<u64> {
        purge_expired_keys(&self.db, now_ms()).await
    }

    pub async fn purge_expired_at(&self, now_ms: i64) -> Result<u64> {
        purge_expired_keys(&self.db, now_ms).await
    }

    fn headroom(&self) -> i64 {
        i64::from(self.config.burst_allowance.max(1))
    }

    fn window_start(&self, now_ms: i64) -> i64 {
        now_ms - duration_ms(self.config.window)
    }

    fn key_expiry(&self, now_ms: i64) -> i64 {
        now_ms + duration_ms(self.config.window) + duration_ms(self.config.key_ttl_slack)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX / 4)
}

/// Delete entries at or before `cutoff`
async fn prune_entries(db: &Database, tenant_id: &str, cutoff: i64) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM rate_limit_entries
        WHERE tenant_id = ? AND requested_at_ms <= ?
        "#,
    )
    .bind(tenant_id)
    .bind(cutoff)
    .execute(db.pool())
    .await
    .map_err(DbError::SqlxError)?;

    Ok(())
}

/// Count entries after `cutoff`
async fn count_entries(db: &Database, tenant_id: &str, cutoff: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM rate_limit_entries
        WHERE tenant_id = ? AND requested_at_ms > ?
        "#,
    )
    .bind(tenant_id)
    .bind(cutoff)
    .fetch_one(db.pool())
    .await
    .map_err(DbError::SqlxError)?;

    Ok(count)
}

async fn touch_key(db: &Database, tenant_id: &str, expires_at_ms: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO rate_limit_keys (tenant_id, expires_at_ms)
        VALUES (?, ?)
        ON CONFLICT(tenant_id)
        DO UPDATE SET expires_at_ms = MAX(expires_at_ms, excluded.expires_at_ms)
        "#,
    )
    .bind(tenant_id)
    .bind(expires_at_ms)
    .execute(db.pool())
    .await
    .map_err(DbError::SqlxError)?;

    Ok(())
}

async fn purge_expired_keys(db: &Database, now_ms: i64) -> Result<u64> {
    let mut tx = db.pool().begin().await.map_err(DbError::SqlxError)?;

    sqlx::query(
        r#"
        DELETE FROM rate_limit_entries
        WHERE tenant_id IN (SELECT tenant_id FROM rate_limit_keys WHERE expires_at_ms <= ?)
        "#,
    )
    .bind(now_ms)
    .execute(&mut *tx)
    .await
    .map_err(DbError::SqlxError)?;

    let purged = sqlx::query("DELETE FROM rate_limit_keys WHERE expires_at_ms <= ?")
        .bind(now_ms)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?
        .rows_affected();

    tx.commit().await.map_err(DbError::SqlxError)?;

    if purged > 0 {
        debug!(purged, "Purged expired rate limit keys");
    }
    Ok(purged)
}
