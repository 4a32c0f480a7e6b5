//! Database operations for Plurwatch

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;

use crate::error::{DbError, Result};
use crate::types::{AuditEntry, AuditStatus, Connection, Mention, PollCursor};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations.
    ///
    /// The file is opened in WAL mode with a busy timeout so several
    /// processes can share it, which the rate limiter relies on.
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Insert a connection, or update every field of an existing one
    pub async fn upsert_connection(&self, connection: &Connection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO connections (id, tenant_id, platform, account, active, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                platform = excluded.platform,
                account = excluded.account,
                active = excluded.active
            "#,
        )
        .bind(&connection.id)
        .bind(&connection.tenant_id)
        .bind(&connection.platform)
        .bind(&connection.account)
        .bind(connection.active)
        .bind(connection.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_connection(&self, id: &str) -> Result<Option<Connection>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, platform, account, active, created_at
            FROM connections WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| connection_from_row(&r)))
    }

    /// List connections ordered by creation time
    pub async fn list_connections(&self, active_only: bool) -> Result<Vec<Connection>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, platform, account, active, created_at
            FROM connections
            WHERE active = 1 OR ? = 0
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(connection_from_row).collect())
    }

    /// Returns false if no connection has this id
    pub async fn set_connection_active(&self, id: &str, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE connections SET active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Poll cursors
    // ------------------------------------------------------------------

    pub async fn get_cursor(&self, connection_id: &str) -> Result<Option<PollCursor>> {
        let row = sqlx::query(
            r#"
            SELECT connection_id, since_id, last_checked_at
            FROM poll_cursors WHERE connection_id = ?
            "#,
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| PollCursor {
            connection_id: r.get("connection_id"),
            since_id: r.get("since_id"),
            last_checked_at: r.get("last_checked_at"),
        }))
    }

    /// Store a new since-id and check time for a connection
    pub async fn save_cursor(
        &self,
        connection_id: &str,
        since_id: &str,
        checked_at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO poll_cursors (connection_id, since_id, last_checked_at)
            VALUES (?, ?, ?)
            ON CONFLICT(connection_id) DO UPDATE SET
                since_id = excluded.since_id,
                last_checked_at = excluded.last_checked_at
            "#,
        )
        .bind(connection_id)
        .bind(since_id)
        .bind(checked_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Update only the check time, leaving the since-id alone
    pub async fn touch_cursor(&self, connection_id: &str, checked_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO poll_cursors (connection_id, since_id, last_checked_at)
            VALUES (?, NULL, ?)
            ON CONFLICT(connection_id) DO UPDATE SET
                last_checked_at = excluded.last_checked_at
            "#,
        )
        .bind(connection_id)
        .bind(checked_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Mentions
    // ------------------------------------------------------------------

    /// Store a mention. Returns false if it was already stored.
    pub async fn store_mention(
        &self,
        connection_id: &str,
        mention: &Mention,
        received_at: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO mentions
                (connection_id, mention_id, author, content, created_at, url, received_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(connection_id)
        .bind(&mention.id)
        .bind(&mention.author)
        .bind(&mention.content)
        .bind(mention.created_at)
        .bind(&mention.url)
        .bind(received_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count_mentions(&self, connection_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mentions WHERE connection_id = ?")
            .bind(connection_id)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(count)
    }

    /// Most recently received mentions first
    pub async fn list_mentions(&self, connection_id: &str, limit: usize) -> Result<Vec<Mention>> {
        let rows = sqlx::query(
            r#"
            SELECT mention_id, author, content, created_at, url
            FROM mentions
            WHERE connection_id = ?
            ORDER BY received_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(connection_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| Mention {
                id: r.get("mention_id"),
                author: r.get("author"),
                content: r.get("content"),
                created_at: r.get("created_at"),
                url: r.get("url"),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Audit log
    // ------------------------------------------------------------------

    /// Append an audit entry and return its id
    pub async fn record_audit(&self, entry: &AuditEntry) -> Result<i64> {
        let metadata = if entry.metadata.is_null() {
            None
        } else {
            Some(entry.metadata.to_string())
        };

        let result = sqlx::query(
            r#"
            INSERT INTO audit_log (action, platform, connection_id, status, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.action)
        .bind(&entry.platform)
        .bind(&entry.connection_id)
        .bind(entry.status.as_str())
        .bind(metadata)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.last_insert_rowid())
    }

    /// Newest entries first
    pub async fn list_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, action, platform, connection_id, status, metadata, created_at
            FROM audit_log
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| {
                let metadata: Option<String> = r.get("metadata");
                AuditEntry {
                    id: Some(r.get("id")),
                    action: r.get("action"),
                    platform: r.get("platform"),
                    connection_id: r.get("connection_id"),
                    status: r
                        .get::<String, _>("status")
                        .parse()
                        .unwrap_or(AuditStatus::Failed),
                    metadata: metadata
                        .and_then(|m| serde_json::from_str(&m).ok())
                        .unwrap_or(serde_json::Value::Null),
                    created_at: r.get("created_at"),
                }
            })
            .collect())
    }
}

fn connection_from_row(r: &sqlx::sqlite::SqliteRow) -> Connection {
    Connection {
        id: r.get("id"),
        tenant_id: r.get("tenant_id"),
        platform: r.get("platform"),
        account: r.get("account"),
        active: r.get("active"),
        created_at: r.get("created_at"),
    }
}
