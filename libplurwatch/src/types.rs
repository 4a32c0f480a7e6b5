//! Core types for Plurwatch

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A platform account whose mentions are polled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    /// Key of the shared rate budget this connection draws from
    pub tenant_id: String,
    pub platform: String,
    pub account: String,
    pub active: bool,
    pub created_at: i64,
}

impl Connection {
    pub fn new(tenant_id: &str, platform: &str, account: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            platform: platform.to_string(),
            account: account.to_string(),
            active: true,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }
}

/// One item returned by a mention fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    /// Platform-assigned id, a decimal string on every supported platform
    pub id: String,
    pub author: String,
    pub content: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Mention {
    pub fn new(id: &str, author: &str, content: &str) -> Self {
        Self {
            id: id.to_string(),
            author: author.to_string(),
            content: content.to_string(),
            created_at: chrono::Utc::now().timestamp(),
            url: None,
        }
    }
}

/// Persisted per-connection polling position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollCursor {
    pub connection_id: String,
    pub since_id: Option<String>,
    pub last_checked_at: Option<i64>,
}

impl PollCursor {
    pub fn empty(connection_id: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            since_id: None,
            last_checked_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failed,
    Skipped,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Failed => "failed",
            AuditStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AuditStatus::Success),
            "failed" => Ok(AuditStatus::Failed),
            "skipped" => Ok(AuditStatus::Skipped),
            other => Err(format!("Unknown audit status: '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Option<i64>,
    pub action: String,
    pub platform: String,
    pub connection_id: Option<String>,
    pub status: AuditStatus,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

impl AuditEntry {
    pub fn new(action: &str, platform: &str, status: AuditStatus) -> Self {
        Self {
            id: None,
            action: action.to_string(),
            platform: platform.to_string(),
            connection_id: None,
            status,
            metadata: serde_json::Value::Null,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn for_connection(mut self, connection_id: &str) -> Self {
        self.connection_id = Some(connection_id.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollOutcome {
    Completed,
    /// The tenant's rate budget was exhausted; nothing was fetched
    RateLimited,
    /// Checked too recently; nothing was fetched
    NotDue,
    CircuitOpen,
    Failed,
}

impl PollOutcome {
    pub fn audit_status(&self) -> AuditStatus {
        match self {
            PollOutcome::Completed => AuditStatus::Success,
            PollOutcome::RateLimited | PollOutcome::NotDue => AuditStatus::Skipped,
            PollOutcome::CircuitOpen | PollOutcome::Failed => AuditStatus::Failed,
        }
    }
}

impl fmt::Display for PollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PollOutcome::Completed => "completed",
            PollOutcome::RateLimited => "rate_limited",
            PollOutcome::NotDue => "not_due",
            PollOutcome::CircuitOpen => "circuit_open",
            PollOutcome::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of polling one connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResult {
    pub connection_id: String,
    pub platform: String,
    pub outcome: PollOutcome,
    pub new_mentions: usize,
    pub duplicates: usize,
    pub since_id: Option<String>,
    pub error: Option<String>,
}

impl PollResult {
    pub fn skipped(connection: &Connection, outcome: PollOutcome) -> Self {
        Self {
            connection_id: connection.id.clone(),
            platform: connection.platform.clone(),
            outcome,
            new_mentions: 0,
            duplicates: 0,
            since_id: None,
            error: None,
        }
    }
}

/// Result of one sweep over all active connections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollSummary {
    pub connections: usize,
    pub polled: usize,
    pub skipped: usize,
    pub failed: usize,
    pub new_mentions: usize,
    pub results: Vec<PollResult>,
}

impl PollSummary {
    pub fn from_results(results: Vec<PollResult>) -> Self {
        let mut summary = PollSummary {
            connections: results.len(),
            ..Default::default()
        };
        for result in &results {
            match result.outcome {
                PollOutcome::Completed => summary.polled += 1,
                PollOutcome::RateLimited | PollOutcome::NotDue => summary.skipped += 1,
                PollOutcome::CircuitOpen | PollOutcome::Failed => summary.failed += 1,
            }
            summary.new_mentions += result.new_mentions;
        }
        summary.results = results;
        summary
    }
}
