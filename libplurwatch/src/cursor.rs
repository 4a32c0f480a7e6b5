//! Per-connection since-id cursors and in-run de-duplication
//!
//! A [`CursorSession`] is opened for one connection at the start of a poll
//! run and owned by the task polling it. Items are marked processed as they
//! are stored; at the end of the run [`PollCursorStore::commit`] persists
//! the highest processed id, but only if it is above the stored one.

use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

use crate::db::Database;
use crate::error::Result;
use crate::types::{Mention, PollCursor};

/// Compare two platform ids.
///
/// Decimal ids compare numerically, so `"999" < "1000"`. Anything else falls
/// back to plain string order.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (as_decimal(a), as_decimal(b)) {
        (Some(a), Some(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

/// Digits with leading zeros removed, or None if `id` is not a decimal number
fn as_decimal(id: &str) -> Option<&str> {
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let trimmed = id.trim_start_matches('0');
    Some(if trimmed.is_empty() { "0" } else { trimmed })
}

/// Sort mentions oldest first by id, whatever order the platform returned
pub fn sort_chronologically(mentions: &mut [Mention]) {
    mentions.sort_by(|a, b| compare_ids(&a.id, &b.id));
}

/// State of one connection's poll run
#[derive(Debug, Clone)]
pub struct CursorSession {
    connection_id: String,
    since_id: Option<String>,
    candidate: Option<String>,
    seen: HashSet<String>,
}

impl CursorSession {
    pub fn new(connection_id: &str, since_id: Option<String>) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            candidate: since_id.clone(),
            since_id,
            seen: HashSet::new(),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// The cursor as loaded at the start of the run
    pub fn since_id(&self) -> Option<&str> {
        self.since_id.as_deref()
    }

    /// Highest id processed so far (or the loaded cursor if none is higher)
    pub fn candidate(&self) -> Option<&str> {
        self.candidate.as_deref()
    }

    /// Whether `id` was already processed in this run
    pub fn is_duplicate(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Whether `id` is at or below the loaded cursor
    pub fn is_stale(&self, id: &str) -> bool {
        self.since_id
            .as_deref()
            .is_some_and(|since| compare_ids(id, since) != Ordering::Greater)
    }

    /// Whether `id` should be skipped in this run
    pub fn should_skip(&self, id: &str) -> bool {
        self.is_duplicate(id) || self.is_stale(id)
    }

    /// Record that `id` was processed successfully
    pub fn mark_processed(&mut self, id: &str) {
        self.seen.insert(id.to_string());
        let higher = self
            .candidate
            .as_deref()
            .map_or(true, |current| compare_ids(id, current) == Ordering::Greater);
        if higher {
            self.candidate = Some(id.to_string());
        }
    }

    /// Whether the candidate is above the loaded cursor
    pub fn advanced(&self) -> bool {
        match (&self.candidate, &self.since_id) {
            (Some(candidate), Some(since)) => compare_ids(candidate, since) == Ordering::Greater,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn processed_count(&self) -> usize {
        self.seen.len()
    }
}

/// Cursor persistence on top of the database
#[derive(Clone)]
pub struct PollCursorStore {
    db: Database,
}

impl PollCursorStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Stored cursor, or an empty one for a connection never polled
    pub async fn load(&self, connection_id: &str) -> Result<PollCursor> {
        Ok(self
            .db
            .get_cursor(connection_id)
            .await?
            .unwrap_or_else(|| PollCursor::empty(connection_id)))
    }

    /// Open a run for `connection_id` starting from its stored cursor
    pub async fn begin(&self, connection_id: &str) -> Result<CursorSession> {
        let cursor = self.load(connection_id).await?;
        Ok(CursorSession::new(connection_id, cursor.since_id))
    }

    /// Finish a completed run. Saves the candidate if it advanced and
    /// always updates the check time. Returns the cursor now stored.
    pub async fn commit(&self, session: &CursorSession, checked_at: i64) -> Result<Option<String>> {
        let connection_id = session.connection_id();

        match session.candidate() {
            Some(candidate) if session.advanced() => {
                self.db
                    .save_cursor(connection_id, candidate, checked_at)
                    .await?;
                debug!(
                    connection_id,
                    since_id = candidate,
                    previous = session.since_id().unwrap_or("none"),
                    "Advanced poll cursor"
                );
            }
            _ => {
                self.db.touch_cursor(connection_id, checked_at).await?;
            }
        }

        Ok(session.candidate().map(str::to_string))
    }

    /// Persist the progress of a run that stopped partway. The check time
    /// is left alone so the connection is polled again on the next sweep.
    pub async fn save_progress(&self, session: &CursorSession) -> Result<()> {
        if let Some(candidate) = session.candidate().filter(|_| session.advanced()) {
            let checked_at = self
                .load(session.connection_id())
                .await?
                .last_checked_at
                .unwrap_or(0);
            self.db
                .save_cursor(session.connection_id(), candidate, checked_at)
                .await?;
        }
        Ok(())
    }
}
