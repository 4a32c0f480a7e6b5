//! Bounded journal of failed attempts
//!
//! Every failed attempt made through the retry executor produces one
//! [`ErrorContext`]. The journal keeps the most recent ones in a fixed-size
//! ring buffer and summarizes them over a time window for health reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::classifier::{Classification, ErrorKind, Severity};

pub const DEFAULT_JOURNAL_CAPACITY: usize = 1000;

/// One failed attempt against a platform. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub platform: String,
    pub operation: String,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub retry_count: u32,
    pub occurred_at: DateTime<Utc>,
    pub user_id: Option<String>,
    pub content_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn new(
        platform: &str,
        operation: &str,
        classification: Classification,
        retry_count: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.to_string(),
            operation: operation.to_string(),
            kind: classification.kind,
            severity: classification.severity,
            retry_count,
            occurred_at: Utc::now(),
            user_id: None,
            content_id: None,
            message: message.into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_content(mut self, content_id: Option<String>) -> Self {
        self.content_id = content_id;
        self
    }

    pub fn with_extra(mut self, extra: BTreeMap<String, serde_json::Value>) -> Self {
        self.extra = extra;
        self
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn classification(&self) -> Classification {
        Classification::new(self.kind, self.severity)
    }
}

/// Aggregate view of the journal over a time window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub window_seconds: u64,
    pub total: usize,
    pub by_kind: BTreeMap<ErrorKind, usize>,
    pub by_platform: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Fixed-capacity ring buffer of [`ErrorContext`] entries, safe to share
/// between tasks. When full, recording evicts the oldest entry only.
#[derive(Debug)]
pub struct ErrorJournal {
    capacity: usize,
    entries: Mutex<VecDeque<ErrorContext>>,
}

impl Default for ErrorJournal {
    fn default() -> Self {
        Self::new(DEFAULT_JOURNAL_CAPACITY)
    }
}

impl ErrorJournal {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn record(&self, context: ErrorContext) {
        let mut entries = self.entries();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(context);
    }

    /// Most recent entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<ErrorContext> {
        self.entries().iter().rev().take(limit).cloned().collect()
    }

    /// Entries that occurred at or after `cutoff`, oldest first
    pub fn since(&self, cutoff: DateTime<Utc>) -> Vec<ErrorContext> {
        self.entries()
            .iter()
            .filter(|e| e.occurred_at >= cutoff)
            .cloned()
            .collect()
    }

    pub fn summary(&self, window: Duration) -> ErrorSummary {
        self.summary_at(window, Utc::now())
    }

    pub fn summary_at(&self, window: Duration, now: DateTime<Utc>) -> ErrorSummary {
        let cutoff = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut summary = ErrorSummary {
            window_seconds: window.as_secs(),
            ..Default::default()
        };

        for entry in self.entries().iter().filter(|e| e.occurred_at >= cutoff) {
            summary.total += 1;
            *summary.by_kind.entry(entry.kind).or_default() += 1;
            *summary.by_platform.entry(entry.platform.clone()).or_default() += 1;
            *summary.by_severity.entry(entry.severity).or_default() += 1;
            summary.last_error_at = summary.last_error_at.max(Some(entry.occurred_at));
        }

        summary
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, VecDeque<ErrorContext>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn context(platform: &str, kind: ErrorKind, retry_count: u32) -> ErrorContext {
        ErrorContext::new(
            platform,
            "fetch_mentions",
            Classification::new(kind, Severity::Medium),
            retry_count,
            "boom",
        )
    }

    #[test]
    fn test_record_and_recent() {
        let journal = ErrorJournal::new(10);
        journal.record(context("nostr", ErrorKind::Network, 0));
        journal.record(context("mastodon", ErrorKind::RateLimit, 1));

        let recent = journal.recent(5);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].platform, "mastodon");
        assert_eq!(recent[1].platform, "nostr");
    }

    #[test]
    fn test_overflow_evicts_oldest_only() {
        let journal = ErrorJournal::new(3);
        for retry in 0..5 {
            journal.record(context("nostr", ErrorKind::Network, retry));
        }

        assert_eq!(journal.len(), 3);
        let retries: Vec<u32> = journal.recent(10).iter().map(|e| e.retry_count).collect();
        assert_eq!(retries, vec![4, 3, 2]);
    }

    #[test]
    fn test_default_capacity() {
        let journal = ErrorJournal::default();
        assert_eq!(journal.capacity(), DEFAULT_JOURNAL_CAPACITY);
        for retry in 0..1500 {
            journal.record(context("nostr", ErrorKind::Network, retry));
        }
        assert_eq!(journal.len(), DEFAULT_JOURNAL_CAPACITY);
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let journal = ErrorJournal::new(0);
        journal.record(context("nostr", ErrorKind::Network, 0));
        journal.record(context("nostr", ErrorKind::Network, 1));
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn test_summary_respects_window() {
        let journal = ErrorJournal::new(100);
        let now = Utc::now();

        journal.record(
            context("nostr", ErrorKind::Network, 0).at(now - chrono::Duration::hours(2)),
        );
        journal.record(
            context("mastodon", ErrorKind::RateLimit, 0).at(now - chrono::Duration::minutes(5)),
        );
        journal.record(
            context("mastodon", ErrorKind::RateLimit, 1).at(now - chrono::Duration::minutes(1)),
        );

        let summary = journal.summary_at(Duration::from_secs(3600), now);
        assert_eq!(summary.window_seconds, 3600);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.by_kind.get(&ErrorKind::RateLimit), Some(&2));
        assert_eq!(summary.by_kind.get(&ErrorKind::Network), None);
        assert_eq!(summary.by_platform.get("mastodon"), Some(&2));
        assert_eq!(summary.by_severity.get(&Severity::Medium), Some(&2));
        assert_eq!(
            summary.last_error_at,
            Some(now - chrono::Duration::minutes(1))
        );
    }

    #[test]
    fn test_since_filters_by_time() {
        let journal = ErrorJournal::new(10);
        let now = Utc::now();
        journal.record(
            context("nostr", ErrorKind::Network, 0).at(now - chrono::Duration::hours(1)),
        );
        journal.record(context("nostr", ErrorKind::Network, 1).at(now));

        let recent = journal.since(now - chrono::Duration::minutes(1));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].retry_count, 1);
    }

    #[test]
    fn test_empty_summary() {
        let journal = ErrorJournal::new(10);
        let summary = journal.summary(Duration::from_secs(60));
        assert_eq!(summary.total, 0);
        assert!(summary.last_error_at.is_none());
        assert!(journal.is_empty());
    }

    #[test]
    fn test_concurrent_writers() {
        let journal = Arc::new(ErrorJournal::new(500));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let journal = Arc::clone(&journal);
                std::thread::spawn(move || {
                    for retry in 0..100 {
                        journal.record(context(&format!("p{}", t), ErrorKind::Network, retry));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(journal.len(), 500);
    }

    #[test]
    fn test_context_builders() {
        let ctx = context("nostr", ErrorKind::Authentication, 0)
            .with_user(Some("user-1".to_string()))
            .with_content(Some("post-9".to_string()))
            .with_extra(BTreeMap::from([(
                "connection_id".to_string(),
                serde_json::json!("conn-1"),
            )]));
        assert_eq!(ctx.user_id.as_deref(), Some("user-1"));
        assert_eq!(ctx.content_id.as_deref(), Some("post-9"));
        assert_eq!(ctx.extra["connection_id"], "conn-1");
        assert_eq!(ctx.classification().kind, ErrorKind::Authentication);
    }

    #[test]
    fn test_summary_serializes_kind_keys_as_strings() {
        let journal = ErrorJournal::new(10);
        journal.record(context("nostr", ErrorKind::QuotaExceeded, 0));
        let json = serde_json::to_value(journal.summary(Duration::from_secs(60))).unwrap();
        assert_eq!(json["by_kind"]["quota_exceeded"], 1);
        assert_eq!(json["by_severity"]["medium"], 1);
    }
}
