//! Scripted mention source for testing
//!
//! Responses are queued up front and replayed in order, one per fetch. Once
//! the queue is empty every fetch returns no mentions.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{PlatformError, Result};
use crate::platforms::MentionSource;
use crate::types::{Connection, Mention};

/// One observed fetch
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub connection_id: String,
    pub since_id: Option<String>,
    pub token: String,
}

#[derive(Default)]
struct MockState {
    responses: VecDeque<std::result::Result<Vec<Mention>, PlatformError>>,
    calls: Vec<MockCall>,
}

/// Mock mention source. Clones share their script and call log.
#[derive(Clone)]
pub struct MockSource {
    platform: String,
    delay: Duration,
    state: Arc<Mutex<MockState>>,
}

impl MockSource {
    pub fn new(platform: &str) -> Self {
        Self {
            platform: platform.to_string(),
            delay: Duration::ZERO,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Simulate network latency on every fetch
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue a successful response
    pub fn push_mentions(&self, mentions: Vec<Mention>) -> &Self {
        self.state().responses.push_back(Ok(mentions));
        self
    }

    /// Queue a failed response
    pub fn push_error(&self, error: PlatformError) -> &Self {
        self.state().responses.push_back(Err(error));
        self
    }

    /// Queue the same failure `times` times
    pub fn push_errors(&self, error: PlatformError, times: usize) -> &Self {
        for _ in 0..times {
            self.push_error(error.clone());
        }
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Build mentions with the given ids
pub fn mentions(ids: &[&str]) -> Vec<Mention> {
    ids.iter()
        .map(|id| Mention::new(id, "mock-author", &format!("mention {}", id)))
        .collect()
}

#[async_trait]
impl MentionSource for MockSource {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn fetch_mentions(
        &self,
        connection: &Connection,
        token: &SecretString,
        since_id: Option<&str>,
    ) -> Result<Vec<Mention>> {
        let response = {
            let mut state = self.state();
            state.calls.push(MockCall {
                connection_id: connection.id.clone(),
                since_id: since_id.map(str::to_string),
                token: token.expose_secret().to_string(),
            });
            state.responses.pop_front()
        };

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        match response {
            Some(Ok(mentions)) => Ok(mentions),
            Some(Err(error)) => Err(error.into()),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replays_script_in_order() {
        let source = MockSource::new("mastodon");
        source
            .push_error(PlatformError::Network("reset".to_string()))
            .push_mentions(mentions(&["1", "2"]));
        let connection = Connection::new("t", "mastodon", "alice");
        let token = SecretString::from("tok".to_string());

        assert!(source
            .fetch_mentions(&connection, &token, None)
            .await
            .is_err());
        let fetched = source
            .fetch_mentions(&connection, &token, Some("0"))
            .await
            .unwrap();
        assert_eq!(fetched.len(), 2);
        assert!(source
            .fetch_mentions(&connection, &token, Some("2"))
            .await
            .unwrap()
            .is_empty());

        let calls = source.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].since_id, None);
        assert_eq!(calls[2].since_id.as_deref(), Some("2"));
        assert_eq!(calls[0].token, "tok");
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let source = MockSource::new("nostr");
        let clone = source.clone();
        source.push_mentions(mentions(&["7"]));

        let connection = Connection::new("t", "nostr", "npub");
        let token = SecretString::from("tok".to_string());
        assert_eq!(
            clone.fetch_mentions(&connection, &token, None).await.unwrap()[0].id,
            "7"
        );
        assert_eq!(source.call_count(), 1);
    }
}
