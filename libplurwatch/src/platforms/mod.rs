//! Mention sources
//!
//! A [`MentionSource`] fetches the mentions of one connection from one
//! platform. The poller does not care how: the bundled
//! [`command::CommandSource`] shells out to an external fetcher, and
//! [`mock::MockSource`] replays scripted responses in tests.
//!
//! # Examples
//!
//! ```no_run
//! use libplurwatch::platforms::{command::CommandSource, SourceRegistry};
//! use std::sync::Arc;
//!
//! let mut registry = SourceRegistry::new();
//! registry.register(Arc::new(CommandSource::new(
//!     "mastodon",
//!     "mastodon-mentions --account {account} --since {since_id}",
//! )));
//! assert!(registry.get("mastodon").is_some());
//! ```

use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::types::{Connection, Mention};

pub mod command;

// Available outside tests so integration tests and the binary's test
// harness can use it
pub mod mock;

#[async_trait]
pub trait MentionSource: Send + Sync {
    /// Platform this source serves, matching `Connection::platform`
    fn platform(&self) -> &str;

    /// Fetch mentions newer than `since_id` (all recent ones when `None`).
    ///
    /// Platforms may return items in any order and may include items at or
    /// below `since_id`; the caller sorts and filters.
    async fn fetch_mentions(
        &self,
        connection: &Connection,
        token: &SecretString,
        since_id: Option<&str>,
    ) -> Result<Vec<Mention>>;
}

/// Sources keyed by platform name
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn MentionSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`command::CommandSource`] per platform with a `fetch_command`
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for (platform, platform_config) in &config.platforms {
            if let Some(command) = &platform_config.fetch_command {
                registry.register(Arc::new(command::CommandSource::new(platform, command)));
            }
        }
        registry
    }

    /// Add a source, replacing any previous one for the same platform
    pub fn register(&mut self, source: Arc<dyn MentionSource>) {
        self.sources.insert(source.platform().to_string(), source);
    }

    pub fn with_source(mut self, source: Arc<dyn MentionSource>) -> Self {
        self.register(source);
        self
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn MentionSource>> {
        self.sources.get(platform).cloned()
    }

    pub fn platforms(&self) -> Vec<&str> {
        self.sources.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
