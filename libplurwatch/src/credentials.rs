//! Bearer tokens for polled connections
//!
//! The poller never stores tokens itself. A [`CredentialProvider`] hands out
//! a decrypted token per connection; a provider failure surfaces as
//! [`PlatformError::Authentication`] so the retry executor classifies it
//! like any other auth failure.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::error::{PlatformError, Result};
use crate::types::Connection;

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Token for `connection`
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Authentication` if no usable token exists.
    async fn token(&self, connection: &Connection) -> Result<SecretString>;
}

/// Reads tokens from `PLURWATCH_TOKEN_<CONNECTION_ID>`.
///
/// The connection id is upper-cased and every character outside
/// `[A-Z0-9]` becomes `_`, so `conn-1` reads `PLURWATCH_TOKEN_CONN_1`.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialProvider;

impl EnvCredentialProvider {
    pub fn new() -> Self {
        Self
    }

    pub fn var_name(connection_id: &str) -> String {
        let suffix: String = connection_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("PLURWATCH_TOKEN_{}", suffix)
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn token(&self, connection: &Connection) -> Result<SecretString> {
        let var = Self::var_name(&connection.id);
        match std::env::var(&var) {
            Ok(token) if !token.trim().is_empty() => Ok(SecretString::from(token)),
            _ => Err(PlatformError::Authentication(format!(
                "No token for connection {} (set {})",
                connection.id, var
            ))
            .into()),
        }
    }
}

/// In-memory tokens keyed by connection id
#[derive(Default)]
pub struct StaticCredentialProvider {
    tokens: Mutex<HashMap<String, String>>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(self, connection_id: &str, token: &str) -> Self {
        self.set_token(connection_id, token);
        self
    }

    pub fn set_token(&self, connection_id: &str, token: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection_id.to_string(), token.to_string());
    }

    pub fn revoke(&self, connection_id: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection_id);
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn token(&self, connection: &Connection) -> Result<SecretString> {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens
            .get(&connection.id)
            .map(|token| SecretString::from(token.clone()))
            .ok_or_else(|| {
                PlatformError::Authentication(format!(
                    "No token for connection {}",
                    connection.id
                ))
                .into()
            })
    }
}

/// Copy a token without exposing it in logs
pub fn duplicate_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn connection(id: &str) -> Connection {
        Connection::new("tenant-1", "mastodon", "alice").with_id(id)
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(
            EnvCredentialProvider::var_name("conn-1"),
            "PLURWATCH_TOKEN_CONN_1"
        );
        assert_eq!(
            EnvCredentialProvider::var_name("a.b/c"),
            "PLURWATCH_TOKEN_A_B_C"
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_env_provider_reads_token() {
        std::env::set_var("PLURWATCH_TOKEN_ENV_TEST", "secret-token");
        let token = EnvCredentialProvider::new()
            .token(&connection("env-test"))
            .await
            .unwrap();
        std::env::remove_var("PLURWATCH_TOKEN_ENV_TEST");
        assert_eq!(token.expose_secret(), "secret-token");
    }

    #[tokio::test]
    #[serial]
    async fn test_env_provider_missing_token_is_auth_error() {
        std::env::remove_var("PLURWATCH_TOKEN_MISSING");
        let err = EnvCredentialProvider::new()
            .token(&connection("missing"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::PlurwatchError::Platform(PlatformError::Authentication(_))
        ));
        assert!(err.to_string().contains("PLURWATCH_TOKEN_MISSING"));
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticCredentialProvider::new().with_token("conn-1", "abc");
        let token = provider.token(&connection("conn-1")).await.unwrap();
        assert_eq!(token.expose_secret(), "abc");

        provider.revoke("conn-1");
        let err = provider.token(&connection("conn-1")).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let token = SecretString::from("hunter2".to_string());
        let copy = duplicate_secret(&token);
        assert!(!format!("{:?}", copy).contains("hunter2"));
        assert_eq!(copy.expose_secret(), "hunter2");
    }
}
