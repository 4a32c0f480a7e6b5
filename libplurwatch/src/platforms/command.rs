//! Mention source backed by an external fetcher command
//!
//! The fetcher is any executable that prints the mentions as a JSON array on
//! stdout:
//!
//! ```text
//! [{"id": "1002", "author": "bob", "content": "@alice hi", "created_at": 1700000000}]
//! ```
//!
//! Placeholders in the command template are replaced per fetch:
//! `{since_id}`, `{account}` and `{connection_id}`. An argument that is
//! empty after substitution (e.g. `{since_id}` on a first poll) is dropped,
//! along with the flag that introduces it.
//! The bearer token is passed in `PLURWATCH_TOKEN`, never on the command
//! line.
//!
//! Exit codes follow the Plurcast tool conventions: 0 success, 2
//! authentication failure, 3 invalid input, anything else a runtime error.
//! A runtime error whose stderr starts with `HTTP <status>` carries that
//! status so it classifies like an HTTP response.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::{PlatformError, Result};
use crate::platforms::MentionSource;
use crate::types::{Connection, Mention};

pub const TOKEN_ENV: &str = "PLURWATCH_TOKEN";

#[derive(Debug, Clone)]
pub struct CommandSource {
    platform: String,
    template: String,
    timeout: Duration,
}

impl CommandSource {
    pub fn new(platform: &str, template: &str) -> Self {
        Self {
            platform: platform.to_string(),
            template: template.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Program and arguments for one fetch.
    ///
    /// A placeholder argument that renders empty is dropped together with
    /// the `--flag` right before it, and `--flag={since_id}` is dropped
    /// whole, so a first poll never passes a flag without its value.
    pub fn render(&self, connection: &Connection, since_id: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut flag_pending = false;

        for token in self.template.split_whitespace() {
            let rendered = token
                .replace("{since_id}", since_id.unwrap_or(""))
                .replace("{account}", &connection.account)
                .replace("{connection_id}", &connection.id);

            if rendered != token {
                let empty_value = rendered.is_empty()
                    || (rendered.starts_with('-') && rendered.ends_with('='));
                if empty_value {
                    if flag_pending && rendered.is_empty() {
                        args.pop();
                    }
                    flag_pending = false;
                    continue;
                }
            }

            flag_pending = is_bare_flag(token);
            args.push(rendered);
        }

        args
    }
}

/// `--since` or `-s`, but not `--since=x` and not a lone `-`
fn is_bare_flag(token: &str) -> bool {
    token.len() > 1 && token.starts_with('-') && !token.contains('=') && !token.contains('{')
}

#[async_trait]
impl MentionSource for CommandSource {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn fetch_mentions(
        &self,
        connection: &Connection,
        token: &SecretString,
        since_id: Option<&str>,
    ) -> Result<Vec<Mention>> {
        let argv = self.render(connection, since_id);
        let (program, args) = argv.split_first().ok_or_else(|| {
            PlatformError::Permanent(format!("Empty fetch command for {}", self.platform))
        })?;

        debug!(platform = %self.platform, program = %program, "Running fetcher");

        let child = Command::new(program)
            .args(args)
            .env(TOKEN_ENV, token.expose_secret())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PlatformError::Permanent(format!("Failed to run fetcher '{}': {}", program, e))
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                PlatformError::Network(format!(
                    "Fetcher timed out after {}",
                    humantime::format_duration(self.timeout)
                ))
            })?
            .map_err(|e| PlatformError::Network(format!("Fetcher I/O failed: {}", e)))?;

        if output.status.success() {
            return serde_json::from_slice(&output.stdout).map_err(|e| {
                PlatformError::Api(format!("Fetcher printed invalid JSON: {}", e)).into()
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(error_from_exit(output.status.code(), stderr).into())
    }
}

/// Map a failed fetcher run to a platform error
pub fn error_from_exit(code: Option<i32>, stderr: String) -> PlatformError {
    if let Some(error) = parse_http_status(&stderr) {
        return error;
    }

    match code {
        Some(2) => PlatformError::Authentication(stderr),
        Some(3) => PlatformError::Validation(stderr),
        Some(code) => PlatformError::Api(format!("fetcher exited with {}: {}", code, stderr)),
        None => PlatformError::Network(format!("fetcher killed by signal: {}", stderr)),
    }
}

/// `HTTP 503 Service Unavailable` -> `Http { status: 503, .. }`
fn parse_http_status(stderr: &str) -> Option<PlatformError> {
    let rest = stderr.strip_prefix("HTTP ")?;
    let (status, message) = rest.split_once(' ').unwrap_or((rest, ""));
    let status: u16 = status.trim_end_matches(':').parse().ok()?;
    Some(PlatformError::Http {
        status,
        message: message.trim().to_string(),
    })
}
