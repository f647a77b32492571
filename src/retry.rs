use crate::config::env_or;
use crate::error::{RagError, Result};
use log::{debug, warn};
use std::future::Future;
use std::time::Duration;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_MS: u64 = 500;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_BACKOFF_MS: u64 = 8_000;

/// Outcome of a single failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    /// Worth retrying: transport errors, timeouts, 429 and 5xx responses
    Transient(String),
    /// Retrying won't help: other 4xx responses, malformed payloads
    Permanent(String),
}

impl Failure {
    /// Classify a reqwest transport error
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() || err.is_builder() {
            Failure::Permanent(err.to_string())
        } else {
            Failure::Transient(err.to_string())
        }
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("HTTP {} {}", status, body);
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Failure::Transient(message)
        } else {
            Failure::Permanent(message)
        }
    }

    fn message(&self) -> &str {
        match self {
            Failure::Transient(m) | Failure::Permanent(m) => m,
        }
    }
}

/// Retry policy applied at every remote-call boundary
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound for a single attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl RetryPolicy {
    /// Create a new policy from environment variables
    pub fn from_env() -> Result<Self> {
        let max_attempts: u32 = env_or("HTTP_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        let backoff_ms: u64 = env_or("HTTP_BACKOFF_MS", DEFAULT_BACKOFF_MS)?;
        let timeout_secs: u64 = env_or("HTTP_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?;

        if max_attempts == 0 {
            return Err(RagError::invalid_input("HTTP_MAX_ATTEMPTS must be at least 1"));
        }

        Ok(RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(backoff_ms),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS.max(backoff_ms)),
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    /// A policy that tries once; handy for tests and health probes
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Backoff before the given retry (attempt numbering starts at 1)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently or attempts run out
    pub async fn run<T, F, Fut>(&self, service: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, Failure>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_failure = Failure::Transient("no attempt made".to_string());

        for attempt in 1..=attempts {
            debug!("{} request attempt {}/{}", service, attempt, attempts);

            let outcome = match tokio::time::timeout(self.timeout, op()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Failure::Transient(format!(
                    "timed out after {:?}",
                    self.timeout
                ))),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(Failure::Permanent(message)) => {
                    warn!("{} request failed permanently: {}", service, message);
                    return Err(RagError::upstream(service, message));
                }
                Err(failure) => {
                    warn!(
                        "{} request failed, attempt {}/{}: {}",
                        service,
                        attempt,
                        attempts,
                        failure.message()
                    );
                    last_failure = failure;
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff_for(attempt)).await;
                    }
                }
            }
        }

        Err(RagError::upstream(
            service,
            format!(
                "giving up after {} attempts: {}",
                attempts,
                last_failure.message()
            ),
        ))
    }
}
