//! Lookup transport: one [`Lookup`] implementation per mode, wrapped in a
//! timeout/retry loop.
//!
//! This is the only place that retries. Lookups perform exactly one attempt.

mod local;
mod remote;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{LookupMode, PipelineConfig};
use crate::error::{EnrichError, EnrichResult};
use crate::record::Record;

pub use local::{AddressClassifier, Classification, LocalLookup};
pub use remote::RemoteLookup;

/// HTTP request descriptor, already rendered for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpTarget {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

/// What a single attempt should query.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupTarget {
    Remote(HttpTarget),
    Local { address: String },
}

impl LookupTarget {
    /// Short form for log lines.
    pub fn describe(&self) -> String {
        match self {
            Self::Remote(http) => format!("{} {}", http.method, http.url),
            Self::Local { address } => format!("local {address}"),
        }
    }
}

/// A source of lookup results, selected once per pipeline.
#[async_trait]
pub trait Lookup: Send + Sync {
    fn mode(&self) -> LookupMode;

    /// Describe the request for `record`. Errors here are per-record.
    fn target(&self, record: &Record) -> EnrichResult<LookupTarget>;

    /// Perform one attempt.
    async fn call(&self, target: &LookupTarget, timeout: Duration) -> EnrichResult<Value>;
}

/// Timeout and retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            timeout: config.timeout(),
            retries: config.effective_retries(),
            retry_delay: config.retry_delay(),
        }
    }

    /// Wait before retry number `attempt` (1-based). Linear in `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

/// Runs a [`Lookup`] with per-attempt timeout and linear backoff.
#[derive(Clone)]
pub struct RetryingTransport {
    lookup: Arc<dyn Lookup>,
    policy: RetryPolicy,
}

impl RetryingTransport {
    pub fn new(lookup: Arc<dyn Lookup>, policy: RetryPolicy) -> Self {
        Self { lookup, policy }
    }

    pub fn lookup(&self) -> &Arc<dyn Lookup> {
        &self.lookup
    }

    /// Up to `retries + 1` attempts. The last error is returned once retries
    /// are exhausted; non-retryable errors are returned at once.
    pub async fn invoke(&self, target: &LookupTarget) -> EnrichResult<Value> {
        let mut attempt = 0;

        loop {
            let result = match tokio::time::timeout(
                self.policy.timeout,
                self.lookup.call(target, self.policy.timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(EnrichError::Timeout {
                    timeout: self.policy.timeout,
                }),
            };

            match result {
                Ok(value) => {
                    debug!(target = %target.describe(), attempts = attempt + 1, "lookup succeeded");
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.retries => {
                    attempt += 1;
                    let backoff = self.policy.delay_for(attempt);

                    warn!(
                        error = %e,
                        target = %target.describe(),
                        retry = attempt,
                        max_retries = self.policy.retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying lookup"
                    );

                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for RetryingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingTransport")
            .field("mode", &self.lookup.mode())
            .field("policy", &self.policy)
            .finish()
    }
}
