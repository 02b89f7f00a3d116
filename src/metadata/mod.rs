//! Metadata client
//!
//! Fetches relative paths from the platform metadata server with a per-call
//! deadline and bounded, backed-off retries. The client knows nothing about
//! what a path means; callers decide how to interpret the body and the
//! [`MetadataError`] classification.

pub mod mock;

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::error::MetadataError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Default metadata server root
pub const METADATA_ROOT: &str = "http://metadata.google.internal";

/// Environment variable overriding the metadata server host
pub const GCE_METADATA_HOST_ENV_VAR: &str = "GCE_METADATA_HOST";

pub const METADATA_FLAVOR: &str = "Metadata-Flavor";
pub const METADATA_FLAVOR_VALUE: &str = "Google";

/// Something that can fetch a metadata path
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    /// Fetch the body stored at `path`
    async fn fetch(&self, path: &str) -> Result<String, MetadataError>;
}

/// Retry behavior for metadata fetches
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Deadline for each individual request
    pub timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay between attempts
    pub backoff: BackoffConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: crate::util::DEFAULT_RESPONSE_DEADLINE,
            max_retries: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

/// HTTP metadata client
#[derive(Debug, Clone)]
pub struct MetadataClient {
    client: reqwest::Client,
    base_url: String,
    policy: RetryPolicy,
    backoff: ExponentialBackoff,
}

impl MetadataClient {
    /// Create a client for the given base URL
    pub fn new(base_url: impl Into<String>, policy: RetryPolicy) -> Result<Self, MetadataError> {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .timeout(policy.timeout)
            .build()
            .map_err(|e| MetadataError::Transient {
                path: base_url.clone(),
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            policy,
            backoff: ExponentialBackoff::new(policy.backoff),
        })
    }

    /// Base URL the client resolves paths against
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Single attempt, classified
    async fn fetch_once(&self, path: &str) -> Result<String, MetadataError> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .get(&url)
            .header(METADATA_FLAVOR, METADATA_FLAVOR_VALUE)
            .send()
            .await
            .map_err(|e| classify_request_error(path, e))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(MetadataError::NotFound {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(MetadataError::Transient {
                path: path.to_string(),
                message: format!("metadata server returned {}", status),
            });
        }

        response
            .text()
            .await
            .map_err(|e| classify_request_error(path, e))
    }
}

#[async_trait]
impl MetadataFetcher for MetadataClient {
    async fn fetch(&self, path: &str) -> Result<String, MetadataError> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(path).await {
                Ok(body) => {
                    debug!(path, attempt, "Fetched metadata");
                    return Ok(body);
                }
                Err(e) if e.is_not_found() => return Err(e),
                Err(e) if attempt >= self.policy.max_retries => {
                    warn!(path, attempts = attempt + 1, "Metadata fetch failed: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff.duration(attempt);
                    debug!(path, attempt, ?delay, "Retrying metadata fetch: {}", e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Transport failures; HTTP statuses are classified in `fetch_once`
fn classify_request_error(path: &str, err: reqwest::Error) -> MetadataError {
    if err.is_timeout() {
        return MetadataError::Timeout {
            path: path.to_string(),
        };
    }
    MetadataError::Transient {
        path: path.to_string(),
        message: err.to_string(),
    }
}

/// Resolve the metadata base URL: explicit value, else `GCE_METADATA_HOST`, else the default root
pub fn resolve_base_url(configured: Option<&str>) -> String {
    if let Some(url) = configured.filter(|u| !u.is_empty()) {
        return url.trim_end_matches('/').to_string();
    }
    match std::env::var(GCE_METADATA_HOST_ENV_VAR) {
        Ok(host) if !host.is_empty() => {
            if host.starts_with("http://") || host.starts_with("https://") {
                host.trim_end_matches('/').to_string()
            } else {
                format!("http://{}", host.trim_end_matches('/'))
            }
        }
        _ => METADATA_ROOT.to_string(),
    }
}

/// Fetch a single-value attribute, trimmed; `None` when the path does not apply here
pub async fn fetch_optional(
    fetcher: &dyn MetadataFetcher,
    path: &str,
) -> Result<Option<String>, MetadataError> {
    match fetcher.fetch(path).await {
        Ok(body) => {
            let value = body.trim();
            if value.is_empty() {
                Ok(None)
            } else {
                Ok(Some(value.to_string()))
            }
        }
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
