//! Credential refresh
//!
//! A [`TokenRefresher`] owns the latest [`Credential`] for one token kind.
//! Callers read a snapshot without touching the network, except on first
//! use when they wait on a single shared fetch. A background task renews the
//! credential a safety margin before it expires and keeps retrying with
//! backoff when renewal fails.

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::error::{Error, Result};
use crate::metadata::MetadataFetcher;
use crate::shutdown::ShutdownSignal;
use crate::util::{ACCESS_TOKEN_PATH, IDENTITY_TOKEN_PATH};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Floor for retry delays while a held credential is about to expire
const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Kind of token served by a refresher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Identity,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKind::Access => write!(f, "access token"),
            TokenKind::Identity => write!(f, "identity token"),
        }
    }
}

/// A token and its validity window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub fetched_at: Instant,
    pub expires_at: Instant,
}

impl Credential {
    pub fn is_valid_at(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    /// Length of the validity window
    pub fn validity(&self) -> Duration {
        self.expires_at.saturating_duration_since(self.fetched_at)
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Source of fresh tokens: returns the token and how long it stays valid
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<(String, Duration)>;
}

/// When to renew, and how to back off after a failed renewal
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    /// Share of the validity window reserved before expiry
    pub safety_fraction: f64,
    /// Lower bound of the reserved time
    pub min_safety_margin: Duration,
    /// Delay between failed background refreshes
    pub backoff: BackoffConfig,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            safety_fraction: 0.1,
            min_safety_margin: Duration::from_secs(5),
            backoff: BackoffConfig {
                min_delay_ms: 1_000,
                max_delay_ms: 30_000,
                factor: 2.0,
                jitter_ms: 250,
            },
        }
    }
}

impl RefreshPolicy {
    /// Time before expiry at which a refresh is due; never zero, at most half the window
    pub fn safety_margin(&self, validity: Duration) -> Duration {
        let margin = validity
            .mul_f64(self.safety_fraction.clamp(0.0, 1.0))
            .max(self.min_safety_margin)
            .min(validity / 2);
        margin.max(Duration::from_nanos(1))
    }
}

/// Keeps one kind of token fresh
pub struct TokenRefresher {
    kind: TokenKind,
    source: Arc<dyn TokenSource>,
    policy: RefreshPolicy,
    backoff: ExponentialBackoff,
    credential: RwLock<Option<Credential>>,
    /// Held for the duration of every fetch; one fetch per kind at a time
    fetch_lock: tokio::sync::Mutex<()>,
    running: AtomicBool,
}

impl TokenRefresher {
    pub fn new(kind: TokenKind, source: Arc<dyn TokenSource>, policy: RefreshPolicy) -> Self {
        Self {
            kind,
            source,
            policy,
            backoff: ExponentialBackoff::new(policy.backoff),
            credential: RwLock::new(None),
            fetch_lock: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    /// The current token, fetching it first if nothing is cached yet
    pub async fn current_token(&self) -> Result<String> {
        self.current_credential().await.map(|c| c.token)
    }

    /// Snapshot of the current valid credential
    ///
    /// Once the cached credential has expired while the background task is
    /// running, this fails with [`Error::CredentialExpired`] instead of
    /// fetching on the caller's time.
    pub async fn current_credential(&self) -> Result<Credential> {
        if let Some(credential) = self.valid_credential() {
            return Ok(credential);
        }
        if self.running.load(Ordering::Acquire) && self.cached().is_some() {
            return Err(Error::CredentialExpired { kind: self.kind });
        }

        let _guard = self.fetch_lock.lock().await;
        // Another caller may have finished the fetch while we waited
        if let Some(credential) = self.valid_credential() {
            return Ok(credential);
        }
        self.fetch_locked().await
    }

    /// Cached credential, valid or not, without any I/O
    pub fn cached(&self) -> Option<Credential> {
        self.read().clone()
    }

    /// Force a refresh now
    pub async fn refresh(&self) -> Result<Credential> {
        let _guard = self.fetch_lock.lock().await;
        self.fetch_locked().await
    }

    /// Whether the background refresh task is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the background refresh task
    ///
    /// Returns `None` when a task is already running for this refresher.
    pub fn start(self: &Arc<Self>, mut shutdown: ShutdownSignal) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!(kind = %self.kind, "Token refresher already running");
            return None;
        }

        let refresher = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut failures: u32 = 0;
            let mut next_attempt = refresher
                .cached()
                .map(|c| refresher.refresh_deadline(&c))
                .unwrap_or_else(Instant::now);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep_until(next_attempt) => {}
                }

                // A caller may have fetched a fresh credential in the meantime
                if let Some(held) = refresher.valid_credential() {
                    let deadline = refresher.refresh_deadline(&held);
                    if deadline > Instant::now() {
                        next_attempt = deadline;
                        continue;
                    }
                }

                let result = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = refresher.refresh() => result,
                };

                match result {
                    Ok(credential) => {
                        failures = 0;
                        next_attempt = refresher.refresh_deadline(&credential);
                        debug!(
                            kind = %refresher.kind,
                            next_in = ?next_attempt.saturating_duration_since(Instant::now()),
                            "Scheduled next token refresh"
                        );
                    }
                    Err(e) => {
                        let now = Instant::now();
                        let mut delay = refresher.backoff.duration(failures);
                        failures = failures.saturating_add(1);
                        // Keep retrying before the held credential runs out
                        if let Some(held) = refresher.valid_credential() {
                            let half = held.expires_at.saturating_duration_since(now) / 2;
                            delay = delay.min(half.max(MIN_RETRY_DELAY));
                        }
                        warn!(
                            kind = %refresher.kind,
                            failures,
                            retry_in = ?delay,
                            "Token refresh failed: {}",
                            e
                        );
                        next_attempt = now + delay;
                    }
                }
            }

            refresher.running.store(false, Ordering::Release);
            debug!(kind = %refresher.kind, "Token refresher stopped");
        }))
    }

    fn refresh_deadline(&self, credential: &Credential) -> Instant {
        credential.expires_at - self.policy.safety_margin(credential.validity())
    }

    fn valid_credential(&self) -> Option<Credential> {
        let now = Instant::now();
        self.read().as_ref().filter(|c| c.is_valid_at(now)).cloned()
    }

    /// Fetch and store a credential; the caller holds `fetch_lock`
    async fn fetch_locked(&self) -> Result<Credential> {
        let started = Instant::now();
        let (token, validity) = self.source.fetch_token().await?;
        if validity.is_zero() {
            return Err(Error::TokenSource {
                kind: self.kind,
                reason: "token has no validity window".to_string(),
            });
        }

        let expires_at = started
            .checked_add(validity)
            .ok_or_else(|| Error::TokenSource {
                kind: self.kind,
                reason: format!("validity window {:?} out of range", validity),
            })?;

        let credential = Credential {
            token,
            fetched_at: started,
            expires_at,
        };
        *self.write() = Some(credential.clone());
        info!(kind = %self.kind, expires_in = ?validity, "Fetched new token");
        Ok(credential)
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Credential>> {
        self.credential.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Credential>> {
        self.credential.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Access token response of the metadata server
#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    #[allow(dead_code)]
    token_type: Option<String>,
}

/// Token source backed by the metadata server's service account endpoints
pub struct MetadataTokenSource {
    fetcher: Arc<dyn MetadataFetcher>,
    kind: TokenKind,
    audience: Option<String>,
    identity_ttl: Duration,
}

impl MetadataTokenSource {
    /// OAuth access token of the default service account
    pub fn access(fetcher: Arc<dyn MetadataFetcher>) -> Self {
        Self {
            fetcher,
            kind: TokenKind::Access,
            audience: None,
            identity_ttl: Duration::ZERO,
        }
    }

    /// OpenID identity token for `audience`, assumed valid for `ttl`
    pub fn identity(fetcher: Arc<dyn MetadataFetcher>, audience: impl Into<String>, ttl: Duration) -> Self {
        Self {
            fetcher,
            kind: TokenKind::Identity,
            audience: Some(audience.into()),
            identity_ttl: ttl,
        }
    }

    /// Metadata path fetched by this source
    pub fn path(&self) -> String {
        match (self.kind, &self.audience) {
            (TokenKind::Identity, Some(audience)) => {
                format!("{}?format=standard&audience={}", IDENTITY_TOKEN_PATH, audience)
            }
            (TokenKind::Identity, None) => IDENTITY_TOKEN_PATH.to_string(),
            (TokenKind::Access, _) => ACCESS_TOKEN_PATH.to_string(),
        }
    }
}

#[async_trait]
impl TokenSource for MetadataTokenSource {
    async fn fetch_token(&self) -> Result<(String, Duration)> {
        let body = self.fetcher.fetch(&self.path()).await?;

        match self.kind {
            TokenKind::Access => {
                let response: AccessTokenResponse =
                    serde_json::from_str(&body).map_err(|e| Error::TokenSource {
                        kind: self.kind,
                        reason: format!("invalid token response: {}", e),
                    })?;
                if response.expires_in <= 0 {
                    return Err(Error::TokenSource {
                        kind: self.kind,
                        reason: format!("non-positive expires_in {}", response.expires_in),
                    });
                }
                Ok((
                    response.access_token,
                    Duration::from_secs(response.expires_in as u64),
                ))
            }
            TokenKind::Identity => {
                let token = body.trim();
                if token.is_empty() {
                    return Err(Error::TokenSource {
                        kind: self.kind,
                        reason: "empty identity token".to_string(),
                    });
                }
                Ok((token.to_string(), self.identity_ttl))
            }
        }
    }
}
