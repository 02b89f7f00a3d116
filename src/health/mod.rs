//! Health check module
//!
//! This module provides health check functionality for the bootstrap service:
//! - Basic liveness check
//! - Readiness derived from the bootstrap state (active config, valid tokens)

use crate::bootstrap::{Bootstrap, StatusReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
}

impl HealthStatus {
    /// Whether the service should receive traffic in this state
    pub fn is_serving(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Health checker service
///
/// Serves liveness from the moment the process starts; readiness only once
/// a [`Bootstrap`] has been attached and reports a usable state.
#[derive(Clone)]
pub struct HealthChecker {
    start_time: Instant,
    bootstrap: Arc<OnceLock<Arc<Bootstrap>>>,
    version: String,
}

impl HealthChecker {
    /// Create a new health checker
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bootstrap: Arc::new(OnceLock::new()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Attach the running bootstrap; only the first call has an effect
    pub fn attach(&self, bootstrap: Arc<Bootstrap>) {
        let _ = self.bootstrap.set(bootstrap);
    }

    /// Get liveness status (always healthy if the service is running)
    pub fn liveness(&self) -> HealthResponse {
        self.response(HealthStatus::Healthy, None)
    }

    /// Get readiness status
    pub fn readiness(&self) -> HealthResponse {
        let Some(bootstrap) = self.bootstrap.get() else {
            return self.response(
                HealthStatus::Unhealthy,
                Some("Bootstrap in progress".to_string()),
            );
        };

        if bootstrap.active_config().is_none() {
            return self.response(
                HealthStatus::Unhealthy,
                Some("No active service config".to_string()),
            );
        }
        if !bootstrap.is_ready() {
            return self.response(
                HealthStatus::Unhealthy,
                Some("Access token unavailable".to_string()),
            );
        }

        let identity_valid = bootstrap
            .identity_tokens()
            .map(|refresher| {
                refresher
                    .cached()
                    .map(|c| c.is_valid_at(tokio::time::Instant::now()))
                    .unwrap_or(false)
            })
            .unwrap_or(true);
        if !identity_valid {
            return self.response(
                HealthStatus::Degraded,
                Some("Identity token unavailable".to_string()),
            );
        }

        self.response(HealthStatus::Healthy, None)
    }

    /// Bootstrap status, once attached
    pub fn status(&self) -> Option<StatusReport> {
        self.bootstrap.get().map(|b| b.status())
    }

    /// Check if the service is ready
    pub fn is_ready(&self) -> bool {
        self.readiness().status.is_serving()
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn response(&self, status: HealthStatus, message: Option<String>) -> HealthResponse {
        HealthResponse {
            status,
            version: self.version.clone(),
            uptime_seconds: self.uptime_seconds(),
            timestamp: Utc::now(),
            message,
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}
