//! Compute platform detection
//!
//! The platform is worked out once per process by probing metadata paths that
//! only exist on a given platform, in priority order:
//! - region path: Cloud Run
//! - kube-env attribute: GKE
//! - gae_server_software attribute: GAE Flex
//! - otherwise: GCE

use crate::error::{Error, MetadataError, Result};
use crate::metadata::MetadataFetcher;
use crate::util::{GAE_SERVER_SOFTWARE_PATH, KUBE_ENV_PATH, REGION_PATH, ZONE_PATH};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Compute platform the gateway runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Gce,
    Gke,
    GaeFlex,
    CloudRun,
    Unknown,
}

impl Platform {
    /// Display name reported to service control
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Gce => "GCE(ESPv2)",
            Platform::Gke => "GKE(ESPv2)",
            Platform::GaeFlex => "GAE_FLEX(ESPv2)",
            Platform::CloudRun => "Cloud Run(ESPv2)",
            Platform::Unknown => "UNKNOWN",
        }
    }

    /// Parse an override value; display names and short names are accepted
    pub fn from_override(value: &str) -> Self {
        match value.trim() {
            "GCE(ESPv2)" => Platform::Gce,
            "GKE(ESPv2)" => Platform::Gke,
            "GAE_FLEX(ESPv2)" => Platform::GaeFlex,
            "Cloud Run(ESPv2)" => Platform::CloudRun,
            other => match other.to_ascii_lowercase().as_str() {
                "gce" => Platform::Gce,
                "gke" => Platform::Gke,
                "gae_flex" => Platform::GaeFlex,
                "cloud_run" => Platform::CloudRun,
                _ => Platform::Unknown,
            },
        }
    }

    /// Cloud Run exposes a region; everything else is zonal
    pub fn is_regional(&self) -> bool {
        matches!(self, Platform::CloudRun)
    }

    /// Metadata path holding this platform's location
    pub fn location_path(&self) -> &'static str {
        if self.is_regional() {
            REGION_PATH
        } else {
            ZONE_PATH
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Probe order, highest priority first
const PROBES: [(&str, Platform); 3] = [
    (REGION_PATH, Platform::CloudRun),
    (KUBE_ENV_PATH, Platform::Gke),
    (GAE_SERVER_SOFTWARE_PATH, Platform::GaeFlex),
];

/// Resolves the platform once and caches it for the lifetime of the resolver
pub struct PlatformResolver {
    fetcher: Arc<dyn MetadataFetcher>,
    platform_override: Option<String>,
    resolved: OnceCell<Platform>,
}

impl PlatformResolver {
    pub fn new(fetcher: Arc<dyn MetadataFetcher>) -> Self {
        Self {
            fetcher,
            platform_override: None,
            resolved: OnceCell::new(),
        }
    }

    /// Skip probing and use the given platform name
    pub fn with_override(mut self, platform: Option<String>) -> Self {
        self.platform_override = platform.filter(|p| !p.trim().is_empty());
        self
    }

    /// Resolve the platform; later calls return the cached value
    pub async fn resolve(&self) -> Result<Platform> {
        self.resolved
            .get_or_try_init(|| self.detect())
            .await
            .copied()
    }

    /// The resolved platform, if [`resolve`](Self::resolve) has succeeded
    pub fn get(&self) -> Option<Platform> {
        self.resolved.get().copied()
    }

    async fn detect(&self) -> Result<Platform> {
        if let Some(value) = &self.platform_override {
            let platform = Platform::from_override(value);
            info!(%platform, "Using platform override '{}'", value);
            return Ok(platform);
        }

        let mut failures: Vec<MetadataError> = Vec::new();
        for (path, platform) in PROBES {
            match self.fetcher.fetch(path).await {
                Ok(_) => {
                    info!(%platform, "Resolved compute platform");
                    return Ok(platform);
                }
                Err(e) if e.is_not_found() => {
                    debug!(path, "Platform probe not applicable");
                }
                Err(e) => {
                    warn!(path, "Platform probe failed: {}", e);
                    failures.push(e);
                }
            }
        }

        if failures.len() == PROBES.len() {
            let reasons: Vec<String> = failures.iter().map(|e| e.to_string()).collect();
            return Err(Error::PlatformUnresolved(reasons.join("; ")));
        }

        info!(platform = %Platform::Gce, "No platform-specific probe matched, defaulting");
        Ok(Platform::Gce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::mock::MockMetadata;

    fn transient(path: &str) -> MetadataError {
        MetadataError::Transient {
            path: path.to_string(),
            message: "503 Service Unavailable".to_string(),
        }
    }

    #[tokio::test]
    async fn test_region_probe_means_cloud_run() {
        let metadata = Arc::new(
            MockMetadata::new()
                .with_value(REGION_PATH, "projects/123/regions/us-central1")
                .with_value(KUBE_ENV_PATH, "KUBE_ENV_CONTENTS"),
        );
        let resolver = PlatformResolver::new(metadata.clone());

        assert_eq!(resolver.resolve().await.unwrap(), Platform::CloudRun);
        // Lower-priority probes are never consulted
        assert_eq!(metadata.calls(KUBE_ENV_PATH), 0);
    }

    #[tokio::test]
    async fn test_kube_env_means_gke() {
        let metadata = Arc::new(MockMetadata::new().with_value(KUBE_ENV_PATH, "KUBE_ENV_CONTENTS"));
        let resolver = PlatformResolver::new(metadata.clone());

        assert_eq!(resolver.resolve().await.unwrap(), Platform::Gke);
        assert_eq!(metadata.calls(REGION_PATH), 1);
    }

    #[tokio::test]
    async fn test_gae_server_software_means_gae_flex() {
        let metadata =
            Arc::new(MockMetadata::new().with_value(GAE_SERVER_SOFTWARE_PATH, "gae-flex"));
        let resolver = PlatformResolver::new(metadata);

        assert_eq!(resolver.resolve().await.unwrap(), Platform::GaeFlex);
    }

    #[tokio::test]
    async fn test_defaults_to_gce() {
        let resolver = PlatformResolver::new(Arc::new(MockMetadata::new()));
        assert_eq!(resolver.resolve().await.unwrap(), Platform::Gce);
    }

    #[tokio::test]
    async fn test_transient_probe_advances() {
        let metadata = Arc::new(
            MockMetadata::new()
                .with_error(REGION_PATH, transient(REGION_PATH))
                .with_value(KUBE_ENV_PATH, "KUBE_ENV_CONTENTS"),
        );
        let resolver = PlatformResolver::new(metadata);

        assert_eq!(resolver.resolve().await.unwrap(), Platform::Gke);
    }

    #[tokio::test]
    async fn test_all_probes_transient_is_fatal() {
        let metadata = Arc::new(
            MockMetadata::new()
                .with_error(REGION_PATH, transient(REGION_PATH))
                .with_error(KUBE_ENV_PATH, transient(KUBE_ENV_PATH))
                .with_error(
                    GAE_SERVER_SOFTWARE_PATH,
                    MetadataError::Timeout {
                        path: GAE_SERVER_SOFTWARE_PATH.to_string(),
                    },
                ),
        );
        let resolver = PlatformResolver::new(metadata);

        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, Error::PlatformUnresolved(_)));
        assert!(err.is_fatal());
        assert_eq!(resolver.get(), None);
    }

    #[tokio::test]
    async fn test_resolved_once() {
        let metadata = Arc::new(MockMetadata::new().with_value(KUBE_ENV_PATH, "KUBE_ENV_CONTENTS"));
        let resolver = PlatformResolver::new(metadata.clone());

        assert_eq!(resolver.resolve().await.unwrap(), Platform::Gke);
        // A later metadata change is not observed
        metadata.set_value(REGION_PATH, "us-central1");
        assert_eq!(resolver.resolve().await.unwrap(), Platform::Gke);
        assert_eq!(metadata.calls(KUBE_ENV_PATH), 1);
        assert_eq!(resolver.get(), Some(Platform::Gke));
    }

    #[tokio::test]
    async fn test_override_skips_probing() {
        let metadata = Arc::new(MockMetadata::new().with_value(KUBE_ENV_PATH, "KUBE_ENV_CONTENTS"));
        let resolver = PlatformResolver::new(metadata.clone())
            .with_override(Some("Cloud Run(ESPv2)".to_string()));

        assert_eq!(resolver.resolve().await.unwrap(), Platform::CloudRun);
        assert_eq!(metadata.calls(REGION_PATH), 0);
    }

    #[test]
    fn test_from_override() {
        assert_eq!(Platform::from_override("GKE(ESPv2)"), Platform::Gke);
        assert_eq!(Platform::from_override("gae_flex"), Platform::GaeFlex);
        assert_eq!(Platform::from_override("CLOUD_RUN"), Platform::CloudRun);
        assert_eq!(Platform::from_override("lambda"), Platform::Unknown);
    }

    #[test]
    fn test_location_path() {
        assert_eq!(Platform::CloudRun.location_path(), REGION_PATH);
        assert_eq!(Platform::Gke.location_path(), ZONE_PATH);
        assert_eq!(Platform::Gce.location_path(), ZONE_PATH);
    }
}
