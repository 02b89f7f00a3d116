//! Startup sequence and ownership of the background tasks
//!
//! [`Bootstrap::start`] resolves the platform, reads the deployment
//! attributes, validates the rollout strategy and performs the initial config
//! switch before any background task runs. Any failure up to that point is
//! fatal. Afterwards the token refreshers and the rollout poller run until
//! [`Bootstrap::shutdown`].

use crate::config::{BootstrapConfig, RolloutSource};
use crate::error::{Error, Result};
use crate::metadata::{fetch_optional, resolve_base_url, MetadataClient, MetadataFetcher};
use crate::platform::{Platform, PlatformResolver};
use crate::rollout::{MetadataRolloutSource, RolloutIdSource, RolloutPoller, RolloutStrategy};
use crate::servicemanagement::ServiceManagementClient;
use crate::shutdown::Shutdown;
use crate::switch::{ConfigBuilder, ConfigSwitchCoordinator, RolloutState, ServiceConfig};
use crate::token::{MetadataTokenSource, TokenKind, TokenRefresher};
use crate::util::{PROJECT_ID_PATH, ROLLOUT_STRATEGY_PATH, SERVICE_NAME_PATH};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Token state as reported by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct TokenStatus {
    pub kind: TokenKind,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_seconds: Option<u64>,
}

/// Snapshot of the bootstrap state
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub platform: String,
    pub project_id: Option<String>,
    pub location: Option<String>,
    pub strategy: RolloutStrategy,
    pub service_name: String,
    pub rollout: RolloutState,
    pub active_built_at: Option<DateTime<Utc>>,
    pub tokens: Vec<TokenStatus>,
    pub started_at: DateTime<Utc>,
}

/// The running control plane
pub struct Bootstrap {
    platform: Platform,
    project_id: Option<String>,
    location: Option<String>,
    strategy: RolloutStrategy,
    service_name: String,
    coordinator: Arc<ConfigSwitchCoordinator>,
    access: Arc<TokenRefresher>,
    identity: Option<Arc<TokenRefresher>>,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
}

impl Bootstrap {
    /// Start against the metadata server named by the configuration
    pub async fn start(config: &BootstrapConfig) -> Result<Self> {
        let base_url = resolve_base_url(config.metadata.base_url.as_deref());
        info!(base_url = %base_url, "Using metadata server");
        let client = MetadataClient::new(base_url, config.metadata.retry_policy())?;
        Self::start_with(config, Arc::new(client), None).await
    }

    /// Start with an explicit metadata fetcher and, optionally, config builder
    ///
    /// Without a builder, configs are fetched from Service Management.
    pub async fn start_with(
        config: &BootstrapConfig,
        metadata: Arc<dyn MetadataFetcher>,
        builder: Option<Arc<dyn ConfigBuilder>>,
    ) -> Result<Self> {
        let platform = PlatformResolver::new(Arc::clone(&metadata))
            .with_override(config.platform.platform_override.clone())
            .resolve()
            .await?;

        let project_id = optional_attribute(&*metadata, PROJECT_ID_PATH).await;
        let location = optional_attribute(&*metadata, platform.location_path()).await;

        let strategy = match config.rollout.parsed_strategy()? {
            Some(strategy) => strategy,
            None => match fetch_optional(&*metadata, ROLLOUT_STRATEGY_PATH).await? {
                Some(value) => value.parse()?,
                None => RolloutStrategy::Fixed,
            },
        };

        let service_name = match &config.rollout.service_name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => fetch_optional(&*metadata, SERVICE_NAME_PATH)
                .await?
                .ok_or(Error::MissingAttribute("service_name"))?,
        };

        info!(
            %platform,
            %strategy,
            service_name = %service_name,
            project_id = project_id.as_deref().unwrap_or("unknown"),
            "Resolved deployment attributes"
        );

        let policy = config.tokens.refresh_policy();
        let access = Arc::new(TokenRefresher::new(
            TokenKind::Access,
            Arc::new(MetadataTokenSource::access(Arc::clone(&metadata))),
            policy,
        ));
        let identity = config.tokens.identity_audience.as_ref().map(|audience| {
            Arc::new(TokenRefresher::new(
                TokenKind::Identity,
                Arc::new(MetadataTokenSource::identity(
                    Arc::clone(&metadata),
                    audience.clone(),
                    config.tokens.identity_token_ttl(),
                )),
                policy,
            ))
        });

        let needs_service_management =
            builder.is_none() || config.rollout.source == RolloutSource::ServiceManagement;
        let service_management = if needs_service_management {
            Some(Arc::new(ServiceManagementClient::new(
                config.service_management.url.clone(),
                service_name.clone(),
                Arc::clone(&access),
                config.metadata.retry_policy().timeout,
            )?))
        } else {
            None
        };

        let builder: Arc<dyn ConfigBuilder> = match (builder, &service_management) {
            (Some(builder), _) => builder,
            (None, Some(client)) => client.clone(),
            (None, None) => return Err(Error::Config("no config builder available".to_string())),
        };
        let source: Arc<dyn RolloutIdSource> = match (config.rollout.source, &service_management) {
            (RolloutSource::ServiceManagement, Some(client)) => client.clone(),
            _ => Arc::new(MetadataRolloutSource::new(Arc::clone(&metadata))),
        };

        let initial_config_id = match &config.rollout.config_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => source.fetch_rollout_id().await?,
        };

        let coordinator = Arc::new(ConfigSwitchCoordinator::new(builder));
        coordinator.switch_to(&initial_config_id).await?;

        let shutdown = Shutdown::new();
        let mut tasks = Vec::new();
        tasks.extend(access.start(shutdown.signal()));
        if let Some(identity) = &identity {
            tasks.extend(identity.start(shutdown.signal()));
        }
        let poller = RolloutPoller::new(
            strategy,
            source,
            Arc::clone(&coordinator),
            config.rollout.poll_interval(),
        );
        tasks.extend(poller.start(shutdown.signal()));

        info!(
            config_id = %initial_config_id,
            tasks = tasks.len(),
            "Bootstrap complete"
        );

        Ok(Self {
            platform,
            project_id,
            location,
            strategy,
            service_name,
            coordinator,
            access,
            identity,
            shutdown,
            tasks: Mutex::new(tasks),
            started_at: Utc::now(),
        })
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn strategy(&self) -> RolloutStrategy {
        self.strategy
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn coordinator(&self) -> &Arc<ConfigSwitchCoordinator> {
        &self.coordinator
    }

    pub fn access_tokens(&self) -> &Arc<TokenRefresher> {
        &self.access
    }

    pub fn identity_tokens(&self) -> Option<&Arc<TokenRefresher>> {
        self.identity.as_ref()
    }

    pub fn active_config(&self) -> Option<Arc<ServiceConfig>> {
        self.coordinator.active()
    }

    /// Ready once a config is active and the access token is valid
    pub fn is_ready(&self) -> bool {
        let token_valid = self
            .access
            .cached()
            .map(|c| c.is_valid_at(Instant::now()))
            .unwrap_or(false);
        self.coordinator.active().is_some() && token_valid
    }

    pub fn status(&self) -> StatusReport {
        let now = Instant::now();
        let tokens = std::iter::once(&self.access)
            .chain(self.identity.iter())
            .map(|refresher| {
                let cached = refresher.cached();
                TokenStatus {
                    kind: refresher.kind(),
                    valid: cached.as_ref().map(|c| c.is_valid_at(now)).unwrap_or(false),
                    expires_in_seconds: cached
                        .map(|c| c.expires_at.saturating_duration_since(now).as_secs()),
                }
            })
            .collect();

        StatusReport {
            platform: self.platform.as_str().to_string(),
            project_id: self.project_id.clone(),
            location: self.location.clone(),
            strategy: self.strategy,
            service_name: self.service_name.clone(),
            rollout: self.coordinator.state(),
            active_built_at: self.coordinator.active().map(|c| c.built_at),
            tokens,
            started_at: self.started_at,
        }
    }

    /// Stop every background task and wait for them to finish
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Bootstrap shut down");
    }
}

/// Attribute that only informs status output; failures are logged and ignored
async fn optional_attribute(metadata: &dyn MetadataFetcher, path: &str) -> Option<String> {
    match fetch_optional(metadata, path).await {
        Ok(value) => value,
        Err(e) => {
            warn!(path, "Failed to read attribute: {}", e);
            None
        }
    }
}
