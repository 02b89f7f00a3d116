//! Rollout strategy and polling
//!
//! Under the `managed` strategy the gateway follows new rollouts: a poller
//! asks a [`RolloutIdSource`] for the current config id on a fixed interval
//! and hands any new id to the [`ConfigSwitchCoordinator`]. Under `fixed` the
//! config id chosen at startup never changes and nothing polls.

use crate::error::{Error, Result};
use crate::metadata::MetadataFetcher;
use crate::shutdown::ShutdownSignal;
use crate::switch::{ConfigSwitchCoordinator, SwitchOutcome};
use crate::util::{CONFIG_ID_PATH, FIXED_ROLLOUT_STRATEGY, MANAGED_ROLLOUT_STRATEGY};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How the active config id evolves after startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RolloutStrategy {
    Fixed,
    Managed,
}

impl RolloutStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutStrategy::Fixed => FIXED_ROLLOUT_STRATEGY,
            RolloutStrategy::Managed => MANAGED_ROLLOUT_STRATEGY,
        }
    }
}

impl FromStr for RolloutStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            FIXED_ROLLOUT_STRATEGY => Ok(RolloutStrategy::Fixed),
            MANAGED_ROLLOUT_STRATEGY => Ok(RolloutStrategy::Managed),
            other => Err(Error::InvalidStrategy(other.to_string())),
        }
    }
}

impl std::fmt::Display for RolloutStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of the current rollout's config id
#[async_trait]
pub trait RolloutIdSource: Send + Sync {
    async fn fetch_rollout_id(&self) -> Result<String>;
}

/// Reads the config id from the instance metadata attributes
pub struct MetadataRolloutSource {
    fetcher: Arc<dyn MetadataFetcher>,
}

impl MetadataRolloutSource {
    pub fn new(fetcher: Arc<dyn MetadataFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl RolloutIdSource for MetadataRolloutSource {
    async fn fetch_rollout_id(&self) -> Result<String> {
        let body = self.fetcher.fetch(CONFIG_ID_PATH).await?;
        let id = body.trim();
        if id.is_empty() {
            return Err(Error::MissingAttribute("config_id"));
        }
        Ok(id.to_string())
    }
}

/// Longest accepted interval between rollout polls
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Polls for new rollouts and drives the coordinator
pub struct RolloutPoller {
    strategy: RolloutStrategy,
    source: Arc<dyn RolloutIdSource>,
    coordinator: Arc<ConfigSwitchCoordinator>,
    interval: Duration,
}

impl RolloutPoller {
    /// Intervals above [`MAX_POLL_INTERVAL`] are clamped to it
    pub fn new(
        strategy: RolloutStrategy,
        source: Arc<dyn RolloutIdSource>,
        coordinator: Arc<ConfigSwitchCoordinator>,
        interval: Duration,
    ) -> Self {
        Self {
            strategy,
            source,
            coordinator,
            interval: interval.min(MAX_POLL_INTERVAL),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start polling; `None` under the fixed strategy
    pub fn start(self, mut shutdown: ShutdownSignal) -> Option<JoinHandle<()>> {
        if self.strategy == RolloutStrategy::Fixed {
            debug!("Fixed rollout strategy, not polling");
            return None;
        }

        info!(interval = ?self.interval, "Starting rollout poller");
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + self.interval,
                self.interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut switches = JoinSet::new();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(_) = switches.join_next() => continue,
                    _ = ticker.tick() => {}
                }

                let fetched = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    fetched = self.source.fetch_rollout_id() => fetched,
                };
                self.handle(fetched, &mut switches);
            }

            // No switch may publish once the poller has stopped
            switches.shutdown().await;
            debug!("Rollout poller stopped");
        }))
    }

    /// Act on one poll result
    fn handle(&self, fetched: Result<String>, switches: &mut JoinSet<()>) {
        let config_id = match fetched {
            Ok(id) => id,
            Err(e) => {
                warn!("Failed to fetch rollout id: {}", e);
                return;
            }
        };

        if !self.coordinator.needs_switch(&config_id) {
            debug!(config_id = %config_id, "Rollout unchanged");
            return;
        }

        info!(config_id = %config_id, "New rollout detected");
        let coordinator = Arc::clone(&self.coordinator);
        // The switch runs on its own task so polling keeps going during a build
        switches.spawn(async move {
            match coordinator.switch_to(&config_id).await {
                Ok(SwitchOutcome::Switched) => info!(config_id = %config_id, "Rollout applied"),
                Ok(outcome) => debug!(config_id = %config_id, ?outcome, "Rollout not applied"),
                Err(e) => warn!(config_id = %config_id, "Rollout failed: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MetadataError;
    use crate::metadata::mock::MockMetadata;
    use crate::shutdown::Shutdown;
    use crate::switch::tests::FakeBuilder;

    fn poller(
        strategy: RolloutStrategy,
        metadata: Arc<MockMetadata>,
        coordinator: Arc<ConfigSwitchCoordinator>,
    ) -> RolloutPoller {
        RolloutPoller::new(
            strategy,
            Arc::new(MetadataRolloutSource::new(metadata)),
            coordinator,
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("fixed".parse::<RolloutStrategy>().unwrap(), RolloutStrategy::Fixed);
        assert_eq!(
            "managed\n".parse::<RolloutStrategy>().unwrap(),
            RolloutStrategy::Managed
        );
        assert_eq!(RolloutStrategy::Managed.to_string(), "managed");
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let err = "unmanaged".parse::<RolloutStrategy>().unwrap_err();
        assert!(matches!(err, Error::InvalidStrategy(ref s) if s == "unmanaged"));
        assert!("".parse::<RolloutStrategy>().is_err());
        assert!("Managed".parse::<RolloutStrategy>().is_err());
    }

    #[tokio::test]
    async fn test_metadata_rollout_source() {
        let metadata = Arc::new(MockMetadata::new().with_value(CONFIG_ID_PATH, "2024-01-01r0\n"));
        let source = MetadataRolloutSource::new(metadata.clone());
        assert_eq!(source.fetch_rollout_id().await.unwrap(), "2024-01-01r0");

        metadata.set_value(CONFIG_ID_PATH, "  ");
        assert!(matches!(
            source.fetch_rollout_id().await.unwrap_err(),
            Error::MissingAttribute(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_strategy_never_polls() {
        let metadata = Arc::new(MockMetadata::new().with_value(CONFIG_ID_PATH, "c1"));
        let coordinator = Arc::new(ConfigSwitchCoordinator::new(FakeBuilder::new()));
        let shutdown = Shutdown::new();

        let handle = poller(RolloutStrategy::Fixed, metadata.clone(), coordinator)
            .start(shutdown.signal());
        assert!(handle.is_none());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(metadata.calls(CONFIG_ID_PATH), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_managed_strategy_applies_new_rollout() {
        let metadata = Arc::new(MockMetadata::new().with_value(CONFIG_ID_PATH, "c1"));
        let builder = FakeBuilder::new();
        let coordinator = Arc::new(ConfigSwitchCoordinator::new(builder.clone()));
        coordinator.switch_to("c1").await.unwrap();
        let shutdown = Shutdown::new();

        let handle = poller(RolloutStrategy::Managed, metadata.clone(), coordinator.clone())
            .start(shutdown.signal())
            .unwrap();

        // Unchanged rollout: no build
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(metadata.calls(CONFIG_ID_PATH), 1);
        assert_eq!(builder.builds(), vec!["c1".to_string()]);

        metadata.set_value(CONFIG_ID_PATH, "c2");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(coordinator.active().unwrap().id, "c2");
        assert_eq!(builder.builds(), vec!["c1".to_string(), "c2".to_string()]);

        shutdown.trigger();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_keeps_polling() {
        let metadata = Arc::new(MockMetadata::new().with_error(
            CONFIG_ID_PATH,
            MetadataError::Transient {
                path: CONFIG_ID_PATH.to_string(),
                message: "503".to_string(),
            },
        ));
        let builder = FakeBuilder::new();
        let coordinator = Arc::new(ConfigSwitchCoordinator::new(builder.clone()));
        coordinator.switch_to("c1").await.unwrap();
        let shutdown = Shutdown::new();

        let handle = poller(RolloutStrategy::Managed, metadata.clone(), coordinator.clone())
            .start(shutdown.signal())
            .unwrap();

        tokio::time::sleep(Duration::from_secs(181)).await;
        assert_eq!(metadata.calls(CONFIG_ID_PATH), 3);
        assert_eq!(coordinator.active().unwrap().id, "c1");

        metadata.set_value(CONFIG_ID_PATH, "c2");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(coordinator.active().unwrap().id, "c2");

        shutdown.trigger();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_rollout_supersedes_slow_build() {
        let metadata = Arc::new(MockMetadata::new().with_value(CONFIG_ID_PATH, "c2"));
        let builder = FakeBuilder::new();
        let coordinator = Arc::new(ConfigSwitchCoordinator::new(builder.clone()));
        coordinator.switch_to("c1").await.unwrap();
        builder.gate("c2");
        let shutdown = Shutdown::new();

        let handle = poller(RolloutStrategy::Managed, metadata.clone(), coordinator.clone())
            .start(shutdown.signal())
            .unwrap();

        // c2 build hangs; the next tick sees c3
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(coordinator.state().candidate_config_id.as_deref(), Some("c2"));

        metadata.set_value(CONFIG_ID_PATH, "c3");
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(coordinator.active().unwrap().id, "c3");
        assert_eq!(coordinator.state().candidate_config_id, None);
        assert_eq!(
            builder.builds(),
            vec!["c1".to_string(), "c2".to_string(), "c3".to_string()]
        );

        shutdown.trigger();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_polling() {
        let metadata = Arc::new(MockMetadata::new().with_value(CONFIG_ID_PATH, "c1"));
        let coordinator = Arc::new(ConfigSwitchCoordinator::new(FakeBuilder::new()));
        let shutdown = Shutdown::new();

        let handle = poller(RolloutStrategy::Managed, metadata.clone(), coordinator)
            .start(shutdown.signal())
            .unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(metadata.calls(CONFIG_ID_PATH), 1);

        shutdown.trigger();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(metadata.calls(CONFIG_ID_PATH), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_in_flight_fetch() {
        let metadata = Arc::new(
            MockMetadata::new()
                .with_value(CONFIG_ID_PATH, "c2")
                .with_delay(CONFIG_ID_PATH, Duration::from_secs(3600)),
        );
        let builder = FakeBuilder::new();
        let coordinator = Arc::new(ConfigSwitchCoordinator::new(builder.clone()));
        coordinator.switch_to("c1").await.unwrap();
        let shutdown = Shutdown::new();

        let handle = poller(RolloutStrategy::Managed, metadata.clone(), coordinator.clone())
            .start(shutdown.signal())
            .unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(metadata.calls(CONFIG_ID_PATH), 1);

        shutdown.trigger();
        handle.await.unwrap();
        assert_eq!(coordinator.active().unwrap().id, "c1");
        assert_eq!(builder.builds(), vec!["c1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_in_flight_switch() {
        let metadata = Arc::new(MockMetadata::new().with_value(CONFIG_ID_PATH, "c2"));
        let builder = FakeBuilder::new();
        let coordinator = Arc::new(ConfigSwitchCoordinator::new(builder.clone()));
        coordinator.switch_to("c1").await.unwrap();
        builder.gate("c2");
        let shutdown = Shutdown::new();

        let handle = poller(RolloutStrategy::Managed, metadata.clone(), coordinator.clone())
            .start(shutdown.signal())
            .unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        builder.wait_for_builds(2).await;
        assert_eq!(coordinator.state().candidate_config_id.as_deref(), Some("c2"));

        shutdown.trigger();
        handle.await.unwrap();

        // The build finishing after shutdown must not publish
        builder.open("c2");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(coordinator.active().unwrap().id, "c1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_poll_interval_is_clamped() {
        let metadata = Arc::new(MockMetadata::new().with_value(CONFIG_ID_PATH, "c1"));
        let coordinator = Arc::new(ConfigSwitchCoordinator::new(FakeBuilder::new()));
        coordinator.switch_to("c1").await.unwrap();
        let shutdown = Shutdown::new();

        let poller = RolloutPoller::new(
            RolloutStrategy::Managed,
            Arc::new(MetadataRolloutSource::new(metadata.clone())),
            coordinator,
            Duration::from_secs(i64::MAX as u64),
        );
        assert_eq!(poller.interval(), MAX_POLL_INTERVAL);

        let handle = poller.start(shutdown.signal()).unwrap();
        tokio::time::sleep(MAX_POLL_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(metadata.calls(CONFIG_ID_PATH), 1);

        shutdown.trigger();
        handle.await.unwrap();
    }
}
