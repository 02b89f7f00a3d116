//! Config switch coordination
//!
//! Builds the configuration for a rollout id through a [`ConfigBuilder`] and
//! publishes it as the active configuration in a single step. Readers only
//! ever see a whole configuration, old or new.
//!
//! Switches are serialized. Every new candidate bumps a generation counter;
//! an attempt whose generation is stale by the time it builds, or while it
//! builds, is abandoned and never published. The newest candidate wins
//! regardless of which build would have finished first.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// A fully built configuration for one rollout id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceConfig {
    pub id: String,
    pub service_name: String,
    pub body: serde_json::Value,
    pub built_at: DateTime<Utc>,
}

impl ServiceConfig {
    pub fn new(id: impl Into<String>, service_name: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            service_name: service_name.into(),
            body,
            built_at: Utc::now(),
        }
    }
}

/// Builds the full configuration for a rollout id
#[async_trait]
pub trait ConfigBuilder: Send + Sync {
    async fn build(&self, config_id: &str) -> Result<ServiceConfig>;
}

/// Active and in-flight config ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RolloutState {
    pub active_config_id: Option<String>,
    pub candidate_config_id: Option<String>,
}

/// Result of a switch request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The candidate was built and is now active
    Switched,
    /// The candidate was already active; nothing was built
    AlreadyActive,
    /// A switch to the same candidate is already in flight
    AlreadyPending,
    /// A newer candidate arrived; this attempt was dropped
    Superseded,
}

/// Serializes config switches and publishes the active configuration
pub struct ConfigSwitchCoordinator {
    builder: Arc<dyn ConfigBuilder>,
    state: Mutex<RolloutState>,
    generation: watch::Sender<u64>,
    switch_lock: tokio::sync::Mutex<()>,
    active: watch::Sender<Option<Arc<ServiceConfig>>>,
}

impl ConfigSwitchCoordinator {
    pub fn new(builder: Arc<dyn ConfigBuilder>) -> Self {
        let (generation, _) = watch::channel(0);
        let (active, _) = watch::channel(None);
        Self {
            builder,
            state: Mutex::new(RolloutState::default()),
            generation,
            switch_lock: tokio::sync::Mutex::new(()),
            active,
        }
    }

    /// The active configuration
    pub fn active(&self) -> Option<Arc<ServiceConfig>> {
        self.active.borrow().clone()
    }

    /// Receiver notified whenever a new configuration is published
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ServiceConfig>>> {
        self.active.subscribe()
    }

    /// Snapshot of the rollout state
    pub fn state(&self) -> RolloutState {
        self.lock_state().clone()
    }

    /// Whether `config_id` is neither active nor already being switched to
    pub fn needs_switch(&self, config_id: &str) -> bool {
        let state = self.lock_state();
        match state.candidate_config_id.as_deref() {
            Some(candidate) => candidate != config_id,
            None => state.active_config_id.as_deref() != Some(config_id),
        }
    }

    /// Switch the active configuration to `candidate`
    pub async fn switch_to(&self, candidate: &str) -> Result<SwitchOutcome> {
        let generation = {
            let mut state = self.lock_state();
            if state.candidate_config_id.as_deref() == Some(candidate) {
                debug!(candidate, "Switch already in flight");
                return Ok(SwitchOutcome::AlreadyPending);
            }
            if state.active_config_id.as_deref() == Some(candidate) {
                if let Some(stale) = state.candidate_config_id.take() {
                    // Back to the active config: drop the in-flight attempt
                    self.bump_generation();
                    info!(candidate, stale = %stale, "Cancelled pending switch");
                }
                return Ok(SwitchOutcome::AlreadyActive);
            }
            state.candidate_config_id = Some(candidate.to_string());
            self.bump_generation()
        };

        info!(candidate, generation, "Switching config");
        let _guard = self.switch_lock.lock().await;
        if self.current_generation() != generation {
            debug!(candidate, "Switch superseded before build");
            return Ok(SwitchOutcome::Superseded);
        }

        let mut generation_rx = self.generation.subscribe();
        let built = tokio::select! {
            biased;
            _ = generation_rx.wait_for(|g| *g != generation) => None,
            built = self.builder.build(candidate) => Some(built),
        };
        let Some(built) = built else {
            info!(candidate, "Switch superseded during build");
            return Ok(SwitchOutcome::Superseded);
        };

        let mut state = self.lock_state();
        if self.current_generation() != generation {
            info!(candidate, "Switch superseded after build");
            return Ok(SwitchOutcome::Superseded);
        }

        match built {
            Ok(config) => {
                state.active_config_id = Some(candidate.to_string());
                state.candidate_config_id = None;
                self.active.send_replace(Some(Arc::new(config)));
                info!(config_id = candidate, "Activated config");
                Ok(SwitchOutcome::Switched)
            }
            Err(e) => {
                state.candidate_config_id = None;
                error!(config_id = candidate, "Config build failed: {}", e);
                Err(Error::SwitchFailed {
                    config_id: candidate.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn bump_generation(&self) -> u64 {
        let mut next = 0;
        self.generation.send_modify(|g| {
            *g += 1;
            next = *g;
        });
        next
    }

    fn current_generation(&self) -> u64 {
        *self.generation.borrow()
    }

    fn lock_state(&self) -> MutexGuard<'_, RolloutState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
