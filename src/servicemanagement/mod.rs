//! Service Management API client
//!
//! Serves two roles for managed deployments:
//! - rollout id source: the config id carrying the most traffic in the
//!   latest successful rollout
//! - config builder: the full service configuration for a config id
//!
//! Requests are authorized with the access token kept fresh by the
//! [`TokenRefresher`].

use crate::error::{Error, Result};
use crate::rollout::RolloutIdSource;
use crate::switch::{ConfigBuilder, ServiceConfig};
use crate::token::TokenRefresher;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default Service Management endpoint
pub const DEFAULT_SERVICE_MANAGEMENT_URL: &str = "https://servicemanagement.googleapis.com";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RolloutsResponse {
    #[serde(default)]
    rollouts: Vec<Rollout>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Rollout {
    #[serde(default)]
    rollout_id: String,
    #[serde(default)]
    traffic_percent_strategy: Option<TrafficPercentStrategy>,
}

#[derive(Debug, Default, Deserialize)]
struct TrafficPercentStrategy {
    #[serde(default)]
    percentages: HashMap<String, f64>,
}

/// Config id with the largest traffic share in the newest rollout
///
/// Ties go to the lexically greatest id, which is the newest for dated ids.
fn latest_config_id(response: &RolloutsResponse) -> Option<String> {
    let rollout = response.rollouts.first()?;
    let strategy = rollout.traffic_percent_strategy.as_ref()?;
    strategy
        .percentages
        .iter()
        .max_by(|(a_id, a_pct), (b_id, b_pct)| {
            a_pct
                .partial_cmp(b_pct)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a_id.cmp(b_id))
        })
        .map(|(id, _)| id.clone())
}

/// REST client for the Service Management API
pub struct ServiceManagementClient {
    client: reqwest::Client,
    base_url: String,
    service_name: String,
    tokens: Arc<TokenRefresher>,
}

impl ServiceManagementClient {
    pub fn new(
        base_url: impl Into<String>,
        service_name: impl Into<String>,
        tokens: Arc<TokenRefresher>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::ServiceManagement(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_name: service_name.into(),
            tokens,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    fn rollouts_url(&self) -> String {
        format!(
            "{}/v1/services/{}/rollouts?filter=status=SUCCESS",
            self.base_url, self.service_name
        )
    }

    fn config_url(&self, config_id: &str) -> String {
        format!(
            "{}/v1/services/{}/configs/{}?view=FULL",
            self.base_url, self.service_name, config_id
        )
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let token = self.tokens.current_token().await?;

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::ServiceManagement(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::ServiceManagement(format!(
                "GET {} returned {}",
                url, status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::ServiceManagement(format!("invalid response from {}: {}", url, e)))
    }
}

#[async_trait]
impl RolloutIdSource for ServiceManagementClient {
    async fn fetch_rollout_id(&self) -> Result<String> {
        let body = self.get_json(&self.rollouts_url()).await?;
        let response: RolloutsResponse = serde_json::from_value(body)
            .map_err(|e| Error::ServiceManagement(format!("invalid rollouts response: {}", e)))?;

        let config_id = latest_config_id(&response).ok_or_else(|| {
            Error::ServiceManagement(format!(
                "no successful rollout found for service {}",
                self.service_name
            ))
        })?;
        debug!(
            rollout_id = response.rollouts.first().map(|r| r.rollout_id.as_str()).unwrap_or_default(),
            config_id = %config_id,
            "Fetched latest rollout"
        );
        Ok(config_id)
    }
}

#[async_trait]
impl ConfigBuilder for ServiceManagementClient {
    async fn build(&self, config_id: &str) -> Result<ServiceConfig> {
        let body = self.get_json(&self.config_url(config_id)).await?;

        if let Some(id) = body.get("id").and_then(|v| v.as_str()) {
            if id != config_id {
                return Err(Error::ServiceManagement(format!(
                    "requested config {} but received {}",
                    config_id, id
                )));
            }
        }
        Ok(ServiceConfig::new(config_id, &self.service_name, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{RefreshPolicy, TokenKind, TokenSource};

    struct StaticToken;

    #[async_trait]
    impl TokenSource for StaticToken {
        async fn fetch_token(&self) -> Result<(String, Duration)> {
            Ok(("ya29.test".to_string(), Duration::from_secs(3600)))
        }
    }

    fn client(base_url: &str) -> ServiceManagementClient {
        let tokens = Arc::new(TokenRefresher::new(
            TokenKind::Access,
            Arc::new(StaticToken),
            RefreshPolicy::default(),
        ));
        ServiceManagementClient::new(
            base_url,
            "bookstore.endpoints.example.cloud.goog",
            tokens,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn parse(json: &str) -> RolloutsResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_latest_config_id_picks_largest_share() {
        let response = parse(
            r#"{"rollouts":[{"rolloutId":"2024-01-02r1","trafficPercentStrategy":{"percentages":{"2024-01-01r0":20.0,"2024-01-02r0":80.0}}},
                             {"rolloutId":"2024-01-01r0","trafficPercentStrategy":{"percentages":{"2024-01-01r0":100.0}}}]}"#,
        );
        assert_eq!(latest_config_id(&response), Some("2024-01-02r0".to_string()));
    }

    #[test]
    fn test_latest_config_id_tie_prefers_newest() {
        let response = parse(
            r#"{"rollouts":[{"rolloutId":"r","trafficPercentStrategy":{"percentages":{"2024-01-01r0":50,"2024-01-02r0":50}}}]}"#,
        );
        assert_eq!(latest_config_id(&response), Some("2024-01-02r0".to_string()));
    }

    #[test]
    fn test_latest_config_id_empty() {
        assert_eq!(latest_config_id(&parse("{}")), None);
        assert_eq!(
            latest_config_id(&parse(r#"{"rollouts":[{"rolloutId":"r"}]}"#)),
            None
        );
    }

    #[test]
    fn test_urls() {
        let client = client("https://servicemanagement.googleapis.com/");
        assert_eq!(
            client.rollouts_url(),
            "https://servicemanagement.googleapis.com/v1/services/bookstore.endpoints.example.cloud.goog/rollouts?filter=status=SUCCESS"
        );
        assert_eq!(
            client.config_url("2024-01-01r0"),
            "https://servicemanagement.googleapis.com/v1/services/bookstore.endpoints.example.cloud.goog/configs/2024-01-01r0?view=FULL"
        );
        assert_eq!(client.service_name(), "bookstore.endpoints.example.cloud.goog");
    }
}
