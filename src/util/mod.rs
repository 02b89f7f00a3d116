//! Shared constants and small helpers
//!
//! Metadata paths, timing defaults and fixed limits used across the control
//! plane and by the collaborators that generate proxy configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default certs path.
pub const DEFAULT_ROOT_CA_PATHS: &str = "/etc/ssl/certs/ca-certificates.crt";

/// Field name for forwarded JWT payloads in filter metadata.
pub const JWT_PAYLOAD_METADATA_NAME: &str = "jwt_payloads";

// Supported HTTP methods
pub const GET: &str = "GET";
pub const PUT: &str = "PUT";
pub const POST: &str = "POST";
pub const DELETE: &str = "DELETE";
pub const PATCH: &str = "PATCH";
pub const OPTIONS: &str = "OPTIONS";
pub const CUSTOM: &str = "CUSTOM";

// Rollout strategy names
pub const FIXED_ROLLOUT_STRATEGY: &str = "fixed";
pub const MANAGED_ROLLOUT_STRATEGY: &str = "managed";

// Metadata paths, relative to the metadata server base URL
pub const CONFIG_ID_PATH: &str =
    "/computeMetadata/v1/instance/attributes/endpoints-service-version";
pub const GAE_SERVER_SOFTWARE_PATH: &str =
    "/computeMetadata/v1/instance/attributes/gae_server_software";
pub const KUBE_ENV_PATH: &str = "/computeMetadata/v1/instance/attributes/kube-env";
pub const ROLLOUT_STRATEGY_PATH: &str =
    "/computeMetadata/v1/instance/attributes/endpoints-rollout-strategy";
pub const SERVICE_NAME_PATH: &str = "/computeMetadata/v1/instance/attributes/endpoints-service-name";
pub const ACCESS_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
pub const IDENTITY_TOKEN_PATH: &str =
    "/computeMetadata/v1/instance/service-accounts/default/identity";
pub const PROJECT_ID_PATH: &str = "/computeMetadata/v1/project/project-id";

/// Cloud Run is regional; the zone path does not exist there.
pub const REGION_PATH: &str = "/computeMetadata/v1/instance/region";

/// GKE and GCE are zonal; the region path does not exist there.
pub const ZONE_PATH: &str = "/computeMetadata/v1/instance/zone";

/// Access token path served by a local token agent.
pub const TOKEN_AGENT_ACCESS_TOKEN_PATH: &str = "/local/access_token";

/// Must not carry a trailing slash.
pub const OPENID_DISCOVERY_CFG_URL_SUFFIX: &str = "/.well-known/openid-configuration";

/// Query parameter carrying the API key.
pub const API_KEY_PARAMETER_NAME: &str = "api_key";

/// retryOn policy for retriable status codes.
pub const RETRY_ON_RETRIABLE_STATUS_CODES: &str = "retriable-status-codes";

/// Response deadline used when a backend rule does not specify one.
pub const DEFAULT_RESPONSE_DEADLINE: Duration = Duration::from_secs(15);

/// Idle timeout applied globally when not configured.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Program size limit for the RE2 matcher.
pub const GOOGLE_RE2_MAX_PROGRAM_SIZE: u32 = 1000;

// Default JWT locations
pub const DEFAULT_JWT_HEADER_NAME_AUTHORIZATION: &str = "Authorization";
pub const DEFAULT_JWT_HEADER_VALUE_PREFIX_BEARER: &str = "Bearer ";
pub const DEFAULT_JWT_HEADER_NAME_X_GOOGLE_IAP_JWT_ASSERTION: &str = "X-Goog-Iap-Jwt-Assertion";
pub const DEFAULT_JWT_QUERY_PARAM_ACCESS_TOKEN: &str = "access_token";

/// Suffix of the header used to forward JWT payloads.
pub const JWT_AUTHN_FORWARD_PAYLOAD_HEADER_SUFFIX: &str = "API-UserInfo";

// Default API key locations
pub const DEFAULT_API_KEY_QUERY_PARAM_KEY: &str = "key";
pub const DEFAULT_API_KEY_QUERY_PARAM_API_KEY: &str = "api_key";

pub const HSTS_HEADER_KEY: &str = "Strict-Transport-Security";
pub const HSTS_HEADER_VALUE: &str = "max-age=31536000; includeSubdomains";

pub const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

pub const LOOPBACK_IPV4_ADDR: &str = "127.0.0.1";

/// Autogenerated operations are named `{prefix}_{component}[_{formatted_path}]`.
pub const AUTOGENERATED_OPERATION_PREFIX: &str = "ESPv2_Autogenerated";

/// Operation used for calls not tied to a specific API.
pub const ESP_OPERATION: &str = "espv2_deployment";

/// Prefix of every span name.
pub const SPAN_NAME_PREFIX: &str = "ingress";

/// Maximum byte length of a span name.
pub const SPAN_NAME_MAX_BYTE_NUM: usize = 128;

pub const STAT_PREFIX: &str = "ingress_http";

pub const OPERATION_HEADER_SUFFIX: &str = "Api-Operation-Name";

/// Backend rule key selecting the HTTP backend protocol.
pub const HTTP_BACKEND_PROTOCOL_KEY: &str = "http";

/// Methods excluded from service control reporting by default.
pub const SKIP_SERVICE_CONTROL_METHODS: &[&str] =
    &["grpc.health.v1.Health.Check", "grpc.health.v1.Health.Watch"];

/// Backend protocol attached to backend routing entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendProtocol {
    #[default]
    Unknown,
    Http1,
    Http2,
    Grpc,
}

impl BackendProtocol {
    /// Parse the protocol string of a backend rule; unrecognised values are `Unknown`
    pub fn from_rule(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "http/1.1" => BackendProtocol::Http1,
            "h2" => BackendProtocol::Http2,
            "grpc" => BackendProtocol::Grpc,
            _ => BackendProtocol::Unknown,
        }
    }
}

impl std::fmt::Display for BackendProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendProtocol::Unknown => write!(f, "unknown"),
            BackendProtocol::Http1 => write!(f, "http/1.1"),
            BackendProtocol::Http2 => write!(f, "h2"),
            BackendProtocol::Grpc => write!(f, "grpc"),
        }
    }
}

/// Truncate a span name to [`SPAN_NAME_MAX_BYTE_NUM`] bytes, marking the cut with `...`
///
/// The cut is moved back to a char boundary, so multi-byte names may come out
/// a little shorter than the limit.
pub fn truncate_span_name(span_name: &str) -> String {
    if span_name.len() <= SPAN_NAME_MAX_BYTE_NUM {
        return span_name.to_string();
    }

    let mut cut = SPAN_NAME_MAX_BYTE_NUM - 3;
    while !span_name.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &span_name[..cut])
}

/// Whether a fully-qualified method is excluded from service control reporting
pub fn should_skip_service_control(method: &str) -> bool {
    SKIP_SERVICE_CONTROL_METHODS.contains(&method)
}
