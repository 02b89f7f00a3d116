//! Error types for the bootstrap control plane
//!
//! Metadata fetches fail with a [`MetadataError`] that tells callers whether the
//! path simply does not exist on this platform or the metadata server is having
//! trouble. Everything above the metadata client reports an [`Error`].

use crate::token::TokenKind;
use thiserror::Error;

/// Classified failure of a single metadata fetch
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetadataError {
    /// The path does not apply to this platform (any 4xx response)
    #[error("metadata path {path} not found (status {status})")]
    NotFound { path: String, status: u16 },
    /// Network error or 5xx response after all retries were used
    #[error("metadata fetch for {path} failed: {message}")]
    Transient { path: String, message: String },
    /// The last attempt hit the per-call deadline
    #[error("metadata fetch for {path} timed out")]
    Timeout { path: String },
}

impl MetadataError {
    /// Whether this error means "not applicable here" rather than "unavailable"
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetadataError::NotFound { .. })
    }

    /// Whether a later attempt could succeed
    pub fn is_retryable(&self) -> bool {
        !self.is_not_found()
    }

    /// The metadata path that failed
    pub fn path(&self) -> &str {
        match self {
            MetadataError::NotFound { path, .. }
            | MetadataError::Transient { path, .. }
            | MetadataError::Timeout { path } => path,
        }
    }
}

/// Control plane error
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("invalid rollout strategy '{0}', expected 'fixed' or 'managed'")]
    InvalidStrategy(String),

    #[error("no valid {kind} is available")]
    CredentialExpired { kind: TokenKind },

    #[error("switch to config '{config_id}' failed: {reason}")]
    SwitchFailed { config_id: String, reason: String },

    #[error("unable to determine the compute platform: {0}")]
    PlatformUnresolved(String),

    #[error("required attribute '{0}' is not configured and not present in metadata")]
    MissingAttribute(&'static str),

    #[error("{kind} source failed: {reason}")]
    TokenSource { kind: TokenKind, reason: String },

    #[error("service management request failed: {0}")]
    ServiceManagement(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error should abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidStrategy(_)
                | Error::PlatformUnresolved(_)
                | Error::MissingAttribute(_)
                | Error::Config(_)
        )
    }
}

/// Control plane result type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_not_retryable() {
        let err = MetadataError::NotFound {
            path: "/computeMetadata/v1/instance/region".to_string(),
            status: 404,
        };
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert_eq!(err.path(), "/computeMetadata/v1/instance/region");
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = MetadataError::Timeout {
            path: "/x".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::InvalidStrategy("unmanaged".to_string()).is_fatal());
        assert!(!Error::CredentialExpired {
            kind: TokenKind::Access
        }
        .is_fatal());
        assert!(!Error::SwitchFailed {
            config_id: "c1".to_string(),
            reason: "boom".to_string()
        }
        .is_fatal());
    }

    #[test]
    fn test_invalid_strategy_message() {
        let err = Error::InvalidStrategy("unmanaged".to_string());
        assert_eq!(
            err.to_string(),
            "invalid rollout strategy 'unmanaged', expected 'fixed' or 'managed'"
        );
    }
}
