//! Gateway Bootstrap - control plane for a cloud-deployed API gateway
//!
//! This crate keeps a gateway's identity and configuration correct over time:
//! - Compute platform detection through the metadata server
//! - Access and identity token refresh ahead of expiry
//! - Rollout polling under the `managed` strategy
//! - Atomic switching of the active service config
//! - Health and status reporting

pub mod backoff;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod health;
pub mod metadata;
pub mod platform;
pub mod rollout;
pub mod servicemanagement;
pub mod shutdown;
pub mod switch;
pub mod token;
pub mod util;

pub use bootstrap::Bootstrap;
pub use config::BootstrapConfig;
pub use error::{Error, MetadataError};

/// Library result type
pub type Result<T> = error::Result<T>;
