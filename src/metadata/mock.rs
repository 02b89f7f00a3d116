//! In-memory metadata fetcher for tests.

use super::MetadataFetcher;
use crate::error::MetadataError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// MockMetadata serves canned responses per path and counts calls.
///
/// Paths without an entry answer with `NotFound` (404). A path carrying a
/// query string falls back to the entry registered for its bare path.
#[derive(Debug, Default)]
pub struct MockMetadata {
    entries: Mutex<HashMap<String, Result<String, MetadataError>>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `value` for `path`.
    pub fn with_value(self, path: &str, value: &str) -> Self {
        self.set_value(path, value);
        self
    }

    /// Fail `path` with `error`.
    pub fn with_error(self, path: &str, error: MetadataError) -> Self {
        self.set_error(path, error);
        self
    }

    /// Delay responses for `path`.
    pub fn with_delay(self, path: &str, delay: Duration) -> Self {
        if let Ok(mut delays) = self.delays.lock() {
            delays.insert(path.to_string(), delay);
        }
        self
    }

    /// Replace the value served for `path`.
    pub fn set_value(&self, path: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(path.to_string(), Ok(value.to_string()));
        }
    }

    /// Replace the error returned for `path`.
    pub fn set_error(&self, path: &str, error: MetadataError) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(path.to_string(), Err(error));
        }
    }

    /// Number of fetches issued for `path`, query string included.
    pub fn calls(&self, path: &str) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(path).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn lookup(&self, path: &str) -> Result<String, MetadataError> {
        let bare = path.split_once('?').map(|(p, _)| p).unwrap_or(path);
        let entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => {
                return Err(MetadataError::Transient {
                    path: path.to_string(),
                    message: "mock state poisoned".to_string(),
                })
            }
        };
        entries
            .get(path)
            .or_else(|| entries.get(bare))
            .cloned()
            .unwrap_or_else(|| {
                Err(MetadataError::NotFound {
                    path: path.to_string(),
                    status: 404,
                })
            })
    }

    fn delay_for(&self, path: &str) -> Option<Duration> {
        let bare = path.split_once('?').map(|(p, _)| p).unwrap_or(path);
        let delays = self.delays.lock().ok()?;
        delays.get(path).or_else(|| delays.get(bare)).copied()
    }
}

#[async_trait]
impl MetadataFetcher for MockMetadata {
    async fn fetch(&self, path: &str) -> Result<String, MetadataError> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(path.to_string()).or_insert(0) += 1;
        }
        if let Some(delay) = self.delay_for(path) {
            tokio::time::sleep(delay).await;
        }
        self.lookup(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let metadata = MockMetadata::new();
        let err = metadata.fetch("/nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(metadata.calls("/nope"), 1);
    }

    #[tokio::test]
    async fn test_query_falls_back_to_bare_path() {
        let metadata = MockMetadata::new().with_value("/identity", "jwt");
        assert_eq!(
            metadata.fetch("/identity?audience=x").await.unwrap(),
            "jwt"
        );
        assert_eq!(metadata.calls("/identity?audience=x"), 1);
    }
}
