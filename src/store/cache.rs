//! S3 store provider that reuses clients across operations.

use super::config::ClientConfig;
use super::s3::S3Store;
use super::{ObjectStore, StoreProvider};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Thread-safe S3 store cache keyed by the full client configuration, so
/// credential resolution happens once per distinct configuration
pub struct S3StoreProvider {
    cache: RwLock<HashMap<ClientConfig, Arc<S3Store>>>,
}

impl S3StoreProvider {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Get an existing store or create a new one for the given config
    pub async fn get_or_create(&self, config: &ClientConfig) -> Result<Arc<S3Store>> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(store) = cache.get(config) {
                return Ok(store.clone());
            }
        }

        debug!(
            "Creating S3 client (region: {:?}, endpoint: {:?})",
            config.region, config.endpoint
        );
        let store = Arc::new(S3Store::new(config).await?);

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        Ok(cache.entry(config.clone()).or_insert(store).clone())
    }

    /// Clear the cache
    pub fn clear(&self) {
        self.cache.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Number of cached stores
    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for S3StoreProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreProvider for S3StoreProvider {
    async fn store_for(&self, config: &ClientConfig) -> Result<Arc<dyn ObjectStore>> {
        let store: Arc<dyn ObjectStore> = self.get_or_create(config).await?;
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ClientConfigBuilder;

    #[test]
    fn test_cache_new() {
        let provider = S3StoreProvider::new();
        assert!(provider.is_empty());
        assert_eq!(provider.len(), 0);
    }

    #[tokio::test]
    async fn test_cache_reuses_store_per_config() {
        let provider = S3StoreProvider::new();
        let config = ClientConfigBuilder::new()
            .region("us-east-1")
            .endpoint("http://localhost:9000")
            .credentials("minio", "minio123")
            .force_path_style(true)
            .build()
            .unwrap();

        let first = provider.get_or_create(&config).await.unwrap();
        let second = provider.get_or_create(&config).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.len(), 1);

        let mut other = config.clone();
        other.socket_timeout_secs = 5;
        provider.get_or_create(&other).await.unwrap();
        assert_eq!(provider.len(), 2);

        provider.clear();
        assert!(provider.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_not_cached() {
        let provider = S3StoreProvider::new();
        let mut config = ClientConfig::new();
        config.signer_override = Some("Bogus".to_string());
        assert!(provider.store_for(&config).await.is_err());
        assert!(provider.is_empty());
    }
}
