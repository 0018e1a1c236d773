// src/bot/registry.rs - Snapshot of channels taking part in the relay

use log::{debug, info};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::RelayResult;
use crate::platforms::RegistryStore;
use crate::types::ChannelId;

/// Read-mostly set of registered channels.
///
/// Readers clone the `Arc` under a short read lock. A refresh loads from the
/// store first and only takes the write lock to swap the pointer, so a slow or
/// failing store never blocks message handling and never empties the cache.
#[derive(Clone, Default)]
pub struct RegistryCache {
    channels: Arc<RwLock<Arc<HashSet<ChannelId>>>>,
}

impl RegistryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> Arc<HashSet<ChannelId>> {
        self.channels.read().await.clone()
    }

    pub async fn is_registered(&self, channel_id: ChannelId) -> bool {
        self.channels.read().await.contains(&channel_id)
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Replace the snapshot with the store's current view.
    ///
    /// On error the previous snapshot stays in place and the error is returned.
    pub async fn refresh(&self, store: &dyn RegistryStore) -> RelayResult<usize> {
        let loaded: HashSet<ChannelId> = store.load_registered_channels().await?.into_iter().collect();
        let count = loaded.len();

        let previous = {
            let mut guard = self.channels.write().await;
            std::mem::replace(&mut *guard, Arc::new(loaded))
        };

        if previous.len() != count {
            info!("Registered channels changed: {} -> {}", previous.len(), count);
        } else {
            debug!("Registry refreshed, {} channels", count);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::memory::MemoryRegistry;

    #[tokio::test]
    async fn test_refresh_swaps_snapshot() {
        let store = MemoryRegistry::new(vec![1, 2, 3]);
        let cache = RegistryCache::new();
        assert!(!cache.is_registered(1).await);

        let count = cache.refresh(&store).await.unwrap();
        assert_eq!(count, 3);
        assert!(cache.is_registered(2).await);

        let before = cache.current().await;
        store.set_channels(vec![3, 4]).await;
        cache.refresh(&store).await.unwrap();

        // old snapshot handed out earlier is untouched
        assert!(before.contains(&1));
        assert!(!cache.is_registered(1).await);
        assert!(cache.is_registered(4).await);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let store = MemoryRegistry::new(vec![10, 20]);
        let cache = RegistryCache::new();
        cache.refresh(&store).await.unwrap();

        store.set_failing(true).await;
        assert!(cache.refresh(&store).await.is_err());
        assert_eq!(cache.len().await, 2);
        assert!(cache.is_registered(10).await);
    }
}
