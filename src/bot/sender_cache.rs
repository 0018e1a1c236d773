// src/bot/sender_cache.rs - Lazily created per-channel delivery handles

use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::RelayResult;
use crate::platforms::ChannelSender;
use crate::types::{ChannelId, SenderHandle};

#[derive(Clone, Default)]
pub struct SenderCache {
    handles: Arc<RwLock<HashMap<ChannelId, SenderHandle>>>,
}

impl SenderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached handle for `channel_id`, asking `sender` for the endpoint called
    /// `name` on first use.
    ///
    /// Creation runs without holding the lock; if two callers race, the first
    /// handle stored wins and both get it.
    pub async fn get_or_create(
        &self,
        channel_id: ChannelId,
        name: &str,
        sender: &dyn ChannelSender,
    ) -> RelayResult<SenderHandle> {
        if let Some(handle) = self.handles.read().await.get(&channel_id) {
            return Ok(handle.clone());
        }

        let created = sender.get_or_create_handle(channel_id, name).await?;
        let mut handles = self.handles.write().await;
        let handle = handles.entry(channel_id).or_insert_with(|| {
            debug!("Cached sender handle for channel {}", channel_id);
            created
        });
        Ok(handle.clone())
    }

    pub async fn evict(&self, channel_id: ChannelId) -> bool {
        self.handles.write().await.remove(&channel_id).is_some()
    }

    /// Drop handles for channels that are no longer registered.
    pub async fn retain_registered(&self, registered: &HashSet<ChannelId>) -> usize {
        let mut handles = self.handles.write().await;
        let before = handles.len();
        handles.retain(|channel_id, _| registered.contains(channel_id));
        let dropped = before - handles.len();
        if dropped > 0 {
            debug!("Dropped {} sender handles for unregistered channels", dropped);
        }
        dropped
    }

    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }
}
