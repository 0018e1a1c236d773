use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::RelayResult;
use crate::types::{
    Attachment, ChannelId, ClassifierScore, MessageId, MessageLogEntry, MuteHistoryEntry, Notice,
    NotificationRef, OutboundMessage, SenderHandle, ServerId, UserId,
};

pub mod file;
pub mod http;
pub mod memory;

/// Source of truth for which channels take part in the relay
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn load_registered_channels(&self) -> RelayResult<Vec<ChannelId>>;
}

/// Answers ban questions; administration happens elsewhere
#[async_trait]
pub trait BanOracle: Send + Sync {
    async fn is_user_banned(&self, user_id: UserId) -> RelayResult<bool>;

    async fn is_server_banned(&self, server_id: ServerId) -> RelayResult<bool>;
}

/// Append-only audit persistence
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn record_mute(&self, user_id: UserId, entry: MuteHistoryEntry) -> RelayResult<()>;

    async fn record_message(&self, entry: MessageLogEntry) -> RelayResult<()>;

    /// Flush and release the underlying storage
    async fn close(&self) -> RelayResult<()> {
        Ok(())
    }
}

/// User-facing notifications: direct messages and channel notices
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_to_user(&self, user_id: UserId, notice: &Notice) -> RelayResult<NotificationRef>;

    /// Fails with `RelayError::NotFound` when the notification has been deleted
    async fn edit_user_notification(&self, notification: &NotificationRef, notice: &Notice) -> RelayResult<()>;

    async fn delete_notification(&self, notification: &NotificationRef) -> RelayResult<()>;

    /// Post plain text in a channel, optionally removed again after `delete_after`
    async fn send_channel_notice(
        &self,
        channel_id: ChannelId,
        text: &str,
        delete_after: Option<Duration>,
    ) -> RelayResult<()>;

    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> RelayResult<()>;
}

/// Per-channel delivery endpoint (webhook or equivalent)
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Reuse the channel's endpoint called `name`, creating it when there is none.
    async fn get_or_create_handle(&self, channel_id: ChannelId, name: &str) -> RelayResult<SenderHandle>;

    async fn send(&self, handle: &SenderHandle, message: &OutboundMessage) -> RelayResult<()>;
}

#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    async fn fetch(&self, attachment: &Attachment) -> RelayResult<Vec<u8>>;
}

/// Opaque image scoring capability
#[async_trait]
pub trait ImageClassifier: Send + Sync {
    async fn classify(&self, bytes: &[u8]) -> RelayResult<ClassifierScore>;
}

/// Everything the engine talks to outside the process
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn RegistryStore>,
    pub bans: Arc<dyn BanOracle>,
    pub audit: Arc<dyn AuditStore>,
    pub notifier: Arc<dyn Notifier>,
    pub sender: Arc<dyn ChannelSender>,
    pub fetcher: Arc<dyn AttachmentFetcher>,
    /// Without a classifier attachments are relayed unscreened
    pub classifier: Option<Arc<dyn ImageClassifier>>,
}
