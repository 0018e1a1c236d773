// src/platforms/memory.rs - In-process stores and transports

use async_trait::async_trait;
use log::info;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{RelayError, RelayResult};
use crate::platforms::{
    AttachmentFetcher, AuditStore, BanOracle, ChannelSender, Collaborators, ImageClassifier, Notifier, RegistryStore,
};
use crate::types::{
    Attachment, ChannelId, ClassifierScore, MessageId, MessageLogEntry, MuteHistoryEntry, Notice, NotificationRef,
    OutboundMessage, SenderHandle, ServerId, UserId,
};

pub struct MemoryRegistry {
    channels: RwLock<Vec<ChannelId>>,
    failing: RwLock<bool>,
}

impl MemoryRegistry {
    pub fn new(channels: Vec<ChannelId>) -> Self {
        Self {
            channels: RwLock::new(channels),
            failing: RwLock::new(false),
        }
    }

    pub async fn set_channels(&self, channels: Vec<ChannelId>) {
        *self.channels.write().await = channels;
    }

    pub async fn set_failing(&self, failing: bool) {
        *self.failing.write().await = failing;
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistry {
    async fn load_registered_channels(&self) -> RelayResult<Vec<ChannelId>> {
        if *self.failing.read().await {
            return Err(RelayError::Infrastructure("registry unavailable".to_string()));
        }
        Ok(self.channels.read().await.clone())
    }
}

#[derive(Default)]
pub struct MemoryBans {
    users: RwLock<HashSet<UserId>>,
    servers: RwLock<HashSet<ServerId>>,
    failing: RwLock<bool>,
}

impl MemoryBans {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ban_user(&self, user_id: UserId) {
        self.users.write().await.insert(user_id);
    }

    pub async fn ban_server(&self, server_id: ServerId) {
        self.servers.write().await.insert(server_id);
    }

    pub async fn set_failing(&self, failing: bool) {
        *self.failing.write().await = failing;
    }
}

#[async_trait]
impl BanOracle for MemoryBans {
    async fn is_user_banned(&self, user_id: UserId) -> RelayResult<bool> {
        if *self.failing.read().await {
            return Err(RelayError::Infrastructure("ban list unavailable".to_string()));
        }
        Ok(self.users.read().await.contains(&user_id))
    }

    async fn is_server_banned(&self, server_id: ServerId) -> RelayResult<bool> {
        if *self.failing.read().await {
            return Err(RelayError::Infrastructure("ban list unavailable".to_string()));
        }
        Ok(self.servers.read().await.contains(&server_id))
    }
}

#[derive(Default)]
pub struct MemoryAudit {
    mutes: RwLock<HashMap<UserId, Vec<MuteHistoryEntry>>>,
    messages: RwLock<Vec<MessageLogEntry>>,
    closed: AtomicBool,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mute_history(&self, user_id: UserId) -> Vec<MuteHistoryEntry> {
        self.mutes.read().await.get(&user_id).cloned().unwrap_or_default()
    }

    pub async fn messages(&self) -> Vec<MessageLogEntry> {
        self.messages.read().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuditStore for MemoryAudit {
    async fn record_mute(&self, user_id: UserId, entry: MuteHistoryEntry) -> RelayResult<()> {
        self.mutes.write().await.entry(user_id).or_default().push(entry);
        Ok(())
    }

    async fn record_message(&self, entry: MessageLogEntry) -> RelayResult<()> {
        self.messages.write().await.push(entry);
        Ok(())
    }

    async fn close(&self) -> RelayResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Notifier that keeps everything it was asked to do
#[derive(Default)]
pub struct RecordingNotifier {
    sent: RwLock<Vec<(UserId, NotificationRef, Notice)>>,
    live: RwLock<HashSet<NotificationRef>>,
    deleted: RwLock<Vec<NotificationRef>>,
    edits: AtomicUsize,
    channel_notices: RwLock<Vec<(ChannelId, String, Option<Duration>)>>,
    deleted_messages: RwLock<Vec<(ChannelId, MessageId)>>,
    blocked_dms: RwLock<HashSet<UserId>>,
    failing: RwLock<bool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notices sent to `user_id` (edits not included)
    pub async fn user_notices(&self, user_id: UserId) -> Vec<Notice> {
        self.sent
            .read()
            .await
            .iter()
            .filter(|(uid, _, _)| *uid == user_id)
            .map(|(_, _, notice)| notice.clone())
            .collect()
    }

    pub async fn channel_notices(&self, channel_id: ChannelId) -> Vec<(String, Option<Duration>)> {
        self.channel_notices
            .read()
            .await
            .iter()
            .filter(|(cid, _, _)| *cid == channel_id)
            .map(|(_, text, delete_after)| (text.clone(), *delete_after))
            .collect()
    }

    pub async fn edit_count(&self) -> usize {
        self.edits.load(Ordering::SeqCst)
    }

    pub async fn deleted_messages(&self) -> Vec<(ChannelId, MessageId)> {
        self.deleted_messages.read().await.clone()
    }

    pub async fn was_deleted(&self, notification: &NotificationRef) -> bool {
        self.deleted.read().await.contains(notification)
    }

    /// Simulate the user deleting a notification on their side
    pub async fn forget(&self, notification: &NotificationRef) {
        self.live.write().await.remove(notification);
    }

    pub async fn block_dms(&self, user_id: UserId) {
        self.blocked_dms.write().await.insert(user_id);
    }

    pub async fn set_failing(&self, failing: bool) {
        *self.failing.write().await = failing;
    }

    async fn check_available(&self) -> RelayResult<()> {
        if *self.failing.read().await {
            return Err(RelayError::Infrastructure("transport unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_to_user(&self, user_id: UserId, notice: &Notice) -> RelayResult<NotificationRef> {
        self.check_available().await?;
        if self.blocked_dms.read().await.contains(&user_id) {
            return Err(RelayError::Infrastructure(format!("user {} does not accept direct messages", user_id)));
        }

        let reference = NotificationRef {
            user_id,
            id: Uuid::new_v4().to_string(),
        };
        self.live.write().await.insert(reference.clone());
        self.sent.write().await.push((user_id, reference.clone(), notice.clone()));
        Ok(reference)
    }

    async fn edit_user_notification(&self, notification: &NotificationRef, _notice: &Notice) -> RelayResult<()> {
        self.check_available().await?;
        if !self.live.read().await.contains(notification) {
            return Err(RelayError::NotFound(format!("notification {}", notification.id)));
        }
        self.edits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_notification(&self, notification: &NotificationRef) -> RelayResult<()> {
        self.check_available().await?;
        if !self.live.write().await.remove(notification) {
            return Err(RelayError::NotFound(format!("notification {}", notification.id)));
        }
        self.deleted.write().await.push(notification.clone());
        Ok(())
    }

    async fn send_channel_notice(
        &self,
        channel_id: ChannelId,
        text: &str,
        delete_after: Option<Duration>,
    ) -> RelayResult<()> {
        self.check_available().await?;
        self.channel_notices
            .write()
            .await
            .push((channel_id, text.to_string(), delete_after));
        Ok(())
    }

    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> RelayResult<()> {
        self.check_available().await?;
        self.deleted_messages.write().await.push((channel_id, message_id));
        Ok(())
    }
}

/// Channel sender that records deliveries and can refuse chosen channels
#[derive(Default)]
pub struct RecordingSender {
    sent: RwLock<Vec<(ChannelId, OutboundMessage)>>,
    failing_channels: RwLock<HashSet<ChannelId>>,
    /// Live endpoints per channel, keyed by name
    endpoints: RwLock<HashMap<ChannelId, HashMap<String, String>>>,
    created: AtomicUsize,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_channel(&self, channel_id: ChannelId) {
        self.failing_channels.write().await.insert(channel_id);
    }

    pub async fn heal_channel(&self, channel_id: ChannelId) {
        self.failing_channels.write().await.remove(&channel_id);
    }

    /// Invalidate every handle issued for `channel_id`
    pub async fn revoke_handles(&self, channel_id: ChannelId) {
        self.endpoints.write().await.remove(&channel_id);
    }

    pub async fn endpoint_names(&self, channel_id: ChannelId) -> Vec<String> {
        let mut names: Vec<String> = self
            .endpoints
            .read()
            .await
            .get(&channel_id)
            .map(|named| named.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub async fn handles_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub async fn sent(&self) -> Vec<(ChannelId, OutboundMessage)> {
        let mut sent = self.sent.read().await.clone();
        sent.sort_by_key(|(channel_id, _)| *channel_id);
        sent
    }
}

#[async_trait]
impl ChannelSender for RecordingSender {
    async fn get_or_create_handle(&self, channel_id: ChannelId, name: &str) -> RelayResult<SenderHandle> {
        if self.failing_channels.read().await.contains(&channel_id) {
            return Err(RelayError::Permission {
                channel_id,
                message: "cannot manage webhooks".to_string(),
            });
        }
        let mut endpoints = self.endpoints.write().await;
        let named = endpoints.entry(channel_id).or_default();
        if let Some(token) = named.get(name) {
            return Ok(SenderHandle { channel_id, token: token.clone() });
        }

        let token = Uuid::new_v4().to_string();
        named.insert(name.to_string(), token.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(SenderHandle { channel_id, token })
    }

    async fn send(&self, handle: &SenderHandle, message: &OutboundMessage) -> RelayResult<()> {
        let valid = self
            .endpoints
            .read()
            .await
            .get(&handle.channel_id)
            .map_or(false, |named| named.values().any(|token| *token == handle.token));
        if !valid {
            return Err(RelayError::NotFound(format!("sender handle for channel {}", handle.channel_id)));
        }
        self.sent.write().await.push((handle.channel_id, message.clone()));
        Ok(())
    }
}

/// Transport that only writes what it would have done to the log
#[derive(Default)]
pub struct LoggingTransport {
    endpoints: RwLock<HashMap<(ChannelId, String), String>>,
}

impl LoggingTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for LoggingTransport {
    async fn send_to_user(&self, user_id: UserId, notice: &Notice) -> RelayResult<NotificationRef> {
        let reference = NotificationRef {
            user_id,
            id: Uuid::new_v4().to_string(),
        };
        info!("[dm {} -> {}] {}: {}", reference.id, user_id, notice.title, notice.description);
        Ok(reference)
    }

    async fn edit_user_notification(&self, notification: &NotificationRef, notice: &Notice) -> RelayResult<()> {
        info!("[dm {} edited] {}: {}", notification.id, notice.title, notice.description);
        Ok(())
    }

    async fn delete_notification(&self, notification: &NotificationRef) -> RelayResult<()> {
        info!("[dm {} deleted]", notification.id);
        Ok(())
    }

    async fn send_channel_notice(
        &self,
        channel_id: ChannelId,
        text: &str,
        _delete_after: Option<Duration>,
    ) -> RelayResult<()> {
        info!("[#{}] {}", channel_id, text);
        Ok(())
    }

    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> RelayResult<()> {
        info!("[#{}] message {} deleted", channel_id, message_id);
        Ok(())
    }
}

#[async_trait]
impl ChannelSender for LoggingTransport {
    async fn get_or_create_handle(&self, channel_id: ChannelId, name: &str) -> RelayResult<SenderHandle> {
        let mut endpoints = self.endpoints.write().await;
        let token = endpoints
            .entry((channel_id, name.to_string()))
            .or_insert_with(|| {
                info!("[#{}] created endpoint '{}'", channel_id, name);
                Uuid::new_v4().to_string()
            })
            .clone();
        Ok(SenderHandle { channel_id, token })
    }

    async fn send(&self, handle: &SenderHandle, message: &OutboundMessage) -> RelayResult<()> {
        info!(
            "[#{}] {}: {} ({} files)",
            handle.channel_id,
            message.username,
            message.content,
            message.files.len()
        );
        Ok(())
    }
}

/// Returns the same bytes for every attachment
#[derive(Default)]
pub struct StaticFetcher {
    bytes: Vec<u8>,
    failing_urls: RwLock<HashSet<String>>,
    fetches: AtomicUsize,
}

impl StaticFetcher {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            ..Self::default()
        }
    }

    pub async fn fail_url(&self, url: &str) {
        self.failing_urls.write().await.insert(url.to_string());
    }

    pub async fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttachmentFetcher for StaticFetcher {
    async fn fetch(&self, attachment: &Attachment) -> RelayResult<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing_urls.read().await.contains(&attachment.url) {
            return Err(RelayError::NotFound(attachment.url.clone()));
        }
        Ok(self.bytes.clone())
    }
}

/// Scores every image the same
pub struct FixedClassifier {
    score: f32,
    failing: bool,
    calls: AtomicUsize,
}

impl FixedClassifier {
    pub fn new(score: f32) -> Self {
        Self {
            score,
            failing: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            score: 0.0,
            failing: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageClassifier for FixedClassifier {
    async fn classify(&self, _bytes: &[u8]) -> RelayResult<ClassifierScore> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(RelayError::Classifier("model not loaded".to_string()));
        }
        Ok(ClassifierScore {
            is_nsfw: self.score >= 0.5,
            score: self.score,
        })
    }
}

/// A full set of in-memory collaborators with handles kept for inspection
pub struct MemoryPlatform {
    pub registry: Arc<MemoryRegistry>,
    pub bans: Arc<MemoryBans>,
    pub audit: Arc<MemoryAudit>,
    pub notifier: Arc<RecordingNotifier>,
    pub sender: Arc<RecordingSender>,
    pub fetcher: Arc<StaticFetcher>,
    pub classifier: Arc<FixedClassifier>,
}

impl MemoryPlatform {
    pub fn new(channels: Vec<ChannelId>) -> Self {
        Self::with_classifier_score(channels, 0.0)
    }

    pub fn with_classifier_score(channels: Vec<ChannelId>, score: f32) -> Self {
        Self {
            registry: Arc::new(MemoryRegistry::new(channels)),
            bans: Arc::new(MemoryBans::new()),
            audit: Arc::new(MemoryAudit::new()),
            notifier: Arc::new(RecordingNotifier::new()),
            sender: Arc::new(RecordingSender::new()),
            fetcher: Arc::new(StaticFetcher::new(vec![0xff, 0xd8, 0xff])),
            classifier: Arc::new(FixedClassifier::new(score)),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            registry: self.registry.clone(),
            bans: self.bans.clone(),
            audit: self.audit.clone(),
            notifier: self.notifier.clone(),
            sender: self.sender.clone(),
            fetcher: self.fetcher.clone(),
            classifier: Some(self.classifier.clone()),
        }
    }
}
