// src/types/mod.rs - Messages, records and notices that flow through the relay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub type UserId = u64;
pub type ChannelId = u64;
pub type ServerId = u64;
pub type MessageId = u64;

/// File attached to an inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: u64,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            url: url.into(),
            content_type: None,
            size: 0,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Lowercased file extension without the dot
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
    }

    /// Images are recognised by MIME type first, file extension second
    pub fn is_image(&self, image_extensions: &[String]) -> bool {
        if let Some(ref content_type) = self.content_type {
            if content_type.starts_with("image/") {
                return true;
            }
        }
        match self.extension() {
            Some(ext) => image_extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(&ext)),
            None => false,
        }
    }
}

/// A message arriving from one registered channel. Lives for one pipeline + fan-out call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    pub message_id: MessageId,
    pub author_id: UserId,
    pub author_name: String,
    #[serde(default)]
    pub author_avatar_url: Option<String>,
    #[serde(default)]
    pub author_is_bot: bool,
    pub source_channel_id: ChannelId,
    #[serde(default)]
    pub origin_server_id: Option<ServerId>,
    #[serde(default)]
    pub origin_server_name: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl RelayMessage {
    pub fn new(
        message_id: MessageId,
        author_id: UserId,
        author_name: impl Into<String>,
        source_channel_id: ChannelId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            author_id,
            author_name: author_name.into(),
            author_avatar_url: None,
            author_is_bot: false,
            source_channel_id,
            origin_server_id: None,
            origin_server_name: None,
            content: content.into(),
            attachments: Vec::new(),
            received_at: Utc::now(),
        }
    }

    pub fn from_server(mut self, server_id: ServerId, server_name: impl Into<String>) -> Self {
        self.origin_server_id = Some(server_id);
        self.origin_server_name = Some(server_name.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.author_avatar_url = Some(url.into());
        self
    }
}

/// Channel opted into the shared conversation. Owned by the external registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRegistration {
    pub channel_id: ChannelId,
    pub guild_id: ServerId,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BanSubject {
    User,
    Server,
}

/// Entry in the external ban list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanRecord {
    pub subject_id: u64,
    pub subject_kind: BanSubject,
    pub active: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// How long a mute lasts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteDuration {
    Timed(Duration),
    /// Never expires on its own; lifted with `MuteManager::unmute`
    Indefinite,
}

impl MuteDuration {
    /// End time for a mute starting at `now`; `None` means no automatic expiry.
    pub fn end_time_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            MuteDuration::Timed(duration) => chrono::Duration::from_std(*duration)
                .ok()
                .and_then(|d| now.checked_add_signed(d)),
            MuteDuration::Indefinite => None,
        }
    }

    pub fn as_secs(&self) -> Option<u64> {
        match self {
            MuteDuration::Timed(duration) => Some(duration.as_secs()),
            MuteDuration::Indefinite => None,
        }
    }
}

/// Reference to a direct notification so it can be edited or deleted later
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationRef {
    pub user_id: UserId,
    pub id: String,
}

/// Active mute. At most one per user; renewals overwrite in place.
#[derive(Debug, Clone, PartialEq)]
pub struct MuteRecord {
    pub user_id: UserId,
    pub end_time: Option<DateTime<Utc>>,
    pub reason: String,
    pub notification: Option<NotificationRef>,
    pub origin_channel_id: ChannelId,
}

impl MuteRecord {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        match self.end_time {
            Some(end) => now < end,
            None => true,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_active_at(now)
    }
}

/// Mute history line persisted per user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuteHistoryEntry {
    pub timestamp: DateTime<Utc>,
    /// `None` for indefinite mutes
    pub duration_secs: Option<u64>,
    pub reason: String,
}

/// Audit record for every accepted message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageLogEntry {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub attachment_count: usize,
}

impl MessageLogEntry {
    /// Stamped with the message's arrival time
    pub fn from_message(message: &RelayMessage) -> Self {
        Self {
            user_id: message.author_id,
            channel_id: message.source_channel_id,
            content: message.content.clone(),
            timestamp: message.received_at,
            attachment_count: message.attachments.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeTone {
    Danger,
    Success,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoticeField {
    pub name: String,
    pub value: String,
}

/// Transport-neutral rich notification; the transport decides how to render it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub title: String,
    pub description: String,
    pub fields: Vec<NoticeField>,
    pub tone: NoticeTone,
    /// Channel the recipient can jump back to
    pub link_channel: Option<ChannelId>,
    pub timestamp: DateTime<Utc>,
}

impl Notice {
    pub fn new(title: impl Into<String>, description: impl Into<String>, tone: NoticeTone) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            fields: Vec::new(),
            tone,
            link_channel: None,
            timestamp: Utc::now(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(NoticeField { name: name.into(), value: value.into() });
        self
    }

    pub fn muted(reason: &str, end_time: Option<DateTime<Utc>>) -> Self {
        let until = match end_time {
            Some(end) => format!("Until {}", end.format("%Y-%m-%d %H:%M:%S UTC")),
            None => "Until lifted by a moderator".to_string(),
        };
        Self::new("You have been muted", format!("Reason: {}", reason), NoticeTone::Danger)
            .field("Duration", until)
    }

    pub fn mute_expired(origin_channel: ChannelId) -> Self {
        let mut notice = Self::new("Mute Expired", "You can now send messages again.", NoticeTone::Success);
        notice.link_channel = Some(origin_channel);
        notice
    }

    pub fn banned() -> Self {
        Self::new(
            "You are banned from Global Chat",
            "Your messages are not relayed to other servers.",
            NoticeTone::Danger,
        )
    }
}

/// Which pings a relayed copy may trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionPolicy {
    pub everyone: bool,
    pub roles: bool,
    pub users: bool,
}

impl MentionPolicy {
    /// Explicit user mentions only; role and broadcast pings are stripped.
    pub fn users_only() -> Self {
        Self { everyone: false, roles: false, users: true }
    }
}

/// Reusable per-channel delivery endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderHandle {
    pub channel_id: ChannelId,
    pub token: String,
}

/// Re-uploaded attachment; bytes are shared across destinations
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Arc<Vec<u8>>,
}

/// Relayed copy as handed to a destination sender
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub username: String,
    pub avatar_url: Option<String>,
    pub content: String,
    pub files: Vec<OutboundFile>,
    pub mentions: MentionPolicy,
}

impl OutboundMessage {
    /// Rewrites the author as "<display name> | <origin server>" so provenance survives the relay.
    pub fn from_relay(message: &RelayMessage, files: Vec<OutboundFile>, direct_message_label: &str) -> Self {
        let server_name = message.origin_server_name.as_deref().unwrap_or(direct_message_label);
        Self {
            username: format!("{} | {}", message.author_name, server_name),
            avatar_url: message.author_avatar_url.clone(),
            content: message.content.clone(),
            files,
            mentions: MentionPolicy::users_only(),
        }
    }
}

/// Raw classifier output
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifierScore {
    #[serde(alias = "nsfw")]
    pub is_nsfw: bool,
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_exts() -> Vec<String> {
        vec!["jpg".to_string(), "png".to_string(), "webp".to_string()]
    }

    #[test]
    fn test_attachment_image_detection() {
        assert!(Attachment::new("cat.PNG", "https://cdn/x").is_image(&image_exts()));
        assert!(Attachment::new("blob", "https://cdn/x")
            .with_content_type("image/gif")
            .is_image(&image_exts()));
        assert!(!Attachment::new("notes.txt", "https://cdn/x").is_image(&image_exts()));
        assert!(!Attachment::new("noext", "https://cdn/x").is_image(&image_exts()));
    }

    #[test]
    fn test_outbound_username_keeps_provenance() {
        let message = RelayMessage::new(1, 42, "bean", 10, "hi @everyone").from_server(7, "Bean Town");
        let outbound = OutboundMessage::from_relay(&message, Vec::new(), "Direct Message");
        assert_eq!(outbound.username, "bean | Bean Town");
        assert_eq!(outbound.content, "hi @everyone");
        assert_eq!(outbound.mentions, MentionPolicy::users_only());

        let dm = RelayMessage::new(2, 42, "bean", 10, "hi");
        let outbound = OutboundMessage::from_relay(&dm, Vec::new(), "Direct Message");
        assert_eq!(outbound.username, "bean | Direct Message");
    }

    #[test]
    fn test_mute_record_activity_window() {
        let now = Utc::now();
        let record = MuteRecord {
            user_id: 1,
            end_time: MuteDuration::Timed(Duration::from_secs(60)).end_time_from(now),
            reason: "x".to_string(),
            notification: None,
            origin_channel_id: 5,
        };
        assert!(record.is_active_at(now));
        assert!(record.is_expired_at(now + chrono::Duration::seconds(60)));

        let forever = MuteRecord { end_time: MuteDuration::Indefinite.end_time_from(now), ..record };
        assert!(forever.is_active_at(now + chrono::Duration::days(3650)));
    }

    #[test]
    fn test_relay_message_deserializes_with_defaults() {
        let json = r#"{"message_id":1,"author_id":2,"author_name":"a","source_channel_id":3,"content":"hey"}"#;
        let message: RelayMessage = serde_json::from_str(json).unwrap();
        assert!(message.attachments.is_empty());
        assert!(!message.author_is_bot);
        assert_eq!(message.origin_server_name, None);
    }
}
