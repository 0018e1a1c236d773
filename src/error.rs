// src/error.rs - Policy violations and collaborator failures

use thiserror::Error;

use crate::types::ChannelId;

/// Why a message was refused. The `Display` text is what the author sees.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyViolation {
    #[error("You are banned from global chat")]
    BannedUser,

    /// Carries the reason stored with the active mute.
    #[error("{0}")]
    ExistingMute(String),

    #[error("Message contains an invite link")]
    InviteLink,

    #[error("Message contains adult content")]
    AdultContent,

    #[error("Message exceeds maximum length")]
    TooLong,

    #[error("Too many attachments")]
    TooManyAttachments,

    #[error("Message contains prohibited words")]
    Prohibited,

    #[error("Too many messages sent in a short time")]
    RateLimited,

    #[error("Message sent too quickly")]
    TooFast,

    #[error("NSFW {kind} detected (score {score:.2})")]
    Nsfw { score: f32, kind: String },

    /// Only produced when the classifier runs with the fail-closed policy.
    #[error("Attachment could not be verified")]
    UnverifiedMedia,
}

impl PolicyViolation {
    /// Timing violations get the short cooldown instead of the long one.
    pub fn is_timing(&self) -> bool {
        matches!(self, PolicyViolation::RateLimited | PolicyViolation::TooFast)
    }

    /// Banned and already-muted authors are not (re)muted.
    pub fn triggers_mute(&self) -> bool {
        !matches!(self, PolicyViolation::BannedUser | PolicyViolation::ExistingMute(_))
    }

    /// Static code used in logs and audit records.
    pub fn code(&self) -> &'static str {
        match self {
            PolicyViolation::BannedUser => "banned_user",
            PolicyViolation::ExistingMute(_) => "existing_mute",
            PolicyViolation::InviteLink => "invite_link",
            PolicyViolation::AdultContent => "adult_content",
            PolicyViolation::TooLong => "too_long",
            PolicyViolation::TooManyAttachments => "too_many_attachments",
            PolicyViolation::Prohibited => "prohibited",
            PolicyViolation::RateLimited => "rate_limited",
            PolicyViolation::TooFast => "too_fast",
            PolicyViolation::Nsfw { .. } => "nsfw",
            PolicyViolation::UnverifiedMedia => "unverified_media",
        }
    }
}

/// Failures reported by external collaborators (stores, transport, classifier).
///
/// None of these are shown to users; callers log them and carry on.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("missing permission in channel {channel_id}: {message}")]
    Permission { channel_id: ChannelId, message: String },

    /// The referenced message, notification or handle no longer exists.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("classifier failure: {0}")]
    Classifier(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RelayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RelayError::NotFound(_))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for RelayError {
    fn from(e: serde_yaml::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;
