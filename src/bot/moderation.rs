// src/bot/moderation.rs - Layered validation and enforcement for inbound messages

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::bot::downloads::DownloadCache;
use crate::bot::fanout::{FanoutReport, RelayFanout};
use crate::bot::filters::ContentFilters;
use crate::bot::mutes::MuteManager;
use crate::bot::nsfw::NsfwScreen;
use crate::bot::registry::RegistryCache;
use crate::bot::sender_cache::SenderCache;
use crate::bot::spam::SpamLimiter;
use crate::config::RelayConfig;
use crate::error::PolicyViolation;
use crate::platforms::{AttachmentFetcher, AuditStore, BanOracle, Collaborators, Notifier};
use crate::types::{MessageLogEntry, MuteDuration, Notice, RelayMessage};

/// Result of `validate`
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept,
    /// Dropped without a reason: unregistered source or bot author
    Ignore,
    Reject(PolicyViolation),
}

/// Result of `process`
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ignored,
    Rejected(PolicyViolation),
    Relayed(FanoutReport),
}

/// Ban, mute, content, rate and media checks in a fixed order, followed by
/// enforcement (mute, delete, notify) or audit and fan-out.
pub struct ModerationPipeline {
    registry: RegistryCache,
    bans: Arc<dyn BanOracle>,
    filters: ContentFilters,
    spam: SpamLimiter,
    nsfw: Option<Arc<NsfwScreen>>,
    mutes: Arc<MuteManager>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditStore>,
    fetcher: Arc<dyn AttachmentFetcher>,
    fanout: RelayFanout,
    short_cooldown: Duration,
    long_cooldown: Duration,
    notice_delete_after: Duration,
}

impl ModerationPipeline {
    pub fn new(config: &RelayConfig, collaborators: &Collaborators) -> Result<Self> {
        let filters = ContentFilters::new(&config.moderation)?;

        let nsfw = match (config.classifier.enabled, collaborators.classifier.as_ref()) {
            (true, Some(classifier)) => Some(Arc::new(NsfwScreen::new(Arc::clone(classifier), &config.classifier))),
            (true, None) => {
                warn!("No image classifier configured, attachments will not be screened");
                None
            }
            (false, _) => None,
        };

        let mutes = Arc::new(MuteManager::new(
            Arc::clone(&collaborators.notifier),
            Arc::clone(&collaborators.audit),
            config.mutes.warning_delete_after(),
        ));

        let fanout = RelayFanout::new(Arc::clone(&collaborators.sender), SenderCache::new(), &config.relay);

        Ok(Self {
            registry: RegistryCache::new(),
            bans: Arc::clone(&collaborators.bans),
            filters,
            spam: SpamLimiter::from_config(&config.spam),
            nsfw,
            mutes,
            notifier: Arc::clone(&collaborators.notifier),
            audit: Arc::clone(&collaborators.audit),
            fetcher: Arc::clone(&collaborators.fetcher),
            fanout,
            short_cooldown: config.mutes.short_cooldown(),
            long_cooldown: config.mutes.long_cooldown(),
            notice_delete_after: config.mutes.warning_delete_after(),
        })
    }

    pub fn registry(&self) -> &RegistryCache {
        &self.registry
    }

    pub fn filters(&self) -> &ContentFilters {
        &self.filters
    }

    pub fn spam(&self) -> &SpamLimiter {
        &self.spam
    }

    pub fn mutes(&self) -> &Arc<MuteManager> {
        &self.mutes
    }

    pub fn nsfw(&self) -> Option<&Arc<NsfwScreen>> {
        self.nsfw.as_ref()
    }

    pub fn fanout(&self) -> &RelayFanout {
        &self.fanout
    }

    pub async fn validate(&self, message: &RelayMessage) -> Verdict {
        self.validate_at(message, Utc::now()).await
    }

    /// Run the checks in order and stop at the first failure.
    pub async fn validate_at(&self, message: &RelayMessage, now: DateTime<Utc>) -> Verdict {
        let downloads = DownloadCache::new(Arc::clone(&self.fetcher));
        self.check_at(message, now, &downloads).await
    }

    async fn check_at(&self, message: &RelayMessage, now: DateTime<Utc>, downloads: &DownloadCache) -> Verdict {
        if message.author_is_bot {
            return Verdict::Ignore;
        }
        if !self.registry.is_registered(message.source_channel_id).await {
            return Verdict::Ignore;
        }

        if self.is_banned(message).await {
            return Verdict::Reject(PolicyViolation::BannedUser);
        }

        if let Some(mute) = self.mutes.mute_status_at(message.author_id, now).await {
            return Verdict::Reject(PolicyViolation::ExistingMute(mute.reason));
        }

        if let Err(violation) = self.filters.check(message).await {
            return Verdict::Reject(violation);
        }

        if let Err(violation) = self.spam.check_at(message.author_id, now).await {
            return Verdict::Reject(violation);
        }

        if !message.attachments.is_empty() {
            if let Some(ref nsfw) = self.nsfw {
                if let Err(violation) = nsfw.screen(message, downloads).await {
                    return Verdict::Reject(violation);
                }
            }
        }

        Verdict::Accept
    }

    /// User first, then origin server. A lookup error counts as not banned.
    async fn is_banned(&self, message: &RelayMessage) -> bool {
        match self.bans.is_user_banned(message.author_id).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => error!("Ban lookup failed for user {}: {}", message.author_id, e),
        }

        if let Some(server_id) = message.origin_server_id {
            match self.bans.is_server_banned(server_id).await {
                Ok(banned) => return banned,
                Err(e) => error!("Ban lookup failed for server {}: {}", server_id, e),
            }
        }
        false
    }

    pub async fn process(&self, message: &RelayMessage) -> Outcome {
        self.process_at(message, Utc::now()).await
    }

    /// Validate, then either enforce the rejection or log and relay the message.
    /// Attachments screened during validation are relayed without a second download.
    pub async fn process_at(&self, message: &RelayMessage, now: DateTime<Utc>) -> Outcome {
        let downloads = DownloadCache::new(Arc::clone(&self.fetcher));
        match self.check_at(message, now, &downloads).await {
            Verdict::Ignore => {
                debug!("Ignoring message {} from channel {}", message.message_id, message.source_channel_id);
                Outcome::Ignored
            }
            Verdict::Reject(violation) => {
                self.enforce(message, &violation, now).await;
                Outcome::Rejected(violation)
            }
            Verdict::Accept => {
                let entry = MessageLogEntry::from_message(message);
                if let Err(e) = self.audit.record_message(entry).await {
                    error!("Failed to log message from user {}: {}", message.author_id, e);
                }

                let registered = self.registry.current().await;
                Outcome::Relayed(self.fanout.fanout(message, &registered, &downloads).await)
            }
        }
    }

    async fn enforce(&self, message: &RelayMessage, violation: &PolicyViolation, now: DateTime<Utc>) {
        info!(
            "Rejected message {} from user {} in channel {}: {} ({})",
            message.message_id,
            message.author_id,
            message.source_channel_id,
            violation,
            violation.code()
        );

        match violation {
            PolicyViolation::BannedUser => self.notify_banned(message).await,
            PolicyViolation::ExistingMute(_) => {}
            _ => {
                let duration = self.mute_duration_for(violation);
                self.mutes
                    .mute_at(
                        message.author_id,
                        duration,
                        &violation.to_string(),
                        message.source_channel_id,
                        now,
                    )
                    .await;
            }
        }

        if let Err(e) = self
            .notifier
            .delete_message(message.source_channel_id, message.message_id)
            .await
        {
            error!("Failed to delete message {} from user {}: {}", message.message_id, message.author_id, e);
        }
    }

    /// Timing violations get the short cooldown, media violations last until lifted.
    pub fn mute_duration_for(&self, violation: &PolicyViolation) -> MuteDuration {
        match violation {
            PolicyViolation::Nsfw { .. } => MuteDuration::Indefinite,
            v if v.is_timing() => MuteDuration::Timed(self.short_cooldown),
            _ => MuteDuration::Timed(self.long_cooldown),
        }
    }

    async fn notify_banned(&self, message: &RelayMessage) {
        if let Err(e) = self.notifier.send_to_user(message.author_id, &Notice::banned()).await {
            debug!("Could not message banned user {} directly: {}", message.author_id, e);
            let text = format!("<@{}>, you are banned from global chat.", message.author_id);
            if let Err(e) = self
                .notifier
                .send_channel_notice(message.source_channel_id, &text, Some(self.notice_delete_after))
                .await
            {
                warn!("Failed to post ban notice in channel {}: {}", message.source_channel_id, e);
            }
        }
    }
}
