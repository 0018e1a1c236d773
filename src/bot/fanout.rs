// src/bot/fanout.rs - Broadcast an accepted message to every other registered channel

use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use log::{debug, error, warn};
use std::collections::HashSet;
use std::sync::Arc;

use crate::bot::downloads::DownloadCache;
use crate::bot::sender_cache::SenderCache;
use crate::config::FanoutConfig;
use crate::platforms::ChannelSender;
use crate::types::{ChannelId, OutboundFile, OutboundMessage, RelayMessage};

/// Where each destination ended up
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanoutReport {
    pub delivered: Vec<ChannelId>,
    /// No sender handle could be obtained
    pub skipped: Vec<ChannelId>,
    /// Handle obtained but the send failed
    pub failed: Vec<ChannelId>,
}

impl FanoutReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.skipped.len() + self.failed.len()
    }
}

enum Delivery {
    Delivered,
    Skipped,
    Failed,
}

pub struct RelayFanout {
    sender: Arc<dyn ChannelSender>,
    cache: SenderCache,
    sender_name: String,
    direct_message_label: String,
    max_concurrent: usize,
}

impl RelayFanout {
    pub fn new(sender: Arc<dyn ChannelSender>, cache: SenderCache, config: &FanoutConfig) -> Self {
        Self {
            sender,
            cache,
            sender_name: config.sender_name.clone(),
            direct_message_label: config.direct_message_label.clone(),
            max_concurrent: config.max_concurrent_deliveries.max(1),
        }
    }

    pub fn cache(&self) -> &SenderCache {
        &self.cache
    }

    /// Deliver `message` to every channel in `registered` except its source.
    ///
    /// Each destination succeeds or fails on its own; nothing here is fatal.
    /// Attachments already downloaded into `downloads` are not fetched again.
    pub async fn fanout(
        &self,
        message: &RelayMessage,
        registered: &HashSet<ChannelId>,
        downloads: &DownloadCache,
    ) -> FanoutReport {
        let mut destinations: Vec<ChannelId> = registered
            .iter()
            .copied()
            .filter(|channel_id| *channel_id != message.source_channel_id)
            .collect();
        destinations.sort_unstable();

        let mut report = FanoutReport::default();
        if destinations.is_empty() {
            return report;
        }

        let files = self.fetch_files(message, downloads).await;
        let outbound = OutboundMessage::from_relay(message, files, &self.direct_message_label);

        let outbound = &outbound;
        let results: Vec<(ChannelId, Delivery)> = stream::iter(destinations)
            .map(move |channel_id| async move { (channel_id, self.deliver(channel_id, outbound).await) })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        for (channel_id, delivery) in results {
            match delivery {
                Delivery::Delivered => report.delivered.push(channel_id),
                Delivery::Skipped => report.skipped.push(channel_id),
                Delivery::Failed => report.failed.push(channel_id),
            }
        }
        report.delivered.sort_unstable();
        report.skipped.sort_unstable();
        report.failed.sort_unstable();

        debug!(
            "Relayed message {} from channel {}: {} delivered, {} skipped, {} failed",
            message.message_id,
            message.source_channel_id,
            report.delivered.len(),
            report.skipped.len(),
            report.failed.len()
        );
        report
    }

    /// Download every attachment once; a failed download drops only that file.
    async fn fetch_files(&self, message: &RelayMessage, downloads: &DownloadCache) -> Vec<OutboundFile> {
        let fetches = message.attachments.iter().map(|attachment| async move {
            match downloads.fetch(attachment).await {
                Ok(data) => Some(OutboundFile {
                    filename: attachment.filename.clone(),
                    content_type: attachment.content_type.clone(),
                    data,
                }),
                Err(e) => {
                    warn!("Failed to fetch attachment {}: {}", attachment.filename, e);
                    None
                }
            }
        });
        join_all(fetches).await.into_iter().flatten().collect()
    }

    async fn deliver(&self, channel_id: ChannelId, outbound: &OutboundMessage) -> Delivery {
        let handle = match self
            .cache
            .get_or_create(channel_id, &self.sender_name, self.sender.as_ref())
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to get sender handle for channel {}: {}", channel_id, e);
                return Delivery::Skipped;
            }
        };

        match self.sender.send(&handle, outbound).await {
            Ok(()) => {
                debug!("Delivered to channel {}", channel_id);
                Delivery::Delivered
            }
            Err(e) => {
                if e.is_not_found() {
                    debug!("Sender handle for channel {} is gone, evicting", channel_id);
                    self.cache.evict(channel_id).await;
                }
                error!("Failed to send message to channel {}: {}", channel_id, e);
                Delivery::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::memory::{RecordingSender, StaticFetcher};
    use crate::types::{Attachment, MentionPolicy};

    fn fanout_with(sender: Arc<RecordingSender>) -> RelayFanout {
        RelayFanout::new(sender, SenderCache::new(), &FanoutConfig::default())
    }

    fn downloads_from(fetcher: &Arc<StaticFetcher>) -> DownloadCache {
        DownloadCache::new(fetcher.clone())
    }

    fn no_downloads() -> DownloadCache {
        DownloadCache::new(Arc::new(StaticFetcher::new(vec![0])))
    }

    fn channels(ids: &[ChannelId]) -> HashSet<ChannelId> {
        ids.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_reaches_every_channel_but_the_source() {
        let sender = Arc::new(RecordingSender::new());
        let fanout = fanout_with(sender.clone());
        let message = RelayMessage::new(1, 42, "bean", 1, "hello")
            .from_server(9, "Bean Town")
            .with_avatar("https://cdn/avatars/42.png");

        let report = fanout.fanout(&message, &channels(&[1, 2, 3, 4, 5]), &no_downloads()).await;
        assert_eq!(report.delivered, vec![2, 3, 4, 5]);
        assert!(report.skipped.is_empty());

        let sent = sender.sent().await;
        assert_eq!(sent.len(), 4);
        for (channel, outbound) in &sent {
            assert_ne!(*channel, 1);
            assert_eq!(outbound.username, "bean | Bean Town");
            assert_eq!(outbound.avatar_url.as_deref(), Some("https://cdn/avatars/42.png"));
            assert_eq!(outbound.content, "hello");
            assert_eq!(outbound.mentions, MentionPolicy::users_only());
        }
        // every destination got the configured endpoint
        for channel in [2, 3, 4, 5] {
            assert_eq!(sender.endpoint_names(channel).await, vec!["GlobalChat Webhook"]);
        }
    }

    #[tokio::test]
    async fn test_direct_message_label_and_missing_avatar() {
        let sender = Arc::new(RecordingSender::new());
        let fanout = fanout_with(sender.clone());
        let message = RelayMessage::new(1, 42, "bean", 1, "psst");

        fanout.fanout(&message, &channels(&[1, 2]), &no_downloads()).await;
        let sent = sender.sent().await;
        assert_eq!(sent[0].1.username, "bean | Direct Message");
        assert_eq!(sent[0].1.avatar_url, None);
    }

    #[tokio::test]
    async fn test_one_failing_destination_does_not_stop_others() {
        let sender = Arc::new(RecordingSender::new());
        sender.fail_channel(3).await;
        let fanout = fanout_with(sender.clone());
        let message = RelayMessage::new(1, 42, "bean", 1, "hello");

        let report = fanout.fanout(&message, &channels(&[1, 2, 3, 4, 5]), &no_downloads()).await;
        assert_eq!(report.delivered, vec![2, 4, 5]);
        assert_eq!(report.skipped, vec![3]);
        assert_eq!(report.attempted(), 4);
    }

    #[tokio::test]
    async fn test_attachments_fetched_once_and_shared() {
        let sender = Arc::new(RecordingSender::new());
        let fetcher = Arc::new(StaticFetcher::new(vec![7, 7, 7]));
        fetcher.fail_url("https://cdn/broken.png").await;
        let fanout = fanout_with(sender.clone());
        let message = RelayMessage::new(1, 42, "bean", 1, "pics")
            .with_attachment(Attachment::new("ok.png", "https://cdn/ok.png"))
            .with_attachment(Attachment::new("broken.png", "https://cdn/broken.png"));

        let report = fanout.fanout(&message, &channels(&[1, 2, 3]), &downloads_from(&fetcher)).await;
        assert_eq!(report.delivered.len(), 2);
        assert_eq!(fetcher.fetch_count().await, 2);

        let sent = sender.sent().await;
        for (_, outbound) in &sent {
            assert_eq!(outbound.files.len(), 1);
            assert_eq!(outbound.files[0].filename, "ok.png");
        }
        assert!(Arc::ptr_eq(&sent[0].1.files[0].data, &sent[1].1.files[0].data));
    }

    #[tokio::test]
    async fn test_stale_handle_is_evicted() {
        let sender = Arc::new(RecordingSender::new());
        let fanout = fanout_with(sender.clone());
        let message = RelayMessage::new(1, 42, "bean", 1, "hello");
        let registered = channels(&[1, 2]);

        fanout.fanout(&message, &registered, &no_downloads()).await;
        assert_eq!(fanout.cache().len().await, 1);

        sender.revoke_handles(2).await;
        let report = fanout.fanout(&message, &registered, &no_downloads()).await;
        assert_eq!(report.failed, vec![2]);
        assert_eq!(fanout.cache().len().await, 0);

        let report = fanout.fanout(&message, &registered, &no_downloads()).await;
        assert_eq!(report.delivered, vec![2]);
        assert_eq!(sender.handles_created().await, 2);
    }

    #[tokio::test]
    async fn test_no_destinations_skips_downloads() {
        let fetcher = Arc::new(StaticFetcher::new(vec![0]));
        let fanout = fanout_with(Arc::new(RecordingSender::new()));
        let message = RelayMessage::new(1, 42, "bean", 1, "alone")
            .with_attachment(Attachment::new("a.png", "https://cdn/a.png"));

        let report = fanout.fanout(&message, &channels(&[1]), &downloads_from(&fetcher)).await;
        assert_eq!(report, FanoutReport::default());
        assert_eq!(fetcher.fetch_count().await, 0);
    }
}
