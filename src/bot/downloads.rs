// src/bot/downloads.rs - Attachment bytes fetched while handling one message

use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::RelayResult;
use crate::platforms::AttachmentFetcher;
use crate::types::Attachment;

/// Each attachment URL is downloaded at most once per message, so the NSFW
/// screen and the fan-out share the same bytes. Failures are not remembered.
pub struct DownloadCache {
    fetcher: Arc<dyn AttachmentFetcher>,
    fetched: Mutex<HashMap<String, Arc<Vec<u8>>>>,
}

impl DownloadCache {
    pub fn new(fetcher: Arc<dyn AttachmentFetcher>) -> Self {
        Self {
            fetcher,
            fetched: Mutex::new(HashMap::new()),
        }
    }

    pub async fn fetch(&self, attachment: &Attachment) -> RelayResult<Arc<Vec<u8>>> {
        if let Some(bytes) = self.fetched.lock().await.get(&attachment.url) {
            debug!("Reusing downloaded {}", attachment.filename);
            return Ok(Arc::clone(bytes));
        }

        let bytes = Arc::new(self.fetcher.fetch(attachment).await?);
        let mut fetched = self.fetched.lock().await;
        Ok(Arc::clone(fetched.entry(attachment.url.clone()).or_insert(bytes)))
    }

    pub async fn len(&self) -> usize {
        self.fetched.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::memory::StaticFetcher;

    #[tokio::test]
    async fn test_each_url_is_fetched_once() {
        let fetcher = Arc::new(StaticFetcher::new(vec![1, 2]));
        let downloads = DownloadCache::new(fetcher.clone());
        let attachment = Attachment::new("a.png", "https://cdn/a.png");

        let first = downloads.fetch(&attachment).await.unwrap();
        let second = downloads.fetch(&attachment).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fetcher.fetch_count().await, 1);
        assert_eq!(downloads.len().await, 1);
    }

    #[tokio::test]
    async fn test_failures_are_retried() {
        let fetcher = Arc::new(StaticFetcher::new(vec![1]));
        fetcher.fail_url("https://cdn/b.png").await;
        let downloads = DownloadCache::new(fetcher.clone());
        let attachment = Attachment::new("b.png", "https://cdn/b.png");

        assert!(downloads.fetch(&attachment).await.is_err());
        assert!(downloads.fetch(&attachment).await.is_err());
        assert_eq!(fetcher.fetch_count().await, 2);
        assert_eq!(downloads.len().await, 0);
    }
}
