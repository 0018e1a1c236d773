// src/bot/nsfw.rs - Bounded image screening in front of an opaque classifier

use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::bot::downloads::DownloadCache;
use crate::config::{ClassifierConfig, FailurePolicy, MAX_CLASSIFIER_WORKERS};
use crate::error::{PolicyViolation, RelayError, RelayResult};
use crate::platforms::ImageClassifier;
use crate::types::{Attachment, ClassifierScore, RelayMessage};

/// Synchronous classifier, e.g. an in-process model
pub trait BlockingImageClassifier: Send + Sync + 'static {
    fn classify_blocking(&self, bytes: &[u8]) -> RelayResult<ClassifierScore>;
}

/// Runs a `BlockingImageClassifier` on the blocking thread pool.
pub struct BlockingClassifierAdapter<C: BlockingImageClassifier> {
    inner: Arc<C>,
}

impl<C: BlockingImageClassifier> BlockingClassifierAdapter<C> {
    pub fn new(inner: C) -> Self {
        Self { inner: Arc::new(inner) }
    }
}

#[async_trait]
impl<C: BlockingImageClassifier> ImageClassifier for BlockingClassifierAdapter<C> {
    async fn classify(&self, bytes: &[u8]) -> RelayResult<ClassifierScore> {
        let inner = Arc::clone(&self.inner);
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || inner.classify_blocking(&bytes))
            .await
            .map_err(|e| RelayError::Classifier(format!("classifier task failed: {}", e)))?
    }
}

/// Screens image attachments with at most `max_workers` classifications in flight.
pub struct NsfwScreen {
    classifier: Arc<dyn ImageClassifier>,
    workers: Arc<Semaphore>,
    max_workers: u32,
    call_timeout: Duration,
    threshold: f32,
    failure_policy: FailurePolicy,
    image_extensions: Vec<String>,
    closed: AtomicBool,
}

impl NsfwScreen {
    pub fn new(classifier: Arc<dyn ImageClassifier>, config: &ClassifierConfig) -> Self {
        let max_workers = config.max_workers.clamp(1, MAX_CLASSIFIER_WORKERS);
        Self {
            classifier,
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers: max_workers as u32,
            call_timeout: config.timeout(),
            threshold: config.threshold,
            failure_policy: config.failure_policy,
            image_extensions: config.image_extensions.clone(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Classify every image in order; the first score at or above the threshold rejects.
    pub async fn screen(&self, message: &RelayMessage, downloads: &DownloadCache) -> Result<(), PolicyViolation> {
        for attachment in &message.attachments {
            if !attachment.is_image(&self.image_extensions) {
                debug!("Skipping non-image attachment {}", attachment.filename);
                continue;
            }

            match self.classify_attachment(attachment, downloads).await {
                Ok(score) if score.score >= self.threshold => {
                    info!(
                        "Attachment {} from user {} scored {:.2}",
                        attachment.filename, message.author_id, score.score
                    );
                    return Err(PolicyViolation::Nsfw {
                        score: score.score,
                        kind: "image".to_string(),
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Could not classify attachment {}: {}", attachment.filename, e);
                    if self.failure_policy == FailurePolicy::FailClosed {
                        return Err(PolicyViolation::UnverifiedMedia);
                    }
                }
            }
        }
        Ok(())
    }

    /// Fetch and classify one attachment under a worker permit and the call timeout.
    pub async fn classify_attachment(
        &self,
        attachment: &Attachment,
        downloads: &DownloadCache,
    ) -> RelayResult<ClassifierScore> {
        if self.is_closed() {
            return Err(RelayError::Classifier("classifier pool is closed".to_string()));
        }
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| RelayError::Classifier("classifier pool is closed".to_string()))?;

        let work = async {
            let bytes = downloads.fetch(attachment).await?;
            self.classifier.classify(&bytes).await
        };

        match timeout(self.call_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout(self.call_timeout)),
        }
    }

    /// Refuse new work and wait for in-flight classifications to finish.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.workers.acquire_many(self.max_workers).await {
            Ok(_permits) => debug!("Classifier pool drained"),
            Err(_) => debug!("Classifier pool already closed"),
        }
        self.workers.close();
        info!("Classifier pool closed");
    }
}
