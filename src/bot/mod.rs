use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use notify::RecommendedWatcher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::RelayConfig;
use crate::error::RelayResult;
use crate::platforms::Collaborators;
use crate::types::RelayMessage;

pub mod downloads;
pub mod fanout;
pub mod filters;
pub mod moderation;
pub mod mutes;
pub mod nsfw;
pub mod registry;
pub mod sender_cache;
pub mod shutdown;
pub mod spam;

use moderation::{ModerationPipeline, Outcome};
use shutdown::{GracefulShutdown, ShutdownPhase};

/// Relay engine: owns the moderation pipeline and its background tasks
pub struct GlobalChat {
    config: RelayConfig,
    collaborators: Collaborators,
    pipeline: Arc<ModerationPipeline>,
    stop_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    blacklist_watcher: Mutex<Option<RecommendedWatcher>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl GlobalChat {
    /// Build the engine. Fails when the registry or the blacklist cannot be loaded.
    pub async fn new(config: RelayConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let pipeline = ModerationPipeline::new(&config, &collaborators)?;

        let channels = pipeline
            .registry()
            .refresh(collaborators.registry.as_ref())
            .await
            .context("loading registered channels")?;
        pipeline
            .filters()
            .load_blacklist(&config.storage.blacklist_path)
            .await
            .context("loading blacklist")?;

        info!("GlobalChat engine ready with {} registered channels", channels);

        let (stop_tx, _) = broadcast::channel(4);
        Ok(Self {
            config,
            collaborators,
            pipeline: Arc::new(pipeline),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
            blacklist_watcher: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn pipeline(&self) -> &ModerationPipeline {
        &self.pipeline
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Spawn the mute sweep, the registry refresher and the blacklist watcher.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("GlobalChat engine already started");
            return Ok(());
        }

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_maintenance());
        tasks.push(self.spawn_registry_refresher());

        if self.config.storage.watch_blacklist {
            match self.pipeline.filters().watch_blacklist(&self.config.storage.blacklist_path) {
                Ok(watcher) => *self.blacklist_watcher.lock().await = Some(watcher),
                Err(e) => warn!("Blacklist hot-reload disabled: {}", e),
            }
        }

        info!("GlobalChat background tasks started");
        Ok(())
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let pipeline = Arc::clone(&self.pipeline);
        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.mutes.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pipeline.mutes().sweep_expired().await;
                        pipeline.spam().evict_idle().await;
                    }
                    _ = stop_rx.recv() => {
                        debug!("Maintenance task stopping");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_registry_refresher(&self) -> JoinHandle<()> {
        let pipeline = Arc::clone(&self.pipeline);
        let store = Arc::clone(&self.collaborators.registry);
        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.registry.refresh_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            // first tick fires immediately and the initial load already happened
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = refresh_registry(&pipeline, store.as_ref()).await {
                            error!("Failed to refresh registered channels, keeping previous set: {}", e);
                        }
                    }
                    _ = stop_rx.recv() => {
                        debug!("Registry refresher stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Reload the registry now and drop sender handles for removed channels.
    pub async fn refresh_registry(&self) -> RelayResult<usize> {
        refresh_registry(&self.pipeline, self.collaborators.registry.as_ref()).await
    }

    pub async fn handle_message(&self, message: &RelayMessage) -> Outcome {
        self.pipeline.process(message).await
    }

    /// Consume inbound messages, one task per message, until the channel
    /// closes or the shutdown manager starts draining.
    pub fn spawn_message_processor(
        self: &Arc<Self>,
        mut receiver: broadcast::Receiver<RelayMessage>,
        shutdown: Arc<GracefulShutdown>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut phases = shutdown.subscribe_to_shutdown();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = receiver.recv() => match received {
                        Ok(message) => {
                            let permit = match shutdown.acquire_operation_permit().await {
                                Some(permit) => permit,
                                None => {
                                    info!("Shutdown in progress, no longer accepting messages");
                                    break;
                                }
                            };
                            let engine = Arc::clone(&engine);
                            tokio::spawn(async move {
                                let outcome = engine.handle_message(&message).await;
                                debug!("Message {} handled: {:?}", message.message_id, outcome);
                                drop(permit);
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Message receiver lagged by {} messages", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Message receiver closed");
                            break;
                        }
                    },
                    phase = phases.recv() => match phase {
                        Ok(ShutdownPhase::Running) => {}
                        Ok(phase) => {
                            info!("Message processor stopping ({:?})", phase);
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Handle every queued message until the input channel closes, then
    /// request shutdown.
    pub async fn relay_until_closed(
        self: &Arc<Self>,
        receiver: broadcast::Receiver<RelayMessage>,
        shutdown: Arc<GracefulShutdown>,
    ) {
        let processor = self.spawn_message_processor(receiver, Arc::clone(&shutdown));
        if let Err(e) = processor.await {
            error!("Message processor ended abnormally: {}", e);
        }
        shutdown.trigger_shutdown().await;
    }

    /// Stop background tasks, drain the classifier pool and close persistence.
    pub async fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.stop_tx.send(());
        self.blacklist_watcher.lock().await.take();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task ended abnormally: {}", e);
            }
        }

        if let Some(nsfw) = self.pipeline.nsfw() {
            nsfw.close().await;
        }

        self.collaborators
            .audit
            .close()
            .await
            .context("closing audit store")?;

        info!("GlobalChat engine stopped");
        Ok(())
    }
}

async fn refresh_registry(
    pipeline: &ModerationPipeline,
    store: &dyn crate::platforms::RegistryStore,
) -> RelayResult<usize> {
    let count = pipeline.registry().refresh(store).await?;
    let registered = pipeline.registry().current().await;
    pipeline.fanout().cache().retain_registered(&registered).await;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::memory::MemoryPlatform;
    use tempfile::{tempdir, TempDir};

    fn config_in(dir: &TempDir) -> RelayConfig {
        let mut config = RelayConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.storage.blacklist_path = dir.path().join("blacklist.txt");
        config.storage.watch_blacklist = false;
        config
    }

    #[test_log::test(tokio::test)]
    async fn test_initial_registry_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let platform = MemoryPlatform::new(vec![1, 2]);
        platform.registry.set_failing(true).await;

        assert!(GlobalChat::new(config_in(&dir), platform.collaborators()).await.is_err());
    }

    #[tokio::test]
    async fn test_engine_loads_blacklist_and_relays() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("blacklist.txt"), "# words\nspoon\n").await.unwrap();
        let platform = MemoryPlatform::new(vec![1, 2, 3]);
        let engine = GlobalChat::new(config_in(&dir), platform.collaborators()).await.unwrap();

        let outcome = engine.handle_message(&RelayMessage::new(1, 10, "a", 1, "hello")).await;
        assert!(matches!(outcome, Outcome::Relayed(ref report) if report.delivered == vec![2, 3]));

        let outcome = engine.handle_message(&RelayMessage::new(2, 11, "b", 2, "a Spoon")).await;
        assert_eq!(
            outcome,
            Outcome::Rejected(crate::error::PolicyViolation::Prohibited)
        );
    }

    #[tokio::test]
    async fn test_refresh_trims_sender_cache() {
        let dir = tempdir().unwrap();
        let platform = MemoryPlatform::new(vec![1, 2, 3]);
        let engine = GlobalChat::new(config_in(&dir), platform.collaborators()).await.unwrap();

        engine.handle_message(&RelayMessage::new(1, 10, "a", 1, "hello")).await;
        assert_eq!(engine.pipeline().fanout().cache().len().await, 2);

        platform.registry.set_channels(vec![1, 2]).await;
        assert_eq!(engine.refresh_registry().await.unwrap(), 2);
        assert_eq!(engine.pipeline().fanout().cache().len().await, 1);
        assert!(!engine.pipeline().registry().is_registered(3).await);

        // failed refresh keeps the last good snapshot
        platform.registry.set_failing(true).await;
        assert!(engine.refresh_registry().await.is_err());
        assert!(engine.pipeline().registry().is_registered(2).await);
    }

    #[test_log::test(tokio::test)]
    async fn test_start_and_shutdown() {
        let dir = tempdir().unwrap();
        let platform = MemoryPlatform::new(vec![1, 2]);
        let engine = GlobalChat::new(config_in(&dir), platform.collaborators()).await.unwrap();

        engine.start().await.unwrap();
        engine.shutdown().await.unwrap();

        assert!(platform.audit.is_closed());
        assert!(engine.pipeline().nsfw().map(|n| n.is_closed()).unwrap_or(false));
        // second call is a no-op
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_messages_are_handled_before_shutdown() {
        let dir = tempdir().unwrap();
        let platform = MemoryPlatform::new(vec![1, 2, 3]);
        let engine = Arc::new(GlobalChat::new(config_in(&dir), platform.collaborators()).await.unwrap());
        let shutdown = Arc::new(GracefulShutdown::with_default_config());
        shutdown
            .register_component(Box::new(shutdown::EngineShutdownComponent::new(Arc::clone(&engine))))
            .await;

        // everything is queued and the input closed before processing starts
        let (tx, rx) = broadcast::channel(16);
        for author in 10u64..15 {
            tx.send(RelayMessage::new(author, author, "a", 1, "hello")).unwrap();
        }
        drop(tx);

        engine.relay_until_closed(rx, Arc::clone(&shutdown)).await;
        assert!(shutdown.is_shutdown_requested());
        shutdown.wait_for_shutdown().await.unwrap();

        assert_eq!(platform.audit.messages().await.len(), 5);
        assert_eq!(platform.sender.sent().await.len(), 10);
        assert!(platform.audit.is_closed());
    }

    #[tokio::test]
    async fn test_processor_stops_when_draining_starts() {
        let dir = tempdir().unwrap();
        let platform = MemoryPlatform::new(vec![1, 2]);
        let engine = Arc::new(GlobalChat::new(config_in(&dir), platform.collaborators()).await.unwrap());
        let shutdown = Arc::new(GracefulShutdown::with_default_config());

        let (tx, rx) = broadcast::channel::<RelayMessage>(16);
        let processor = engine.spawn_message_processor(rx, Arc::clone(&shutdown));

        shutdown.trigger_shutdown().await;
        tokio::time::timeout(std::time::Duration::from_secs(5), processor)
            .await
            .expect("processor should stop once draining starts")
            .unwrap();
        // input is still open
        assert_eq!(tx.receiver_count(), 0);
    }
}
