// src/bot/shutdown.rs - Graceful shutdown management

use anyhow::Result;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::timeout;

use crate::bot::GlobalChat;

/// Shutdown phases for orderly termination
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownPhase {
    /// Normal operation
    Running,
    /// No new messages admitted, in-flight ones finish
    Draining,
    /// Components are being stopped
    Terminating,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// How long in-flight messages get before components are stopped anyway
    pub graceful_timeout_seconds: u64,
    /// Time to wait for individual components to shut down
    pub component_timeout_seconds: u64,
    /// Upper bound on concurrently handled messages
    pub max_operations: u32,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_seconds: 30,
            component_timeout_seconds: 10,
            max_operations: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownStats {
    pub phase: ShutdownPhase,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_seconds: Option<f64>,
    pub components_shutdown: Vec<String>,
    pub failed_components: Vec<(String, String)>, // (component, error)
    pub forced_termination: bool,
}

impl Default for ShutdownStats {
    fn default() -> Self {
        Self {
            phase: ShutdownPhase::Running,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            components_shutdown: Vec::new(),
            failed_components: Vec::new(),
            forced_termination: false,
        }
    }
}

/// Component that can be gracefully shut down
#[async_trait::async_trait]
pub trait ShutdownComponent: Send + Sync {
    fn name(&self) -> &str;

    async fn shutdown(&self) -> Result<()>;

    /// Check if component is ready to shutdown (no pending operations)
    async fn is_ready_for_shutdown(&self) -> bool {
        true
    }

    /// Called if graceful shutdown fails or times out
    async fn force_shutdown(&self) -> Result<()> {
        self.shutdown().await
    }
}

pub struct GracefulShutdown {
    config: ShutdownConfig,
    phase: Arc<RwLock<ShutdownPhase>>,
    stats: Arc<RwLock<ShutdownStats>>,
    shutdown_notifier: broadcast::Sender<ShutdownPhase>,
    components: Arc<RwLock<Vec<Box<dyn ShutdownComponent>>>>,
    active_operations: Arc<Semaphore>,
    shutdown_requested: Arc<AtomicBool>,
    requested_signal: Arc<Notify>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(10);
        let max_operations = config.max_operations.max(1);

        Self {
            config,
            phase: Arc::new(RwLock::new(ShutdownPhase::Running)),
            stats: Arc::new(RwLock::new(ShutdownStats::default())),
            shutdown_notifier: shutdown_tx,
            components: Arc::new(RwLock::new(Vec::new())),
            active_operations: Arc::new(Semaphore::new(max_operations as usize)),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            requested_signal: Arc::new(Notify::new()),
        }
    }

    pub fn with_default_config() -> Self {
        Self::new(ShutdownConfig::default())
    }

    pub async fn register_component(&self, component: Box<dyn ShutdownComponent>) {
        let name = component.name().to_string();
        self.components.write().await.push(component);
        debug!("Registered shutdown component: {}", name);
    }

    /// Start listening for Ctrl+C and SIGTERM
    pub async fn start_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C signal, initiating graceful shutdown...");
                    manager.trigger_shutdown().await;
                }
                Err(err) => error!("Failed to listen for Ctrl+C signal: {}", err),
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(sigterm) => sigterm,
                    Err(err) => {
                        error!("Failed to register SIGTERM handler: {}", err);
                        return;
                    }
                };
                sigterm.recv().await;
                info!("Received SIGTERM signal, initiating graceful shutdown...");
                manager.trigger_shutdown().await;
            });
        }

        info!("Shutdown signal handlers started");
    }

    /// Wait for a shutdown request and run the shutdown sequence
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        info!("Waiting for shutdown signal...");
        while !self.is_shutdown_requested() {
            self.requested_signal.notified().await;
        }

        info!("Shutdown requested, beginning graceful shutdown process...");
        self.perform_shutdown().await
    }

    pub async fn perform_shutdown(&self) -> Result<()> {
        let start_time = chrono::Utc::now();
        {
            let mut stats = self.stats.write().await;
            stats.started_at = Some(start_time);
            stats.phase = ShutdownPhase::Draining;
        }

        info!("Phase 1: Draining - no new messages admitted");
        self.set_phase(ShutdownPhase::Draining).await;

        let drain_timeout = Duration::from_secs(self.config.graceful_timeout_seconds);
        match timeout(drain_timeout, self.wait_for_operations_completion()).await {
            Ok(()) => info!("All in-flight messages completed"),
            Err(_) => {
                warn!("Timeout waiting for in-flight messages, proceeding with shutdown");
                self.stats.write().await.forced_termination = true;
            }
        }

        info!("Phase 2: Terminating - shutting down components...");
        self.set_phase(ShutdownPhase::Terminating).await;
        self.shutdown_all_components().await;

        let end_time = chrono::Utc::now();
        let duration = (end_time - start_time).num_milliseconds() as f64 / 1000.0;
        {
            let mut stats = self.stats.write().await;
            stats.completed_at = Some(end_time);
            stats.duration_seconds = Some(duration);
            stats.phase = ShutdownPhase::Stopped;
        }
        self.set_phase(ShutdownPhase::Stopped).await;

        info!("Graceful shutdown completed in {:.2} seconds", duration);
        Ok(())
    }

    async fn set_phase(&self, phase: ShutdownPhase) {
        *self.phase.write().await = phase.clone();
        let _ = self.shutdown_notifier.send(phase);
    }

    /// Holding every permit means no message is in flight
    async fn wait_for_operations_completion(&self) {
        match self.active_operations.acquire_many(self.config.max_operations.max(1)).await {
            Ok(_permits) => debug!("All active operations have completed"),
            Err(e) => warn!("Operation semaphore closed while draining: {}", e),
        }
    }

    async fn shutdown_all_components(&self) {
        let components = self.components.read().await;
        let component_timeout = Duration::from_secs(self.config.component_timeout_seconds);

        info!("Shutting down {} components...", components.len());

        for component in components.iter() {
            let component_name = component.name().to_string();
            if !component.is_ready_for_shutdown().await {
                debug!("Component '{}' still busy, shutting down anyway", component_name);
            }

            match timeout(component_timeout, component.shutdown()).await {
                Ok(Ok(())) => {
                    info!("Component '{}' shut down gracefully", component_name);
                    self.stats.write().await.components_shutdown.push(component_name);
                }
                outcome => {
                    match outcome {
                        Ok(Err(e)) => error!("Component '{}' failed to shutdown gracefully: {}", component_name, e),
                        _ => error!("Component '{}' shutdown timed out", component_name),
                    }

                    warn!("Attempting force shutdown of component '{}'", component_name);
                    match timeout(component_timeout, component.force_shutdown()).await {
                        Ok(Ok(())) => {
                            warn!("Component '{}' force shutdown successful", component_name);
                            self.stats.write().await.components_shutdown.push(component_name);
                        }
                        Ok(Err(force_err)) => {
                            error!("Component '{}' force shutdown failed: {}", component_name, force_err);
                            self.stats
                                .write()
                                .await
                                .failed_components
                                .push((component_name, force_err.to_string()));
                        }
                        Err(_) => {
                            error!("Component '{}' could not be shut down", component_name);
                            self.stats
                                .write()
                                .await
                                .failed_components
                                .push((component_name, "Shutdown timeout".to_string()));
                        }
                    }
                }
            }
        }
    }

    pub async fn get_phase(&self) -> ShutdownPhase {
        self.phase.read().await.clone()
    }

    pub async fn get_stats(&self) -> ShutdownStats {
        self.stats.read().await.clone()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn subscribe_to_shutdown(&self) -> broadcast::Receiver<ShutdownPhase> {
        self.shutdown_notifier.subscribe()
    }

    /// Request shutdown programmatically (end of input, tests)
    pub async fn trigger_shutdown(&self) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutdown triggered");
        self.set_phase(ShutdownPhase::Draining).await;
        self.requested_signal.notify_waiters();
        self.requested_signal.notify_one();
    }

    /// Permit for handling one message; `None` once draining has begun
    pub async fn acquire_operation_permit(&self) -> Option<OwnedSemaphorePermit> {
        if *self.phase.read().await == ShutdownPhase::Running {
            Arc::clone(&self.active_operations).acquire_owned().await.ok()
        } else {
            None
        }
    }
}

/// Stops the relay engine: background tasks, classifier pool, persistence
pub struct EngineShutdownComponent {
    engine: Arc<GlobalChat>,
}

impl EngineShutdownComponent {
    pub fn new(engine: Arc<GlobalChat>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl ShutdownComponent for EngineShutdownComponent {
    fn name(&self) -> &str {
        "GlobalChat"
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down relay engine...");
        self.engine.shutdown().await?;
        info!("Relay engine shutdown complete");
        Ok(())
    }
}

/// Set up graceful shutdown for the engine with signal handlers installed
pub async fn setup(engine: Arc<GlobalChat>, config: ShutdownConfig) -> Arc<GracefulShutdown> {
    let shutdown_manager = Arc::new(GracefulShutdown::new(config));
    shutdown_manager
        .register_component(Box::new(EngineShutdownComponent::new(engine)))
        .await;
    shutdown_manager.start_signal_handlers().await;

    info!("Graceful shutdown system initialized");
    shutdown_manager
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestComponent {
        name: String,
        shutdown_called: Arc<AtomicBool>,
        should_fail: bool,
    }

    impl TestComponent {
        fn new(name: &str, should_fail: bool) -> Self {
            Self {
                name: name.to_string(),
                shutdown_called: Arc::new(AtomicBool::new(false)),
                should_fail,
            }
        }
    }

    #[async_trait::async_trait]
    impl ShutdownComponent for TestComponent {
        fn name(&self) -> &str {
            &self.name
        }

        async fn shutdown(&self) -> Result<()> {
            self.shutdown_called.store(true, Ordering::Relaxed);
            if self.should_fail {
                Err(anyhow::anyhow!("Test component shutdown failure"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_graceful_shutdown_phases() {
        let shutdown_manager = GracefulShutdown::with_default_config();
        let mut phases = shutdown_manager.subscribe_to_shutdown();
        assert_eq!(shutdown_manager.get_phase().await, ShutdownPhase::Running);

        shutdown_manager.trigger_shutdown().await;
        assert_eq!(shutdown_manager.get_phase().await, ShutdownPhase::Draining);
        assert_eq!(phases.recv().await.unwrap(), ShutdownPhase::Draining);

        shutdown_manager.wait_for_shutdown().await.unwrap();
        assert_eq!(shutdown_manager.get_phase().await, ShutdownPhase::Stopped);
    }

    #[tokio::test]
    async fn test_component_registration_and_shutdown() {
        let shutdown_manager = GracefulShutdown::with_default_config();

        let ok_component = TestComponent::new("ok", false);
        let ok_called = ok_component.shutdown_called.clone();
        let failing = TestComponent::new("failing", true);

        shutdown_manager.register_component(Box::new(ok_component)).await;
        shutdown_manager.register_component(Box::new(failing)).await;

        shutdown_manager.trigger_shutdown().await;
        shutdown_manager.perform_shutdown().await.unwrap();

        assert!(ok_called.load(Ordering::Relaxed));
        let stats = shutdown_manager.get_stats().await;
        assert_eq!(stats.components_shutdown, vec!["ok".to_string()]);
        assert_eq!(stats.failed_components.len(), 1);
        assert_eq!(stats.failed_components[0].0, "failing");
    }

    #[tokio::test]
    async fn test_operation_permits_during_shutdown() {
        let shutdown_manager = GracefulShutdown::with_default_config();

        let permit = shutdown_manager.acquire_operation_permit().await;
        assert!(permit.is_some());

        shutdown_manager.trigger_shutdown().await;
        assert!(shutdown_manager.acquire_operation_permit().await.is_none());
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_operations() {
        let shutdown_manager = Arc::new(GracefulShutdown::new(ShutdownConfig {
            graceful_timeout_seconds: 5,
            component_timeout_seconds: 1,
            max_operations: 4,
        }));

        let permit = shutdown_manager.acquire_operation_permit().await.unwrap();
        let finished = Arc::new(AtomicBool::new(false));
        let finished_flag = finished.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            finished_flag.store(true, Ordering::SeqCst);
            drop(permit);
        });

        shutdown_manager.trigger_shutdown().await;
        shutdown_manager.perform_shutdown().await.unwrap();

        assert!(finished.load(Ordering::SeqCst));
        assert!(!shutdown_manager.get_stats().await.forced_termination);
    }
}
