// src/config/mod.rs - Relay configuration with YAML persistence and env overrides

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub const DEFAULT_INVITE_PATTERN: &str = r"(?i)(discord\.gg|discord(?:app)?\.com/invite)/[a-z0-9-]+";
/// Upper bound on concurrent image classifications
pub const MAX_CLASSIFIER_WORKERS: usize = 64;
/// Upper bound on concurrent fan-out deliveries per message
pub const MAX_CONCURRENT_DELIVERIES: usize = 256;

pub const DEFAULT_ADULT_PATTERN: &str =
    r"(?i)\b(porn(?:hub)?|xxx|xvideos|xhamster|onlyfans\.com|nsfw\s*content)\b";

/// Top-level configuration, one section per engine component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub storage: StorageConfig,
    pub moderation: ModerationConfig,
    pub spam: SpamConfig,
    pub mutes: MuteConfig,
    pub classifier: ClassifierConfig,
    pub registry: RegistryConfig,
    pub relay: FanoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding channels.yaml, bans.yaml and the JSON-lines logs
    pub data_dir: PathBuf,
    /// One word per line, `#` starts a comment
    pub blacklist_path: PathBuf,
    pub watch_blacklist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    pub max_message_length: usize,
    pub max_attachments: usize,
    pub invite_pattern: String,
    pub adult_pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamConfig {
    pub window_ms: u64,
    /// More than this many messages inside the window is rate limited
    pub threshold: usize,
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuteConfig {
    pub sweep_interval_secs: u64,
    /// Mute length for timing violations
    pub short_cooldown_secs: u64,
    /// Mute length for content violations
    pub long_cooldown_secs: u64,
    pub warning_delete_after_secs: u64,
}

/// What to do when an attachment cannot be classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    FailOpen,
    FailClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub enabled: bool,
    /// Scoring endpoint; without one no classifier is wired
    pub endpoint: Option<String>,
    pub threshold: f32,
    pub max_workers: usize,
    pub timeout_secs: u64,
    pub failure_policy: FailurePolicy,
    pub image_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Name given to the per-channel sender handles
    pub sender_name: String,
    pub direct_message_label: String,
    pub max_concurrent_deliveries: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            blacklist_path: PathBuf::from("data/blacklist.txt"),
            watch_blacklist: true,
        }
    }
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            max_message_length: 2000,
            max_attachments: 10,
            invite_pattern: DEFAULT_INVITE_PATTERN.to_string(),
            adult_pattern: DEFAULT_ADULT_PATTERN.to_string(),
        }
    }
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            window_ms: 1000,
            threshold: 8,
            cooldown_ms: 2000,
        }
    }
}

impl Default for MuteConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 5,
            short_cooldown_secs: 2,
            long_cooldown_secs: 60,
            warning_delete_after_secs: 5,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            threshold: 0.7,
            max_workers: 2,
            timeout_secs: 10,
            failure_policy: FailurePolicy::FailOpen,
            image_extensions: ["jpg", "jpeg", "png", "webp"].iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { refresh_interval_secs: 60 }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            sender_name: "GlobalChat Webhook".to_string(),
            direct_message_label: "Direct Message".to_string(),
            max_concurrent_deliveries: 16,
        }
    }
}

impl SpamConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl MuteConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn short_cooldown(&self) -> Duration {
        Duration::from_secs(self.short_cooldown_secs)
    }

    pub fn long_cooldown(&self) -> Duration {
        Duration::from_secs(self.long_cooldown_secs)
    }

    pub fn warning_delete_after(&self) -> Duration {
        Duration::from_secs(self.warning_delete_after_secs)
    }
}

impl ClassifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RegistryConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

impl RelayConfig {
    /// Load the config file, writing the defaults there first when it does not exist.
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .await
                .with_context(|| format!("reading config {}", path.display()))?;
            let config: RelayConfig = serde_yaml::from_str(&content)
                .with_context(|| format!("parsing config {}", path.display()))?;
            debug!("Loaded relay configuration from {}", path.display());
            config
        } else {
            let config = RelayConfig::default();
            config.save(path).await?;
            info!("Created default relay configuration: {}", path.display());
            config
        };

        config.validate()?;
        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
            }
        }
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)
            .await
            .with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }

    /// Apply `GLOBALCHAT_*` environment overrides on top of the loaded file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("GLOBALCHAT_DATA_DIR") {
            info!("Data directory overridden from environment: {}", dir);
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("GLOBALCHAT_BLACKLIST") {
            info!("Blacklist path overridden from environment: {}", path);
            self.storage.blacklist_path = PathBuf::from(path);
        }
        if let Some(url) = lookup("GLOBALCHAT_CLASSIFIER_URL") {
            if url.trim().is_empty() {
                warn!("GLOBALCHAT_CLASSIFIER_URL is set but empty, ignoring");
            } else {
                self.classifier.endpoint = Some(url);
            }
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.moderation.max_message_length == 0 {
            return Err(anyhow::anyhow!("moderation.max_message_length must be greater than 0"));
        }
        regex::Regex::new(&self.moderation.invite_pattern)
            .map_err(|e| anyhow::anyhow!("Invalid invite pattern: {}", e))?;
        regex::Regex::new(&self.moderation.adult_pattern)
            .map_err(|e| anyhow::anyhow!("Invalid adult content pattern: {}", e))?;

        if self.spam.window_ms == 0 {
            return Err(anyhow::anyhow!("spam.window_ms must be greater than 0"));
        }
        if self.spam.threshold == 0 {
            return Err(anyhow::anyhow!("spam.threshold must be greater than 0"));
        }

        if self.mutes.sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!("mutes.sweep_interval_secs must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.classifier.threshold) {
            return Err(anyhow::anyhow!("Classifier threshold must be between 0.0 and 1.0"));
        }
        if self.classifier.max_workers == 0 || self.classifier.max_workers > MAX_CLASSIFIER_WORKERS {
            return Err(anyhow::anyhow!(
                "classifier.max_workers must be between 1 and {}",
                MAX_CLASSIFIER_WORKERS
            ));
        }
        if self.classifier.timeout_secs == 0 {
            return Err(anyhow::anyhow!("classifier.timeout_secs must be greater than 0"));
        }
        if let Some(ref endpoint) = self.classifier.endpoint {
            let parsed = url::Url::parse(endpoint)
                .map_err(|e| anyhow::anyhow!("Invalid classifier endpoint '{}': {}", endpoint, e))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(anyhow::anyhow!("Classifier endpoint must use http or https"));
            }
        }

        if self.registry.refresh_interval_secs == 0 {
            return Err(anyhow::anyhow!("registry.refresh_interval_secs must be greater than 0"));
        }

        if self.relay.max_concurrent_deliveries == 0 || self.relay.max_concurrent_deliveries > MAX_CONCURRENT_DELIVERIES {
            return Err(anyhow::anyhow!(
                "relay.max_concurrent_deliveries must be between 1 and {}",
                MAX_CONCURRENT_DELIVERIES
            ));
        }

        Ok(())
    }
}
