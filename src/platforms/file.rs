// src/platforms/file.rs - Directory-backed registry, ban list and audit logs

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{RelayError, RelayResult};
use crate::platforms::{AuditStore, BanOracle, RegistryStore};
use crate::types::{BanRecord, BanSubject, ChannelId, ChannelRegistration, MessageLogEntry, MuteHistoryEntry, ServerId, UserId};

const CHANNELS_FILE: &str = "channels.yaml";
const BANS_FILE: &str = "bans.yaml";
const MUTE_HISTORY_FILE: &str = "mute_history.jsonl";
const MESSAGE_LOG_FILE: &str = "message_log.jsonl";

#[derive(Debug, Serialize, Deserialize)]
struct MuteHistoryLine {
    user_id: UserId,
    #[serde(flatten)]
    entry: MuteHistoryEntry,
}

/// Stores everything as plain files under one data directory:
/// `channels.yaml` and `bans.yaml` are maintained by administrators, the two
/// `.jsonl` logs are append-only.
pub struct FileStore {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl FileStore {
    /// Open an existing data directory; the registry file must be readable.
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> RelayResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if !data_dir.is_dir() {
            return Err(RelayError::Infrastructure(format!(
                "data directory {} does not exist",
                data_dir.display()
            )));
        }

        let store = Self {
            data_dir,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        };
        let channels = store.read_channels().await?;
        info!(
            "Opened data directory {} ({} registered channels)",
            store.data_dir.display(),
            channels.len()
        );
        Ok(store)
    }

    /// Create the data directory with empty registry and ban files.
    pub async fn init<P: AsRef<Path>>(data_dir: P) -> RelayResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).await?;
        for file in [CHANNELS_FILE, BANS_FILE] {
            let path = data_dir.join(file);
            if !path.exists() {
                fs::write(&path, "[]\n").await?;
                info!("Created {}", path.display());
            }
        }
        Self::open(data_dir).await
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    async fn read_channels(&self) -> RelayResult<Vec<ChannelRegistration>> {
        let path = self.data_dir.join(CHANNELS_FILE);
        let content = fs::read_to_string(&path).await.map_err(|e| {
            RelayError::Infrastructure(format!("cannot read registry {}: {}", path.display(), e))
        })?;
        Ok(serde_yaml::from_str::<Option<Vec<ChannelRegistration>>>(&content)?.unwrap_or_default())
    }

    pub async fn write_channels(&self, channels: &[ChannelRegistration]) -> RelayResult<()> {
        let _guard = self.write_lock.lock().await;
        fs::write(self.data_dir.join(CHANNELS_FILE), serde_yaml::to_string(channels)?).await?;
        Ok(())
    }

    async fn read_bans(&self) -> RelayResult<Vec<BanRecord>> {
        let path = self.data_dir.join(BANS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).await?;
        Ok(serde_yaml::from_str::<Option<Vec<BanRecord>>>(&content)?.unwrap_or_default())
    }

    pub async fn write_bans(&self, bans: &[BanRecord]) -> RelayResult<()> {
        let _guard = self.write_lock.lock().await;
        fs::write(self.data_dir.join(BANS_FILE), serde_yaml::to_string(bans)?).await?;
        Ok(())
    }

    async fn is_banned(&self, subject_id: u64, kind: BanSubject) -> RelayResult<bool> {
        Ok(self
            .read_bans()
            .await?
            .iter()
            .any(|ban| ban.active && ban.subject_kind == kind && ban.subject_id == subject_id))
    }

    async fn append_line<T: Serialize>(&self, file: &str, value: &T) -> RelayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Infrastructure("store is closed".to_string()));
        }
        let mut line = serde_json::to_string(value)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.data_dir.join(file))
            .await?;
        handle.write_all(line.as_bytes()).await?;
        handle.flush().await?;
        Ok(())
    }

    pub async fn read_mute_history(&self, user_id: UserId) -> RelayResult<Vec<MuteHistoryEntry>> {
        let path = self.data_dir.join(MUTE_HISTORY_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).await?;
        let mut entries = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let parsed: MuteHistoryLine = serde_json::from_str(line)?;
            if parsed.user_id == user_id {
                entries.push(parsed.entry);
            }
        }
        Ok(entries)
    }

    pub async fn read_message_log(&self) -> RelayResult<Vec<MessageLogEntry>> {
        let path = self.data_dir.join(MESSAGE_LOG_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).await?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(RelayError::from))
            .collect()
    }
}

#[async_trait]
impl RegistryStore for FileStore {
    async fn load_registered_channels(&self) -> RelayResult<Vec<ChannelId>> {
        let channels = self.read_channels().await?;
        debug!("Read {} channel registrations", channels.len());
        Ok(channels.into_iter().map(|c| c.channel_id).collect())
    }
}

#[async_trait]
impl BanOracle for FileStore {
    async fn is_user_banned(&self, user_id: UserId) -> RelayResult<bool> {
        self.is_banned(user_id, BanSubject::User).await
    }

    async fn is_server_banned(&self, server_id: ServerId) -> RelayResult<bool> {
        self.is_banned(server_id, BanSubject::Server).await
    }
}

#[async_trait]
impl AuditStore for FileStore {
    async fn record_mute(&self, user_id: UserId, entry: MuteHistoryEntry) -> RelayResult<()> {
        self.append_line(MUTE_HISTORY_FILE, &MuteHistoryLine { user_id, entry }).await
    }

    async fn record_message(&self, entry: MessageLogEntry) -> RelayResult<()> {
        self.append_line(MESSAGE_LOG_FILE, &entry).await
    }

    async fn close(&self) -> RelayResult<()> {
        // wait for any in-progress append
        let _guard = self.write_lock.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        info!("Closed data store at {}", self.data_dir.display());
        Ok(())
    }
}
