// src/bot/filters.rs - Pattern, size and blacklist checks over message content

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

use crate::config::ModerationConfig;
use crate::error::PolicyViolation;
use crate::types::RelayMessage;

/// Stateless content checks plus a hot-reloadable word blacklist.
///
/// Patterns are compiled once at construction.
#[derive(Clone)]
pub struct ContentFilters {
    invite_pattern: Regex,
    adult_pattern: Regex,
    max_message_length: usize,
    max_attachments: usize,
    blacklist: Arc<RwLock<HashSet<String>>>,
}

impl ContentFilters {
    pub fn new(config: &ModerationConfig) -> Result<Self> {
        let invite_pattern = Regex::new(&config.invite_pattern).context("compiling invite pattern")?;
        let adult_pattern = Regex::new(&config.adult_pattern).context("compiling adult content pattern")?;

        Ok(Self {
            invite_pattern,
            adult_pattern,
            max_message_length: config.max_message_length,
            max_attachments: config.max_attachments,
            blacklist: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    /// Run every content rule in order and stop at the first hit.
    pub async fn check(&self, message: &RelayMessage) -> Result<(), PolicyViolation> {
        let content = message.content.as_str();

        if self.contains_invite(content) {
            return Err(PolicyViolation::InviteLink);
        }
        if self.contains_adult_content(content) {
            return Err(PolicyViolation::AdultContent);
        }
        if content.chars().count() > self.max_message_length {
            return Err(PolicyViolation::TooLong);
        }
        if message.attachments.len() > self.max_attachments {
            return Err(PolicyViolation::TooManyAttachments);
        }
        if self.contains_blacklisted_word(content).await {
            return Err(PolicyViolation::Prohibited);
        }
        Ok(())
    }

    pub fn contains_invite(&self, content: &str) -> bool {
        self.invite_pattern.is_match(content)
    }

    pub fn contains_adult_content(&self, content: &str) -> bool {
        self.adult_pattern.is_match(content)
    }

    /// Case-insensitive substring match against every blacklisted word
    pub async fn contains_blacklisted_word(&self, content: &str) -> bool {
        let lowered = content.to_lowercase();
        let blacklist = self.blacklist.read().await;
        blacklist.iter().any(|word| lowered.contains(word.as_str()))
    }

    pub async fn set_blacklist<I, S>(&self, words: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let words: HashSet<String> = words
            .into_iter()
            .map(|w| w.as_ref().trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        *self.blacklist.write().await = words;
    }

    pub async fn blacklist_len(&self) -> usize {
        self.blacklist.read().await.len()
    }

    /// Replace the blacklist with the words in `path`, creating an empty file if needed.
    pub async fn load_blacklist(&self, path: &Path) -> Result<usize> {
        let words = read_blacklist_file(path).await?;
        let count = words.len();
        *self.blacklist.write().await = words;
        info!("Loaded {} blacklisted words from {}", count, path.display());
        Ok(count)
    }

    /// Reload the blacklist whenever its file is modified.
    ///
    /// The returned watcher must be kept alive for as long as reloads are wanted.
    pub fn watch_blacklist(&self, path: &Path) -> Result<RecommendedWatcher> {
        let path: PathBuf = path.to_path_buf();
        let watch_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path.file_name().map(|n| n.to_os_string());

        let (tx, mut rx) = tokio::sync::mpsc::channel(100);
        let mut watcher = notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if let Err(e) = tx.blocking_send(event) {
                    error!("Failed to send blacklist watch event: {}", e);
                }
            }
        })?;
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        let filters = self.clone();
        let reload_path = path.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }
                let touches_blacklist = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if !touches_blacklist {
                    continue;
                }

                info!("Blacklist file changed, reloading...");
                match read_blacklist_file(&reload_path).await {
                    Ok(words) => {
                        let count = words.len();
                        *filters.blacklist.write().await = words;
                        debug!("Reloaded {} blacklisted words", count);
                    }
                    Err(e) => warn!("Failed to reload blacklist, keeping previous list: {}", e),
                }
            }
        });

        info!("Watching {} for blacklist changes", path.display());
        Ok(watcher)
    }
}

async fn read_blacklist_file(path: &Path) -> Result<HashSet<String>> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(path, "").await?;
        info!("Created empty blacklist file: {}", path.display());
        return Ok(HashSet::new());
    }

    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading blacklist {}", path.display()))?;
    Ok(parse_blacklist(&content))
}

fn parse_blacklist(content: &str) -> HashSet<String> {
    content
        .lines()
        .map(|line| line.trim().to_lowercase())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Attachment;
    use tempfile::tempdir;

    fn filters() -> ContentFilters {
        ContentFilters::new(&ModerationConfig::default()).unwrap()
    }

    fn msg(content: &str) -> RelayMessage {
        RelayMessage::new(1, 2, "tester", 3, content)
    }

    #[tokio::test]
    async fn test_invite_and_adult_patterns() {
        let filters = filters();
        assert_eq!(
            filters.check(&msg("join us at discord.gg/abc123")).await,
            Err(PolicyViolation::InviteLink)
        );
        assert_eq!(
            filters.check(&msg("https://discord.com/invite/Xyz")).await,
            Err(PolicyViolation::InviteLink)
        );
        assert_eq!(filters.check(&msg("free XXX here")).await, Err(PolicyViolation::AdultContent));
        assert_eq!(filters.check(&msg("talking about discord in general")).await, Ok(()));
    }

    #[tokio::test]
    async fn test_length_and_attachment_limits() {
        let filters = filters();
        assert_eq!(filters.check(&msg(&"a".repeat(2000))).await, Ok(()));
        assert_eq!(filters.check(&msg(&"a".repeat(2001))).await, Err(PolicyViolation::TooLong));
        // counted in characters, not bytes
        assert_eq!(filters.check(&msg(&"é".repeat(2000))).await, Ok(()));

        let mut message = msg("pics");
        for i in 0..11 {
            message = message.with_attachment(Attachment::new(format!("{}.png", i), "https://cdn/x"));
        }
        assert_eq!(filters.check(&message).await, Err(PolicyViolation::TooManyAttachments));
    }

    #[tokio::test]
    async fn test_blacklist_is_case_insensitive_substring() {
        let filters = filters();
        filters.set_blacklist(["Spoon", "forbidden phrase"]).await;

        assert_eq!(filters.check(&msg("I like SPOONS")).await, Err(PolicyViolation::Prohibited));
        assert_eq!(
            filters.check(&msg("this is a Forbidden Phrase indeed")).await,
            Err(PolicyViolation::Prohibited)
        );
        assert_eq!(filters.check(&msg("forks and knives")).await, Ok(()));
    }

    #[tokio::test]
    async fn test_load_blacklist_creates_missing_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("lists").join("blacklist.txt");
        let filters = filters();

        assert_eq!(filters.load_blacklist(&path).await.unwrap(), 0);
        assert!(path.exists());

        fs::write(&path, "# comment\n  BadWord \n\nother\n").await.unwrap();
        assert_eq!(filters.load_blacklist(&path).await.unwrap(), 2);
        assert!(filters.contains_blacklisted_word("a badword here").await);
        assert!(!filters.contains_blacklisted_word("# comment").await);
    }

    #[test]
    fn test_parse_blacklist_skips_comments() {
        let words = parse_blacklist("#header\nOne\n  two  \n#three\n");
        assert_eq!(words.len(), 2);
        assert!(words.contains("one"));
        assert!(words.contains("two"));
    }
}
