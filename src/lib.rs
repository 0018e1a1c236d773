//! # GlobalChat
//!
//! Relay engine for a federated chat: messages posted in any registered
//! channel are moderated once and then re-posted into every other
//! registered channel under the author's name.
//!
//! ## Features
//!
//! - **Moderation pipeline**: bans, active mutes, content filters, spam limits and NSFW image screening
//! - **Timed mutes**: cooldown notices that are edited in place and cleared by a background sweep
//! - **Fan-out**: concurrent per-channel delivery with cached sender handles
//! - **Hot-reloaded blacklist**: prohibited words are picked up without a restart
//! - **Pluggable platforms**: in-memory, file-backed and HTTP collaborators
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use globalchat::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let platform = MemoryPlatform::new(vec![1, 2, 3]);
//!     let engine = Arc::new(GlobalChat::new(RelayConfig::default(), platform.collaborators()).await?);
//!     engine.start().await?;
//!
//!     let outcome = engine.handle_message(&RelayMessage::new(1, 42, "alice", 1, "hello")).await;
//!     println!("{:?}", outcome);
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod bot;
pub mod config;
pub mod error;
pub mod platforms;
pub mod types;

// Re-export commonly used items
pub mod prelude {
    pub use crate::bot::moderation::{ModerationPipeline, Outcome, Verdict};
    pub use crate::bot::shutdown::{GracefulShutdown, ShutdownConfig};
    pub use crate::bot::GlobalChat;
    pub use crate::config::{FailurePolicy, RelayConfig};
    pub use crate::error::{PolicyViolation, RelayError, RelayResult};
    pub use crate::platforms::file::FileStore;
    pub use crate::platforms::http::{HttpAttachmentFetcher, HttpClassifier};
    pub use crate::platforms::memory::{LoggingTransport, MemoryPlatform};
    pub use crate::platforms::Collaborators;
    pub use crate::types::{Attachment, ChannelId, MuteDuration, RelayMessage, UserId};
    pub use anyhow::Result;
}
