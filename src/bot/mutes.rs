// src/bot/mutes.rs - Timed per-user mutes with notifications and an expiry sweep

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use crate::platforms::{AuditStore, Notifier};
use crate::types::{ChannelId, MuteDuration, MuteHistoryEntry, MuteRecord, Notice, NotificationRef, UserId};

/// Owns every active mute.
///
/// Lock order is always per-user lock, then the record map. Notification I/O
/// happens while holding only the per-user lock, so a renewal, an unmute and
/// the sweep never interleave for one user while other users are unaffected.
pub struct MuteManager {
    records: RwLock<HashMap<UserId, MuteRecord>>,
    user_locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
    /// Records evicted on read that still owe the user an expiry notice
    pending_expired: Mutex<Vec<MuteRecord>>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditStore>,
    warning_delete_after: Duration,
}

impl MuteManager {
    pub fn new(notifier: Arc<dyn Notifier>, audit: Arc<dyn AuditStore>, warning_delete_after: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            user_locks: Mutex::new(HashMap::new()),
            pending_expired: Mutex::new(Vec::new()),
            notifier,
            audit,
            warning_delete_after,
        }
    }

    async fn user_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        Arc::clone(locks.entry(user_id).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    pub async fn mute(
        &self,
        user_id: UserId,
        duration: MuteDuration,
        reason: &str,
        origin_channel_id: ChannelId,
    ) -> MuteRecord {
        self.mute_at(user_id, duration, reason, origin_channel_id, Utc::now()).await
    }

    /// Mute or renew. A renewal edits the existing notification and overwrites
    /// the end time and reason in place.
    pub async fn mute_at(
        &self,
        user_id: UserId,
        duration: MuteDuration,
        reason: &str,
        origin_channel_id: ChannelId,
        now: DateTime<Utc>,
    ) -> MuteRecord {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        let end_time = duration.end_time_from(now);
        let notice = Notice::muted(reason, end_time);
        // a record evicted on read but not yet swept is renewed like a live one
        let live = self.records.read().await.get(&user_id).cloned();
        let existing = match live {
            Some(record) => Some(record),
            None => self.take_pending(user_id).await,
        };

        let notification = match existing.and_then(|record| record.notification) {
            Some(previous) => match self.notifier.edit_user_notification(&previous, &notice).await {
                Ok(()) => {
                    debug!("Updated mute notification for user {}", user_id);
                    Some(previous)
                }
                Err(e) if e.is_not_found() => {
                    debug!("Mute notification for user {} is gone, sending a new one", user_id);
                    self.send_mute_notice(user_id, &notice).await
                }
                Err(e) => {
                    warn!("Failed to update mute notification for user {}: {}", user_id, e);
                    Some(previous)
                }
            },
            None => self.send_mute_notice(user_id, &notice).await,
        };

        let record = MuteRecord {
            user_id,
            end_time,
            reason: reason.to_string(),
            notification,
            origin_channel_id,
        };
        let renewed = self.records.write().await.insert(user_id, record.clone()).is_some();

        match end_time {
            Some(end) => info!(
                "{} user {} until {}: {}",
                if renewed { "Renewed mute for" } else { "Muted" },
                user_id,
                end,
                reason
            ),
            None => info!("Muted user {} indefinitely: {}", user_id, reason),
        }

        let entry = MuteHistoryEntry {
            timestamp: now,
            duration_secs: duration.as_secs(),
            reason: reason.to_string(),
        };
        if let Err(e) = self.audit.record_mute(user_id, entry).await {
            error!("Failed to record mute history for user {}: {}", user_id, e);
        }

        let warning = format!("<@{}>, you are currently muted. Wait for the cooldown.", user_id);
        if let Err(e) = self
            .notifier
            .send_channel_notice(origin_channel_id, &warning, Some(self.warning_delete_after))
            .await
        {
            warn!("Failed to post mute warning in channel {}: {}", origin_channel_id, e);
        }

        record
    }

    async fn take_pending(&self, user_id: UserId) -> Option<MuteRecord> {
        let mut pending = self.pending_expired.lock().await;
        let position = pending.iter().position(|record| record.user_id == user_id)?;
        Some(pending.remove(position))
    }

    async fn send_mute_notice(&self, user_id: UserId, notice: &Notice) -> Option<NotificationRef> {
        match self.notifier.send_to_user(user_id, notice).await {
            Ok(reference) => Some(reference),
            Err(e) => {
                warn!("Failed to notify user {} about mute: {}", user_id, e);
                None
            }
        }
    }

    pub async fn mute_status(&self, user_id: UserId) -> Option<MuteRecord> {
        self.mute_status_at(user_id, Utc::now()).await
    }

    /// Active mute for `user_id`, evicting an expired record on the way.
    pub async fn mute_status_at(&self, user_id: UserId, now: DateTime<Utc>) -> Option<MuteRecord> {
        match self.records.read().await.get(&user_id) {
            None => return None,
            Some(record) if record.is_active_at(now) => return Some(record.clone()),
            Some(_) => {}
        }

        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        let mut records = self.records.write().await;
        match records.get(&user_id) {
            Some(record) if record.is_active_at(now) => Some(record.clone()),
            Some(_) => {
                if let Some(expired) = records.remove(&user_id) {
                    debug!("Lazily evicted expired mute for user {}", user_id);
                    self.pending_expired.lock().await.push(expired);
                }
                None
            }
            None => None,
        }
    }

    pub async fn is_muted(&self, user_id: UserId) -> bool {
        self.mute_status(user_id).await.is_some()
    }

    pub async fn is_muted_at(&self, user_id: UserId, now: DateTime<Utc>) -> bool {
        self.mute_status_at(user_id, now).await.is_some()
    }

    /// Lift a mute by hand. Returns false when the user was not muted.
    pub async fn unmute(&self, user_id: UserId) -> bool {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        let removed = self.records.write().await.remove(&user_id);
        match removed {
            Some(record) => {
                info!("Mute lifted for user {}", user_id);
                self.notify_expired(&record).await;
                true
            }
            None => false,
        }
    }

    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Remove every record past its end time and tell each user once.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let candidates: Vec<UserId> = self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.is_expired_at(now))
            .map(|record| record.user_id)
            .collect();

        let mut expired = 0;
        for user_id in candidates {
            let lock = self.user_lock(user_id).await;
            let _guard = lock.lock().await;

            let removed = {
                let mut records = self.records.write().await;
                match records.get(&user_id) {
                    // renewed since the scan
                    Some(record) if record.is_active_at(now) => None,
                    Some(_) => records.remove(&user_id),
                    None => None,
                }
            };

            if let Some(record) = removed {
                self.notify_expired(&record).await;
                expired += 1;
            }
        }

        let pending: Vec<MuteRecord> = std::mem::take(&mut *self.pending_expired.lock().await);
        for record in pending {
            let lock = self.user_lock(record.user_id).await;
            let _guard = lock.lock().await;

            let muted_again = self
                .records
                .read()
                .await
                .get(&record.user_id)
                .map_or(false, |current| current.is_active_at(now));
            if muted_again {
                debug!("User {} was muted again before the sweep, skipping expiry notice", record.user_id);
                self.delete_stale_notification(&record).await;
                continue;
            }

            self.notify_expired(&record).await;
            expired += 1;
        }

        if expired > 0 {
            info!("Expired {} mutes", expired);
            self.prune_user_locks().await;
        }
        expired
    }

    async fn notify_expired(&self, record: &MuteRecord) {
        let notice = Notice::mute_expired(record.origin_channel_id);
        match self.notifier.send_to_user(record.user_id, &notice).await {
            Ok(_) => info!("Sent mute expired notification to user {}", record.user_id),
            Err(e) => warn!("Failed to send mute expired notification to user {}: {}", record.user_id, e),
        }

        self.delete_stale_notification(record).await;
    }

    async fn delete_stale_notification(&self, record: &MuteRecord) {
        let current = self
            .records
            .read()
            .await
            .get(&record.user_id)
            .and_then(|current| current.notification.clone());
        if let Some(ref notification) = record.notification {
            // a renewal may have taken this notification over
            if current.as_ref() == Some(notification) {
                return;
            }
            if let Err(e) = self.notifier.delete_notification(notification).await {
                debug!("Failed to delete mute notification for user {}: {}", record.user_id, e);
            }
        }
    }

    async fn prune_user_locks(&self) {
        let mut locks = self.user_locks.lock().await;
        let records = self.records.read().await;
        locks.retain(|user_id, lock| records.contains_key(user_id) || Arc::strong_count(lock) > 1);
    }

    /// Snapshot of mutes still active at the current time
    pub async fn active_mutes(&self) -> Vec<MuteRecord> {
        let now = Utc::now();
        let mut active: Vec<MuteRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.is_active_at(now))
            .cloned()
            .collect();
        active.sort_by_key(|record| record.user_id);
        active
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::memory::{MemoryAudit, RecordingNotifier};

    struct Fixture {
        notifier: Arc<RecordingNotifier>,
        audit: Arc<MemoryAudit>,
        mutes: MuteManager,
    }

    fn fixture() -> Fixture {
        let notifier = Arc::new(RecordingNotifier::new());
        let audit = Arc::new(MemoryAudit::new());
        let mutes = MuteManager::new(notifier.clone(), audit.clone(), Duration::from_secs(5));
        Fixture { notifier, audit, mutes }
    }

    fn secs(n: u64) -> MuteDuration {
        MuteDuration::Timed(Duration::from_secs(n))
    }

    #[tokio::test]
    async fn test_mute_notifies_and_warns() {
        let f = fixture();
        let now = Utc::now();
        let record = f.mutes.mute_at(42, secs(60), "Message contains prohibited words", 7, now).await;

        assert!(record.notification.is_some());
        assert!(f.mutes.is_muted_at(42, now).await);

        let dms = f.notifier.user_notices(42).await;
        assert_eq!(dms.len(), 1);
        assert_eq!(dms[0].title, "You have been muted");
        assert_eq!(dms[0].description, "Reason: Message contains prohibited words");

        let warnings = f.notifier.channel_notices(7).await;
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].0.contains("you are currently muted"));
        assert_eq!(warnings[0].1, Some(Duration::from_secs(5)));

        assert_eq!(f.audit.mute_history(42).await.len(), 1);
    }

    #[tokio::test]
    async fn test_active_mute_keeps_stored_reason_until_expiry() {
        let f = fixture();
        let now = Utc::now();
        f.mutes.mute_at(1, secs(60), "Message sent too quickly", 3, now).await;

        let status = f.mutes.mute_status_at(1, now + chrono::Duration::seconds(59)).await.unwrap();
        assert_eq!(status.reason, "Message sent too quickly");
        assert!(f.mutes.mute_status_at(1, now + chrono::Duration::seconds(60)).await.is_none());
    }

    #[tokio::test]
    async fn test_renewal_updates_record_in_place() {
        let f = fixture();
        let now = Utc::now();
        let first = f.mutes.mute_at(5, secs(60), "first", 1, now).await;
        let second = f.mutes.mute_at(5, secs(120), "second", 1, now + chrono::Duration::seconds(10)).await;

        assert_eq!(f.mutes.len().await, 1);
        assert_eq!(second.reason, "second");
        assert!(second.end_time > first.end_time);
        // the existing notification was edited, not replaced
        assert_eq!(first.notification, second.notification);
        assert_eq!(f.notifier.user_notices(5).await.len(), 1);
        assert_eq!(f.notifier.edit_count().await, 1);
        assert_eq!(f.audit.mute_history(5).await.len(), 2);
    }

    #[tokio::test]
    async fn test_renewal_resends_when_notification_was_deleted() {
        let f = fixture();
        let now = Utc::now();
        let first = f.mutes.mute_at(5, secs(60), "first", 1, now).await;
        f.notifier.forget(first.notification.as_ref().unwrap()).await;

        let second = f.mutes.mute_at(5, secs(60), "second", 1, now).await;
        assert!(second.notification.is_some());
        assert_ne!(first.notification, second.notification);
        assert_eq!(f.notifier.user_notices(5).await.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_expires_once_with_single_notice() {
        let f = fixture();
        let now = Utc::now();
        let record = f.mutes.mute_at(9, secs(2), "Message sent too quickly", 4, now).await;

        assert_eq!(f.mutes.sweep_expired_at(now + chrono::Duration::seconds(1)).await, 0);
        assert_eq!(f.mutes.sweep_expired_at(now + chrono::Duration::seconds(2)).await, 1);
        assert_eq!(f.mutes.sweep_expired_at(now + chrono::Duration::seconds(7)).await, 0);
        assert_eq!(f.mutes.len().await, 0);

        let dms = f.notifier.user_notices(9).await;
        let expired: Vec<_> = dms.iter().filter(|n| n.title == "Mute Expired").collect();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].link_channel, Some(4));
        assert!(f.notifier.was_deleted(record.notification.as_ref().unwrap()).await);
    }

    #[tokio::test]
    async fn test_lazy_eviction_still_gets_one_notice() {
        let f = fixture();
        let now = Utc::now();
        f.mutes.mute_at(9, secs(2), "x", 4, now).await;

        let later = now + chrono::Duration::seconds(3);
        assert!(!f.mutes.is_muted_at(9, later).await);
        assert_eq!(f.mutes.len().await, 0);

        assert_eq!(f.mutes.sweep_expired_at(later).await, 1);
        assert_eq!(f.mutes.sweep_expired_at(later).await, 0);
        let expired = f
            .notifier
            .user_notices(9)
            .await
            .into_iter()
            .filter(|n| n.title == "Mute Expired")
            .count();
        assert_eq!(expired, 1);
    }

    #[tokio::test]
    async fn test_remute_after_lazy_eviction_gets_no_expiry_notice() {
        let f = fixture();
        let now = Utc::now();
        let first = f.mutes.mute_at(9, secs(2), "Message sent too quickly", 4, now).await;

        let evicted_at = now + chrono::Duration::seconds(3);
        assert!(!f.mutes.is_muted_at(9, evicted_at).await);
        let second = f.mutes.mute_at(9, secs(60), "Message contains prohibited words", 4, evicted_at).await;
        // the evicted record's notification is edited in place
        assert_eq!(first.notification, second.notification);
        assert_eq!(f.notifier.edit_count().await, 1);

        let sweep_at = now + chrono::Duration::seconds(4);
        assert_eq!(f.mutes.sweep_expired_at(sweep_at).await, 0);
        assert!(f.mutes.is_muted_at(9, sweep_at).await);

        let dms = f.notifier.user_notices(9).await;
        assert!(dms.iter().all(|n| n.title != "Mute Expired"));
        assert!(!f.notifier.was_deleted(second.notification.as_ref().unwrap()).await);
    }

    #[tokio::test]
    async fn test_pending_expiry_skipped_when_muted_again_with_new_notice() {
        let f = fixture();
        let now = Utc::now();
        let first = f.mutes.mute_at(9, secs(2), "x", 4, now).await;

        let evicted_at = now + chrono::Duration::seconds(3);
        assert!(!f.mutes.is_muted_at(9, evicted_at).await);
        // the queued record is taken by the renewal; simulate a sweep that already drained it
        let queued = f.mutes.take_pending(9).await.unwrap();
        f.mutes.mute_at(9, secs(60), "y", 4, evicted_at).await;
        f.mutes.pending_expired.lock().await.push(queued);

        assert_eq!(f.mutes.sweep_expired_at(now + chrono::Duration::seconds(4)).await, 0);
        let dms = f.notifier.user_notices(9).await;
        assert!(dms.iter().all(|n| n.title != "Mute Expired"));
        assert!(f.notifier.was_deleted(first.notification.as_ref().unwrap()).await);
    }

    #[tokio::test]
    async fn test_indefinite_mute_needs_unmute() {
        let f = fixture();
        let now = Utc::now();
        f.mutes.mute_at(11, MuteDuration::Indefinite, "NSFW image detected", 2, now).await;

        assert_eq!(f.mutes.sweep_expired_at(now + chrono::Duration::days(365)).await, 0);
        assert!(f.mutes.is_muted_at(11, now + chrono::Duration::days(365)).await);
        assert_eq!(f.audit.mute_history(11).await[0].duration_secs, None);

        assert!(f.mutes.unmute(11).await);
        assert!(!f.mutes.is_muted(11).await);
        assert!(!f.mutes.unmute(11).await);
        assert_eq!(f.mutes.active_mutes().await.len(), 0);
    }

    #[tokio::test]
    async fn test_notifier_failures_do_not_block_mute() {
        let f = fixture();
        f.notifier.set_failing(true).await;
        let record = f.mutes.mute(3, secs(60), "x", 1).await;

        assert!(record.notification.is_none());
        assert!(f.mutes.is_muted(3).await);
        assert_eq!(f.mutes.active_mutes().await.len(), 1);
    }
}
