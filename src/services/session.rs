use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::error::{AppError, AppResult};
use crate::models::{CacheStats, NotificationData, NotificationKind, NotificationSummary, PrazoFiscal};
use crate::services::cache::QueryCache;
use crate::services::notifications::{NotificationInbox, NotificationSubscription};
use crate::utils::{new_id, now_rfc3339};

const CHANNEL_CAPACITY: usize = 64;

/// State owned by one signed-in user. Created on login, dropped on logout.
pub struct UserSession {
    pub user_id: String,
    pub started_at: String,
    inbox: Mutex<NotificationInbox>,
    cache: Mutex<QueryCache<Vec<PrazoFiscal>>>,
    sender: broadcast::Sender<NotificationData>,
}

impl UserSession {
    pub fn new(user_id: &str, cache_ttl: Duration) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        UserSession {
            user_id: user_id.to_string(),
            started_at: now_rfc3339(),
            inbox: Mutex::new(NotificationInbox::default()),
            cache: Mutex::new(QueryCache::new(cache_ttl)),
            sender,
        }
    }

    pub fn prazos_tag(&self) -> String {
        format!("prazos:{}", self.user_id)
    }

    pub fn cache(&self) -> AppResult<MutexGuard<'_, QueryCache<Vec<PrazoFiscal>>>> {
        self.cache.lock().map_err(|_| AppError::Lock("query cache"))
    }

    pub fn inbox(&self) -> AppResult<MutexGuard<'_, NotificationInbox>> {
        self.inbox.lock().map_err(|_| AppError::Lock("notification inbox"))
    }

    pub fn invalidate_prazos(&self) -> AppResult<usize> {
        let tag = self.prazos_tag();
        Ok(self.cache()?.invalidate_tag(&tag))
    }

    pub fn cache_stats(&self) -> AppResult<CacheStats> {
        Ok(self.cache()?.stats())
    }

    pub fn subscribe(&self) -> NotificationSubscription {
        NotificationSubscription::new(self.sender.subscribe())
    }

    pub fn notify(
        &self,
        kind: NotificationKind,
        title: &str,
        message: &str,
        prazo_id: Option<&str>,
    ) -> AppResult<NotificationData> {
        let notification = NotificationData {
            id: new_id(),
            user_id: self.user_id.clone(),
            kind,
            title: title.to_string(),
            message: message.to_string(),
            prazo_id: prazo_id.map(str::to_string),
            read: false,
            created_at: now_rfc3339(),
        };
        self.inbox()?.push(notification.clone());
        // No subscribers is fine; the inbox keeps the record.
        let _ = self.sender.send(notification.clone());
        Ok(notification)
    }

    /// Sends `kind` for `prazo_id` at most once per session.
    pub fn notify_once(
        &self,
        kind: NotificationKind,
        prazo_id: &str,
        title: &str,
        message: &str,
    ) -> AppResult<Option<NotificationData>> {
        if !self.inbox()?.first_delivery(prazo_id, kind) {
            return Ok(None);
        }
        self.notify(kind, title, message, Some(prazo_id)).map(Some)
    }

    pub fn notifications(&self, unread_only: bool) -> AppResult<Vec<NotificationData>> {
        Ok(self.inbox()?.list(unread_only))
    }

    pub fn mark_read(&self, id: &str) -> AppResult<bool> {
        self.inbox()?
            .mark_read(id)
            .ok_or_else(|| AppError::not_found("notification", id))
    }

    pub fn mark_all_read(&self) -> AppResult<usize> {
        Ok(self.inbox()?.mark_all_read())
    }

    pub fn summary(&self, latest: usize) -> AppResult<NotificationSummary> {
        Ok(self.inbox()?.summary(latest))
    }
}
