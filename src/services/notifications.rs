use std::collections::HashSet;

use tokio::sync::broadcast;

use crate::models::{NotificationData, NotificationKind, NotificationSummary};

/// Session-held notification list. Entries are only appended; reading flips a flag.
#[derive(Debug, Default)]
pub struct NotificationInbox {
    items: Vec<NotificationData>,
    delivered: HashSet<(String, NotificationKind)>,
}

impl NotificationInbox {
    pub fn push(&mut self, notification: NotificationData) {
        self.items.push(notification);
    }

    /// Records that `kind` was sent for `prazo_id`; false if it already was.
    pub fn first_delivery(&mut self, prazo_id: &str, kind: NotificationKind) -> bool {
        self.delivered.insert((prazo_id.to_string(), kind))
    }

    /// `None` for an unknown id, `Some(false)` when it was already read.
    pub fn mark_read(&mut self, id: &str) -> Option<bool> {
        let item = self.items.iter_mut().find(|n| n.id == id)?;
        if item.read {
            return Some(false);
        }
        item.read = true;
        Some(true)
    }

    pub fn mark_all_read(&mut self) -> usize {
        let mut changed = 0;
        for item in self.items.iter_mut().filter(|n| !n.read) {
            item.read = true;
            changed += 1;
        }
        changed
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    /// Newest first.
    pub fn list(&self, unread_only: bool) -> Vec<NotificationData> {
        self.items
            .iter()
            .rev()
            .filter(|n| !unread_only || !n.read)
            .cloned()
            .collect()
    }

    pub fn summary(&self, latest: usize) -> NotificationSummary {
        NotificationSummary {
            total: self.items.len(),
            unread: self.unread_count(),
            latest: self.items.iter().rev().take(latest).cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    Delivered(NotificationData),
    /// The subscriber fell behind and skipped this many events.
    Missed(u64),
}

pub struct NotificationSubscription {
    receiver: broadcast::Receiver<NotificationData>,
}

impl NotificationSubscription {
    pub fn new(receiver: broadcast::Receiver<NotificationData>) -> Self {
        NotificationSubscription { receiver }
    }

    /// `None` once the owning session is gone.
    pub async fn next(&mut self) -> Option<NotificationEvent> {
        match self.receiver.recv().await {
            Ok(notification) => Some(NotificationEvent::Delivered(notification)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "notification subscriber lagged");
                Some(NotificationEvent::Missed(skipped))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(id: &str) -> NotificationData {
        NotificationData {
            id: id.to_string(),
            user_id: "u1".to_string(),
            kind: NotificationKind::System,
            title: "t".to_string(),
            message: "m".to_string(),
            prazo_id: None,
            read: false,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn mark_read_decrements_once_and_is_idempotent() {
        let mut inbox = NotificationInbox::default();
        inbox.push(notification("n1"));
        inbox.push(notification("n2"));
        assert_eq!(inbox.unread_count(), 2);

        assert_eq!(inbox.mark_read("n1"), Some(true));
        assert_eq!(inbox.unread_count(), 1);
        assert_eq!(inbox.mark_read("n1"), Some(false));
        assert_eq!(inbox.unread_count(), 1);
        assert_eq!(inbox.mark_read("missing"), None);
    }

    #[test]
    fn mark_all_read_reports_changed_items() {
        let mut inbox = NotificationInbox::default();
        inbox.push(notification("n1"));
        inbox.push(notification("n2"));
        inbox.mark_read("n2");

        assert_eq!(inbox.mark_all_read(), 1);
        assert_eq!(inbox.unread_count(), 0);
        assert_eq!(inbox.list(false).len(), 2);
        assert!(inbox.list(true).is_empty());
    }

    #[test]
    fn first_delivery_is_tracked_per_kind() {
        let mut inbox = NotificationInbox::default();
        assert!(inbox.first_delivery("p1", NotificationKind::DeadlineDueSoon));
        assert!(!inbox.first_delivery("p1", NotificationKind::DeadlineDueSoon));
        assert!(inbox.first_delivery("p1", NotificationKind::DeadlineOverdue));
    }

    #[tokio::test]
    async fn lagging_subscriber_is_told_what_it_missed() {
        let (tx, rx) = broadcast::channel(2);
        let mut subscription = NotificationSubscription::new(rx);
        for id in ["n1", "n2", "n3"] {
            tx.send(notification(id)).unwrap();
        }

        assert_eq!(subscription.next().await, Some(NotificationEvent::Missed(1)));
        match subscription.next().await {
            Some(NotificationEvent::Delivered(n)) => assert_eq!(n.id, "n2"),
            other => panic!("unexpected event: {other:?}"),
        }
        drop(tx);
        assert!(matches!(subscription.next().await, Some(NotificationEvent::Delivered(_))));
        assert_eq!(subscription.next().await, None);
    }
}
