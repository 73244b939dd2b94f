use serde::{Deserialize, Serialize};

use crate::error::CommandError;
use crate::models::NotificationData;
use crate::services::state::AppState;

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct GetNotificationsPayload {
    pub unread_only: bool,
}

#[derive(Deserialize)]
pub struct MarkReadPayload {
    pub id: String,
}

#[derive(Serialize)]
pub struct MarkReadResult {
    pub changed: usize,
    pub unread: usize,
}

pub async fn get_notifications(
    state: &AppState,
    payload: GetNotificationsPayload,
) -> Result<Vec<NotificationData>, CommandError> {
    Ok(state.session()?.notifications(payload.unread_only)?)
}

/// Idempotent: a second call reports `changed: 0`.
pub async fn mark_notification_read(state: &AppState, payload: MarkReadPayload) -> Result<MarkReadResult, CommandError> {
    let session = state.session()?;
    let changed = usize::from(session.mark_read(&payload.id)?);
    Ok(MarkReadResult {
        changed,
        unread: session.summary(0)?.unread,
    })
}

pub async fn mark_all_notifications_read(state: &AppState) -> Result<MarkReadResult, CommandError> {
    let session = state.session()?;
    let changed = session.mark_all_read()?;
    Ok(MarkReadResult { changed, unread: 0 })
}
