//! Background deadline monitor: persists overdue transitions and pushes
//! overdue / due-soon notifications once per deadline per session.

use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::models::{NotificationKind, Period, PrazoFilters, PrazoSort, PrazoStatus};
use crate::services::prazos;
use crate::services::state::AppState;
use crate::utils::{format_decimal, now_rfc3339, today};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorReport {
    pub overdue: usize,
    pub due_soon: usize,
}

pub fn run_once(state: &AppState, today: NaiveDate) -> AppResult<MonitorReport> {
    let Some(session) = state.current_session()? else {
        return Ok(MonitorReport::default());
    };
    let settings = state.settings()?;

    let transitioned = {
        let mut db = state.db.lock().map_err(|_| AppError::Lock("database"))?;
        db.mark_overdue(&session.user_id, today, &now_rfc3339())?
    };
    if !transitioned.is_empty() {
        session.invalidate_prazos()?;
        tracing::info!(user = %session.user_id, count = transitioned.len(), "deadlines became overdue");
    }

    let mut report = MonitorReport::default();

    let overdue = prazos::list_prazos(
        &state.db,
        &session,
        &PrazoFilters {
            status: Some(PrazoStatus::Overdue),
            ..Default::default()
        },
        PrazoSort::DueDateAsc,
        today,
    )?;
    for prazo in &overdue {
        let message = format!("{} venceu em {}", prazo.description, prazo.due_date.format("%d/%m/%Y"));
        if session
            .notify_once(NotificationKind::DeadlineOverdue, &prazo.id, "Prazo vencido", &message)?
            .is_some()
        {
            report.overdue += 1;
        }
    }

    let horizon = today + chrono::Duration::days(settings.due_soon_days.max(0));
    let due_soon = prazos::list_prazos(
        &state.db,
        &session,
        &PrazoFilters {
            period: Some(Period::Custom { from: today, to: horizon }),
            status: Some(PrazoStatus::Pending),
            ..Default::default()
        },
        PrazoSort::DueDateAsc,
        today,
    )?;
    for prazo in &due_soon {
        let mut message = format!("{} vence em {}", prazo.description, prazo.due_date.format("%d/%m/%Y"));
        if let Some(amount) = prazo.amount {
            message.push_str(&format!(" (R$ {})", format_decimal(amount)));
        }
        if session
            .notify_once(NotificationKind::DeadlineDueSoon, &prazo.id, "Prazo próximo", &message)?
            .is_some()
        {
            report.due_soon += 1;
        }
    }

    if report != MonitorReport::default() {
        tracing::debug!(user = %session.user_id, overdue = report.overdue, due_soon = report.due_soon, "monitor notified");
    }
    Ok(report)
}

/// Runs the monitor on the configured interval until the runtime shuts down.
pub fn spawn(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval = state
                .settings()
                .map(|s| s.monitor_interval_secs.max(1))
                .unwrap_or(300);
            if let Err(err) = run_once(&state, today()) {
                tracing::error!(error = %err, "deadline monitor failed");
            }
            tokio::time::sleep(Duration::from_secs(interval)).await;
        }
    })
}
