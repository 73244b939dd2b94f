use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::CommandError;
use crate::models::{DashboardData, Period, PrazoFilters, PrazoFiscal, PrazoSort, Region};
use crate::services::state::AppState;
use crate::services::{documents, prazos};
use crate::utils::today;

const UPCOMING_DAYS: i64 = 30;
const UPCOMING_LIMIT: usize = 10;
const RECENT_DOCUMENTS: usize = 5;
const LATEST_NOTIFICATIONS: usize = 5;
const SERIES_MONTHS: u32 = 6;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DashboardPayload {
    pub reference_date: Option<NaiveDate>,
}

/// Loads every panel independently; a failing source only empties its own region.
pub async fn get_dashboard(state: &AppState, payload: DashboardPayload) -> Result<DashboardData, CommandError> {
    let session = state.session()?;
    let settings = state.settings()?;
    let today = payload.reference_date.unwrap_or_else(today);

    let upcoming_filters = PrazoFilters {
        period: Some(Period::Custom {
            from: today,
            to: today + chrono::Duration::days(UPCOMING_DAYS),
        }),
        ..Default::default()
    };
    let upcoming = prazos::list_prazos(&state.db, &session, &upcoming_filters, PrazoSort::DueDateAsc, today).map(
        |list| {
            list.into_iter()
                .filter(PrazoFiscal::is_open)
                .take(UPCOMING_LIMIT)
                .collect::<Vec<_>>()
        },
    );

    let estatisticas = prazos::estatisticas(
        &state.db,
        &session,
        &PrazoFilters::default(),
        today,
        settings.due_soon_days,
    );

    let due_series = prazos::list_prazos(&state.db, &session, &PrazoFilters::default(), PrazoSort::DueDateAsc, today)
        .map(|all| prazos::due_series(&all, today, SERIES_MONTHS));

    let notifications = session.summary(LATEST_NOTIFICATIONS);
    let recent_documents = documents::list_uploads(&state.db, &session, RECENT_DOCUMENTS, false);

    let data = DashboardData {
        reference_date: today,
        upcoming: Region::from_result(upcoming),
        estatisticas: Region::from_result(estatisticas),
        notifications: Region::from_result(notifications),
        recent_documents: Region::from_result(recent_documents),
        due_series: Region::from_result(due_series),
    };

    for (region, error) in [
        ("upcoming", &data.upcoming.error),
        ("estatisticas", &data.estatisticas.error),
        ("notifications", &data.notifications.error),
        ("recent_documents", &data.recent_documents.error),
        ("due_series", &data.due_series.error),
    ] {
        if let Some(error) = error {
            tracing::warn!(region, error = %error, "dashboard region failed");
        }
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{CreatePrazoInput, Settings};
    use crate::services::storage::DocumentStorage;

    fn state() -> AppState {
        AppState::new(
            Database::in_memory().unwrap(),
            Settings::default(),
            DocumentStorage::new(std::env::temp_dir().join("contabilidade-dashboard-test")),
        )
        .unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn seed(state: &AppState, due: &str, amount: f64) {
        let session = state.session().unwrap();
        prazos::create_prazo(
            &state.db,
            &session,
            CreatePrazoInput {
                description: format!("DAS {}", due),
                company_id: "empresa-1".to_string(),
                due_date: Some(due.to_string()),
                amount: Some(amount),
                ..Default::default()
            },
        )
        .unwrap();
    }

    #[tokio::test]
    async fn dashboard_collects_every_region() {
        let state = state();
        state.login("u1").unwrap();
        seed(&state, "2026-03-20", 100.0);
        seed(&state, "2026-05-20", 50.0);

        let payload = DashboardPayload {
            reference_date: Some(date("2026-03-10")),
        };
        let data = get_dashboard(&state, payload).await.unwrap();

        assert!(data.upcoming.is_ok());
        assert_eq!(data.upcoming.data.as_ref().unwrap().len(), 1);
        assert_eq!(data.estatisticas.data.as_ref().unwrap().total, 2);
        assert_eq!(data.notifications.data.as_ref().unwrap().total, 2);
        assert_eq!(data.recent_documents.data.as_ref().unwrap().len(), 0);

        let series = data.due_series.data.unwrap();
        assert_eq!(series.months.len(), 6);
        assert_eq!(series.months[0], "2026-03");
        assert_eq!(series.counts[..3], [1, 0, 1]);
    }

    #[tokio::test]
    async fn failing_region_does_not_block_the_others() {
        let state = state();
        state.login("u1").unwrap();
        seed(&state, "2026-03-20", 100.0);
        state
            .db
            .lock()
            .unwrap()
            .execute_raw("DROP TABLE prazo_documents;")
            .unwrap();

        let data = get_dashboard(
            &state,
            DashboardPayload {
                reference_date: Some(date("2026-03-10")),
            },
        )
        .await
        .unwrap();

        assert!(!data.recent_documents.is_ok());
        assert!(data.recent_documents.data.is_none());
        assert!(data.upcoming.is_ok());
        assert!(data.estatisticas.is_ok());
        assert!(data.due_series.is_ok());
    }
}
