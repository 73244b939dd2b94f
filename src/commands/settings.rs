use crate::config::{self, SettingsPayload};
use crate::error::{AppError, CommandError, ValidationErrors};
use crate::models::{CacheStats, FiscalCalculationRequest, FiscalCalculationResult, SettingsView};
use crate::services::state::AppState;

pub async fn get_settings(state: &AppState) -> Result<SettingsView, CommandError> {
    Ok(SettingsView::from(&state.settings()?))
}

/// Persists the payload, then rebuilds clients from the reloaded settings.
pub async fn save_settings(state: &AppState, payload: SettingsPayload) -> Result<SettingsView, CommandError> {
    let settings = {
        let db = state.db.lock().map_err(|_| AppError::Lock("database"))?;
        config::save_settings(&db, &payload)?
    };
    state.update_settings(settings)?;
    get_settings(state).await
}

fn validate_fiscal(request: &FiscalCalculationRequest) -> Result<(), AppError> {
    let mut errors = ValidationErrors::default();
    if request.regime.trim().is_empty() {
        errors.push("regime", "Tax regime is required");
    }
    if request.company_id.trim().is_empty() {
        errors.push("company_id", "Company is required");
    }
    if request.reference_period.trim().is_empty() {
        errors.push("reference_period", "Reference period is required");
    }
    if !request.gross_revenue.is_finite() || request.gross_revenue < 0.0 {
        errors.push("gross_revenue", "Gross revenue must be a non-negative number");
    }
    if matches!(request.revenue_12m, Some(v) if !v.is_finite() || v < 0.0) {
        errors.push("revenue_12m", "Revenue must be a non-negative number");
    }
    errors.into_result()
}

pub async fn calculate_fiscal(
    state: &AppState,
    request: FiscalCalculationRequest,
) -> Result<FiscalCalculationResult, CommandError> {
    state.session()?;
    validate_fiscal(&request)?;
    let functions = state.functions()?;
    Ok(functions.calculate_fiscal(&request).await?)
}

pub async fn get_cache_stats(state: &AppState) -> Result<CacheStats, CommandError> {
    Ok(state.session()?.cache_stats()?)
}
