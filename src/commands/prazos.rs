use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::CommandError;
use crate::models::{CreatePrazoInput, EstatisticasPrazos, PrazoFilters, PrazoFiscal, PrazoSort, UpdatePrazoInput};
use crate::services::prazos;
use crate::services::state::AppState;
use crate::utils::today;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GetPrazosPayload {
    pub filters: PrazoFilters,
    pub sort: PrazoSort,
    pub reference_date: Option<NaiveDate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EstatisticasPayload {
    pub filters: PrazoFilters,
    pub reference_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePrazoPayload {
    #[serde(flatten)]
    pub input: UpdatePrazoInput,
    #[serde(default)]
    pub reference_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct CompletePrazoPayload {
    pub id: String,
    #[serde(default)]
    pub reference_date: Option<NaiveDate>,
}

pub async fn get_prazos(state: &AppState, payload: GetPrazosPayload) -> Result<Vec<PrazoFiscal>, CommandError> {
    let session = state.session()?;
    let today = payload.reference_date.unwrap_or_else(today);
    Ok(prazos::list_prazos(&state.db, &session, &payload.filters, payload.sort, today)?)
}

pub async fn get_estatisticas_prazos(
    state: &AppState,
    payload: EstatisticasPayload,
) -> Result<EstatisticasPrazos, CommandError> {
    let session = state.session()?;
    let due_soon_days = state.settings()?.due_soon_days;
    let today = payload.reference_date.unwrap_or_else(today);
    Ok(prazos::estatisticas(&state.db, &session, &payload.filters, today, due_soon_days)?)
}

pub async fn create_prazo(state: &AppState, input: CreatePrazoInput) -> Result<PrazoFiscal, CommandError> {
    let session = state.session()?;
    Ok(prazos::create_prazo(&state.db, &session, input)?)
}

pub async fn update_prazo(state: &AppState, payload: UpdatePrazoPayload) -> Result<PrazoFiscal, CommandError> {
    let session = state.session()?;
    let today = payload.reference_date.unwrap_or_else(today);
    Ok(prazos::update_prazo(&state.db, &session, payload.input, today)?)
}

pub async fn complete_prazo(state: &AppState, payload: CompletePrazoPayload) -> Result<PrazoFiscal, CommandError> {
    let session = state.session()?;
    let today = payload.reference_date.unwrap_or_else(today);
    Ok(prazos::complete_prazo(&state.db, &session, &payload.id, today)?)
}
