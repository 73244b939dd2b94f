use serde::{Deserialize, Serialize};

use crate::error::CommandError;
use crate::services::state::AppState;

#[derive(Deserialize)]
pub struct LoginPayload {
    pub user_id: String,
}

#[derive(Serialize)]
pub struct SessionInfo {
    pub user_id: String,
    pub started_at: String,
}

#[derive(Serialize)]
pub struct LogoutResult {
    pub ended: bool,
}

pub async fn login(state: &AppState, payload: LoginPayload) -> Result<SessionInfo, CommandError> {
    let session = state.login(&payload.user_id)?;
    Ok(SessionInfo {
        user_id: session.user_id.clone(),
        started_at: session.started_at.clone(),
    })
}

pub async fn logout(state: &AppState) -> Result<LogoutResult, CommandError> {
    Ok(LogoutResult { ended: state.logout()? })
}
