pub mod dashboard;
pub mod documents;
pub mod notifications;
pub mod prazos;
pub mod session;
pub mod settings;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{CommandError, ErrorKind};
use crate::services::state::AppState;

pub const COMMANDS: &[&str] = &[
    "login",
    "logout",
    "get_prazos",
    "get_estatisticas_prazos",
    "create_prazo",
    "update_prazo",
    "complete_prazo",
    "upload_prazo_document",
    "confirm_prazo_document",
    "discard_prazo_document",
    "list_prazo_documents",
    "import_prazo_folder",
    "get_document_url",
    "verify_document_url",
    "get_notifications",
    "mark_notification_read",
    "mark_all_notifications_read",
    "get_dashboard",
    "get_settings",
    "save_settings",
    "calculate_fiscal",
    "get_cache_stats",
];

/// Routes one bridge request to its handler. `null` args count as `{}`.
pub async fn dispatch(state: &AppState, command: &str, args: Value) -> Result<Value, CommandError> {
    let args = if args.is_null() { json!({}) } else { args };
    match command {
        "login" => respond(session::login(state, parse(args)?).await),
        "logout" => respond(session::logout(state).await),

        "get_prazos" => respond(prazos::get_prazos(state, parse(args)?).await),
        "get_estatisticas_prazos" => respond(prazos::get_estatisticas_prazos(state, parse(args)?).await),
        "create_prazo" => respond(prazos::create_prazo(state, parse(args)?).await),
        "update_prazo" => respond(prazos::update_prazo(state, parse(args)?).await),
        "complete_prazo" => respond(prazos::complete_prazo(state, parse(args)?).await),

        "upload_prazo_document" => respond(documents::upload_prazo_document(state, parse(args)?).await),
        "confirm_prazo_document" => respond(documents::confirm_prazo_document(state, parse(args)?).await),
        "discard_prazo_document" => respond(documents::discard_prazo_document(state, parse(args)?).await),
        "list_prazo_documents" => respond(documents::list_prazo_documents(state, parse(args)?).await),
        "import_prazo_folder" => respond(documents::import_prazo_folder(state, parse(args)?).await),
        "get_document_url" => respond(documents::get_document_url(state, parse(args)?).await),
        "verify_document_url" => respond(documents::verify_document_url(state, parse(args)?).await),

        "get_notifications" => respond(notifications::get_notifications(state, parse(args)?).await),
        "mark_notification_read" => respond(notifications::mark_notification_read(state, parse(args)?).await),
        "mark_all_notifications_read" => respond(notifications::mark_all_notifications_read(state).await),

        "get_dashboard" => respond(dashboard::get_dashboard(state, parse(args)?).await),

        "get_settings" => respond(settings::get_settings(state).await),
        "save_settings" => respond(settings::save_settings(state, parse(args)?).await),
        "calculate_fiscal" => respond(settings::calculate_fiscal(state, parse(args)?).await),
        "get_cache_stats" => respond(settings::get_cache_stats(state).await),

        _ => Err(CommandError::new(
            ErrorKind::NotFound,
            format!("Unknown command: {}", command),
        )),
    }
}

fn parse<T: DeserializeOwned>(args: Value) -> Result<T, CommandError> {
    Ok(serde_json::from_value(args)?)
}

fn respond<T: Serialize>(result: Result<T, CommandError>) -> Result<Value, CommandError> {
    serde_json::to_value(result?).map_err(|e| CommandError::new(ErrorKind::Internal, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::Settings;
    use crate::services::storage::DocumentStorage;

    fn state() -> AppState {
        AppState::new(
            Database::in_memory().unwrap(),
            Settings::default(),
            DocumentStorage::new(std::env::temp_dir().join("contabilidade-dispatch-test")),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_commands_are_reported() {
        let err = dispatch(&state(), "drop_everything", Value::Null).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn session_commands_require_login() {
        let state = state();
        let err = dispatch(&state, "get_prazos", Value::Null).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthenticated);

        dispatch(&state, "login", json!({"user_id": "u1"})).await.unwrap();
        let prazos = dispatch(&state, "get_prazos", Value::Null).await.unwrap();
        assert_eq!(prazos, json!([]));
    }

    #[tokio::test]
    async fn malformed_args_are_validation_errors() {
        let state = state();
        dispatch(&state, "login", json!({"user_id": "u1"})).await.unwrap();
        let err = dispatch(&state, "complete_prazo", json!({"id": 42})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }
}
