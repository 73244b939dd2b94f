use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::models::Settings;
use crate::services::extraction::{FieldExtractor, HeuristicExtractor, IntakePipeline, OcrService};
use crate::services::functions::{EdgeFunctionClient, RemoteOcrService};
use crate::services::openai::OpenAIExtractor;
use crate::services::session::UserSession;
use crate::services::storage::DocumentStorage;

pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub settings: Arc<Mutex<Settings>>,
    pub storage: DocumentStorage,
    session: Mutex<Option<Arc<UserSession>>>,
    pipeline: Mutex<Arc<IntakePipeline>>,
    functions: Mutex<Option<EdgeFunctionClient>>,
}

impl AppState {
    pub fn new(db: Database, settings: Settings, storage: DocumentStorage) -> Result<Self> {
        let functions = functions_from_settings(&settings)?;
        let pipeline = pipeline_from_settings(&settings, functions.clone())?;
        Ok(AppState {
            db: Arc::new(Mutex::new(db)),
            settings: Arc::new(Mutex::new(settings)),
            storage,
            session: Mutex::new(None),
            pipeline: Mutex::new(Arc::new(pipeline)),
            functions: Mutex::new(functions),
        })
    }

    /// Replaces the intake pipeline, e.g. with fakes in tests.
    pub fn with_pipeline(self, pipeline: IntakePipeline) -> Self {
        AppState {
            pipeline: Mutex::new(Arc::new(pipeline)),
            ..self
        }
    }

    pub fn settings(&self) -> AppResult<Settings> {
        Ok(self.settings.lock().map_err(|_| AppError::Lock("settings"))?.clone())
    }

    /// Swaps in new settings and rebuilds the clients that depend on them.
    pub fn update_settings(&self, settings: Settings) -> AppResult<()> {
        let functions = functions_from_settings(&settings)?;
        let pipeline = pipeline_from_settings(&settings, functions.clone())?;

        if let Some(session) = self.current_session()? {
            session.cache()?.set_ttl(Duration::from_secs(settings.cache_ttl_secs));
        }
        *self.pipeline.lock().map_err(|_| AppError::Lock("pipeline"))? = Arc::new(pipeline);
        *self.functions.lock().map_err(|_| AppError::Lock("functions"))? = functions;
        *self.settings.lock().map_err(|_| AppError::Lock("settings"))? = settings;
        Ok(())
    }

    /// Starts a fresh session for `user_id`, dropping any previous one.
    pub fn login(&self, user_id: &str) -> AppResult<Arc<UserSession>> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(AppError::validation("user_id", "User id is required"));
        }
        let ttl = Duration::from_secs(self.settings()?.cache_ttl_secs);
        let session = Arc::new(UserSession::new(user_id, ttl));

        let previous = self
            .session
            .lock()
            .map_err(|_| AppError::Lock("session"))?
            .replace(session.clone());
        if let Some(previous) = previous {
            tracing::info!(user = %previous.user_id, "replacing active session");
        }
        tracing::info!(user = %user_id, "session started");
        Ok(session)
    }

    /// Drops the active session with its cache and notifications.
    pub fn logout(&self) -> AppResult<bool> {
        let previous = self.session.lock().map_err(|_| AppError::Lock("session"))?.take();
        match previous {
            Some(session) => {
                tracing::info!(user = %session.user_id, "session ended");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn current_session(&self) -> AppResult<Option<Arc<UserSession>>> {
        Ok(self.session.lock().map_err(|_| AppError::Lock("session"))?.clone())
    }

    pub fn session(&self) -> AppResult<Arc<UserSession>> {
        self.current_session()?.ok_or(AppError::Unauthenticated)
    }

    pub fn pipeline(&self) -> AppResult<Arc<IntakePipeline>> {
        Ok(self.pipeline.lock().map_err(|_| AppError::Lock("pipeline"))?.clone())
    }

    pub fn functions(&self) -> AppResult<EdgeFunctionClient> {
        self.functions
            .lock()
            .map_err(|_| AppError::Lock("functions"))?
            .clone()
            .ok_or_else(|| AppError::validation("functions_url", "Serverless functions are not configured"))
    }

    pub fn signing_key(&self) -> AppResult<String> {
        self.settings()?
            .signing_key
            .ok_or_else(|| AppError::Internal(anyhow!("Document signing key missing")))
    }
}

fn functions_from_settings(settings: &Settings) -> Result<Option<EdgeFunctionClient>> {
    let timeout = Duration::from_secs(settings.request_timeout_secs);
    settings
        .functions_url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
        .map(|url| EdgeFunctionClient::new(url, settings.functions_api_key.clone(), timeout))
        .transpose()
}

/// OpenAI first when a key is set, then the local heuristic; remote OCR when
/// the functions endpoint is configured.
pub fn pipeline_from_settings(settings: &Settings, functions: Option<EdgeFunctionClient>) -> Result<IntakePipeline> {
    let timeout = Duration::from_secs(settings.request_timeout_secs);
    let mut extractors: Vec<Arc<dyn FieldExtractor>> = Vec::new();
    if let Some(key) = settings.openai_api_key.clone().filter(|k| !k.trim().is_empty()) {
        extractors.push(Arc::new(OpenAIExtractor::new(key, timeout)?));
    }
    extractors.push(Arc::new(HeuristicExtractor));

    let ocr = functions.map(|client| Arc::new(RemoteOcrService::new(client, &settings.ocr_language)) as Arc<dyn OcrService>);
    Ok(IntakePipeline::new(extractors, ocr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        let dir = std::env::temp_dir().join("contabilidade-state-test");
        AppState::new(Database::in_memory().unwrap(), Settings::default(), DocumentStorage::new(dir)).unwrap()
    }

    #[test]
    fn commands_need_a_session() {
        let state = state();
        assert!(matches!(state.session(), Err(AppError::Unauthenticated)));

        let session = state.login("user-1").unwrap();
        assert_eq!(state.session().unwrap().user_id, session.user_id);

        assert!(state.logout().unwrap());
        assert!(!state.logout().unwrap());
        assert!(matches!(state.session(), Err(AppError::Unauthenticated)));
    }

    #[test]
    fn login_rejects_blank_user() {
        assert!(matches!(state().login("  "), Err(AppError::Validation(_))));
    }

    #[test]
    fn functions_require_configuration() {
        let state = state();
        assert!(matches!(state.functions(), Err(AppError::Validation(_))));

        let settings = Settings {
            functions_url: Some("https://fn.example/v1".to_string()),
            ..Settings::default()
        };
        state.update_settings(settings).unwrap();
        assert_eq!(
            state.functions().unwrap().function_url("fiscal-calculator"),
            "https://fn.example/v1/fiscal-calculator"
        );
    }
}
