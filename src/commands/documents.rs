use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{AppError, CommandError};
use crate::models::{ConfirmDocumentInput, DocumentoUploadPrazo, ImportReport, PrazoFiscal};
use crate::services::documents::{self, UploadRequest};
use crate::services::state::AppState;

const DEFAULT_URL_TTL_SECS: i64 = 15 * 60;
const MAX_URL_TTL_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Deserialize)]
pub struct UploadPayload {
    pub file_name: String,
    pub content_base64: String,
}

#[derive(Deserialize)]
pub struct UploadIdPayload {
    pub upload_id: String,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct ListDocumentsPayload {
    pub limit: Option<usize>,
    pub staged_only: bool,
}

#[derive(Deserialize)]
pub struct ImportFolderPayload {
    pub folder: String,
}

#[derive(Deserialize)]
pub struct DocumentUrlPayload {
    pub document_id: String,
    #[serde(default)]
    pub expires_in_secs: Option<i64>,
}

#[derive(Deserialize)]
pub struct VerifyUrlPayload {
    pub url: String,
}

#[derive(Serialize)]
pub struct ConfirmResult {
    pub document: DocumentoUploadPrazo,
    pub prazo: PrazoFiscal,
}

#[derive(Serialize)]
pub struct DocumentUrl {
    pub url: String,
    pub expires_at: i64,
}

#[derive(Serialize)]
pub struct VerifiedDocument {
    pub document_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub storage_path: String,
}

pub async fn upload_prazo_document(
    state: &AppState,
    payload: UploadPayload,
) -> Result<DocumentoUploadPrazo, CommandError> {
    let session = state.session()?;
    let content = general_purpose::STANDARD
        .decode(payload.content_base64.trim())
        .map_err(|e| AppError::validation("content_base64", format!("Invalid base64: {}", e)))?;
    let threshold = state.settings()?.review_threshold;
    let pipeline = state.pipeline()?;

    let request = UploadRequest {
        file_name: payload.file_name,
        content,
    };
    Ok(documents::stage_upload(&state.db, &state.storage, &pipeline, &session, request, threshold).await?)
}

pub async fn confirm_prazo_document(
    state: &AppState,
    input: ConfirmDocumentInput,
) -> Result<ConfirmResult, CommandError> {
    let session = state.session()?;
    let (document, prazo) = documents::confirm_upload(&state.db, &session, input)?;
    Ok(ConfirmResult { document, prazo })
}

pub async fn discard_prazo_document(
    state: &AppState,
    payload: UploadIdPayload,
) -> Result<DocumentoUploadPrazo, CommandError> {
    let session = state.session()?;
    Ok(documents::discard_upload(&state.db, &session, &payload.upload_id)?)
}

pub async fn list_prazo_documents(
    state: &AppState,
    payload: ListDocumentsPayload,
) -> Result<Vec<DocumentoUploadPrazo>, CommandError> {
    let session = state.session()?;
    let limit = payload.limit.unwrap_or(50).clamp(1, 500);
    Ok(documents::list_uploads(&state.db, &session, limit, payload.staged_only)?)
}

pub async fn import_prazo_folder(state: &AppState, payload: ImportFolderPayload) -> Result<ImportReport, CommandError> {
    let session = state.session()?;
    let threshold = state.settings()?.review_threshold;
    let pipeline = state.pipeline()?;
    let folder = PathBuf::from(payload.folder);
    Ok(documents::import_folder(&state.db, &state.storage, &pipeline, &session, &folder, threshold).await?)
}

pub async fn get_document_url(state: &AppState, payload: DocumentUrlPayload) -> Result<DocumentUrl, CommandError> {
    let session = state.session()?;
    let ttl = payload.expires_in_secs.unwrap_or(DEFAULT_URL_TTL_SECS);
    if !(1..=MAX_URL_TTL_SECS).contains(&ttl) {
        return Err(AppError::validation("expires_in_secs", "Must be between 1 second and 7 days").into());
    }

    let exists = state
        .db
        .lock()
        .map_err(|_| AppError::Lock("database"))?
        .get_document(&session.user_id, &payload.document_id)
        .map_err(AppError::from)?
        .is_some();
    if !exists {
        return Err(AppError::not_found("document", &payload.document_id).into());
    }

    let expires_at = chrono::Utc::now().timestamp() + ttl;
    let url = state
        .storage
        .signed_url(&payload.document_id, expires_at, &state.signing_key()?)
        .map_err(AppError::Internal)?;
    Ok(DocumentUrl { url, expires_at })
}

pub async fn verify_document_url(state: &AppState, payload: VerifyUrlPayload) -> Result<VerifiedDocument, CommandError> {
    let session = state.session()?;
    let document_id = state
        .storage
        .verify_signed_url(&payload.url, &state.signing_key()?, chrono::Utc::now().timestamp())
        .map_err(|e| AppError::validation("url", e.to_string()))?;

    let document = state
        .db
        .lock()
        .map_err(|_| AppError::Lock("database"))?
        .get_document(&session.user_id, &document_id)
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::not_found("document", &document_id))?;
    Ok(VerifiedDocument {
        document_id: document.id,
        file_name: document.file_name,
        mime_type: document.mime_type,
        storage_path: document.storage_path,
    })
}
