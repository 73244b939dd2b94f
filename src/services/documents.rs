use std::path::Path;
use std::sync::Mutex;

use crate::db::Database;
use crate::error::{AppError, AppResult, ValidationErrors};
use crate::models::{
    ConfirmDocumentInput, CreatePrazoInput, DocumentoUploadPrazo, ExtractedPrazoData, ExtractionSource,
    ExtractionStatus, ImportFailure, ImportReport, NotificationKind, PrazoFiscal,
};
use crate::services::extraction::{compute_confidence, IntakePipeline};
use crate::services::prazos;
use crate::services::session::UserSession;
use crate::services::storage::DocumentStorage;
use crate::utils::{extension_of, mime_for_extension, new_id, now_rfc3339};

pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

pub struct UploadRequest {
    pub file_name: String,
    pub content: Vec<u8>,
}

fn lock_db(db: &Mutex<Database>) -> AppResult<std::sync::MutexGuard<'_, Database>> {
    db.lock().map_err(|_| AppError::Lock("database"))
}

/// Returns `(extension, mime type)` for an acceptable upload.
pub fn validate_upload(file_name: &str, content: &[u8]) -> AppResult<(String, &'static str)> {
    let mut errors = ValidationErrors::default();
    let kind = extension_of(file_name).and_then(|ext| mime_for_extension(&ext).map(|mime| (ext, mime)));
    if file_name.trim().is_empty() {
        errors.push("file_name", "File name is required");
    } else if kind.is_none() {
        errors.push("file_name", "Only PDF, PNG, JPEG and TIFF files are accepted");
    }
    if content.is_empty() {
        errors.push("content", "File is empty");
    } else if content.len() > MAX_UPLOAD_BYTES {
        errors.push("content", format!("File exceeds {} MiB", MAX_UPLOAD_BYTES / (1024 * 1024)));
    }
    errors.into_result()?;
    kind.ok_or_else(|| AppError::validation("file_name", "Unsupported file type"))
}

/// Stores the file, extracts candidate fields and stages them for confirmation.
/// Extraction problems never fail the upload; they leave empty candidates.
pub async fn stage_upload(
    db: &Mutex<Database>,
    storage: &DocumentStorage,
    pipeline: &IntakePipeline,
    session: &UserSession,
    request: UploadRequest,
    review_threshold: f64,
) -> AppResult<DocumentoUploadPrazo> {
    let (extension, mime_type) = validate_upload(&request.file_name, &request.content)?;
    let stored = storage.store(&request.content, &extension, mime_type).await?;
    let outcome = pipeline.extract(&stored).await;

    let mut candidate: ExtractedPrazoData = outcome.data;
    let extraction_status = if !candidate.is_empty() {
        ExtractionStatus::Extracted
    } else if outcome.error.is_some() {
        ExtractionStatus::Failed
    } else {
        ExtractionStatus::Empty
    };
    let confidence_score = if candidate.is_empty() {
        0.0
    } else {
        candidate
            .confidence_score
            .unwrap_or_else(|| compute_confidence(&candidate))
            .clamp(0.0, 1.0)
    };
    candidate.confidence_score = Some(confidence_score);

    let now = now_rfc3339();
    let document = DocumentoUploadPrazo {
        id: new_id(),
        user_id: session.user_id.clone(),
        file_name: request.file_name.trim().to_string(),
        mime_type: mime_type.to_string(),
        file_hash: stored.hash.clone(),
        file_size: stored.size as i64,
        storage_path: stored.path.to_string_lossy().to_string(),
        extraction_status,
        extraction_source: if candidate.is_empty() {
            ExtractionSource::Unavailable
        } else {
            outcome.source
        },
        candidate,
        confidence_score,
        needs_review: confidence_score < review_threshold,
        error_message: outcome.error,
        prazo_id: None,
        created_at: now.clone(),
        updated_at: now,
    };

    {
        let db = lock_db(db)?;
        db.upsert_document(&document)?;
        db.log_processing(
            Some(&document.id),
            Some(&document.file_hash),
            "extract",
            document.extraction_status.as_str(),
            document.error_message.as_deref(),
        )?;
    }

    tracing::info!(
        user = %session.user_id,
        document = %document.id,
        status = %document.extraction_status,
        source = %document.extraction_source,
        fields = document.candidate.field_count(),
        "document staged"
    );

    let message = if document.candidate.is_empty() {
        format!("{}: nenhum campo reconhecido, preencha manualmente", document.file_name)
    } else {
        format!(
            "{}: {} campos extraídos para revisão",
            document.file_name,
            document.candidate.field_count()
        )
    };
    session.notify(NotificationKind::DocumentProcessed, "Documento processado", &message, None)?;

    Ok(document)
}

fn staged_document(db: &Database, session: &UserSession, upload_id: &str) -> AppResult<DocumentoUploadPrazo> {
    let document = db
        .get_document(&session.user_id, upload_id)?
        .ok_or_else(|| AppError::not_found("upload", upload_id))?;
    if !document.is_staged() {
        return Err(AppError::validation(
            "upload_id",
            format!("Upload is already {}", document.extraction_status),
        ));
    }
    Ok(document)
}

/// Merges the user's answers over the extracted candidates and builds the
/// create request; missing fields are left for validation to report.
pub fn merge_candidate(document: &DocumentoUploadPrazo, input: &ConfirmDocumentInput) -> CreatePrazoInput {
    let candidate = &document.candidate;
    let description = input
        .description
        .clone()
        .or_else(|| candidate.description.clone())
        .or_else(|| {
            let label = [candidate.obligation_type.as_deref(), candidate.reference_period.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            (!label.is_empty()).then_some(label)
        })
        .unwrap_or_default();

    CreatePrazoInput {
        description,
        company_id: input
            .company_id
            .clone()
            .or_else(|| candidate.company_document.clone())
            .unwrap_or_default(),
        due_date: input.due_date.clone().or_else(|| candidate.due_date.clone()),
        obligation_type: input
            .obligation_type
            .clone()
            .or_else(|| candidate.obligation_type.clone()),
        priority: input.priority,
        amount: input.amount.or(candidate.amount),
        notes: input.notes.clone(),
        source_document_id: Some(document.id.clone()),
    }
}

/// Creates the deadline and marks the upload confirmed atomically; a failed
/// confirm leaves the upload staged and no deadline behind.
pub fn confirm_upload(
    db: &Mutex<Database>,
    session: &UserSession,
    input: ConfirmDocumentInput,
) -> AppResult<(DocumentoUploadPrazo, PrazoFiscal)> {
    let document = staged_document(&*lock_db(db)?, session, &input.upload_id)?;
    let prazo = prazos::build_prazo(session, merge_candidate(&document, &input))?;

    let mut confirmed = document;
    confirmed.extraction_status = ExtractionStatus::Confirmed;
    confirmed.prazo_id = Some(prazo.id.clone());
    confirmed.updated_at = now_rfc3339();
    if !lock_db(db)?.confirm_document(&prazo, &confirmed)? {
        return Err(AppError::validation("upload_id", "Upload is no longer awaiting confirmation"));
    }

    prazos::announce_created(session, &prazo)?;
    tracing::info!(document = %confirmed.id, prazo = %prazo.id, "upload confirmed");
    Ok((confirmed, prazo))
}

pub fn discard_upload(db: &Mutex<Database>, session: &UserSession, upload_id: &str) -> AppResult<DocumentoUploadPrazo> {
    let db = lock_db(db)?;
    let mut document = staged_document(&db, session, upload_id)?;
    document.extraction_status = ExtractionStatus::Discarded;
    document.updated_at = now_rfc3339();
    db.upsert_document(&document)?;
    db.log_processing(Some(&document.id), Some(&document.file_hash), "discard", "success", None)?;
    Ok(document)
}

pub fn list_uploads(
    db: &Mutex<Database>,
    session: &UserSession,
    limit: usize,
    staged_only: bool,
) -> AppResult<Vec<DocumentoUploadPrazo>> {
    Ok(lock_db(db)?.get_recent_documents(&session.user_id, limit, staged_only)?)
}

/// Stages every supported file directly inside `folder`.
pub async fn import_folder(
    db: &Mutex<Database>,
    storage: &DocumentStorage,
    pipeline: &IntakePipeline,
    session: &UserSession,
    folder: &Path,
    review_threshold: f64,
) -> AppResult<ImportReport> {
    if !folder.is_dir() {
        return Err(AppError::validation("folder", format!("Not a folder: {}", folder.display())));
    }

    let entries = walkdir::WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .map(|e| e.path().to_path_buf())
        .collect::<Vec<_>>();

    let mut report = ImportReport::default();
    for path in entries {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let supported = extension_of(&file_name)
            .and_then(|ext| mime_for_extension(&ext))
            .is_some();
        if !supported {
            report.skipped.push(file_name);
            continue;
        }

        let result = match tokio::fs::read(&path).await {
            Ok(content) => {
                let request = UploadRequest {
                    file_name: file_name.clone(),
                    content,
                };
                stage_upload(db, storage, pipeline, session, request, review_threshold).await
            }
            Err(err) => Err(AppError::Internal(err.into())),
        };

        match result {
            Ok(document) => report.staged.push(document),
            Err(err) => {
                tracing::warn!(file = %file_name, error = %err, "import failed");
                report.failed.push(ImportFailure {
                    file_name,
                    error: err.to_string(),
                });
            }
        }
    }

    tracing::info!(
        folder = %folder.display(),
        staged = report.staged.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        "folder import finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;
    use std::time::Duration;

    fn staged(db: &Database, id: &str) -> DocumentoUploadPrazo {
        let document = DocumentoUploadPrazo {
            id: id.to_string(),
            user_id: "u1".to_string(),
            file_name: "guia.png".to_string(),
            mime_type: "image/png".to_string(),
            file_hash: "abc".to_string(),
            file_size: 10,
            storage_path: "/tmp/abc.png".to_string(),
            extraction_status: ExtractionStatus::Extracted,
            extraction_source: ExtractionSource::RemoteOcr,
            candidate: ExtractedPrazoData {
                due_date: Some("2026-04-20".to_string()),
                obligation_type: Some("DAS".to_string()),
                reference_period: Some("03/2026".to_string()),
                company_document: Some("12.345.678/0001-90".to_string()),
                ..Default::default()
            },
            confidence_score: 0.9,
            needs_review: false,
            error_message: None,
            prazo_id: None,
            created_at: "2026-03-10T00:00:00Z".to_string(),
            updated_at: "2026-03-10T00:00:00Z".to_string(),
        };
        db.upsert_document(&document).unwrap();
        document
    }

    fn confirm(id: &str) -> ConfirmDocumentInput {
        ConfirmDocumentInput {
            upload_id: id.to_string(),
            priority: Some(Priority::High),
            ..Default::default()
        }
    }

    #[test]
    fn failed_confirm_leaves_no_deadline_and_retry_creates_one() {
        let db = Mutex::new(Database::in_memory().unwrap());
        let session = UserSession::new("u1", Duration::from_secs(60));
        staged(&db.lock().unwrap(), "doc-1");

        db.lock().unwrap().execute_raw("ALTER TABLE processing_logs RENAME TO processing_logs_off;").unwrap();
        let err = confirm_upload(&db, &session, confirm("doc-1")).unwrap_err();
        assert!(matches!(err, AppError::Storage(_)));
        {
            let db = db.lock().unwrap();
            assert_eq!(db.count_prazos("u1").unwrap(), 0);
            assert!(db.get_document("u1", "doc-1").unwrap().unwrap().is_staged());
        }
        assert_eq!(session.summary(5).unwrap().total, 0);

        db.lock().unwrap().execute_raw("ALTER TABLE processing_logs_off RENAME TO processing_logs;").unwrap();
        let (document, prazo) = confirm_upload(&db, &session, confirm("doc-1")).unwrap();
        assert_eq!(document.extraction_status, ExtractionStatus::Confirmed);
        assert_eq!(document.prazo_id.as_deref(), Some(prazo.id.as_str()));

        let again = confirm_upload(&db, &session, confirm("doc-1")).unwrap_err();
        assert!(matches!(again, AppError::Validation(_)));
        assert_eq!(db.lock().unwrap().count_prazos("u1").unwrap(), 1);
    }

    #[test]
    fn confirm_of_an_upload_discarded_meanwhile_writes_nothing() {
        let mut db = Database::in_memory().unwrap();
        let session = UserSession::new("u1", Duration::from_secs(60));
        let mut document = staged(&db, "doc-2");
        let prazo = prazos::build_prazo(&session, merge_candidate(&document, &confirm("doc-2"))).unwrap();

        document.extraction_status = ExtractionStatus::Discarded;
        db.upsert_document(&document).unwrap();

        document.extraction_status = ExtractionStatus::Confirmed;
        assert!(!db.confirm_document(&prazo, &document).unwrap());
        assert_eq!(db.count_prazos("u1").unwrap(), 0);
        assert_eq!(
            db.get_document("u1", "doc-2").unwrap().unwrap().extraction_status,
            ExtractionStatus::Discarded
        );
    }
}
