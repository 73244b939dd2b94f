use anyhow::anyhow;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Value};
use std::sync::Arc;

use contabilidade_pro::commands::dispatch;
use contabilidade_pro::db::Database;
use contabilidade_pro::error::ErrorKind;
use contabilidade_pro::models::{
    DocumentoUploadPrazo, ExtractedPrazoData, ExtractionSource, ExtractionStatus, ImportReport, PrazoFiscal, Settings,
};
use contabilidade_pro::services::crypto::CryptoService;
use contabilidade_pro::services::extraction::{HeuristicExtractor, IntakePipeline, OcrOutput, OcrService};
use contabilidade_pro::services::state::AppState;
use contabilidade_pro::services::storage::{DocumentStorage, StoredDocument};

struct FixedOcr(ExtractedPrazoData);

#[async_trait]
impl OcrService for FixedOcr {
    async fn recognize(&self, _document: &StoredDocument) -> anyhow::Result<OcrOutput> {
        Ok(OcrOutput {
            text: None,
            data: self.0.clone(),
        })
    }
}

struct TextOnlyOcr(&'static str);

#[async_trait]
impl OcrService for TextOnlyOcr {
    async fn recognize(&self, _document: &StoredDocument) -> anyhow::Result<OcrOutput> {
        Ok(OcrOutput {
            text: Some(self.0.to_string()),
            data: ExtractedPrazoData::default(),
        })
    }
}

struct DownOcr;

#[async_trait]
impl OcrService for DownOcr {
    async fn recognize(&self, _document: &StoredDocument) -> anyhow::Result<OcrOutput> {
        Err(anyhow!("document-ocr returned 503"))
    }
}

fn setup(ocr: Arc<dyn OcrService>) -> (tempfile::TempDir, AppState) {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        signing_key: Some(CryptoService::generate_signing_key().unwrap()),
        ..Settings::default()
    };
    let state = AppState::new(
        Database::in_memory().unwrap(),
        settings,
        DocumentStorage::new(dir.path().join("storage")),
    )
    .unwrap()
    .with_pipeline(IntakePipeline::new(vec![Arc::new(HeuristicExtractor)], Some(ocr)));
    (dir, state)
}

fn das_candidate() -> ExtractedPrazoData {
    ExtractedPrazoData {
        description: None,
        due_date: Some("2026-04-20".to_string()),
        amount: Some(150.0),
        obligation_type: Some("DAS".to_string()),
        company_document: Some("12.345.678/0001-90".to_string()),
        reference_period: Some("03/2026".to_string()),
        extraction_notes: "ocr".to_string(),
        confidence_score: Some(0.9),
    }
}

async fn call(state: &AppState, command: &str, args: Value) -> Value {
    dispatch(state, command, args)
        .await
        .unwrap_or_else(|e| panic!("{} failed: {:?}", command, e))
}

async fn upload(state: &AppState, file_name: &str, content: &[u8]) -> DocumentoUploadPrazo {
    let value = call(
        state,
        "upload_prazo_document",
        json!({
            "file_name": file_name,
            "content_base64": general_purpose::STANDARD.encode(content),
        }),
    )
    .await;
    serde_json::from_value(value).unwrap()
}

#[tokio::test]
async fn recognized_upload_is_confirmed_into_a_deadline() {
    let (_dir, state) = setup(Arc::new(FixedOcr(das_candidate())));
    call(&state, "login", json!({"user_id": "contador-1"})).await;

    let staged = upload(&state, "guia-das.png", b"\x89PNG fake scan").await;
    assert_eq!(staged.extraction_status, ExtractionStatus::Extracted);
    assert_eq!(staged.extraction_source, ExtractionSource::RemoteOcr);
    assert_eq!(staged.mime_type, "image/png");
    assert!(!staged.needs_review);
    assert!(std::path::Path::new(&staged.storage_path).exists());

    let value = call(
        &state,
        "confirm_prazo_document",
        json!({"upload_id": staged.id, "priority": "high"}),
    )
    .await;
    let prazo: PrazoFiscal = serde_json::from_value(value["prazo"].clone()).unwrap();
    assert_eq!(prazo.description, "DAS 03/2026");
    assert_eq!(prazo.company_id, "12.345.678/0001-90");
    assert_eq!(prazo.due_date.to_string(), "2026-04-20");
    assert_eq!(prazo.amount, Some(150.0));
    assert_eq!(prazo.source_document_id.as_deref(), Some(staged.id.as_str()));
    assert_eq!(value["document"]["extraction_status"], json!("confirmed"));
    assert_eq!(value["document"]["prazo_id"], json!(prazo.id));

    let again = dispatch(&state, "confirm_prazo_document", json!({"upload_id": staged.id}))
        .await
        .unwrap_err();
    assert_eq!(again.kind, ErrorKind::Validation);

    let logs = state.db.lock().unwrap().count_processing_logs(&staged.id).unwrap();
    assert_eq!(logs, 2);
}

#[tokio::test]
async fn upload_without_fields_still_allows_manual_entry() {
    let (_dir, state) = setup(Arc::new(DownOcr));
    call(&state, "login", json!({"user_id": "contador-1"})).await;

    let staged = upload(&state, "foto.jpg", b"blurry photo bytes").await;
    assert_eq!(staged.extraction_status, ExtractionStatus::Failed);
    assert_eq!(staged.extraction_source, ExtractionSource::Unavailable);
    assert!(staged.candidate.is_empty());
    assert!(staged.needs_review);
    assert_eq!(staged.confidence_score, 0.0);
    assert!(staged.error_message.as_deref().unwrap().contains("503"));

    let missing = dispatch(
        &state,
        "confirm_prazo_document",
        json!({"upload_id": staged.id, "description": "DARF"}),
    )
    .await
    .unwrap_err();
    assert_eq!(missing.kind, ErrorKind::Validation);
    assert!(missing.fields.iter().any(|f| f.field == "due_date"));
    assert!(missing.fields.iter().any(|f| f.field == "company_id"));

    let value = call(
        &state,
        "confirm_prazo_document",
        json!({
            "upload_id": staged.id,
            "description": "DARF IRPJ",
            "company_id": "empresa-1",
            "due_date": "30/04/2026",
            "amount": 321.5,
        }),
    )
    .await;
    assert_eq!(value["prazo"]["due_date"], json!("2026-04-30"));

    let prazos = call(&state, "get_prazos", json!({"reference_date": "2026-04-01"})).await;
    assert_eq!(prazos.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn ocr_text_runs_through_the_field_extractors() {
    let text = "DOCUMENTO DE ARRECADAÇÃO DO SIMPLES NACIONAL CNPJ 12.345.678/0001-90 \
                Período de Apuração 03/2026 Data de Vencimento 20/04/2026 Valor Total R$ 1.234,56";
    let (_dir, state) = setup(Arc::new(TextOnlyOcr(text)));
    call(&state, "login", json!({"user_id": "contador-1"})).await;

    let staged = upload(&state, "das.tiff", b"tiff scan").await;
    assert_eq!(staged.extraction_status, ExtractionStatus::Extracted);
    assert_eq!(staged.candidate.due_date.as_deref(), Some("2026-04-20"));
    assert_eq!(staged.candidate.amount, Some(1234.56));
}

#[tokio::test]
async fn unsupported_and_empty_files_are_rejected() {
    let (_dir, state) = setup(Arc::new(DownOcr));
    call(&state, "login", json!({"user_id": "contador-1"})).await;

    let exe = dispatch(
        &state,
        "upload_prazo_document",
        json!({"file_name": "setup.exe", "content_base64": general_purpose::STANDARD.encode(b"MZ")}),
    )
    .await
    .unwrap_err();
    assert_eq!(exe.kind, ErrorKind::Validation);

    let empty = dispatch(
        &state,
        "upload_prazo_document",
        json!({"file_name": "guia.pdf", "content_base64": ""}),
    )
    .await
    .unwrap_err();
    assert!(empty.fields.iter().any(|f| f.field == "content"));

    let garbage = dispatch(
        &state,
        "upload_prazo_document",
        json!({"file_name": "guia.pdf", "content_base64": "***"}),
    )
    .await
    .unwrap_err();
    assert_eq!(garbage.kind, ErrorKind::Validation);
}

#[tokio::test]
async fn discarded_uploads_leave_the_staged_list() {
    let (_dir, state) = setup(Arc::new(FixedOcr(das_candidate())));
    call(&state, "login", json!({"user_id": "contador-1"})).await;

    let keep = upload(&state, "a.png", b"first").await;
    let drop = upload(&state, "b.png", b"second").await;
    call(&state, "discard_prazo_document", json!({"upload_id": drop.id})).await;

    let staged: Vec<DocumentoUploadPrazo> =
        serde_json::from_value(call(&state, "list_prazo_documents", json!({"staged_only": true})).await).unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].id, keep.id);

    let all = call(&state, "list_prazo_documents", Value::Null).await;
    assert_eq!(all.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn staged_filter_applies_before_the_limit() {
    let (_dir, state) = setup(Arc::new(FixedOcr(das_candidate())));
    call(&state, "login", json!({"user_id": "contador-1"})).await;

    let waiting = upload(&state, "antigo.png", b"oldest scan").await;
    for content in [&b"newer 1"[..], b"newer 2", b"newer 3"] {
        let newer = upload(&state, "novo.png", content).await;
        call(&state, "discard_prazo_document", json!({"upload_id": newer.id})).await;
    }

    let staged: Vec<DocumentoUploadPrazo> = serde_json::from_value(
        call(&state, "list_prazo_documents", json!({"staged_only": true, "limit": 2})).await,
    )
    .unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].id, waiting.id);
}

#[tokio::test]
async fn folder_import_stages_supported_files_only() {
    let (dir, state) = setup(Arc::new(FixedOcr(das_candidate())));
    call(&state, "login", json!({"user_id": "contador-1"})).await;

    let inbox = dir.path().join("inbox");
    std::fs::create_dir_all(inbox.join("nested")).unwrap();
    std::fs::write(inbox.join("das.png"), b"das scan").unwrap();
    std::fs::write(inbox.join("darf.JPG"), b"darf scan").unwrap();
    std::fs::write(inbox.join("leia-me.txt"), b"notes").unwrap();
    std::fs::write(inbox.join("nested").join("gps.png"), b"gps scan").unwrap();

    let value = call(
        &state,
        "import_prazo_folder",
        json!({"folder": inbox.to_string_lossy()}),
    )
    .await;
    let report: ImportReport = serde_json::from_value(value).unwrap();
    assert_eq!(report.staged.len(), 2);
    assert_eq!(report.skipped, vec!["leia-me.txt".to_string()]);
    assert!(report.failed.is_empty());

    let missing = dispatch(
        &state,
        "import_prazo_folder",
        json!({"folder": dir.path().join("nope").to_string_lossy()}),
    )
    .await
    .unwrap_err();
    assert_eq!(missing.kind, ErrorKind::Validation);
}

#[tokio::test]
async fn signed_document_urls_verify_until_tampered() {
    let (_dir, state) = setup(Arc::new(FixedOcr(das_candidate())));
    call(&state, "login", json!({"user_id": "contador-1"})).await;
    let staged = upload(&state, "guia.png", b"scan").await;

    let signed = call(
        &state,
        "get_document_url",
        json!({"document_id": staged.id, "expires_in_secs": 60}),
    )
    .await;
    let url = signed["url"].as_str().unwrap().to_string();

    let verified = call(&state, "verify_document_url", json!({"url": url})).await;
    assert_eq!(verified["document_id"], json!(staged.id));
    assert_eq!(verified["file_name"], json!("guia.png"));

    let tampered = url.replace("expires=", "expires=9");
    let err = dispatch(&state, "verify_document_url", json!({"url": tampered}))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);

    let unknown = dispatch(&state, "get_document_url", json!({"document_id": "missing"}))
        .await
        .unwrap_err();
    assert_eq!(unknown.kind, ErrorKind::NotFound);
}
