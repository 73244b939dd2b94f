use anyhow::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::models::{ExtractedPrazoData, FiscalCalculationRequest, FiscalCalculationResult};
use crate::services::extraction::{compute_confidence, OcrOutput, OcrService};
use crate::services::storage::StoredDocument;

pub const OCR_FUNCTION: &str = "document-ocr";
pub const FISCAL_CALCULATOR_FUNCTION: &str = "fiscal-calculator";

/// JSON-in/JSON-out client for the hosted serverless functions.
#[derive(Clone)]
pub struct EdgeFunctionClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl EdgeFunctionClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(EdgeFunctionClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    pub fn function_url(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    /// Single attempt; non-2xx answers become network errors carrying the body.
    pub async fn invoke<B, R>(&self, name: &str, body: &B) -> AppResult<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let mut request = self.client.post(self.function_url(name)).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let started = std::time::Instant::now();
        let response = request.send().await?;
        let status = response.status();
        tracing::debug!(function = name, %status, elapsed_ms = started.elapsed().as_millis() as u64, "function call");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Network(format!("Function {} error {}: {}", name, status, body)));
        }
        Ok(response.json::<R>().await?)
    }

    pub async fn calculate_fiscal(&self, request: &FiscalCalculationRequest) -> AppResult<FiscalCalculationResult> {
        self.invoke(FISCAL_CALCULATOR_FUNCTION, request).await
    }
}

#[derive(Serialize)]
struct OcrRequest<'a> {
    file_name: String,
    mime_type: &'a str,
    language: &'a str,
    content_base64: String,
}

#[derive(Deserialize)]
struct OcrResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    fields: ExtractedPrazoData,
    #[serde(default)]
    confidence: Option<f64>,
}

pub struct RemoteOcrService {
    functions: EdgeFunctionClient,
    language: String,
}

impl RemoteOcrService {
    pub fn new(functions: EdgeFunctionClient, language: &str) -> Self {
        RemoteOcrService {
            functions,
            language: language.to_string(),
        }
    }
}

#[async_trait]
impl OcrService for RemoteOcrService {
    async fn recognize(&self, document: &StoredDocument) -> Result<OcrOutput> {
        let bytes = tokio::fs::read(&document.path).await?;
        let request = OcrRequest {
            file_name: document
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            mime_type: &document.mime_type,
            language: &self.language,
            content_base64: general_purpose::STANDARD.encode(bytes),
        };

        let response: OcrResponse = self.functions.invoke(OCR_FUNCTION, &request).await?;
        let mut data = response.fields;
        data.due_date = crate::utils::normalize_date(data.due_date);
        if !data.is_empty() {
            data.confidence_score = response
                .confidence
                .or(data.confidence_score)
                .or_else(|| Some(compute_confidence(&data)));
        }
        Ok(OcrOutput {
            text: response.text,
            data,
        })
    }
}
