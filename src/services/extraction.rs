use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::models::{ExtractedPrazoData, ExtractionSource};
use crate::services::storage::StoredDocument;
use crate::utils::{parse_date, parse_decimal};

pub struct OcrOutput {
    pub text: Option<String>,
    pub data: ExtractedPrazoData,
}

/// Remote OCR: reads a stored file and returns whatever fields it recognized.
#[async_trait]
pub trait OcrService: Send + Sync {
    async fn recognize(&self, document: &StoredDocument) -> Result<OcrOutput>;
}

/// Turns plain document text into candidate deadline fields.
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    async fn extract(&self, text: &str) -> Result<ExtractedPrazoData>;
}

pub struct TextExtractor;

impl TextExtractor {
    pub async fn extract_text_layer(path: &Path) -> Result<String> {
        let path: PathBuf = path.to_path_buf();
        let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text(&path))
            .await
            .map_err(|e| anyhow!("PDF worker: {}", e))?
            .map_err(|e| anyhow!("PDF text: {}", e))?;
        Ok(text)
    }

    pub fn validate_text_quality(text: &str) -> bool {
        text.len() > 50 && text.split_whitespace().count() > 10
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub source: ExtractionSource,
    pub data: ExtractedPrazoData,
    pub error: Option<String>,
}

/// Text layer first, then field extractors in order, then remote OCR.
pub struct IntakePipeline {
    extractors: Vec<Arc<dyn FieldExtractor>>,
    ocr: Option<Arc<dyn OcrService>>,
}

impl IntakePipeline {
    pub fn new(extractors: Vec<Arc<dyn FieldExtractor>>, ocr: Option<Arc<dyn OcrService>>) -> Self {
        IntakePipeline { extractors, ocr }
    }

    pub fn heuristic_only() -> Self {
        IntakePipeline::new(vec![Arc::new(HeuristicExtractor)], None)
    }

    pub async fn extract(&self, document: &StoredDocument) -> ExtractionOutcome {
        let mut last_error = None;

        if document.mime_type == "application/pdf" {
            match TextExtractor::extract_text_layer(&document.path).await {
                Ok(text) if TextExtractor::validate_text_quality(&text) => {
                    match self.extract_fields(&text).await {
                        Ok(data) if !data.is_empty() => {
                            return ExtractionOutcome {
                                source: ExtractionSource::TextLayer,
                                data,
                                error: None,
                            };
                        }
                        Ok(_) => tracing::debug!(hash = %document.hash, "text layer had no deadline fields"),
                        Err(err) => last_error = Some(err.to_string()),
                    }
                }
                Ok(_) => tracing::debug!(hash = %document.hash, "text layer too poor, falling back to OCR"),
                Err(err) => {
                    tracing::warn!(hash = %document.hash, error = %err, "text layer extraction failed");
                    last_error = Some(err.to_string());
                }
            }
        }

        if let Some(ocr) = &self.ocr {
            match ocr.recognize(document).await {
                Ok(output) if !output.data.is_empty() => {
                    return ExtractionOutcome {
                        source: ExtractionSource::RemoteOcr,
                        data: output.data,
                        error: None,
                    };
                }
                Ok(output) => {
                    if let Some(text) = output.text.filter(|t| !t.trim().is_empty()) {
                        match self.extract_fields(&text).await {
                            Ok(data) if !data.is_empty() => {
                                return ExtractionOutcome {
                                    source: ExtractionSource::RemoteOcr,
                                    data,
                                    error: None,
                                };
                            }
                            Ok(_) => {}
                            Err(err) => last_error = Some(err.to_string()),
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(hash = %document.hash, error = %err, "remote OCR unavailable");
                    last_error = Some(err.to_string());
                }
            }
        }

        ExtractionOutcome {
            source: ExtractionSource::Unavailable,
            data: ExtractedPrazoData::default(),
            error: last_error,
        }
    }

    /// First extractor producing any field wins; an extractor error only matters
    /// when nobody produced anything.
    async fn extract_fields(&self, text: &str) -> Result<ExtractedPrazoData> {
        let mut last_error = None;
        for extractor in &self.extractors {
            match extractor.extract(text).await {
                Ok(data) if !data.is_empty() => return Ok(data),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(extractor = extractor.name(), error = %err, "field extraction failed");
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(ExtractedPrazoData::default()),
        }
    }
}

pub fn compute_confidence(data: &ExtractedPrazoData) -> f64 {
    let mut score: f64 = 0.2;
    if data.due_date.is_some() {
        score += 0.2;
    }
    if data.amount.is_some() {
        score += 0.15;
    }
    if data.obligation_type.is_some() {
        score += 0.1;
    }
    if data.company_document.is_some() {
        score += 0.1;
    }
    if data.reference_period.is_some() {
        score += 0.05;
    }
    if data.description.is_some() {
        score += 0.05;
    }
    score.clamp(0.0, 1.0)
}

struct Patterns {
    due_date: Regex,
    any_date: Regex,
    labelled_amount: Regex,
    currency_amount: Regex,
    obligation: Regex,
    cnpj: Regex,
    reference_period: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        due_date: Regex::new(r"(?i)venc\w*\D{0,30}?(\d{2}/\d{2}/\d{4})").expect("due date pattern"),
        any_date: Regex::new(r"\b(\d{2}/\d{2}/\d{4})\b").expect("date pattern"),
        labelled_amount: Regex::new(
            r"(?i)(?:valor\s+total|valor\s+a\s+recolher|valor\s+do\s+documento|total\s+a\s+pagar)\D{0,30}?(\d{1,3}(?:\.\d{3})*,\d{2})",
        )
        .expect("labelled amount pattern"),
        currency_amount: Regex::new(r"R\$\s*(\d{1,3}(?:\.\d{3})*,\d{2})").expect("currency pattern"),
        obligation: Regex::new(
            r"\b(DCTFWeb|DAS|DARF|GPS|FGTS|DCTF|DEFIS|DIRF|ECD|ECF|EFD|ICMS|ISS|IRPJ|CSLL|PIS|COFINS)\b",
        )
        .expect("obligation pattern"),
        cnpj: Regex::new(r"\b\d{2}\.\d{3}\.\d{3}/\d{4}-\d{2}\b").expect("cnpj pattern"),
        reference_period: Regex::new(
            r"(?i)(?:per[ií]odo\s+de\s+apura[cç][aã]o|compet[eê]ncia)\D{0,20}?(\d{2}/\d{4})",
        )
        .expect("reference period pattern"),
    })
}

/// Regex reading of Brazilian tax guides (DAS, DARF, GPS...).
pub struct HeuristicExtractor;

impl HeuristicExtractor {
    pub fn extract_sync(text: &str) -> ExtractedPrazoData {
        let p = patterns();

        let due_date = p
            .due_date
            .captures(text)
            .and_then(|c| parse_date(&c[1]))
            .or_else(|| {
                p.any_date
                    .captures_iter(text)
                    .filter_map(|c| parse_date(&c[1]))
                    .max()
            })
            .map(|d| d.format("%Y-%m-%d").to_string());

        let amount = p
            .labelled_amount
            .captures(text)
            .and_then(|c| parse_decimal(&c[1]).ok())
            .or_else(|| {
                p.currency_amount
                    .captures_iter(text)
                    .filter_map(|c| parse_decimal(&c[1]).ok())
                    .fold(None, |max: Option<f64>, v| Some(max.map_or(v, |m| m.max(v))))
            });

        let obligation_type = p.obligation.captures(text).map(|c| c[1].to_string());
        let company_document = p.cnpj.find(text).map(|m| m.as_str().to_string());
        let reference_period = p.reference_period.captures(text).map(|c| c[1].to_string());

        let description = obligation_type.as_ref().map(|kind| match &reference_period {
            Some(period) => format!("{} {}", kind, period),
            None => kind.clone(),
        });

        let mut data = ExtractedPrazoData {
            description,
            due_date,
            amount,
            obligation_type,
            company_document,
            reference_period,
            extraction_notes: "heuristic".to_string(),
            confidence_score: None,
        };
        if !data.is_empty() {
            data.confidence_score = Some(compute_confidence(&data));
        }
        data
    }
}

#[async_trait]
impl FieldExtractor for HeuristicExtractor {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    async fn extract(&self, text: &str) -> Result<ExtractedPrazoData> {
        Ok(Self::extract_sync(text))
    }
}
