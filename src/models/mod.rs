use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

/// Enums stored as TEXT columns and exchanged as snake_case strings.
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: ParseEnumError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrazoStatus {
    Pending,
    Completed,
    Overdue,
}

text_enum!(PrazoStatus, "deadline status", {
    Pending => "pending",
    Completed => "completed",
    Overdue => "overdue",
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

text_enum!(Priority, "priority", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrazoFiscal {
    pub id: String,
    pub user_id: String,
    pub company_id: String,
    pub description: String,
    pub obligation_type: Option<String>,
    pub due_date: NaiveDate,
    pub status: PrazoStatus,
    pub priority: Priority,
    pub amount: Option<f64>,
    pub notes: Option<String>,
    pub source_document_id: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl PrazoFiscal {
    /// Status as seen on `today`: open deadlines past their due date are overdue,
    /// open deadlines due today or later are pending.
    pub fn effective_status(&self, today: NaiveDate) -> PrazoStatus {
        match self.status {
            PrazoStatus::Completed => PrazoStatus::Completed,
            PrazoStatus::Pending | PrazoStatus::Overdue if self.due_date < today => PrazoStatus::Overdue,
            PrazoStatus::Pending | PrazoStatus::Overdue => PrazoStatus::Pending,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status != PrazoStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Today,
    Week,
    Month,
    Quarter,
    Year,
    Custom { from: NaiveDate, to: NaiveDate },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PrazoFilters {
    pub period: Option<Period>,
    pub status: Option<PrazoStatus>,
    pub company_id: Option<String>,
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrazoSort {
    #[default]
    DueDateAsc,
    DueDateDesc,
    PriorityDesc,
    AmountDesc,
    CreatedDesc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreatePrazoInput {
    pub description: String,
    pub company_id: String,
    pub due_date: Option<String>,
    pub obligation_type: Option<String>,
    pub priority: Option<Priority>,
    pub amount: Option<f64>,
    pub notes: Option<String>,
    pub source_document_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatePrazoInput {
    pub id: String,
    pub description: Option<String>,
    pub company_id: Option<String>,
    pub due_date: Option<String>,
    pub obligation_type: Option<String>,
    pub priority: Option<Priority>,
    pub amount: Option<f64>,
    pub notes: Option<String>,
    pub status: Option<PrazoStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstatisticasPrazos {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub overdue: usize,
    pub due_soon: usize,
    pub total_value: f64,
    pub pending_value: f64,
    pub overdue_value: f64,
    pub completed_value: f64,
    pub by_priority: BTreeMap<Priority, usize>,
    pub by_obligation_type: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractedPrazoData {
    pub description: Option<String>,
    pub due_date: Option<String>,
    pub amount: Option<f64>,
    pub obligation_type: Option<String>,
    pub company_document: Option<String>,
    pub reference_period: Option<String>,
    pub extraction_notes: String,
    pub confidence_score: Option<f64>,
}

impl ExtractedPrazoData {
    pub fn field_count(&self) -> usize {
        [
            self.description.is_some(),
            self.due_date.is_some(),
            self.amount.is_some(),
            self.obligation_type.is_some(),
            self.company_document.is_some(),
            self.reference_period.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    pub fn is_empty(&self) -> bool {
        self.field_count() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Extracted,
    Empty,
    Failed,
    Confirmed,
    Discarded,
}

text_enum!(ExtractionStatus, "extraction status", {
    Extracted => "extracted",
    Empty => "empty",
    Failed => "failed",
    Confirmed => "confirmed",
    Discarded => "discarded",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSource {
    TextLayer,
    RemoteOcr,
    #[serde(rename = "none")]
    Unavailable,
}

text_enum!(ExtractionSource, "extraction source", {
    TextLayer => "text_layer",
    RemoteOcr => "remote_ocr",
    Unavailable => "none",
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentoUploadPrazo {
    pub id: String,
    pub user_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub file_hash: String,
    pub file_size: i64,
    pub storage_path: String,
    pub extraction_status: ExtractionStatus,
    pub extraction_source: ExtractionSource,
    pub candidate: ExtractedPrazoData,
    pub confidence_score: f64,
    pub needs_review: bool,
    pub error_message: Option<String>,
    pub prazo_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DocumentoUploadPrazo {
    pub fn is_staged(&self) -> bool {
        matches!(
            self.extraction_status,
            ExtractionStatus::Extracted | ExtractionStatus::Empty | ExtractionStatus::Failed
        )
    }
}

/// User confirmation of a staged upload; set fields win over extracted candidates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmDocumentInput {
    pub upload_id: String,
    pub description: Option<String>,
    pub company_id: Option<String>,
    pub due_date: Option<String>,
    pub obligation_type: Option<String>,
    pub priority: Option<Priority>,
    pub amount: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportFailure {
    pub file_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportReport {
    pub staged: Vec<DocumentoUploadPrazo>,
    pub skipped: Vec<String>,
    pub failed: Vec<ImportFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    DeadlineCreated,
    DeadlineUpdated,
    DeadlineDueSoon,
    DeadlineOverdue,
    DocumentProcessed,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationData {
    pub id: String,
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub prazo_id: Option<String>,
    pub read: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationSummary {
    pub total: usize,
    pub unread: usize,
    pub latest: Vec<NotificationData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub functions_url: Option<String>,
    pub functions_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub ocr_language: String,
    pub due_soon_days: i64,
    pub review_threshold: f64,
    pub cache_ttl_secs: u64,
    pub request_timeout_secs: u64,
    pub monitor_interval_secs: u64,
    #[serde(skip_serializing)]
    pub signing_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            functions_url: None,
            functions_api_key: None,
            openai_api_key: None,
            ocr_language: "por".to_string(),
            due_soon_days: 7,
            review_threshold: 0.6,
            cache_ttl_secs: 60,
            request_timeout_secs: 30,
            monitor_interval_secs: 300,
            signing_key: None,
        }
    }
}

/// Settings as returned to the UI: secrets are reduced to presence flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsView {
    pub functions_url: Option<String>,
    pub has_functions_api_key: bool,
    pub has_openai_api_key: bool,
    pub ocr_language: String,
    pub due_soon_days: i64,
    pub review_threshold: f64,
    pub cache_ttl_secs: u64,
    pub request_timeout_secs: u64,
    pub monitor_interval_secs: u64,
}

impl From<&Settings> for SettingsView {
    fn from(settings: &Settings) -> Self {
        SettingsView {
            functions_url: settings.functions_url.clone(),
            has_functions_api_key: settings.functions_api_key.is_some(),
            has_openai_api_key: settings.openai_api_key.is_some(),
            ocr_language: settings.ocr_language.clone(),
            due_soon_days: settings.due_soon_days,
            review_threshold: settings.review_threshold,
            cache_ttl_secs: settings.cache_ttl_secs,
            request_timeout_secs: settings.request_timeout_secs,
            monitor_interval_secs: settings.monitor_interval_secs,
        }
    }
}

/// One independently loaded dashboard panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region<T> {
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> Region<T> {
    pub fn from_result<E: fmt::Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(data) => Region {
                data: Some(data),
                error: None,
            },
            Err(err) => Region {
                data: None,
                error: Some(err.to_string()),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DueSeries {
    pub months: Vec<String>,
    pub counts: Vec<usize>,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardData {
    pub reference_date: NaiveDate,
    pub upcoming: Region<Vec<PrazoFiscal>>,
    pub estatisticas: Region<EstatisticasPrazos>,
    pub notifications: Region<NotificationSummary>,
    pub recent_documents: Region<Vec<DocumentoUploadPrazo>>,
    pub due_series: Region<DueSeries>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiscalCalculationRequest {
    pub regime: String,
    pub company_id: String,
    pub reference_period: String,
    pub gross_revenue: f64,
    #[serde(default)]
    pub revenue_12m: Option<f64>,
    #[serde(default)]
    pub annex: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiscalCalculationResult {
    pub amount_due: f64,
    #[serde(default)]
    pub effective_rate: Option<f64>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub details: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prazo(due: NaiveDate, status: PrazoStatus) -> PrazoFiscal {
        PrazoFiscal {
            id: "p1".to_string(),
            user_id: "u1".to_string(),
            company_id: "c1".to_string(),
            description: "DAS".to_string(),
            obligation_type: None,
            due_date: due,
            status,
            priority: Priority::Medium,
            amount: None,
            notes: None,
            source_document_id: None,
            completed_at: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn effective_status_follows_due_date() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let yesterday = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();

        assert_eq!(prazo(today, PrazoStatus::Pending).effective_status(today), PrazoStatus::Pending);
        assert_eq!(prazo(yesterday, PrazoStatus::Pending).effective_status(today), PrazoStatus::Overdue);
        assert_eq!(prazo(today, PrazoStatus::Overdue).effective_status(today), PrazoStatus::Pending);
        assert_eq!(
            prazo(yesterday, PrazoStatus::Completed).effective_status(today),
            PrazoStatus::Completed
        );
    }

    #[test]
    fn filters_accept_plain_period_strings() {
        let filters: PrazoFilters =
            serde_json::from_str(r#"{"status": "pending", "period": "month"}"#).unwrap();
        assert_eq!(filters.status, Some(PrazoStatus::Pending));
        assert_eq!(filters.period, Some(Period::Month));
        assert!(filters.company_id.is_none());
    }

    #[test]
    fn text_enums_round_trip_through_strings() {
        assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Critical);
        assert_eq!(ExtractionSource::Unavailable.as_str(), "none");
        assert!("later".parse::<PrazoStatus>().is_err());
    }
}
