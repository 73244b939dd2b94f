use anyhow::{anyhow, Result};
use chrono::{Datelike, Duration, Local, Months, NaiveDate, Utc};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::models::Period;

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn format_decimal(value: f64) -> String {
    format!("{:.2}", value)
}

/// Parses `1234.56`, `1234,56` and Brazilian `1.234,56`.
pub fn parse_decimal(value: &str) -> Result<f64> {
    let raw = value.trim().trim_start_matches("R$").trim();
    let normalized = if raw.contains(',') {
        raw.replace('.', "").replace(',', ".")
    } else {
        raw.to_string()
    };
    normalized
        .parse::<f64>()
        .map_err(|e| anyhow!("Parse decimal '{}': {}", value, e))
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let formats = ["%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y", "%d-%m-%Y", "%Y/%m/%d"];
    formats
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

pub fn normalize_date(value: Option<String>) -> Option<String> {
    let raw = value?.trim().to_string();
    if raw.is_empty() {
        return None;
    }
    match parse_date(&raw) {
        Some(date) => Some(date.format("%Y-%m-%d").to_string()),
        None => Some(raw),
    }
}

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

pub fn month_end(date: NaiveDate) -> NaiveDate {
    let start = month_start(date);
    start
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(date)
}

/// Inclusive due-date window of `period` around `today`.
pub fn period_bounds(period: &Period, today: NaiveDate) -> (NaiveDate, NaiveDate) {
    match period {
        Period::Today => (today, today),
        Period::Week => {
            let offset = today.weekday().num_days_from_monday() as i64;
            let start = today - Duration::days(offset);
            (start, start + Duration::days(6))
        }
        Period::Month => (month_start(today), month_end(today)),
        Period::Quarter => {
            let first_month = (today.month0() / 3) * 3 + 1;
            let start = NaiveDate::from_ymd_opt(today.year(), first_month, 1).unwrap_or(today);
            let end = start
                .checked_add_months(Months::new(3))
                .and_then(|next| next.pred_opt())
                .unwrap_or(today);
            (start, end)
        }
        Period::Year => {
            let start = NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today);
            let end = NaiveDate::from_ymd_opt(today.year(), 12, 31).unwrap_or(today);
            (start, end)
        }
        Period::Custom { from, to } => (*from, *to),
    }
}

pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "pdf" => Some("application/pdf"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "tif" | "tiff" => Some("image/tiff"),
        _ => None,
    }
}

pub fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}
