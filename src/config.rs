//! Settings persistence and environment overrides.
//!
//! Values live in the `settings` table; API keys and the URL signing key are
//! stored encrypted and decrypted on load. `CONTABILIDADE_*` variables win over
//! stored values without being written back.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;

use crate::db::Database;
use crate::error::{AppResult, ValidationErrors};
use crate::models::Settings;
use crate::services::crypto::CryptoService;

pub const ENV_DATA_DIR: &str = "CONTABILIDADE_DATA_DIR";
const ENV_PREFIX: &str = "CONTABILIDADE_";
const SIGNING_KEY: &str = "signing_key";
const SECRET_KEYS: [&str; 2] = ["functions_api_key", "openai_api_key"];

/// Data directory: `CONTABILIDADE_DATA_DIR`, else the platform data dir.
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let base = dirs::data_dir().context("No platform data directory")?;
    Ok(base.join("contabilidade-pro"))
}

pub fn load_settings(db: &Database) -> AppResult<Settings> {
    let mut settings = Settings::default();
    let stored = |key: &str| -> AppResult<Option<String>> { Ok(db.get_setting(key)?) };

    settings.functions_url = stored("functions_url")?;
    settings.functions_api_key = read_secret(db, "functions_api_key")?;
    settings.openai_api_key = read_secret(db, "openai_api_key")?;
    if let Some(language) = stored("ocr_language")? {
        settings.ocr_language = language;
    }
    parse_into(&mut settings.due_soon_days, "due_soon_days", stored("due_soon_days")?);
    parse_into(&mut settings.review_threshold, "review_threshold", stored("review_threshold")?);
    parse_into(&mut settings.cache_ttl_secs, "cache_ttl_secs", stored("cache_ttl_secs")?);
    parse_into(&mut settings.request_timeout_secs, "request_timeout_secs", stored("request_timeout_secs")?);
    parse_into(&mut settings.monitor_interval_secs, "monitor_interval_secs", stored("monitor_interval_secs")?);
    settings.signing_key = read_secret(db, SIGNING_KEY)?;

    apply_env(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

/// Applies `CONTABILIDADE_*` overrides read through `var`.
pub fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    let get = |suffix: &str| {
        var(&format!("{}{}", ENV_PREFIX, suffix))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    if let Some(url) = get("FUNCTIONS_URL") {
        settings.functions_url = Some(url);
    }
    if let Some(key) = get("FUNCTIONS_KEY") {
        settings.functions_api_key = Some(key);
    }
    if let Some(key) = get("OPENAI_KEY") {
        settings.openai_api_key = Some(key);
    }
    if let Some(language) = get("OCR_LANGUAGE") {
        settings.ocr_language = language;
    }
    parse_into(&mut settings.due_soon_days, "CONTABILIDADE_DUE_SOON_DAYS", get("DUE_SOON_DAYS"));
    parse_into(&mut settings.review_threshold, "CONTABILIDADE_REVIEW_THRESHOLD", get("REVIEW_THRESHOLD"));
    parse_into(&mut settings.cache_ttl_secs, "CONTABILIDADE_CACHE_TTL", get("CACHE_TTL"));
    parse_into(&mut settings.request_timeout_secs, "CONTABILIDADE_REQUEST_TIMEOUT", get("REQUEST_TIMEOUT"));
    parse_into(&mut settings.monitor_interval_secs, "CONTABILIDADE_MONITOR_INTERVAL", get("MONITOR_INTERVAL"));
}

fn parse_into<T: FromStr>(target: &mut T, name: &str, raw: Option<String>) {
    if let Some(raw) = raw {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(setting = name, value = %raw, "ignoring unparsable setting"),
        }
    }
}

fn read_secret(db: &Database, key: &str) -> AppResult<Option<String>> {
    let Some(stored) = db.get_setting(key)? else {
        return Ok(None);
    };
    match CryptoService::decrypt_secret(&stored) {
        Ok(plain) => Ok(Some(plain)),
        Err(err) => {
            tracing::warn!(setting = key, error = %err, "stored secret could not be decrypted");
            Ok(None)
        }
    }
}

/// Partial settings update; `Some("")` clears an optional value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SettingsPayload {
    pub functions_url: Option<String>,
    pub functions_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub ocr_language: Option<String>,
    pub due_soon_days: Option<i64>,
    pub review_threshold: Option<f64>,
    pub cache_ttl_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub monitor_interval_secs: Option<u64>,
}

impl SettingsPayload {
    pub fn validate(&self) -> AppResult<()> {
        let mut errors = ValidationErrors::default();
        if let Some(url) = self.functions_url.as_deref().map(str::trim) {
            if !url.is_empty() && !(url.starts_with("https://") || url.starts_with("http://")) {
                errors.push("functions_url", "Must be an http(s) URL");
            }
        }
        if let Some(language) = &self.ocr_language {
            if language.trim().is_empty() {
                errors.push("ocr_language", "OCR language is required");
            }
        }
        if matches!(self.due_soon_days, Some(days) if !(0..=365).contains(&days)) {
            errors.push("due_soon_days", "Must be between 0 and 365");
        }
        if matches!(self.review_threshold, Some(t) if !(0.0..=1.0).contains(&t)) {
            errors.push("review_threshold", "Must be between 0 and 1");
        }
        if self.request_timeout_secs == Some(0) {
            errors.push("request_timeout_secs", "Must be at least one second");
        }
        if self.monitor_interval_secs == Some(0) {
            errors.push("monitor_interval_secs", "Must be at least one second");
        }
        errors.into_result()
    }
}

/// Validates and writes `payload`; returns the reloaded settings.
pub fn save_settings(db: &Database, payload: &SettingsPayload) -> AppResult<Settings> {
    payload.validate()?;

    if let Some(url) = &payload.functions_url {
        set_or_clear(db, "functions_url", url.trim())?;
    }
    for (key, value) in SECRET_KEYS
        .iter()
        .zip([&payload.functions_api_key, &payload.openai_api_key])
    {
        if let Some(value) = value {
            let value = value.trim();
            if value.is_empty() {
                db.delete_setting(key)?;
            } else {
                db.set_setting(key, &CryptoService::encrypt_secret(value)?)?;
            }
        }
    }
    if let Some(language) = &payload.ocr_language {
        db.set_setting("ocr_language", language.trim())?;
    }
    let numbers = [
        ("due_soon_days", payload.due_soon_days.map(|v| v.to_string())),
        ("review_threshold", payload.review_threshold.map(|v| v.to_string())),
        ("cache_ttl_secs", payload.cache_ttl_secs.map(|v| v.to_string())),
        ("request_timeout_secs", payload.request_timeout_secs.map(|v| v.to_string())),
        ("monitor_interval_secs", payload.monitor_interval_secs.map(|v| v.to_string())),
    ];
    for (key, value) in numbers {
        if let Some(value) = value {
            db.set_setting(key, &value)?;
        }
    }

    tracing::info!("settings saved");
    load_settings(db)
}

fn set_or_clear(db: &Database, key: &str, value: &str) -> AppResult<()> {
    if value.is_empty() {
        db.delete_setting(key)?;
    } else {
        db.set_setting(key, value)?;
    }
    Ok(())
}

/// Returns the document URL signing key, generating and storing one on first run.
pub fn ensure_signing_key(db: &Database) -> AppResult<String> {
    if let Some(key) = read_secret(db, SIGNING_KEY)? {
        return Ok(key);
    }
    let key = CryptoService::generate_signing_key()?;
    db.set_setting(SIGNING_KEY, &CryptoService::encrypt_secret(&key)?)?;
    tracing::info!("generated document signing key");
    Ok(key)
}
