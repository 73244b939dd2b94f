use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }

    pub fn into_result(self) -> Result<(), AppError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        f.write_str(&parts.join("; "))
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("no active session")]
    Unauthenticated,
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("network error: {0}")]
    Network(String),
    #[error("{0} lock poisoned")]
    Lock(&'static str),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        let mut errors = ValidationErrors::default();
        errors.push(field, message);
        AppError::Validation(errors)
    }

    pub fn not_found(entity: &'static str, id: &str) -> Self {
        AppError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Network(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Unauthenticated,
    Storage,
    Network,
    Internal,
}

/// Error object returned over the command bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
}

impl CommandError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        CommandError {
            kind,
            message: message.into(),
            fields: Vec::new(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<AppError> for CommandError {
    fn from(err: AppError) -> Self {
        let message = err.to_string();
        match err {
            AppError::Validation(errors) => CommandError {
                kind: ErrorKind::Validation,
                message,
                fields: errors.errors,
            },
            AppError::NotFound { .. } => CommandError::new(ErrorKind::NotFound, message),
            AppError::Unauthenticated => CommandError::new(ErrorKind::Unauthenticated, message),
            AppError::Storage(_) => CommandError::new(ErrorKind::Storage, message),
            AppError::Network(_) => CommandError::new(ErrorKind::Network, message),
            AppError::Lock(_) | AppError::Internal(_) => CommandError::new(ErrorKind::Internal, message),
        }
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(err: serde_json::Error) -> Self {
        CommandError::new(ErrorKind::Validation, format!("Invalid arguments: {}", err))
    }
}
