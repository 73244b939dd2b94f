use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;

use crate::services::crypto::CryptoService;
use crate::utils::sha256_bytes;

const URL_SCHEME: &str = "storage://documents/";

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub path: PathBuf,
    pub hash: String,
    pub size: u64,
    pub mime_type: String,
}

/// Content-addressed file store for uploaded deadline documents.
#[derive(Debug, Clone)]
pub struct DocumentStorage {
    root: PathBuf,
}

impl DocumentStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DocumentStorage { root: root.into() }
    }

    pub async fn store(&self, bytes: &[u8], extension: &str, mime_type: &str) -> Result<StoredDocument> {
        let hash = sha256_bytes(bytes);
        let dir = self.root.join("documents").join(&hash[..2]);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Create storage dir {}", dir.display()))?;

        let path = dir.join(format!("{}.{}", hash, extension));
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::write(&path, bytes)
                .await
                .with_context(|| format!("Write {}", path.display()))?;
        }

        Ok(StoredDocument {
            path,
            hash,
            size: bytes.len() as u64,
            mime_type: mime_type.to_string(),
        })
    }

    pub fn signed_url(&self, document_id: &str, expires_at: i64, key_hex: &str) -> Result<String> {
        let signature = CryptoService::sign(key_hex, &signing_message(document_id, expires_at))?;
        Ok(format!(
            "{}{}?expires={}&signature={}",
            URL_SCHEME, document_id, expires_at, signature
        ))
    }

    /// Returns the document id when the signature matches and `now` is before expiry.
    pub fn verify_signed_url(&self, url: &str, key_hex: &str, now: i64) -> Result<String> {
        let rest = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| anyhow!("Not a document URL"))?;
        let (document_id, query) = rest
            .split_once('?')
            .ok_or_else(|| anyhow!("Missing URL signature"))?;

        let mut expires_at = None;
        let mut signature = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", value)) => expires_at = value.parse::<i64>().ok(),
                Some(("signature", value)) => signature = Some(value),
                _ => {}
            }
        }
        let expires_at = expires_at.ok_or_else(|| anyhow!("Missing expiry"))?;
        let signature = signature.ok_or_else(|| anyhow!("Missing signature"))?;

        if !CryptoService::verify(key_hex, &signing_message(document_id, expires_at), signature)? {
            return Err(anyhow!("Invalid URL signature"));
        }
        if now >= expires_at {
            return Err(anyhow!("URL expired"));
        }
        Ok(document_id.to_string())
    }
}

fn signing_message(document_id: &str, expires_at: i64) -> String {
    format!("{}:{}", document_id, expires_at)
}
