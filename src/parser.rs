//! Turns a ready file into a [`DocumentRecord`].
//!
//! Schema and signature validation of fiscal documents happens downstream; the
//! default parser only needs the natural key, the content hash and the text.

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

use crate::model::DocumentRecord;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("document is empty")]
    Empty,
    #[error("no access key found in document")]
    MissingKey,
    #[error("document is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDocument {
    pub record: DocumentRecord,
    pub content_hash: String,
}

#[async_trait]
pub trait DocumentParser: Send + Sync {
    async fn parse(&self, path: &Path) -> Result<ParsedDocument, ParseError>;
}

static ACCESS_KEY_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"Id\s*=\s*"(?:NFe|CTe|MDFe|NFCe)?(\d{44})""#).expect("valid regex")
});
static ACCESS_KEY_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<ch(?:NFe|CTe|MDFe)>\s*(\d{44})\s*</ch(?:NFe|CTe|MDFe)>").expect("valid regex"));

/// Hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// First 44-digit access key found in the document text.
pub fn extract_access_key(text: &str) -> Option<String> {
    ACCESS_KEY_ATTR
        .captures(text)
        .or_else(|| ACCESS_KEY_TAG.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Default parser for XML fiscal documents.
#[derive(Debug, Clone, Default)]
pub struct FiscalDocumentParser {
    /// Reject documents without an access key instead of keying them by hash.
    pub require_access_key: bool,
}

impl FiscalDocumentParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self {
            require_access_key: true,
        }
    }

    pub fn parse_bytes(&self, path: &Path, bytes: Vec<u8>) -> Result<ParsedDocument, ParseError> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(ParseError::Empty);
        }
        let hash = content_hash(&bytes);
        let size = bytes.len() as u64;
        let text = String::from_utf8(bytes).map_err(|_| ParseError::InvalidUtf8)?;

        let document_key = match extract_access_key(&text) {
            Some(key) => key,
            None if self.require_access_key => return Err(ParseError::MissingKey),
            None => hash.clone(),
        };

        let record = DocumentRecord {
            document_key,
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            source_path: path.to_string_lossy().into_owned(),
            content_hash: hash.clone(),
            size,
            detected_at: Utc::now(),
            content: text,
        };
        Ok(ParsedDocument {
            record,
            content_hash: hash,
        })
    }
}

#[async_trait]
impl DocumentParser for FiscalDocumentParser {
    async fn parse(&self, path: &Path) -> Result<ParsedDocument, ParseError> {
        let bytes = tokio::fs::read(path).await?;
        self.parse_bytes(path, bytes)
    }
}
