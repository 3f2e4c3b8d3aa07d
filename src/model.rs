use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of an outbox row.
///
/// `Pending -> Processing -> {Sent | Retry | DeadLetter | Error}`,
/// `Retry -> Processing` once the retry time has passed, and
/// `Processing -> Pending` when a stuck item is swept. `DeadLetter` is terminal
/// for the automatic machine; only an operator force-retry moves it again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Sent,
    Error,
    Retry,
    DeadLetter,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 6] = [
        QueueStatus::Pending,
        QueueStatus::Processing,
        QueueStatus::Sent,
        QueueStatus::Error,
        QueueStatus::Retry,
        QueueStatus::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Sent => "sent",
            QueueStatus::Error => "error",
            QueueStatus::Retry => "retry",
            QueueStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse_status(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "sent" => Some(QueueStatus::Sent),
            "error" => Some(QueueStatus::Error),
            "retry" => Some(QueueStatus::Retry),
            "dead_letter" => Some(QueueStatus::DeadLetter),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Sent | QueueStatus::DeadLetter)
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted unit of outbound work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub document_key: String,
    pub payload: String,
    pub status: QueueStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_response: Option<String>,
    pub last_status_code: Option<i64>,
    pub duration_ms: Option<i64>,
    pub dead_letter_reason: Option<String>,
}

/// Process-wide view of the link to the ingestion endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityStatus {
    #[default]
    Unknown,
    Connected,
    Disconnected,
    Error,
}

impl ConnectivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityStatus::Unknown => "unknown",
            ConnectivityStatus::Connected => "connected",
            ConnectivityStatus::Disconnected => "disconnected",
            ConnectivityStatus::Error => "error",
        }
    }
}

/// A folder the agent watches for incoming documents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchedFolder {
    pub path: PathBuf,
    /// Glob patterns matched against the file name. Empty means every file.
    #[serde(default)]
    pub include: Vec<String>,
    /// Glob patterns matched against the file name and the full path.
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_recursive() -> bool {
    true
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

impl WatchedFolder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            include: Vec::new(),
            exclude: Vec::new(),
            recursive: default_recursive(),
            max_file_size: default_max_file_size(),
        }
    }
}

/// Structured record produced by the parser and carried as the outbox payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentRecord {
    pub document_key: String,
    pub file_name: String,
    pub source_path: String,
    pub content_hash: String,
    pub size: u64,
    pub detected_at: DateTime<Utc>,
    pub content: String,
}

/// Observability events emitted by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    FileReady { path: PathBuf, content_hash: String },
    Enqueued { id: String, document_key: String },
    Duplicate { id: String, document_key: String },
    ProcessingFailed { path: PathBuf, error: String },
    Sent { id: String },
    Retrying { id: String, attempts: i64 },
    DeadLettered { id: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in QueueStatus::ALL {
            assert_eq!(QueueStatus::parse_status(status.as_str()), Some(status));
        }
        assert_eq!(QueueStatus::parse_status("bogus"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(QueueStatus::Sent.is_terminal());
        assert!(QueueStatus::DeadLetter.is_terminal());
        assert!(!QueueStatus::Retry.is_terminal());
        assert!(!QueueStatus::Error.is_terminal());
    }

    #[test]
    fn watched_folder_defaults_from_yaml() {
        let folder: WatchedFolder = serde_yaml::from_str("path: /tmp/in").unwrap();
        assert!(folder.recursive);
        assert!(folder.include.is_empty());
        assert_eq!(folder.max_file_size, 10 * 1024 * 1024);
    }
}
