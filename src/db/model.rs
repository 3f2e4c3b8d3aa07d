//! Database view models used by repositories.
//!
//! Keep these structs focused on the data passed to or returned by queries.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Insert descriptor for a new outbox row.
#[derive(Debug, Clone)]
pub struct NewQueueItem<'a> {
    pub document_key: &'a str,
    pub payload: &'a str,
    pub priority: i64,
    pub max_attempts: i64,
}

/// Slice of a failed row surfaced in queue statistics.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorSample {
    pub id: String,
    pub document_key: String,
    pub status: String,
    pub attempts: i64,
    pub last_error: String,
    pub last_status_code: Option<i64>,
    pub updated_at: DateTime<Utc>,
}
