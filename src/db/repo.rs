use super::model::{ErrorSample, NewQueueItem};
use crate::model::{QueueItem, QueueStatus};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::Row;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

const ITEM_COLUMNS: &str = "id, document_key, payload, status, attempts, max_attempts, priority, \
     created_at, updated_at, processing_started_at, sent_at, next_retry_at, last_error, \
     last_response, last_status_code, duration_ms, dead_letter_reason";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    // Enable WAL and stricter durability.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));

    // Every connection to `sqlite::memory:` is its own database, so keep one.
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(8)
    };
    let pool = pool_options.connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %err, "failed to create database directory");
            }
        }
    }

    // Rebuild URL, prefer sqlite:// form
    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn map_item(row: &SqliteRow) -> Result<QueueItem> {
    let status_str: String = row.try_get("status")?;
    let status = QueueStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("outbox row has unknown status {}", status_str))?;
    let opt_time = |column: &str| -> Result<Option<DateTime<Utc>>> {
        Ok(row.try_get::<Option<i64>, _>(column)?.map(from_millis))
    };

    Ok(QueueItem {
        id: row.try_get("id")?,
        document_key: row.try_get("document_key")?,
        payload: row.try_get("payload")?,
        status,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        priority: row.try_get("priority")?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
        processing_started_at: opt_time("processing_started_at")?,
        sent_at: opt_time("sent_at")?,
        next_retry_at: opt_time("next_retry_at")?,
        last_error: row.try_get("last_error")?,
        last_response: row.try_get("last_response")?,
        last_status_code: row.try_get("last_status_code")?,
        duration_ms: row.try_get("duration_ms")?,
        dead_letter_reason: row.try_get("dead_letter_reason")?,
    })
}

/// Insert a row unless one with the same document key exists.
/// Returns the row id and whether this call created it.
#[instrument(skip_all)]
pub async fn insert_or_get(
    pool: &Pool,
    item: &NewQueueItem<'_>,
    now: DateTime<Utc>,
) -> Result<(String, bool)> {
    let mut tx = pool.begin().await?;
    let id = uuid::Uuid::new_v4().to_string();
    let now_ms = to_millis(now);
    let inserted = sqlx::query(
        "INSERT INTO outbox (id, document_key, payload, status, attempts, max_attempts, priority, created_at, updated_at) \
         VALUES (?, ?, ?, 'pending', 0, ?, ?, ?, ?) \
         ON CONFLICT(document_key) DO NOTHING",
    )
    .bind(&id)
    .bind(item.document_key)
    .bind(item.payload)
    .bind(item.max_attempts)
    .bind(item.priority)
    .bind(now_ms)
    .bind(now_ms)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if inserted == 1 {
        tx.commit().await?;
        return Ok((id, true));
    }

    let existing: String = sqlx::query_scalar("SELECT id FROM outbox WHERE document_key = ?")
        .bind(item.document_key)
        .fetch_one(&mut *tx)
        .await
        .context("document key conflicted but no row was found")?;
    tx.commit().await?;
    Ok((existing, false))
}

/// Select the next eligible row and move it to `processing` in one transaction.
/// Callers must serialise invocations (see `OutboxQueue::dequeue`).
#[instrument(skip_all)]
pub async fn claim_next(pool: &Pool, now: DateTime<Utc>) -> Result<Option<QueueItem>> {
    let now_ms = to_millis(now);
    let mut tx = pool.begin().await?;
    let candidate: Option<String> = sqlx::query_scalar(
        "SELECT id FROM outbox \
         WHERE (status = 'pending' OR (status = 'retry' AND COALESCE(next_retry_at, 0) <= ?)) \
           AND attempts < max_attempts \
         ORDER BY priority DESC, created_at ASC, rowid ASC \
         LIMIT 1",
    )
    .bind(now_ms)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(id) = candidate else {
        tx.commit().await?;
        return Ok(None);
    };

    let claimed = sqlx::query(
        "UPDATE outbox SET status = 'processing', attempts = attempts + 1, \
         processing_started_at = ?, updated_at = ? \
         WHERE id = ? AND status IN ('pending', 'retry')",
    )
    .bind(now_ms)
    .bind(now_ms)
    .bind(&id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if claimed != 1 {
        tx.rollback().await?;
        return Ok(None);
    }

    let row = sqlx::query(&format!("SELECT {} FROM outbox WHERE id = ?", ITEM_COLUMNS))
        .bind(&id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(Some(map_item(&row)?))
}

#[instrument(skip_all)]
pub async fn fetch_item(pool: &Pool, id: &str) -> Result<Option<QueueItem>> {
    let row = sqlx::query(&format!("SELECT {} FROM outbox WHERE id = ?", ITEM_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_item).transpose()
}

#[instrument(skip_all)]
pub async fn fetch_by_key(pool: &Pool, document_key: &str) -> Result<Option<QueueItem>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM outbox WHERE document_key = ?",
        ITEM_COLUMNS
    ))
    .bind(document_key)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(map_item).transpose()
}

#[instrument(skip_all)]
pub async fn mark_sent(
    pool: &Pool,
    id: &str,
    now: DateTime<Utc>,
    duration_ms: i64,
    response: Option<&str>,
    status_code: Option<i64>,
) -> Result<bool> {
    let now_ms = to_millis(now);
    let updated = sqlx::query(
        "UPDATE outbox SET status = 'sent', sent_at = ?, updated_at = ?, duration_ms = ?, \
         last_response = ?, last_status_code = ?, last_error = NULL, next_retry_at = NULL \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(now_ms)
    .bind(now_ms)
    .bind(duration_ms)
    .bind(response)
    .bind(status_code)
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated == 1)
}

#[instrument(skip_all)]
#[allow(clippy::too_many_arguments)]
pub async fn mark_retry(
    pool: &Pool,
    id: &str,
    now: DateTime<Utc>,
    next_retry_at: DateTime<Utc>,
    error: &str,
    response: Option<&str>,
    status_code: Option<i64>,
    duration_ms: Option<i64>,
) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE outbox SET status = 'retry', next_retry_at = ?, updated_at = ?, last_error = ?, \
         last_response = ?, last_status_code = ?, duration_ms = ? \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(to_millis(next_retry_at))
    .bind(to_millis(now))
    .bind(error)
    .bind(response)
    .bind(status_code)
    .bind(duration_ms)
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated == 1)
}

#[instrument(skip_all)]
#[allow(clippy::too_many_arguments)]
pub async fn mark_dead_letter(
    pool: &Pool,
    id: &str,
    now: DateTime<Utc>,
    reason: &str,
    error: Option<&str>,
    response: Option<&str>,
    status_code: Option<i64>,
) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE outbox SET status = 'dead_letter', dead_letter_reason = ?, updated_at = ?, \
         last_error = COALESCE(?, last_error), last_response = COALESCE(?, last_response), \
         last_status_code = COALESCE(?, last_status_code), next_retry_at = NULL \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(reason)
    .bind(to_millis(now))
    .bind(error)
    .bind(response)
    .bind(status_code)
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated == 1)
}

#[instrument(skip_all)]
pub async fn mark_error(pool: &Pool, id: &str, now: DateTime<Utc>, error: &str) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE outbox SET status = 'error', last_error = ?, updated_at = ?, next_retry_at = NULL \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(error)
    .bind(to_millis(now))
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated == 1)
}

/// Reset rows stuck in `processing` since before `started_before`.
#[instrument(skip_all)]
pub async fn reset_stuck(
    pool: &Pool,
    started_before: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let updated = sqlx::query(
        "UPDATE outbox SET status = 'pending', processing_started_at = NULL, updated_at = ?, \
         max_attempts = MAX(max_attempts, attempts + 1) \
         WHERE status = 'processing' AND COALESCE(processing_started_at, 0) < ?",
    )
    .bind(to_millis(now))
    .bind(to_millis(started_before))
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated)
}

#[instrument(skip_all)]
pub async fn reset_processing(pool: &Pool, now: DateTime<Utc>) -> Result<u64> {
    let updated = sqlx::query(
        "UPDATE outbox SET status = 'pending', processing_started_at = NULL, updated_at = ?, \
         max_attempts = MAX(max_attempts, attempts + 1) \
         WHERE status = 'processing'",
    )
    .bind(to_millis(now))
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated)
}

/// Hand one interrupted `processing` row back to `pending`. The interrupted
/// attempt stays counted, so the ceiling moves up to keep the row eligible.
#[instrument(skip_all)]
pub async fn release_processing(pool: &Pool, id: &str, now: DateTime<Utc>) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE outbox SET status = 'pending', processing_started_at = NULL, updated_at = ?, \
         max_attempts = MAX(max_attempts, attempts + 1) \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(to_millis(now))
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated == 1)
}

#[instrument(skip_all)]
pub async fn list_by_status(
    pool: &Pool,
    status: QueueStatus,
    limit: i64,
    offset: i64,
) -> Result<Vec<QueueItem>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM outbox WHERE status = ? \
         ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT ? OFFSET ?",
        ITEM_COLUMNS
    ))
    .bind(status.as_str())
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.iter().map(map_item).collect()
}

#[instrument(skip_all)]
pub async fn count_by_status(pool: &Pool, status: QueueStatus) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE status = ?")
        .bind(status.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn count_grouped_by_status(pool: &Pool) -> Result<HashMap<QueueStatus, i64>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM outbox GROUP BY status")
            .fetch_all(pool)
            .await?;
    let mut counts = HashMap::new();
    for (raw, count) in rows {
        let status = QueueStatus::parse_status(&raw)
            .ok_or_else(|| anyhow!("outbox row has unknown status {}", raw))?;
        counts.insert(status, count);
    }
    Ok(counts)
}

#[instrument(skip_all)]
pub async fn oldest_pending_created_at(pool: &Pool) -> Result<Option<DateTime<Utc>>> {
    let oldest: Option<i64> = sqlx::query_scalar(
        "SELECT MIN(created_at) FROM outbox WHERE status IN ('pending', 'retry')",
    )
    .fetch_one(pool)
    .await?;
    Ok(oldest.map(from_millis))
}

/// Move every `error` row back to `retry`, eligible immediately.
#[instrument(skip_all)]
pub async fn requeue_errors(pool: &Pool, now: DateTime<Utc>) -> Result<u64> {
    let now_ms = to_millis(now);
    let updated = sqlx::query(
        "UPDATE outbox SET status = 'retry', next_retry_at = ?, updated_at = ?, \
         max_attempts = MAX(max_attempts, attempts + 1) \
         WHERE status = 'error'",
    )
    .bind(now_ms)
    .bind(now_ms)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated)
}

/// Operator override for an `error` or `dead_letter` row: grants `extra_attempts`
/// more attempts on top of those already used and schedules it now.
#[instrument(skip_all)]
pub async fn force_retry(
    pool: &Pool,
    id: &str,
    extra_attempts: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let now_ms = to_millis(now);
    let updated = sqlx::query(
        "UPDATE outbox SET status = 'retry', next_retry_at = ?, updated_at = ?, \
         max_attempts = attempts + ?, dead_letter_reason = NULL \
         WHERE id = ? AND status IN ('error', 'dead_letter')",
    )
    .bind(now_ms)
    .bind(now_ms)
    .bind(extra_attempts)
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated == 1)
}

#[instrument(skip_all)]
pub async fn purge_sent_before(pool: &Pool, cutoff: DateTime<Utc>) -> Result<u64> {
    let deleted = sqlx::query("DELETE FROM outbox WHERE status = 'sent' AND sent_at < ?")
        .bind(to_millis(cutoff))
        .execute(pool)
        .await?
        .rows_affected();
    Ok(deleted)
}

#[instrument(skip_all)]
pub async fn recent_errors(pool: &Pool, limit: i64) -> Result<Vec<ErrorSample>> {
    let rows = sqlx::query(
        "SELECT id, document_key, status, attempts, last_error, last_status_code, updated_at \
         FROM outbox WHERE last_error IS NOT NULL AND status != 'sent' \
         ORDER BY updated_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(ErrorSample {
                id: row.try_get("id")?,
                document_key: row.try_get("document_key")?,
                status: row.try_get("status")?,
                attempts: row.try_get("attempts")?,
                last_error: row.try_get("last_error")?,
                last_status_code: row.try_get("last_status_code")?,
                updated_at: from_millis(row.try_get("updated_at")?),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn new_item<'a>(key: &'a str, payload: &'a str) -> NewQueueItem<'a> {
        NewQueueItem {
            document_key: key,
            payload,
            priority: 0,
            max_attempts: 5,
        }
    }

    #[test]
    fn prepare_sqlite_url_keeps_memory_and_normalises_paths() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        let td = tempfile::tempdir().unwrap();
        let nested = td.path().join("a/b/outbox.db");
        let url = format!("sqlite:{}?mode=rwc", nested.display());
        let normalized = prepare_sqlite_url(&url);
        assert_eq!(normalized, format!("sqlite://{}?mode=rwc", nested.display()));
        assert!(nested.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn insert_is_idempotent_on_document_key() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let (id1, created1) = insert_or_get(&pool, &new_item("K1", "{}"), now).await.unwrap();
        let (id2, created2) = insert_or_get(&pool, &new_item("K1", "{\"x\":1}"), now)
            .await
            .unwrap();
        assert!(created1);
        assert!(!created2);
        assert_eq!(id1, id2);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
        let stored = fetch_item(&pool, &id1).await.unwrap().unwrap();
        assert_eq!(stored.payload, "{}");
    }

    #[tokio::test]
    async fn claim_marks_processing_and_counts_attempt() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let (id, _) = insert_or_get(&pool, &new_item("K1", "{}"), now).await.unwrap();

        let claimed = claim_next(&pool, now).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, QueueStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.processing_started_at.is_some());

        assert!(claim_next(&pool, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transitions_require_processing_state() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let (id, _) = insert_or_get(&pool, &new_item("K1", "{}"), now).await.unwrap();

        assert!(!mark_sent(&pool, &id, now, 5, None, None).await.unwrap());
        assert!(!mark_error(&pool, &id, now, "boom").await.unwrap());

        claim_next(&pool, now).await.unwrap().unwrap();
        assert!(mark_sent(&pool, &id, now, 5, Some("ok"), Some(200)).await.unwrap());
        assert!(!mark_retry(&pool, &id, now, now, "late", None, None, None)
            .await
            .unwrap());

        let item = fetch_item(&pool, &id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Sent);
        assert_eq!(item.last_status_code, Some(200));
        assert!(item.sent_at.is_some());
    }

    #[tokio::test]
    async fn grouped_counts_and_error_samples() {
        let pool = setup_pool().await;
        let now = Utc::now();
        insert_or_get(&pool, &new_item("K1", "{}"), now).await.unwrap();
        let (id2, _) = insert_or_get(&pool, &new_item("K2", "{}"), now).await.unwrap();
        claim_next(&pool, now).await.unwrap();
        claim_next(&pool, now).await.unwrap();
        mark_error(&pool, &id2, now, "payload unreadable").await.unwrap();

        let counts = count_grouped_by_status(&pool).await.unwrap();
        assert_eq!(counts.get(&QueueStatus::Processing), Some(&1));
        assert_eq!(counts.get(&QueueStatus::Error), Some(&1));

        let samples = recent_errors(&pool, 10).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].document_key, "K2");
        assert_eq!(samples[0].last_error, "payload unreadable");
    }

    #[tokio::test]
    async fn released_row_stays_eligible_at_its_ceiling() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let item = NewQueueItem {
            max_attempts: 1,
            ..new_item("K1", "{}")
        };
        let (id, _) = insert_or_get(&pool, &item, now).await.unwrap();
        claim_next(&pool, now).await.unwrap().unwrap();

        assert!(release_processing(&pool, &id, now).await.unwrap());
        assert!(!release_processing(&pool, &id, now).await.unwrap());
        let released = fetch_item(&pool, &id).await.unwrap().unwrap();
        assert_eq!(released.status, QueueStatus::Pending);
        assert_eq!(released.attempts, 1);
        assert_eq!(released.max_attempts, 2);
        assert!(released.processing_started_at.is_none());

        let again = claim_next(&pool, now).await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 2);
    }
}
