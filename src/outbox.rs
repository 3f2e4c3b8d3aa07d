//! Durable outbox queue: state transitions over the `outbox` table and the
//! drain step that feeds claimed items through a [`Transmitter`].

use crate::db::{self, ErrorSample, NewQueueItem, Pool};
use crate::model::{DocumentRecord, QueueItem, QueueStatus};
use crate::retry::RetrySchedule;
use crate::transmit::{FailureKind, SendOutcome, Transmitter};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub retry: RetrySchedule,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry: RetrySchedule::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub id: String,
    /// False when the document key was already queued.
    pub created: bool,
}

/// Success acknowledgement for a `Processing` item.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub duration: Duration,
    pub response_body: Option<String>,
    pub status_code: Option<u16>,
}

/// Failure acknowledgement for a `Processing` item.
#[derive(Debug, Clone, Default)]
pub struct Failure {
    pub error: String,
    pub response_body: Option<String>,
    pub status_code: Option<u16>,
    pub duration: Option<Duration>,
}

impl Failure {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    Retry {
        attempts: i64,
        next_retry_at: DateTime<Utc>,
    },
    DeadLetter {
        attempts: i64,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub error: i64,
    pub retry: i64,
    pub dead_letter: i64,
    pub oldest_waiting_since: Option<DateTime<Utc>>,
    pub recent_errors: Vec<ErrorSample>,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.sent + self.error + self.retry + self.dead_letter
    }
}

/// Handle to the persisted outbox. Cheap to clone; clones share the dequeue lock.
#[derive(Clone)]
pub struct OutboxQueue {
    pool: Pool,
    settings: QueueSettings,
    dequeue_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for OutboxQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxQueue")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl OutboxQueue {
    pub fn new(pool: Pool, settings: QueueSettings) -> Self {
        Self {
            pool,
            settings,
            dequeue_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Queue a payload under its natural key. A second call with the same key
    /// returns the existing id and leaves the stored row untouched.
    #[instrument(skip_all, fields(document_key = %document_key))]
    pub async fn enqueue(
        &self,
        document_key: &str,
        payload: &str,
        priority: i64,
    ) -> Result<EnqueueOutcome> {
        if document_key.trim().is_empty() {
            return Err(anyhow!("document key must be non-empty"));
        }
        let (id, created) = db::insert_or_get(
            &self.pool,
            &NewQueueItem {
                document_key,
                payload,
                priority,
                max_attempts: i64::from(self.settings.max_attempts),
            },
            Utc::now(),
        )
        .await?;
        if created {
            debug!(%id, document_key, "enqueued");
        } else {
            debug!(%id, document_key, "document already queued");
        }
        Ok(EnqueueOutcome { id, created })
    }

    pub async fn enqueue_record(
        &self,
        record: &DocumentRecord,
        priority: i64,
    ) -> Result<EnqueueOutcome> {
        let payload = serde_json::to_string(record)?;
        self.enqueue(&record.document_key, &payload, priority).await
    }

    /// Claim the next eligible item: highest priority first, then oldest.
    pub async fn dequeue(&self) -> Result<Option<QueueItem>> {
        let _guard = self.dequeue_lock.lock().await;
        db::claim_next(&self.pool, Utc::now()).await
    }

    #[instrument(skip_all, fields(id = %id))]
    pub async fn complete(&self, id: &str, delivery: &Delivery) -> Result<()> {
        let updated = db::mark_sent(
            &self.pool,
            id,
            Utc::now(),
            duration_ms(delivery.duration),
            delivery.response_body.as_deref(),
            delivery.status_code.map(i64::from),
        )
        .await?;
        if !updated {
            return Err(anyhow!("item {} is not processing; cannot mark sent", id));
        }
        Ok(())
    }

    /// Record a failed attempt. Items below their attempt ceiling go to `Retry`
    /// with the scheduled delay; the rest are dead-lettered.
    #[instrument(skip_all, fields(id = %id))]
    pub async fn fail(&self, id: &str, failure: &Failure) -> Result<FailureDisposition> {
        let item = db::fetch_item(&self.pool, id)
            .await?
            .ok_or_else(|| anyhow!("item {} not found", id))?;
        if item.status != QueueStatus::Processing {
            return Err(anyhow!(
                "item {} is {}; only processing items can fail",
                id,
                item.status
            ));
        }

        let now = Utc::now();
        let status_code = failure.status_code.map(i64::from);
        if item.attempts >= item.max_attempts {
            let reason = format!(
                "exhausted {} attempts; last error: {}",
                item.attempts, failure.error
            );
            let updated = db::mark_dead_letter(
                &self.pool,
                id,
                now,
                &reason,
                Some(&failure.error),
                failure.response_body.as_deref(),
                status_code,
            )
            .await?;
            if !updated {
                return Err(anyhow!("item {} changed state while dead-lettering", id));
            }
            warn!(id, attempts = item.attempts, error = %failure.error, "dead-lettered");
            return Ok(FailureDisposition::DeadLetter {
                attempts: item.attempts,
                reason,
            });
        }

        let delay = self
            .settings
            .retry
            .delay_for(u32::try_from(item.attempts).unwrap_or(u32::MAX));
        let next_retry_at = now + chrono::Duration::from_std(delay)?;
        let updated = db::mark_retry(
            &self.pool,
            id,
            now,
            next_retry_at,
            &failure.error,
            failure.response_body.as_deref(),
            status_code,
            failure.duration.map(duration_ms),
        )
        .await?;
        if !updated {
            return Err(anyhow!("item {} changed state while scheduling retry", id));
        }
        info!(id, attempts = item.attempts, delay_ms = delay.as_millis() as u64, "retry scheduled");
        Ok(FailureDisposition::Retry {
            attempts: item.attempts,
            next_retry_at,
        })
    }

    /// Explicitly park a processing item as dead-letter with a reason.
    pub async fn dead_letter(&self, id: &str, reason: &str) -> Result<bool> {
        if reason.trim().is_empty() {
            return Err(anyhow!("dead-letter reason must be non-empty"));
        }
        db::mark_dead_letter(&self.pool, id, Utc::now(), reason, None, None, None).await
    }

    /// Park a processing item in `Error` (not transmittable as stored).
    pub async fn mark_error(&self, id: &str, error: &str) -> Result<bool> {
        db::mark_error(&self.pool, id, Utc::now(), error).await
    }

    /// Return items stuck in `Processing` for longer than `stuck_timeout` to `Pending`.
    pub async fn reset_stuck(&self, stuck_timeout: Duration) -> Result<u64> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(stuck_timeout)?;
        let reset = db::reset_stuck(&self.pool, cutoff, now).await?;
        if reset > 0 {
            warn!(reset, "reset stuck processing items");
        }
        Ok(reset)
    }

    /// Return one interrupted `Processing` item to `Pending` without recording
    /// a failure.
    pub async fn release(&self, id: &str) -> Result<bool> {
        db::release_processing(&self.pool, id, Utc::now()).await
    }

    /// Return every `Processing` item to `Pending`; used on graceful shutdown.
    pub async fn reset_processing(&self) -> Result<u64> {
        let _guard = self.dequeue_lock.lock().await;
        db::reset_processing(&self.pool, Utc::now()).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<QueueItem>> {
        db::fetch_item(&self.pool, id).await
    }

    pub async fn get_by_key(&self, document_key: &str) -> Result<Option<QueueItem>> {
        db::fetch_by_key(&self.pool, document_key).await
    }

    pub async fn list(&self, status: QueueStatus, limit: i64, offset: i64) -> Result<Vec<QueueItem>> {
        db::list_by_status(&self.pool, status, limit, offset).await
    }

    pub async fn count(&self, status: QueueStatus) -> Result<i64> {
        db::count_by_status(&self.pool, status).await
    }

    /// Make every `Error` item eligible again through the `Retry` state.
    pub async fn requeue_errors(&self) -> Result<u64> {
        db::requeue_errors(&self.pool, Utc::now()).await
    }

    /// Operator override for an `Error`/`DeadLetter` item: one more full
    /// attempt allowance, eligible immediately.
    pub async fn force_retry(&self, id: &str) -> Result<bool> {
        db::force_retry(
            &self.pool,
            id,
            i64::from(self.settings.max_attempts),
            Utc::now(),
        )
        .await
    }

    /// Delete `Sent` items delivered longer than `retention` ago.
    pub async fn purge_sent(&self, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(retention)?;
        let purged = db::purge_sent_before(&self.pool, cutoff).await?;
        if purged > 0 {
            info!(purged, "purged delivered items");
        }
        Ok(purged)
    }

    pub async fn stats(&self, error_samples: i64) -> Result<QueueStats> {
        let counts = db::count_grouped_by_status(&self.pool).await?;
        let get = |status: QueueStatus| counts.get(&status).copied().unwrap_or(0);
        Ok(QueueStats {
            pending: get(QueueStatus::Pending),
            processing: get(QueueStatus::Processing),
            sent: get(QueueStatus::Sent),
            error: get(QueueStatus::Error),
            retry: get(QueueStatus::Retry),
            dead_letter: get(QueueStatus::DeadLetter),
            oldest_waiting_since: db::oldest_pending_created_at(&self.pool).await?,
            recent_errors: db::recent_errors(&self.pool, error_samples).await?,
        })
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// What happened to one claimed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemResult {
    Sent,
    Retry { attempts: i64 },
    DeadLetter { reason: String },
    Error { error: String },
    /// Shutdown cut the send short; the item went back to `Pending`.
    Released,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub errored: usize,
    pub released: usize,
    pub results: Vec<(String, ItemResult)>,
}

impl DrainReport {
    fn record(&mut self, id: String, result: ItemResult) {
        match &result {
            ItemResult::Sent => self.sent += 1,
            ItemResult::Retry { .. } => self.retried += 1,
            ItemResult::DeadLetter { .. } => self.dead_lettered += 1,
            ItemResult::Error { .. } => self.errored += 1,
            ItemResult::Released => self.released += 1,
        }
        self.results.push((id, result));
    }
}

/// Send one claimed item and feed the outcome back into the queue.
#[instrument(skip_all, fields(id = %item.id, attempts = item.attempts))]
pub async fn process_item(
    queue: &OutboxQueue,
    transmitter: &dyn Transmitter,
    item: &QueueItem,
) -> Result<ItemResult> {
    let record: DocumentRecord = match serde_json::from_str(&item.payload) {
        Ok(record) => record,
        Err(err) => {
            let error = format!("payload is not a document record: {}", err);
            queue.mark_error(&item.id, &error).await?;
            warn!(id = %item.id, %error, "parked in error");
            return Ok(ItemResult::Error { error });
        }
    };

    let outcome = transmitter.send(&record).await;
    apply_outcome(queue, &item.id, &outcome).await
}

async fn apply_outcome(queue: &OutboxQueue, id: &str, outcome: &SendOutcome) -> Result<ItemResult> {
    if outcome.success {
        queue
            .complete(
                id,
                &Delivery {
                    duration: outcome.duration,
                    response_body: outcome.response_body.clone(),
                    status_code: outcome.status_code,
                },
            )
            .await?;
        info!(id, "outbox item delivered");
        return Ok(ItemResult::Sent);
    }

    if outcome.failure == Some(FailureKind::Cancelled) {
        if !queue.release(id).await? {
            return Err(anyhow!("item {} is not processing; cannot release", id));
        }
        info!(id, "send interrupted by shutdown; item released");
        return Ok(ItemResult::Released);
    }

    let failure = Failure {
        error: outcome
            .error
            .clone()
            .unwrap_or_else(|| "transmission failed".to_string()),
        response_body: outcome.response_body.clone(),
        status_code: outcome.status_code,
        duration: Some(outcome.duration),
    };
    match queue.fail(id, &failure).await? {
        FailureDisposition::Retry { attempts, .. } => Ok(ItemResult::Retry { attempts }),
        FailureDisposition::DeadLetter { reason, .. } => Ok(ItemResult::DeadLetter { reason }),
    }
}

/// Claim one item and send it. `None` once the queue has nothing eligible
/// or shutdown has begun.
async fn claim_and_send(
    queue: &OutboxQueue,
    transmitter: &dyn Transmitter,
    cancel: &CancellationToken,
    exhausted: &AtomicBool,
) -> Result<Option<(String, Result<ItemResult>)>> {
    if cancel.is_cancelled() || exhausted.load(Ordering::Acquire) {
        return Ok(None);
    }
    let Some(item) = queue.dequeue().await? else {
        exhausted.store(true, Ordering::Release);
        return Ok(None);
    };
    let result = process_item(queue, transmitter, &item).await;
    Ok(Some((item.id, result)))
}

/// Send up to `batch` items with at most `concurrency` in flight. Each item
/// is claimed only when a send slot frees up, so nothing sits in `Processing`
/// waiting for its turn. No new claims are made once `cancel` fires.
pub async fn drain_batch(
    queue: &OutboxQueue,
    transmitter: &dyn Transmitter,
    batch: usize,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<DrainReport> {
    let exhausted = AtomicBool::new(false);
    let exhausted = &exhausted;
    let claims: Vec<Result<Option<(String, Result<ItemResult>)>>> = stream::iter(0..batch)
        .map(|_| claim_and_send(queue, transmitter, cancel, exhausted))
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut report = DrainReport::default();
    let mut first_err = None;
    for claim in claims {
        match claim {
            Ok(Some((id, Ok(result)))) => {
                report.claimed += 1;
                report.record(id, result);
            }
            Ok(Some((id, Err(err)))) => {
                report.claimed += 1;
                warn!(?err, %id, "failed to record outcome; item stays processing until swept");
                first_err.get_or_insert(err);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(?err, "failed to claim outbox item");
                first_err.get_or_insert(err);
            }
        }
    }
    if report.results.is_empty() {
        if let Some(err) = first_err {
            return Err(err);
        }
    }
    Ok(report)
}
