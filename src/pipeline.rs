//! Orchestrator: wires detection, debounce, parsing, the outbox and the
//! transmission client into one lifecycle.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::debounce::{DebounceCoordinator, DebounceSettings, ReadyFile, ReadyFileHandler};
use crate::model::{PipelineEvent, WatchedFolder};
use crate::outbox::{self, DrainReport, ItemResult, OutboxQueue};
use crate::parser::DocumentParser;
use crate::transmit::{self, Transmitter};
use crate::watcher::ChangeDetector;

const EVENT_CAPACITY: usize = 256;

/// Holds a busy flag for one tick's worth of work; clears it on drop, so a
/// panicking task does not wedge later ticks.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub debounce: DebounceSettings,
    pub reinstall_delay: Duration,
    pub drain_interval: Duration,
    pub drain_batch: usize,
    pub send_concurrency: usize,
    pub stuck_timeout: Duration,
    pub sweep_interval: Duration,
    pub sent_retention: Duration,
    pub health_interval: Duration,
    pub health_min_spacing: Duration,
    pub priority: i64,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            debounce: DebounceSettings::from_config(&cfg.watch),
            reinstall_delay: Duration::from_secs(cfg.watch.reinstall_delay_secs),
            drain_interval: Duration::from_secs(cfg.queue.drain_interval_secs),
            drain_batch: cfg.queue.drain_batch,
            send_concurrency: cfg.transmission.send_concurrency,
            stuck_timeout: Duration::from_secs(cfg.queue.stuck_timeout_secs),
            sweep_interval: Duration::from_secs(cfg.queue.sweep_interval_secs),
            sent_retention: Duration::from_secs(u64::from(cfg.queue.sent_retention_days) * 86_400),
            health_interval: Duration::from_secs(cfg.transmission.health_interval_secs),
            health_min_spacing: Duration::from_secs(cfg.transmission.health_min_spacing_secs),
            priority: 0,
        }
    }
}

/// Parses ready files and enqueues the resulting records.
pub struct EnqueueHandler {
    parser: Arc<dyn DocumentParser>,
    queue: OutboxQueue,
    events: broadcast::Sender<PipelineEvent>,
    priority: i64,
}

impl EnqueueHandler {
    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ReadyFileHandler for EnqueueHandler {
    async fn handle(&self, file: ReadyFile) -> Result<()> {
        self.emit(PipelineEvent::FileReady {
            path: file.path.clone(),
            content_hash: file.content_hash.clone(),
        });

        let parsed = match self.parser.parse(&file.path).await {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(path = %file.path.display(), error = %err, "failed to parse document");
                self.emit(PipelineEvent::ProcessingFailed {
                    path: file.path,
                    error: err.to_string(),
                });
                return Ok(());
            }
        };

        let outcome = self
            .queue
            .enqueue_record(&parsed.record, self.priority)
            .await
            .with_context(|| format!("failed to enqueue {}", file.path.display()))?;
        let document_key = parsed.record.document_key;
        if outcome.created {
            info!(id = %outcome.id, %document_key, "document enqueued");
            self.emit(PipelineEvent::Enqueued {
                id: outcome.id,
                document_key,
            });
        } else {
            info!(id = %outcome.id, %document_key, "document already queued");
            self.emit(PipelineEvent::Duplicate {
                id: outcome.id,
                document_key,
            });
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Pipeline {
    settings: PipelineSettings,
    queue: OutboxQueue,
    transmitter: Arc<dyn Transmitter>,
    parser: Arc<dyn DocumentParser>,
    events: broadcast::Sender<PipelineEvent>,
    draining: Arc<AtomicBool>,
    sweeping: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        queue: OutboxQueue,
        transmitter: Arc<dyn Transmitter>,
        parser: Arc<dyn DocumentParser>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings,
            queue,
            transmitter,
            parser,
            events,
            draining: Arc::new(AtomicBool::new(false)),
            sweeping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &OutboxQueue {
        &self.queue
    }

    pub fn handler(&self) -> EnqueueHandler {
        EnqueueHandler {
            parser: self.parser.clone(),
            queue: self.queue.clone(),
            events: self.events.clone(),
            priority: self.settings.priority,
        }
    }

    /// Drain one batch. Returns `None` without touching the queue when another
    /// drain is still running.
    pub async fn drain_once(&self) -> Result<Option<DrainReport>> {
        self.drain(&CancellationToken::new()).await
    }

    async fn drain(&self, cancel: &CancellationToken) -> Result<Option<DrainReport>> {
        let Some(_busy) = BusyGuard::acquire(&self.draining) else {
            debug!("previous drain still running; skipping tick");
            return Ok(None);
        };
        let report = outbox::drain_batch(
            &self.queue,
            self.transmitter.as_ref(),
            self.settings.drain_batch,
            self.settings.send_concurrency,
            cancel,
        )
        .await?;

        for (id, result) in &report.results {
            let event = match result {
                ItemResult::Sent => PipelineEvent::Sent { id: id.clone() },
                ItemResult::Retry { attempts } => PipelineEvent::Retrying {
                    id: id.clone(),
                    attempts: *attempts,
                },
                ItemResult::DeadLetter { reason } => PipelineEvent::DeadLettered {
                    id: id.clone(),
                    reason: reason.clone(),
                },
                ItemResult::Error { .. } | ItemResult::Released => continue,
            };
            let _ = self.events.send(event);
        }
        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                sent = report.sent,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                errored = report.errored,
                released = report.released,
                "drain finished"
            );
        }
        Ok(Some(report))
    }

    /// Reset stuck items and purge old deliveries. Returns `None` when a
    /// previous sweep is still running.
    pub async fn sweep_once(&self) -> Result<Option<(u64, u64)>> {
        let Some(_busy) = BusyGuard::acquire(&self.sweeping) else {
            debug!("previous sweep still running; skipping tick");
            return Ok(None);
        };
        let reset = self.queue.reset_stuck(self.settings.stuck_timeout).await?;
        let purged = self.queue.purge_sent(self.settings.sent_retention).await?;
        Ok(Some((reset, purged)))
    }

    /// Run until `cancel` fires, then shut down in order: stop watches, flush
    /// the coordinator, wait for drains and sweeps, then return processing
    /// items to pending.
    pub async fn run(&self, folders: &[WatchedFolder], cancel: CancellationToken) -> Result<()> {
        let recovered = self.queue.reset_processing().await?;
        if recovered > 0 {
            warn!(recovered, "returned items left processing by a previous run");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let detector = ChangeDetector::new(tx, self.settings.reinstall_delay);
        let report = detector.start(folders);
        info!(
            watching = report.watching.len(),
            skipped = report.skipped.len(),
            "change detector started"
        );

        let coordinator = DebounceCoordinator::new(
            self.settings.debounce.clone(),
            rx,
            Arc::new(self.handler()),
        );
        let coordinator_cancel = CancellationToken::new();
        let coordinator_task = tokio::spawn(coordinator.run(coordinator_cancel.clone()));

        let health_cancel = cancel.child_token();
        let health_task = tokio::spawn(transmit::run_health_monitor(
            self.transmitter.clone(),
            self.settings.health_interval,
            self.settings.health_min_spacing,
            health_cancel.clone(),
        ));

        let mut drain_tick = tokio::time::interval(self.settings.drain_interval);
        drain_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sweep_tick = tokio::time::interval(self.settings.sweep_interval);
        sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = drain_tick.tick() => {
                    if self.draining.load(Ordering::Acquire) {
                        debug!("drain in progress; tick skipped");
                        continue;
                    }
                    let pipeline = self.clone();
                    let cancel = cancel.clone();
                    tasks.spawn(async move {
                        if let Err(err) = pipeline.drain(&cancel).await {
                            error!(?err, "drain failed");
                        }
                    });
                }
                _ = sweep_tick.tick() => {
                    if self.sweeping.load(Ordering::Acquire) {
                        debug!("sweep in progress; tick skipped");
                        continue;
                    }
                    let pipeline = self.clone();
                    tasks.spawn(async move {
                        if let Err(err) = pipeline.sweep_once().await {
                            error!(?err, "maintenance sweep failed");
                        }
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        error!(?err, "pipeline task failed");
                    }
                }
            }
        }

        info!("shutting down pipeline");
        detector.stop();
        coordinator_cancel.cancel();
        match coordinator_task.await {
            Ok(report) => debug!(?report, "coordinator flushed"),
            Err(err) => error!(?err, "coordinator task failed"),
        }
        health_cancel.cancel();
        let _ = health_task.await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(?err, "pipeline task failed");
            }
        }
        let reset = self.queue.reset_processing().await?;
        if reset > 0 {
            info!(reset, "returned in-flight items to pending");
        }
        Ok(())
    }
}
