//! Resilient audit logger
//!
//! `AuditLogger` makes one save attempt per event through the circuit
//! breaker and never surfaces write failures to its caller. Events that
//! cannot be saved go to the retry queue; a background worker drains due
//! entries on a fixed period and either delivers them, reschedules them
//! with backoff, or hands them to the DLQ handler once their retry budget
//! is spent.

use crate::breaker::{CircuitBreakerPolicy, CircuitState};
use crate::config::AuditConfig;
use crate::dlq::{should_dead_letter, DeadLetterEvent, DlqHandler, DropReason, TracingDlqHandler};
use crate::error::{AuditError, Result};
use crate::queue::{EnqueueOutcome, RetryEntry, RetryQueue};
use crate::repository::AuditRepository;
use crate::types::{AuditEvent, AuditQuery};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Delivery notifications for monitoring
#[derive(Debug, Clone)]
pub enum DeliveryNotice {
    /// Background drain worker started
    Started,
    /// Background drain worker stopped
    Stopped,
    /// Event durably saved
    Delivered { event_id: String, attempts: u32 },
    /// Event placed in the retry queue after a failed immediate save
    Queued { event_id: String, error: String },
    /// Event permanently abandoned
    Dropped { event_id: String, reason: DropReason },
    /// Breaker changed mode
    CircuitTransition { from: CircuitState, to: CircuitState },
}

/// Builder for [`AuditLogger`]
///
/// A repository is mandatory; `build` fails fast without one.
#[derive(Default)]
pub struct AuditLoggerBuilder {
    repository: Option<Arc<dyn AuditRepository>>,
    dlq: Option<Arc<dyn DlqHandler>>,
    config: AuditConfig,
}

impl AuditLoggerBuilder {
    pub fn repository(self, repository: impl AuditRepository + 'static) -> Self {
        self.repository_arc(Arc::new(repository))
    }

    /// Use a shared, externally owned repository
    pub fn repository_arc(mut self, repository: Arc<dyn AuditRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn dlq(self, dlq: impl DlqHandler + 'static) -> Self {
        self.dlq_arc(Arc::new(dlq))
    }

    pub fn dlq_arc(mut self, dlq: Arc<dyn DlqHandler>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn config(mut self, config: AuditConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<AuditLogger> {
        let repository = self
            .repository
            .ok_or_else(|| AuditError::Config("an audit repository is required".into()))?;
        self.config.validate()?;

        let (notices, _) = broadcast::channel(256);
        let hook_tx = notices.clone();
        let breaker = CircuitBreakerPolicy::new(self.config.breaker()).with_transition_hook(
            move |from, to| {
                let _ = hook_tx.send(DeliveryNotice::CircuitTransition { from, to });
            },
        );

        tracing::debug!(
            repository = repository.name(),
            max_queue_size = self.config.max_queue_size,
            drain_interval_ms = self.config.drain_interval_ms,
            "Audit logger built"
        );

        Ok(AuditLogger {
            shared: Arc::new(Shared {
                queue: RetryQueue::new(self.config.max_queue_size),
                breaker,
                repository,
                dlq: self.dlq.unwrap_or_else(|| Arc::new(TracingDlqHandler)),
                notices,
                config: self.config,
            }),
            worker: Mutex::new(None),
        })
    }
}

/// Resilient, non-blocking audit event logger
pub struct AuditLogger {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

struct Worker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl AuditLogger {
    pub fn builder() -> AuditLoggerBuilder {
        AuditLoggerBuilder::default()
    }

    /// Create a logger with the default DLQ handler
    pub fn new(repository: impl AuditRepository + 'static, config: AuditConfig) -> Result<Self> {
        Self::builder().repository(repository).config(config).build()
    }

    /// Record an audit event
    ///
    /// Makes at most one save attempt, bounded by the call timeout, and
    /// none at all while the breaker is open. Failures are absorbed into
    /// the retry path; this never returns an error.
    ///
    /// The attempt runs on its own task, so a caller that stops waiting
    /// (timeout, `select!`, abort) does not lose the event: it is still
    /// delivered, queued, or dead-lettered.
    pub async fn log_event(&self, event: AuditEvent) {
        let shared = self.shared.clone();
        let event_id = event.id().to_string();
        let attempt = tokio::spawn(async move { shared.deliver(event).await });

        if let Err(e) = attempt.await {
            tracing::error!(event_id = %event_id, error = %e, "Audit delivery task failed");
        }
    }

    /// Query the audit trail
    ///
    /// Reads bypass the breaker and the retry path: any failure is returned
    /// immediately as [`AuditError::Search`].
    pub async fn query(&self, criteria: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let timeout = self.shared.config.breaker().call_timeout;
        match tokio::time::timeout(timeout, self.shared.repository.query(criteria)).await {
            Ok(Ok(events)) => Ok(events),
            Ok(Err(AuditError::Search(reason))) => Err(AuditError::Search(reason)),
            Ok(Err(e)) => Err(AuditError::Search(e.to_string())),
            Err(_) => Err(AuditError::Search(format!(
                "query exceeded {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Start the background drain worker
    ///
    /// Idempotent. Requires a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AuditError::Config(format!("audit logger needs a Tokio runtime: {}", e)))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = runtime.spawn(run_worker(self.shared.clone(), shutdown_rx));
        *worker = Some(Worker {
            shutdown_tx,
            handle,
        });

        self.shared.notify(DeliveryNotice::Started);
        tracing::info!(
            drain_interval_ms = self.shared.config.drain_interval_ms,
            repository = self.shared.repository.name(),
            "Audit logger started"
        );
        Ok(())
    }

    /// Stop the background drain worker and wait for it to exit
    ///
    /// A drain in progress finishes its current store call and re-enqueues
    /// the untouched remainder. After this returns the worker makes no
    /// further repository calls. Queued entries stay queued.
    pub async fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        let _ = worker.shutdown_tx.send(true);
        if let Err(e) = worker.handle.await {
            tracing::error!(error = %e, "Audit drain worker terminated abnormally");
        }

        tracing::info!(pending = self.shared.queue.len(), "Audit logger stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Subscribe to delivery notifications
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryNotice> {
        self.shared.notices.subscribe()
    }

    /// Number of events awaiting retry
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Whether an event is currently waiting in the retry queue
    pub fn is_pending(&self, event_id: &str) -> bool {
        self.shared.queue.contains(event_id)
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.shared.breaker.state()
    }

    pub fn config(&self) -> &AuditConfig {
        &self.shared.config
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            let _ = worker.shutdown_tx.send(true);
        }

        let pending = self.shared.queue.len();
        if pending > 0 {
            tracing::warn!(pending, "Audit logger dropped with undelivered events");
        }
    }
}

/// Tally of one drain pass
#[derive(Debug, Default, PartialEq, Eq)]
struct DrainReport {
    delivered: usize,
    requeued: usize,
    deferred: usize,
    dropped: usize,
}

impl DrainReport {
    fn is_empty(&self) -> bool {
        *self == DrainReport::default()
    }
}

struct Shared {
    repository: Arc<dyn AuditRepository>,
    breaker: CircuitBreakerPolicy,
    queue: RetryQueue,
    dlq: Arc<dyn DlqHandler>,
    notices: broadcast::Sender<DeliveryNotice>,
    config: AuditConfig,
}

impl Shared {
    fn notify(&self, notice: DeliveryNotice) {
        let _ = self.notices.send(notice);
    }

    /// Immediate save attempt for a freshly logged event
    async fn deliver(&self, event: AuditEvent) {
        let result = self
            .breaker
            .execute(|| self.repository.save(&event))
            .await;

        match result {
            Ok(()) => {
                tracing::debug!(event_id = %event.id(), action = %event.action(), "Audit event delivered");
                self.notify(DeliveryNotice::Delivered {
                    event_id: event.id().to_string(),
                    attempts: 0,
                });
            }
            Err(e) if is_retryable(&e) => {
                let delay = match e {
                    AuditError::CircuitOpen { retry_after } => retry_after,
                    _ => self.breaker.backoff(0),
                };
                tracing::debug!(event_id = %event.id(), error = %e, "Audit event queued for retry");
                self.notify(DeliveryNotice::Queued {
                    event_id: event.id().to_string(),
                    error: e.to_string(),
                });
                self.requeue(RetryEntry::new(event, Instant::now() + delay, e.to_string()))
                    .await;
            }
            Err(e) => {
                let entry = RetryEntry::new(event, Instant::now(), e.to_string());
                self.dead_letter(entry, DropReason::Rejected).await;
            }
        }
    }

    /// Retry every due entry once
    ///
    /// Stops early when shutdown is signalled, putting unattempted entries
    /// back unchanged.
    async fn drain(&self, shutdown: &watch::Receiver<bool>) -> DrainReport {
        let mut report = DrainReport::default();
        let mut due = self.queue.drain_due(Instant::now()).into_iter();

        while let Some(mut entry) = due.next() {
            if *shutdown.borrow() {
                report.deferred += 1;
                self.requeue(entry).await;
                for rest in due.by_ref() {
                    report.deferred += 1;
                    self.requeue(rest).await;
                }
                break;
            }

            let result = self
                .breaker
                .execute(|| self.repository.save(entry.event()))
                .await;

            match result {
                Ok(()) => {
                    report.delivered += 1;
                    tracing::info!(
                        event_id = %entry.event().id(),
                        attempts = entry.attempts + 1,
                        "Queued audit event delivered"
                    );
                    self.notify(DeliveryNotice::Delivered {
                        event_id: entry.event().id().to_string(),
                        attempts: entry.attempts + 1,
                    });
                }
                Err(AuditError::CircuitOpen { retry_after }) => {
                    // No store call was made, so no attempt is consumed
                    report.deferred += 1;
                    entry.next_eligible = Instant::now() + retry_after;
                    self.requeue(entry).await;
                }
                Err(e) if e.is_transient() => {
                    entry.attempts += 1;
                    entry.last_error = e.to_string();

                    if should_dead_letter(entry.attempts, self.config.max_attempts) {
                        report.dropped += 1;
                        self.dead_letter(entry, DropReason::RetriesExhausted).await;
                    } else {
                        report.requeued += 1;
                        entry.next_eligible = Instant::now() + self.breaker.backoff(entry.attempts);
                        tracing::debug!(
                            event_id = %entry.event().id(),
                            attempts = entry.attempts,
                            error = %e,
                            "Audit event retry failed"
                        );
                        self.requeue(entry).await;
                    }
                }
                Err(e) => {
                    report.dropped += 1;
                    entry.last_error = e.to_string();
                    self.dead_letter(entry, DropReason::Rejected).await;
                }
            }
        }

        if !report.is_empty() {
            tracing::info!(
                delivered = report.delivered,
                requeued = report.requeued,
                deferred = report.deferred,
                dropped = report.dropped,
                pending = self.queue.len(),
                "Audit retry drain completed"
            );
        }
        report
    }

    async fn requeue(&self, entry: RetryEntry) {
        match self.queue.enqueue(entry) {
            EnqueueOutcome::Queued => {}
            EnqueueOutcome::Evicted(oldest) => {
                self.dead_letter(oldest, DropReason::Evicted).await;
            }
            EnqueueOutcome::Merged => {
                tracing::debug!("Audit event already queued; retry state merged");
            }
        }
    }

    async fn dead_letter(&self, entry: RetryEntry, reason: DropReason) {
        let attempts = entry.attempts;
        let last_error = entry.last_error.clone();
        let event = entry.into_event();
        let event_id = event.id().to_string();

        let dle = DeadLetterEvent::new(event, reason, attempts, last_error);
        if let Err(e) = self.dlq.handle(dle).await {
            tracing::error!(
                event_id = %event_id,
                reason = %reason,
                error = %e,
                "DLQ handler failed; audit event lost"
            );
        }

        self.notify(DeliveryNotice::Dropped { event_id, reason });
    }
}

fn is_retryable(error: &AuditError) -> bool {
    matches!(error, AuditError::CircuitOpen { .. }) || error.is_transient()
}

async fn run_worker(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let period = shared.config.drain_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        if *shutdown.borrow() {
            break;
        }
        shared.drain(&shutdown).await;
    }

    shared.notify(DeliveryNotice::Stopped);
    tracing::debug!("Audit drain worker exited");
}
