//! Dead letter handling: terminal drops of audit events
//!
//! An audit event is never discarded without a signal. Whenever the logger
//! gives up on an event (retry budget exhausted, evicted from a full retry
//! queue, or rejected by the store as unretryable) it hands a
//! [`DeadLetterEvent`] to a `DlqHandler`.

use crate::error::Result;
use crate::types::AuditEvent;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Why an event was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Failed drain attempts reached the per-entry maximum
    RetriesExhausted,
    /// Displaced by a newer event while the retry queue was full
    Evicted,
    /// The store returned an error that retrying cannot fix
    Rejected,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DropReason::RetriesExhausted => "retries exhausted",
            DropReason::Evicted => "evicted from full retry queue",
            DropReason::Rejected => "rejected by store",
        })
    }
}

/// A permanently dropped event with context about why
#[derive(Debug, Clone)]
pub struct DeadLetterEvent {
    /// The original audit event
    pub event: AuditEvent,

    /// Reason the event was dropped
    pub reason: DropReason,

    /// Failed drain attempts at the time of the drop
    pub attempts: u32,

    /// Last failure reported by the store
    pub last_error: String,

    /// Unix timestamp in milliseconds when the event was dropped
    pub dead_lettered_at: u64,
}

impl DeadLetterEvent {
    /// Create a new dead letter event
    pub fn new(
        event: AuditEvent,
        reason: DropReason,
        attempts: u32,
        last_error: impl Into<String>,
    ) -> Self {
        Self {
            event,
            reason,
            attempts,
            last_error: last_error.into(),
            dead_lettered_at: now_millis(),
        }
    }
}

/// Trait for dead letter handlers
///
/// Implementations decide what to do with events the logger abandoned:
/// log them, persist them elsewhere, or page someone.
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Handle a dropped event
    async fn handle(&self, event: DeadLetterEvent) -> Result<()>;

    /// Get the number of events currently held
    async fn count(&self) -> Result<usize>;

    /// List recent dropped events, most recent first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEvent>>;
}

/// DLQ handler that only emits an error-level tracing event
///
/// The default when no handler is configured.
#[derive(Debug, Default)]
pub struct TracingDlqHandler;

#[async_trait]
impl DlqHandler for TracingDlqHandler {
    async fn handle(&self, event: DeadLetterEvent) -> Result<()> {
        tracing::error!(
            event_id = %event.event.id(),
            actor = %event.event.actor(),
            action = %event.event.action(),
            attempts = event.attempts,
            reason = %event.reason,
            last_error = %event.last_error,
            "Audit event dropped"
        );
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(0)
    }

    async fn list(&self, _limit: usize) -> Result<Vec<DeadLetterEvent>> {
        Ok(Vec::new())
    }
}

/// In-memory DLQ handler for development and testing
///
/// Stores dropped events in a `Vec` with configurable max capacity.
pub struct MemoryDlqHandler {
    events: Arc<RwLock<Vec<DeadLetterEvent>>>,
    max_events: usize,
}

impl MemoryDlqHandler {
    /// Create a new in-memory DLQ handler
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            max_events,
        }
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, event: DeadLetterEvent) -> Result<()> {
        tracing::warn!(
            event_id = %event.event.id(),
            attempts = event.attempts,
            reason = %event.reason,
            "Audit event dead-lettered"
        );

        let mut events = self.events.write().await;
        events.push(event);

        if self.max_events > 0 && events.len() > self.max_events {
            let drain_count = events.len() - self.max_events;
            events.drain(..drain_count);
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let events = self.events.read().await;
        Ok(events.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEvent>> {
        let events = self.events.read().await;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}

/// Check if an entry has used up its retry budget
///
/// `max_attempts` of 0 means unlimited.
pub fn should_dead_letter(attempts: u32, max_attempts: u32) -> bool {
    max_attempts > 0 && attempts >= max_attempts
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
