//! Audit repository trait: the durable store behind the logger
//!
//! Backends (in-memory, JSON-lines file, or an external database adapter)
//! implement `AuditRepository`. The logger depends on nothing beyond this
//! narrow save/query contract.

use crate::error::Result;
use crate::types::{AuditEvent, AuditQuery};
use async_trait::async_trait;

pub mod file;
pub mod memory;

/// Core trait for audit stores
///
/// `save` may fail transiently; the logger retries it. `query` failures are
/// surfaced to the caller as [`AuditError::Search`](crate::AuditError::Search).
#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Durably record one event
    async fn save(&self, event: &AuditEvent) -> Result<()>;

    /// Fetch events matching the criteria, oldest first
    async fn query(&self, criteria: &AuditQuery) -> Result<Vec<AuditEvent>>;

    /// Repository name (e.g., "memory", "file")
    fn name(&self) -> &str;

    /// Health check: returns true if the store is reachable
    ///
    /// Default implementation runs a one-row query.
    async fn health(&self) -> Result<bool> {
        self.query(&AuditQuery::new().limit(1)).await.map(|_| true)
    }
}

/// Keep the newest `limit` events (0 = all) of an oldest-first list
pub(crate) fn apply_limit(mut events: Vec<AuditEvent>, limit: usize) -> Vec<AuditEvent> {
    if limit > 0 && events.len() > limit {
        events.drain(..events.len() - limit);
    }
    events
}
