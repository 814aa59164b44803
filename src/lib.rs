//! # a3s-audit
//!
//! Resilient audit event delivery for the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-audit` records compliance and security audit events against a
//! backing store that may be transiently unavailable. Callers never block
//! beyond a single bounded save attempt and never see write errors: failed
//! events wait in a bounded retry queue and are redelivered in the
//! background, while a circuit breaker keeps a failing store from being
//! hammered.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_audit::{AuditConfig, AuditEvent, AuditLogger, AuditQuery, MemoryRepository};
//!
//! # async fn example() -> a3s_audit::Result<()> {
//! let logger = AuditLogger::new(MemoryRepository::default(), AuditConfig::default())?;
//! logger.start()?;
//!
//! logger
//!     .log_event(AuditEvent::new(
//!         "user:alice",
//!         "role.grant",
//!         serde_json::json!({"role": "admin", "target": "user:bob"}),
//!     ))
//!     .await;
//!
//! let grants = logger.query(&AuditQuery::new().action("role.grant")).await?;
//! println!("{} grants recorded", grants.len());
//!
//! logger.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **AuditLogger**: fire-and-forget `log_event`, background retry drain,
//!   deterministic `stop`, and query delegation
//! - **CircuitBreakerPolicy**: `Closed | Open | HalfOpen` state machine with
//!   exponential backoff and jitter
//! - **RetryQueue**: bounded in-memory queue with oldest-first eviction
//! - **AuditRepository** trait: the durable store (memory and JSON-lines
//!   file implementations included)
//! - **DlqHandler** trait: receives every permanently dropped event

pub mod breaker;
pub mod config;
pub mod dlq;
pub mod error;
pub mod logger;
pub mod queue;
pub mod repository;
pub mod types;

pub use breaker::{
    BreakerConfig, BreakerState, CircuitBreakerPolicy, CircuitState, Outcome, Ticket,
};
pub use config::AuditConfig;
pub use dlq::{DeadLetterEvent, DlqHandler, DropReason, MemoryDlqHandler, TracingDlqHandler};
pub use error::{AuditError, Result};
pub use logger::{AuditLogger, AuditLoggerBuilder, DeliveryNotice};
pub use queue::{EnqueueOutcome, EntryId, RetryEntry, RetryQueue};
pub use repository::AuditRepository;
pub use types::{AuditEvent, AuditQuery};

// Re-export repositories for convenience
pub use repository::file::FileRepository;
pub use repository::memory::{MemoryConfig, MemoryRepository};
