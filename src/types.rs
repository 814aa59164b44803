//! Core audit types
//!
//! All types use camelCase JSON serialization for wire compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single audit record
///
/// Built once by the originating caller and never mutated afterwards:
/// fields are private and only construction-time builders take `self`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Unique event identifier (aud-<uuid>)
    id: String,

    /// Identity of the user or system performing the action
    actor: String,

    /// Symbolic action name (e.g., "user.login", "policy.update")
    action: String,

    /// When the action occurred
    timestamp: DateTime<Utc>,

    /// Structured payload, opaque to the delivery core
    details: serde_json::Value,

    /// Optional key-value metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    metadata: HashMap<String, String>,
}

impl AuditEvent {
    /// Create a new event with auto-generated id and the current timestamp
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("aud-{}", uuid::Uuid::new_v4()),
            actor: actor.into(),
            action: action.into(),
            timestamp: Utc::now(),
            details,
            metadata: HashMap::new(),
        }
    }

    /// Override the occurrence time (e.g., when replaying an upstream record)
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn details(&self) -> &serde_json::Value {
        &self.details
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

/// Criteria for querying the audit trail
///
/// Every populated field must match. A `limit` of 0 means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Inclusive lower bound on the event timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,

    /// Exclusive upper bound on the event timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,

    #[serde(default)]
    pub limit: usize,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Check whether an event satisfies every populated criterion
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(ref actor) = self.actor {
            if event.actor() != actor {
                return false;
            }
        }
        if let Some(ref action) = self.action {
            if event.action() != action {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp() < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp() >= until {
                return false;
            }
        }
        true
    }
}
