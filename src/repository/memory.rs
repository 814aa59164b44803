//! In-memory audit repository for testing and single-process use

use super::{apply_limit, AuditRepository};
use crate::error::Result;
use crate::types::{AuditEvent, AuditQuery};
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Configuration for the in-memory repository
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum events retained; older events are discarded first (0 = unbounded)
    pub max_events: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
        }
    }
}

/// Audit repository backed by a `Vec`
///
/// Events are lost on drop. Useful as a test double and for local tooling.
#[derive(Default)]
pub struct MemoryRepository {
    events: RwLock<Vec<AuditEvent>>,
    config: MemoryConfig,
}

impl MemoryRepository {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            config,
        }
    }

    /// Number of stored events
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    /// Look up a stored event by id
    pub async fn get(&self, event_id: &str) -> Option<AuditEvent> {
        let events = self.events.read().await;
        events.iter().find(|e| e.id() == event_id).cloned()
    }
}

#[async_trait]
impl AuditRepository for MemoryRepository {
    async fn save(&self, event: &AuditEvent) -> Result<()> {
        let mut events = self.events.write().await;
        events.push(event.clone());

        if self.config.max_events > 0 && events.len() > self.config.max_events {
            let drain_count = events.len() - self.config.max_events;
            events.drain(..drain_count);
        }

        tracing::debug!(event_id = %event.id(), action = %event.action(), "Audit event stored");
        Ok(())
    }

    async fn query(&self, criteria: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let events = self.events.read().await;
        let matching = events
            .iter()
            .filter(|e| criteria.matches(e))
            .cloned()
            .collect();
        Ok(apply_limit(matching, criteria.limit))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_query() {
        let repo = MemoryRepository::default();
        let login = AuditEvent::new("user:alice", "user.login", serde_json::json!({}));
        let grant = AuditEvent::new("user:root", "role.grant", serde_json::json!({"role": "ops"}));

        repo.save(&login).await.unwrap();
        repo.save(&grant).await.unwrap();

        assert_eq!(repo.len().await, 2);
        let found = repo.query(&AuditQuery::new().actor("user:root")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].details()["role"], "ops");

        assert_eq!(repo.get(login.id()).await.unwrap(), login);
    }

    #[tokio::test]
    async fn test_query_limit_returns_newest() {
        let repo = MemoryRepository::default();
        for i in 0..10 {
            repo.save(&AuditEvent::new("svc", format!("step.{}", i), serde_json::json!({})))
                .await
                .unwrap();
        }

        let found = repo.query(&AuditQuery::new().limit(3)).await.unwrap();
        let actions: Vec<&str> = found.iter().map(|e| e.action()).collect();
        assert_eq!(actions, vec!["step.7", "step.8", "step.9"]);
    }

    #[tokio::test]
    async fn test_max_events_discards_oldest() {
        let repo = MemoryRepository::new(MemoryConfig { max_events: 2 });
        for i in 0..4 {
            repo.save(&AuditEvent::new("svc", format!("a{}", i), serde_json::json!({})))
                .await
                .unwrap();
        }

        let all = repo.query(&AuditQuery::new()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].action(), "a2");
    }

    #[tokio::test]
    async fn test_health() {
        let repo = MemoryRepository::default();
        assert!(repo.health().await.unwrap());
        assert_eq!(repo.name(), "memory");
        assert!(repo.is_empty().await);
    }
}
