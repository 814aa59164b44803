//! JSON-lines file audit repository
//!
//! Appends one camelCase JSON object per line. Appends are serialized by a
//! mutex so concurrent saves never interleave within a line, and each save
//! is flushed and synced before it reports success.
//!
//! Writes are at-least-once: a save abandoned by the call timeout may still
//! land, and its retry appends the event again. Queries collapse repeated
//! lines by event id, keeping the first.

use super::{apply_limit, AuditRepository};
use crate::error::{AuditError, Result};
use crate::types::{AuditEvent, AuditQuery};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only audit file
pub struct FileRepository {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRepository {
    /// Create a repository writing to `path`; the file is created on first save
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, line: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line).await?;
        file.flush().await?;
        file.sync_data().await
    }
}

#[async_trait]
impl AuditRepository for FileRepository {
    async fn save(&self, event: &AuditEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        self.append(&line).await.map_err(|e| {
            AuditError::Store(format!(
                "Failed to append to audit file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(event_id = %event.id(), path = %self.path.display(), "Audit event appended");
        Ok(())
    }

    async fn query(&self, criteria: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(AuditError::Search(format!(
                    "Failed to read audit file {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let mut seen = HashSet::new();
        let mut matching = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: AuditEvent = serde_json::from_str(line).map_err(|e| {
                AuditError::Search(format!(
                    "Corrupt record at {}:{}: {}",
                    self.path.display(),
                    line_no + 1,
                    e
                ))
            })?;
            if !seen.insert(event.id().to_string()) {
                continue;
            }
            if criteria.matches(&event) {
                matching.push(event);
            }
        }

        Ok(apply_limit(matching, criteria.limit))
    }

    fn name(&self) -> &str {
        "file"
    }
}
