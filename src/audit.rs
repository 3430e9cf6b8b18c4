//! Build audit trail
//!
//! Appends one JSON line per build lifecycle event to the audit log in the
//! state directory. Write failures are logged and never fail a build.

use crate::build::BuildRecord;
use crate::config::{schema::Config, ConfigManager};
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Build lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    BuildStarted,
    BuildSucceeded,
    BuildFailed,
    BuildRejected,
    DrainStarted,
    DrainCompleted,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuildStarted => "build.started",
            Self::BuildSucceeded => "build.succeeded",
            Self::BuildFailed => "build.failed",
            Self::BuildRejected => "build.rejected",
            Self::DrainStarted => "drain.started",
            Self::DrainCompleted => "drain.completed",
        }
    }
}

/// Append-only JSON lines logger
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
}

impl AuditLog {
    pub fn new(config: &Config) -> Self {
        Self::with_path(config.general.audit_log, ConfigManager::audit_log_path())
    }

    pub fn with_path(enabled: bool, path: impl Into<PathBuf>) -> Self {
        Self {
            enabled,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Record an event carrying a build's current record
    pub async fn record(&self, event: AuditEvent, record: &BuildRecord) {
        let data = json!({
            "build_id": record.id,
            "image": record.image,
            "status": record.status,
            "output": record.output,
            "rootfs_size": record.rootfs_size,
            "cache_key": record.cache_key,
            "error": record.error,
            "duration_ms": record.duration().num_milliseconds(),
        });
        self.log(event, &data).await;
    }

    pub async fn log(&self, event: AuditEvent, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event.as_str(),
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write audit log {}: {}", self.path.display(), e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}
