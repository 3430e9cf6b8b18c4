//! Build records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Build status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl BuildStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What to build
#[derive(Debug, Clone)]
pub struct BuildSpec {
    /// Opaque build identity
    pub build_id: String,

    /// Image reference to build from
    pub image: String,

    /// Where the rootfs image is written
    pub output: PathBuf,

    /// Hard ceiling for the rootfs image
    pub max_bytes: u64,
}

impl BuildSpec {
    pub fn new(
        build_id: impl Into<String>,
        image: impl Into<String>,
        output: impl Into<PathBuf>,
        max_bytes: u64,
    ) -> Self {
        Self {
            build_id: build_id.into(),
            image: image.into(),
            output: output.into(),
            max_bytes,
        }
    }
}

/// Build record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Build identity
    pub id: String,

    /// Image reference
    pub image: String,

    /// Destination of the rootfs image
    pub output: PathBuf,

    /// Current status
    pub status: BuildStatus,

    /// When the build was registered
    pub started_at: DateTime<Utc>,

    /// When the record last changed
    pub updated_at: DateTime<Utc>,

    /// When the build finished
    pub finished_at: Option<DateTime<Utc>>,

    /// Compressed image size reported by the registry
    pub image_size: Option<u64>,

    /// Size of the produced rootfs image
    pub rootfs_size: Option<u64>,

    /// Cache key of the stored artifact
    pub cache_key: Option<String>,

    /// Failure reason
    pub error: Option<String>,
}

impl BuildRecord {
    pub fn new(spec: &BuildSpec) -> Self {
        let now = Utc::now();
        Self {
            id: spec.build_id.clone(),
            image: spec.image.clone(),
            output: spec.output.clone(),
            status: BuildStatus::Pending,
            started_at: now,
            updated_at: now,
            finished_at: None,
            image_size: None,
            rootfs_size: None,
            cache_key: None,
            error: None,
        }
    }

    pub fn set_status(&mut self, status: BuildStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_finished() {
            self.finished_at = Some(now);
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
        self.set_status(BuildStatus::Failed);
    }

    /// Wall time since registration, up to completion if finished
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> BuildSpec {
        BuildSpec::new("b1", "alpine:3.19", "/tmp/rootfs.ext4", 1 << 30)
    }

    #[test]
    fn record_new() {
        let record = BuildRecord::new(&spec());
        assert_eq!(record.id, "b1");
        assert_eq!(record.status, BuildStatus::Pending);
        assert!(record.finished_at.is_none());
    }

    #[test]
    fn fail_marks_finished() {
        let mut record = BuildRecord::new(&spec());
        record.set_status(BuildStatus::Running);
        assert!(record.finished_at.is_none());

        record.fail("exceeded");
        assert_eq!(record.status, BuildStatus::Failed);
        assert!(record.status.is_finished());
        assert!(record.finished_at.is_some());
        assert_eq!(record.error.as_deref(), Some("exceeded"));
    }

    #[test]
    fn record_serialize() {
        let record = BuildRecord::new(&spec());
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"pending\""));

        let parsed: BuildRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.image, "alpine:3.19");
    }
}
