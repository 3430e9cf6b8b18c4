//! Template build pipeline
//!
//! fetch → size report → materialize → upload → cache

use crate::audit::{AuditEvent, AuditLog};
use crate::build::coordinator::{BuildCoordinator, BuildHandle};
use crate::build::record::{BuildSpec, BuildStatus};
use crate::diff::{storage_key, Diff, DiffCache, DiffKind};
use crate::error::RootsmithResult;
use crate::registry::{image_size, ImageSource, Platform};
use crate::rootfs::Materializer;
use crate::storage::ObjectStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Result of a successful build
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub build_id: String,
    /// Compressed image size reported by the registry
    pub image_size: u64,
    pub rootfs_size: u64,
    pub output: PathBuf,
    pub diff: Arc<Diff>,
}

/// Runs builds against one registry, store and cache
pub struct TemplateBuilder {
    source: Arc<dyn ImageSource>,
    materializer: Materializer,
    cache: DiffCache,
    store: Arc<dyn ObjectStore>,
    platform: Platform,
    block_size: u64,
    audit: Option<Arc<AuditLog>>,
}

impl TemplateBuilder {
    pub fn new(
        source: Arc<dyn ImageSource>,
        materializer: Materializer,
        cache: DiffCache,
        store: Arc<dyn ObjectStore>,
        platform: Platform,
        block_size: u64,
    ) -> Self {
        Self {
            source,
            materializer,
            cache,
            store,
            platform,
            block_size,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn cache(&self) -> &DiffCache {
        &self.cache
    }

    /// Run the stages for an accepted build
    #[instrument(skip_all, fields(build_id = %handle.build_id()))]
    pub async fn build(
        &self,
        handle: &BuildHandle,
        cancel: &CancellationToken,
    ) -> RootsmithResult<BuildOutput> {
        let spec = handle.spec();
        handle.update(|record| record.set_status(BuildStatus::Running));

        let image = self
            .source
            .fetch_image(&spec.image, &self.platform, cancel)
            .await?;

        let image_size = image_size(&image)?;
        info!(image_size, layers = image.layers.len(), "Image fetched");
        handle.update(|record| record.image_size = Some(image_size));

        let rootfs_size = self
            .materializer
            .materialize(Arc::new(image), &spec.output, spec.max_bytes, cancel)
            .await?;
        handle.update(|record| record.rootfs_size = Some(rootfs_size));

        let key = storage_key(&spec.build_id, DiffKind::Snapshot);
        self.store.upload_file(&key, &spec.output).await?;
        info!(key, "Rootfs uploaded");

        let diff = self
            .cache
            .put_file(&spec.build_id, DiffKind::Snapshot, self.block_size, &spec.output)
            .await?;
        let cache_key = diff.cache_key();
        handle.update(|record| record.cache_key = Some(cache_key));

        Ok(BuildOutput {
            build_id: spec.build_id.clone(),
            image_size,
            rootfs_size,
            output: spec.output.clone(),
            diff,
        })
    }

    /// Register, build and finish, auditing each transition
    pub async fn run(
        &self,
        coordinator: &BuildCoordinator,
        spec: BuildSpec,
        cancel: &CancellationToken,
    ) -> RootsmithResult<BuildOutput> {
        let build_id = spec.build_id.clone();

        let handle = match coordinator.start_build(spec) {
            Ok(handle) => handle,
            Err(e) => {
                self.audit_event(AuditEvent::BuildRejected, &build_id, Some(&e.to_string()))
                    .await;
                return Err(e);
            }
        };
        self.audit_record(coordinator, AuditEvent::BuildStarted, &build_id)
            .await;

        let result = self.build(&handle, cancel).await;
        coordinator.finish_build(handle, &result);

        let event = if result.is_ok() {
            AuditEvent::BuildSucceeded
        } else {
            AuditEvent::BuildFailed
        };
        self.audit_record(coordinator, event, &build_id).await;

        result
    }

    async fn audit_record(&self, coordinator: &BuildCoordinator, event: AuditEvent, id: &str) {
        let Some(audit) = &self.audit else {
            return;
        };
        if let Ok(record) = coordinator.build_status(id) {
            audit.record(event, &record).await;
        }
    }

    async fn audit_event(&self, event: AuditEvent, id: &str, reason: Option<&str>) {
        if let Some(audit) = &self.audit {
            audit
                .log(event, &serde_json::json!({ "build_id": id, "reason": reason }))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RootsmithError;
    use crate::registry::OciImage;
    use crate::rootfs::testutil::{image, LayerBuilder, ListingWriter};
    use crate::storage::FsObjectStore;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Serves one canned image, or fails like an unreachable registry
    struct FakeSource {
        image: Option<OciImage>,
    }

    #[async_trait]
    impl ImageSource for FakeSource {
        async fn fetch_image(
            &self,
            reference: &str,
            _platform: &Platform,
            cancel: &CancellationToken,
        ) -> RootsmithResult<OciImage> {
            if cancel.is_cancelled() {
                return Err(RootsmithError::Canceled(reference.to_string()));
            }
            self.image.clone().ok_or_else(|| RootsmithError::ImagePull {
                image: reference.to_string(),
                reason: "connection refused".to_string(),
            })
        }
    }

    struct Fixture {
        temp: TempDir,
        store: Arc<FsObjectStore>,
        builder: TemplateBuilder,
        coordinator: BuildCoordinator,
    }

    fn fixture(image: Option<OciImage>) -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FsObjectStore::new(temp.path().join("store")));
        let cache = DiffCache::new(
            temp.path().join("build"),
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            Duration::from_secs(25 * 3600),
            Duration::from_secs(60),
        )
        .unwrap();

        let builder = TemplateBuilder::new(
            Arc::new(FakeSource { image }),
            Materializer::new(Arc::new(ListingWriter)),
            cache,
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            Platform::linux_amd64(),
            4096,
        )
        .with_audit(Arc::new(AuditLog::with_path(true, temp.path().join("audit.log"))));

        Fixture {
            temp,
            store,
            builder,
            coordinator: BuildCoordinator::with_delays(Duration::ZERO, Duration::ZERO),
        }
    }

    fn alpine() -> OciImage {
        image(
            "alpine:3.19",
            vec![LayerBuilder::new()
                .dir("etc")
                .file("etc/alpine-release", b"3.19.1\n")
                .build()],
        )
    }

    impl Fixture {
        fn spec(&self, id: &str, max_bytes: u64) -> BuildSpec {
            BuildSpec::new(id, "alpine:3.19", self.temp.path().join(format!("{}.ext4", id)), max_bytes)
        }
    }

    #[tokio::test]
    async fn successful_build_uploads_and_caches() {
        let f = fixture(Some(alpine()));
        let spec = f.spec("b1", 64 << 20);

        let output = f
            .builder
            .run(&f.coordinator, spec, &CancellationToken::new())
            .await
            .unwrap();

        assert!(output.output.exists());
        assert_eq!(
            f.store.size("b1/rootfs.ext4").await.unwrap(),
            output.rootfs_size
        );
        assert!(f.builder.cache().contains("b1", DiffKind::Snapshot, 4096));
        assert_eq!(output.diff.size().unwrap(), output.rootfs_size);

        let record = f.coordinator.build_status("b1").unwrap();
        assert_eq!(record.status, BuildStatus::Succeeded);
        assert_eq!(record.cache_key.as_deref(), Some("b1/snapshot/4096"));
        assert_eq!(f.coordinator.in_flight(), 0);

        let audit = std::fs::read_to_string(f.temp.path().join("audit.log")).unwrap();
        assert!(audit.contains("build.started"));
        assert!(audit.contains("build.succeeded"));
    }

    #[tokio::test]
    async fn oversized_build_fails_cleanly() {
        let big = image(
            "big:1",
            vec![LayerBuilder::new().file("blob", &vec![0u8; 4 << 20]).build()],
        );
        let f = fixture(Some(big));
        let spec = f.spec("b2", 4 << 20);
        let output = spec.output.clone();

        let err = f
            .builder
            .run(&f.coordinator, spec, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_size_limit());
        assert!(!output.exists());
        assert!(f.builder.cache().is_empty());

        let record = f.coordinator.build_status("b2").unwrap();
        assert_eq!(record.status, BuildStatus::Failed);
        assert_eq!(
            record.error.as_deref(),
            Some("Build failed - exceeded maximum size 4 MB")
        );
    }

    #[tokio::test]
    async fn fetch_failure_marks_build_failed() {
        let f = fixture(None);
        let err = f
            .builder
            .run(&f.coordinator, f.spec("b3", 64 << 20), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(
            f.coordinator.build_status("b3").unwrap().status,
            BuildStatus::Failed
        );
        assert_eq!(f.coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn draining_coordinator_rejects() {
        let f = fixture(Some(alpine()));
        f.coordinator
            .shutdown(&CancellationToken::new())
            .await
            .unwrap();

        let err = f
            .builder
            .run(&f.coordinator, f.spec("b4", 64 << 20), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RootsmithError::Draining));
        let audit = std::fs::read_to_string(f.temp.path().join("audit.log")).unwrap();
        assert!(audit.contains("build.rejected"));
    }
}
