//! Build lifecycle and drain protocol
//!
//! Every accepted build holds a tracker token until its handle is dropped,
//! so the in-flight count is correct on every exit path. Shutdown flips the
//! health state first, then waits for the tracker to empty.
//!
//! Finished records stay queryable so dependent services can read the final
//! status while the server drains; only the most recent ones are kept.

use crate::build::record::{BuildRecord, BuildSpec, BuildStatus};
use crate::config::schema::DrainConfig;
use crate::config::Environment;
use crate::error::{RootsmithError, RootsmithResult};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Finished records kept for status queries
pub const FINISHED_HISTORY: usize = 256;

/// Health reported to the build-management service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Accepting builds
    Healthy,
    /// Finishing in-flight builds, rejecting new ones
    Draining,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Draining => f.write_str("draining"),
        }
    }
}

struct Lifecycle {
    health: HealthState,
    builds: HashMap<String, BuildRecord>,
    /// Ids of finished builds, oldest first
    finished: VecDeque<String>,
}

impl Lifecycle {
    /// Drop the oldest finished records beyond `history`
    fn archive(&mut self, build_id: &str, history: usize) {
        self.finished.retain(|id| id != build_id);
        self.finished.push_back(build_id.to_string());

        while self.finished.len() > history {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            if self.builds.get(&oldest).is_some_and(|r| r.status.is_finished()) {
                self.builds.remove(&oldest);
                debug!(build_id = %oldest, "Archived build record");
            }
        }
    }
}

struct Inner {
    lifecycle: Mutex<Lifecycle>,
    tracker: TaskTracker,
    announce_delay: Duration,
    final_delay: Duration,
    history: usize,
}

/// Tracks builds and owns the health state
#[derive(Clone)]
pub struct BuildCoordinator {
    inner: Arc<Inner>,
}

impl BuildCoordinator {
    /// Coordinator with the configured drain delays, zero in the local environment
    pub fn new(drain: &DrainConfig, environment: Environment) -> Self {
        if environment.is_local() {
            return Self::with_delays(Duration::ZERO, Duration::ZERO);
        }
        Self::with_delays(
            Duration::from_secs(drain.announce_delay_secs),
            Duration::from_secs(drain.final_delay_secs),
        )
    }

    pub fn with_delays(announce_delay: Duration, final_delay: Duration) -> Self {
        Self::with_limits(announce_delay, final_delay, FINISHED_HISTORY)
    }

    /// Coordinator keeping at most `history` finished records
    pub fn with_limits(announce_delay: Duration, final_delay: Duration, history: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                lifecycle: Mutex::new(Lifecycle {
                    health: HealthState::Healthy,
                    builds: HashMap::new(),
                    finished: VecDeque::new(),
                }),
                tracker: TaskTracker::new(),
                announce_delay,
                final_delay,
                history,
            }),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a build, or reject it while draining
    pub fn start_build(&self, spec: BuildSpec) -> RootsmithResult<BuildHandle> {
        let mut lifecycle = self.lifecycle();

        if lifecycle.health == HealthState::Draining {
            debug!(build_id = %spec.build_id, "Rejecting build while draining");
            return Err(RootsmithError::Draining);
        }

        if lifecycle
            .builds
            .get(&spec.build_id)
            .is_some_and(|record| !record.status.is_finished())
        {
            return Err(RootsmithError::BuildExists(spec.build_id));
        }

        // Counted before the lock is released, so shutdown cannot miss it
        let token = self.inner.tracker.token();
        lifecycle
            .builds
            .insert(spec.build_id.clone(), BuildRecord::new(&spec));

        info!(build_id = %spec.build_id, image = %spec.image, "Build started");

        Ok(BuildHandle {
            spec,
            coordinator: self.clone(),
            finished: false,
            _token: token,
        })
    }

    /// Record the outcome; the in-flight count drops with the handle
    pub fn finish_build<T>(&self, mut handle: BuildHandle, outcome: &RootsmithResult<T>) {
        handle.finished = true;
        let id = handle.spec.build_id.clone();

        self.complete(&id, |record| match outcome {
            Ok(_) => record.set_status(BuildStatus::Succeeded),
            Err(e) => record.fail(e.to_string()),
        });

        match outcome {
            Ok(_) => info!(build_id = %id, "Build succeeded"),
            Err(e) => warn!(build_id = %id, "Build failed: {}", e),
        }
    }

    /// Mutate the record of a build
    pub fn update(&self, build_id: &str, f: impl FnOnce(&mut BuildRecord)) {
        if let Some(record) = self.lifecycle().builds.get_mut(build_id) {
            f(record);
            record.updated_at = chrono::Utc::now();
        }
    }

    /// Apply the final update of a build and archive its record
    fn complete(&self, build_id: &str, f: impl FnOnce(&mut BuildRecord)) {
        let mut lifecycle = self.lifecycle();
        let Some(record) = lifecycle.builds.get_mut(build_id) else {
            return;
        };
        f(record);
        record.updated_at = chrono::Utc::now();
        lifecycle.archive(build_id, self.inner.history);
    }

    /// Drain, then return once every in-flight build finished.
    ///
    /// Fails with `Canceled` only if `cancel` already fired on entry; there is
    /// no internal timeout.
    pub async fn shutdown(&self, cancel: &CancellationToken) -> RootsmithResult<()> {
        if cancel.is_cancelled() {
            return Err(RootsmithError::Canceled("shutdown canceled".to_string()));
        }

        self.lifecycle().health = HealthState::Draining;
        info!(in_flight = self.in_flight(), "Draining, new builds are rejected");

        if !self.inner.announce_delay.is_zero() {
            tokio::time::sleep(self.inner.announce_delay).await;
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("All builds finished");

        if !self.inner.final_delay.is_zero() {
            tokio::time::sleep(self.inner.final_delay).await;
        }

        info!("Drain complete");
        Ok(())
    }

    pub fn health(&self) -> HealthState {
        self.lifecycle().health
    }

    /// Number of builds whose handle is still alive
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.len()
    }

    pub fn build_status(&self, build_id: &str) -> RootsmithResult<BuildRecord> {
        self.lifecycle()
            .builds
            .get(build_id)
            .cloned()
            .ok_or_else(|| RootsmithError::BuildNotFound(build_id.to_string()))
    }

    /// All known builds, newest first
    pub fn builds(&self) -> Vec<BuildRecord> {
        let mut builds: Vec<BuildRecord> = self.lifecycle().builds.values().cloned().collect();
        builds.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        builds
    }
}

/// An accepted build. Dropping it without `finish_build` marks the build failed.
pub struct BuildHandle {
    spec: BuildSpec,
    coordinator: BuildCoordinator,
    finished: bool,
    _token: TaskTrackerToken,
}

impl BuildHandle {
    pub fn spec(&self) -> &BuildSpec {
        &self.spec
    }

    pub fn build_id(&self) -> &str {
        &self.spec.build_id
    }

    /// Update this build's record
    pub fn update(&self, f: impl FnOnce(&mut BuildRecord)) {
        self.coordinator.update(&self.spec.build_id, f);
    }
}

impl Drop for BuildHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(build_id = %self.spec.build_id, "Build abandoned before completion");
        self.coordinator
            .complete(&self.spec.build_id, |record| record.fail("build abandoned"));
    }
}
