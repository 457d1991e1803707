// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHandle, GlobalConfig};
use crate::error::{ConfigError, JobError, SchedulerError};
use crate::fetcher::SharedFetcher;
use crate::library::{purge_source_dir, scan_source_dir};
use crate::manifest::ManifestCache;
use crate::pipeline::{DownloadPipeline, PipelineOutcome};
use crate::progress::{EventKind, JobId, ProgressBroadcaster, ProgressSubscription};
use crate::registry::SourceRegistry;
use crate::retention;
use crate::source::Source;

/// Lifecycle of a sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

/// One synchronization attempt for a source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncJob {
    pub job_id: JobId,
    pub source_id: String,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Counts from the pipeline, when it ran
    pub downloaded: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Why the job failed
    pub error: Option<String>,
}

impl SyncJob {
    fn pending(job_id: JobId, source_id: &str) -> Self {
        Self {
            job_id,
            source_id: source_id.to_string(),
            state: JobState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            downloaded: 0,
            deleted: 0,
            failed: 0,
            error: None,
        }
    }
}

/// Timeouts and cache settings for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Upper bound for one manifest fetch
    pub manifest_timeout: Duration,
    /// Upper bound for one video download
    pub video_timeout: Duration,
    /// Manifest freshness; defaults to the check interval
    pub manifest_ttl: Option<Duration>,
    /// How often [`SyncJobScheduler::run`] re-reads settings and sources
    pub reload_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            manifest_timeout: Duration::from_secs(5 * 60),
            video_timeout: Duration::from_secs(2 * 60 * 60),
            manifest_ttl: None,
            reload_interval: Duration::from_secs(10),
        }
    }
}

/// Per-source single-flight slot
#[derive(Debug)]
enum Slot {
    Running {
        job_id: JobId,
        cancel: CancellationToken,
    },
    Resetting,
}

#[derive(Debug, Default)]
struct SchedulerState {
    slots: HashMap<String, Slot>,
    jobs: HashMap<JobId, watch::Receiver<SyncJob>>,
    latest: HashMap<String, JobId>,
}

struct SchedulerInner {
    config: ConfigHandle,
    registry: Arc<SourceRegistry>,
    cache: ManifestCache,
    broadcaster: ProgressBroadcaster,
    fetcher: SharedFetcher,
    pipeline: DownloadPipeline,
    manifest_timeout: Duration,
    reload_interval: Duration,
    state: Mutex<SchedulerState>,
}

/// Starts sync jobs on demand and on a timer.
///
/// Sources sync concurrently, but each source has at most one job at a time.
/// The pause flag is read from the shared [`ConfigHandle`] on every trigger.
#[derive(Clone)]
pub struct SyncJobScheduler {
    inner: Arc<SchedulerInner>,
}

impl SyncJobScheduler {
    pub fn new(
        config: ConfigHandle,
        registry: Arc<SourceRegistry>,
        fetcher: SharedFetcher,
        options: SchedulerOptions,
    ) -> Self {
        let broadcaster = ProgressBroadcaster::new();
        let cache = match options.manifest_ttl {
            Some(ttl) => ManifestCache::with_ttl(config.clone(), ttl),
            None => ManifestCache::new(config.clone()),
        };
        let pipeline =
            DownloadPipeline::new(fetcher.clone(), broadcaster.clone(), options.video_timeout);

        Self {
            inner: Arc::new(SchedulerInner {
                config,
                registry,
                cache,
                broadcaster,
                fetcher,
                pipeline,
                manifest_timeout: options.manifest_timeout,
                reload_interval: options.reload_interval,
                state: Mutex::default(),
            }),
        }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.inner.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.inner.registry
    }

    pub fn manifest_cache(&self) -> &ManifestCache {
        &self.inner.cache
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a job for a source.
    ///
    /// Rejected while background tasks are paused or while the source already
    /// has a job; requests are never queued.
    pub fn trigger(&self, source_id: &str) -> Result<JobId, SchedulerError> {
        if self.inner.config.background_tasks_paused() {
            return Err(SchedulerError::Paused);
        }
        let source = self
            .inner
            .registry
            .get(source_id)
            .ok_or_else(|| SchedulerError::UnknownSource(source_id.to_string()))?;

        let job_id = JobId::new();
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(SyncJob::pending(job_id, source_id));

        {
            let mut state = self.lock();
            match state.slots.get(source_id) {
                Some(Slot::Running { job_id, .. }) => {
                    return Err(SchedulerError::AlreadyRunning {
                        source_id: source_id.to_string(),
                        job_id: *job_id,
                    });
                }
                Some(Slot::Resetting) => {
                    return Err(SchedulerError::Resetting(source_id.to_string()));
                }
                None => {}
            }

            state.slots.insert(
                source_id.to_string(),
                Slot::Running {
                    job_id,
                    cancel: cancel.clone(),
                },
            );
            state.jobs.insert(job_id, rx);
            if let Some(previous) = state.latest.insert(source_id.to_string(), job_id) {
                state.jobs.remove(&previous);
                self.inner.broadcaster.close(previous);
            }
            self.inner.broadcaster.open(job_id);
        }

        info!(%job_id, source_id, "Sync job pending");
        let this = self.clone();
        tokio::spawn(async move { this.run_job(source, cancel, tx).await });

        Ok(job_id)
    }

    /// Start a job for every source that is idle. Does nothing while paused.
    pub fn trigger_periodic(&self) -> Vec<JobId> {
        if self.inner.config.background_tasks_paused() {
            debug!("Background tasks paused, skipping periodic sync");
            return Vec::new();
        }

        let mut started = Vec::new();
        for source in self.inner.registry.list() {
            match self.trigger(source.id()) {
                Ok(job_id) => started.push(job_id),
                Err(SchedulerError::AlreadyRunning { .. } | SchedulerError::Resetting(_)) => {
                    debug!(source_id = source.id(), "Source busy, skipping periodic sync");
                }
                Err(SchedulerError::Paused) => break,
                Err(e) => warn!(source_id = source.id(), "Periodic trigger failed: {}", e),
            }
        }
        started
    }

    /// Trigger periodic syncs every check interval until `shutdown` fires,
    /// then cancel running jobs and wait for them.
    ///
    /// Settings and sources are re-read every reload interval, so changes
    /// made by other processes sharing the config directory take effect.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Scheduler started");
        let mut last_sync: Option<Instant> = None;
        loop {
            if let Err(e) = self.reload().await {
                warn!("Failed to reload settings and sources: {}", e);
            }

            let interval = self.inner.config.check_interval();
            let now = Instant::now();
            let due = match last_sync {
                None => true,
                Some(at) => at.checked_add(interval).is_some_and(|next| now >= next),
            };
            if due {
                let started = self.trigger_periodic();
                if !started.is_empty() {
                    info!(count = started.len(), "Periodic sync started");
                }
                last_sync = Some(now);
            }

            let until_sync = last_sync
                .and_then(|at| at.checked_add(interval))
                .map_or(interval, |next| next.saturating_duration_since(now));
            let nap = until_sync.min(self.inner.reload_interval);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(nap) => {}
            }
        }

        self.cancel_all().await;
        info!("Scheduler stopped");
    }

    /// Cancel every running job and wait until each has ended
    pub async fn cancel_all(&self) {
        let running: Vec<JobId> = self
            .lock()
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Running { job_id, cancel } => {
                    cancel.cancel();
                    Some(*job_id)
                }
                Slot::Resetting => None,
            })
            .collect();

        for job_id in running {
            self.wait(job_id).await;
        }
    }

    /// Current state of a job
    pub fn job(&self, job_id: JobId) -> Option<SyncJob> {
        self.lock().jobs.get(&job_id).map(|rx| rx.borrow().clone())
    }

    /// Most recent job for a source
    pub fn latest_job(&self, source_id: &str) -> Option<SyncJob> {
        let state = self.lock();
        let job_id = state.latest.get(source_id)?;
        state.jobs.get(job_id).map(|rx| rx.borrow().clone())
    }

    pub fn is_running(&self, source_id: &str) -> bool {
        self.lock().slots.contains_key(source_id)
    }

    /// Wait until a job reaches a terminal state
    pub async fn wait(&self, job_id: JobId) -> Option<SyncJob> {
        let mut rx = self.lock().jobs.get(&job_id)?.clone();
        if rx.wait_for(|job| job.state.is_terminal()).await.is_err() {
            debug!(%job_id, "Job ended without a terminal state");
        }
        let job = rx.borrow().clone();
        Some(job)
    }

    /// Follow a job's progress from its first event
    pub fn subscribe(&self, job_id: JobId) -> Option<ProgressSubscription> {
        self.inner.broadcaster.subscribe(job_id)
    }

    /// Cancel a source's job, delete its videos and records and forget its
    /// cached manifest. Safe to call when nothing is running.
    ///
    /// The reset is recorded in `sources.json`, so a scheduler in another
    /// process applies it on its next reload.
    pub async fn reset(&self, source_id: &str) -> Result<(), SchedulerError> {
        let source = self
            .inner
            .registry
            .get(source_id)
            .ok_or_else(|| SchedulerError::UnknownSource(source_id.to_string()))?;
        self.reset_source(&source, true).await
    }

    async fn reset_source(&self, source: &Source, record: bool) -> Result<(), SchedulerError> {
        let source_id = source.id();
        let Some(cancelled) = self.reserve(source_id) else {
            debug!(source_id, "Reset already in progress");
            return Ok(());
        };
        if let Some(job_id) = cancelled {
            info!(%job_id, source_id, "Cancelling job for reset");
            self.wait(job_id).await;
        }

        let purged = purge_source_dir(&self.inner.registry.media_dir(source)).await;
        self.inner.cache.invalidate(source_id);
        self.inner.registry.refresh_video_count(source_id);
        let recorded = if record {
            self.inner.registry.mark_reset(source_id)
        } else {
            Ok(())
        };
        self.release(source_id);

        purged?;
        recorded?;
        info!(source_id, "Source reset");
        Ok(())
    }

    /// Apply changes other processes made to `settings.json` and
    /// `sources.json`: removed sources are stopped and purged, reset
    /// sources are reset here too.
    pub async fn reload(&self) -> Result<(), SchedulerError> {
        let settings = self.inner.config.reload();
        if let Ok(true) = settings {
            info!(
                paused = self.inner.config.background_tasks_paused(),
                "Settings changed on disk"
            );
        }

        let changes = self.inner.registry.reload()?;
        for source in &changes.removed {
            info!(source_id = source.id(), "Source removed by another process");
            if let Err(e) = self.forget_source(source).await {
                warn!(source_id = source.id(), "Failed to clean up removed source: {}", e);
            }
        }
        for source_id in &changes.reset {
            let Some(source) = self.inner.registry.get(source_id) else {
                continue;
            };
            info!(source_id = %source_id, "Source reset by another process");
            if let Err(e) = self.reset_source(&source, false).await {
                warn!(source_id = %source_id, "Failed to reset source: {}", e);
            }
        }

        settings?;
        Ok(())
    }

    /// Stop and purge a source that is no longer in the registry
    async fn forget_source(&self, source: &Source) -> Result<(), SchedulerError> {
        let source_id = source.id();
        let Some(cancelled) = self.reserve(source_id) else {
            return Err(SchedulerError::Resetting(source_id.to_string()));
        };
        if let Some(job_id) = cancelled {
            info!(%job_id, source_id, "Cancelling job for removal");
            self.wait(job_id).await;
        }

        let purged = purge_source_dir(&self.inner.registry.media_dir(source)).await;
        self.inner.cache.invalidate(source_id);
        self.close_jobs(source_id);
        self.release(source_id);

        purged?;
        Ok(())
    }

    fn close_jobs(&self, source_id: &str) {
        let mut state = self.lock();
        if let Some(job_id) = state.latest.remove(source_id) {
            state.jobs.remove(&job_id);
            self.inner.broadcaster.close(job_id);
        }
    }

    /// Remove a source, cancelling its job first
    pub async fn delete_source(&self, source_id: &str) -> Result<Source, SchedulerError> {
        if self.inner.registry.get(source_id).is_none() {
            return Err(SchedulerError::UnknownSource(source_id.to_string()));
        }

        let Some(cancelled) = self.reserve(source_id) else {
            return Err(SchedulerError::Resetting(source_id.to_string()));
        };
        if let Some(job_id) = cancelled {
            info!(%job_id, source_id, "Cancelling job for removal");
            self.wait(job_id).await;
        }

        let removed = self.inner.registry.delete(source_id).await;
        self.inner.cache.invalidate(source_id);
        self.close_jobs(source_id);
        self.release(source_id);

        Ok(removed?)
    }

    /// Claim a source's slot for a reset or removal, cancelling any running
    /// job. Returns `None` when another reset holds the slot, otherwise the
    /// cancelled job, if there was one.
    fn reserve(&self, source_id: &str) -> Option<Option<JobId>> {
        let mut state = self.lock();
        match state.slots.insert(source_id.to_string(), Slot::Resetting) {
            Some(Slot::Running { job_id, cancel }) => {
                cancel.cancel();
                Some(Some(job_id))
            }
            Some(Slot::Resetting) => None,
            None => Some(None),
        }
    }

    fn release(&self, source_id: &str) {
        let mut state = self.lock();
        if matches!(state.slots.get(source_id), Some(Slot::Resetting)) {
            state.slots.remove(source_id);
        }
    }

    /// Flip the pause flag. Running jobs are not affected.
    pub fn toggle_background_tasks(&self) -> Result<GlobalConfig, ConfigError> {
        let config = self.inner.config.toggle_background_tasks()?;
        info!(paused = config.background_tasks_paused, "Background tasks toggled");
        Ok(config)
    }

    /// Flip manifest cache maintenance
    pub fn toggle_manifest_maintenance(&self) -> Result<GlobalConfig, ConfigError> {
        let config = self.inner.config.toggle_manifest_maintenance()?;
        info!(
            enabled = config.maintain_manifest_cache,
            "Manifest cache maintenance toggled"
        );
        Ok(config)
    }

    async fn run_job(&self, source: Source, cancel: CancellationToken, tx: watch::Sender<SyncJob>) {
        let job_id = tx.borrow().job_id;
        let source_id = source.id().to_string();
        let broadcaster = &self.inner.broadcaster;

        tx.send_modify(|job| job.state = JobState::Running);
        info!(%job_id, source_id = %source_id, "Sync job running");
        broadcaster.publish(
            job_id,
            EventKind::Info,
            format!("Syncing {} '{}'", source.kind_name(), source.name()),
        );

        let result = AssertUnwindSafe(self.execute(job_id, &source, &cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(JobError::Panicked(panic_message(&*panic))));

        let (state, outcome, failure) = match result {
            Ok(outcome) if outcome.cancelled => {
                info!(%job_id, source_id = %source_id, "Sync job cancelled");
                broadcaster.finish(job_id, EventKind::Cancelled, "Sync cancelled");
                (JobState::Cancelled, outcome, None)
            }
            Ok(outcome) => (JobState::Succeeded, outcome, None),
            Err(e) => {
                error!(%job_id, source_id = %source_id, "Sync job failed: {}", e);
                broadcaster.finish(job_id, EventKind::Error, format!("Sync failed: {}", e));
                (JobState::Failed, PipelineOutcome::default(), Some(e.to_string()))
            }
        };

        self.inner.registry.refresh_video_count(&source_id);
        if state != JobState::Cancelled
            && let Err(e) = self.inner.registry.mark_checked(&source_id, Utc::now())
        {
            warn!(source_id = %source_id, "Failed to record last check: {}", e);
        }

        {
            let mut guard = self.lock();
            let owns_slot = matches!(
                guard.slots.get(&source_id),
                Some(Slot::Running { job_id: running, .. }) if *running == job_id
            );
            if owns_slot {
                guard.slots.remove(&source_id);
            }
        }

        tx.send_modify(|job| {
            job.state = state;
            job.finished_at = Some(Utc::now());
            job.downloaded = outcome.downloaded;
            job.deleted = outcome.deleted;
            job.failed = outcome.failed();
            job.error = failure;
        });
        debug!(%job_id, ?state, "Sync job finished");
    }

    async fn execute(
        &self,
        job_id: JobId,
        source: &Source,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, JobError> {
        let cancelled = PipelineOutcome {
            cancelled: true,
            ..PipelineOutcome::default()
        };
        let broadcaster = &self.inner.broadcaster;
        let fetcher = &self.inner.fetcher;
        let timeout = self.inner.manifest_timeout;

        let fetch = self.inner.cache.get_or_fetch(source.id(), || async move {
            tokio::time::timeout(timeout, fetcher.fetch_manifest(source))
                .await
                .map_err(|_| JobError::ManifestTimeout {
                    source_id: source.id().to_string(),
                    after: timeout,
                })?
                .map_err(|e| JobError::ManifestFetch {
                    source_id: source.id().to_string(),
                    source: e,
                })
        });

        let manifest = tokio::select! {
            _ = cancel.cancelled() => return Ok(cancelled),
            manifest = fetch => manifest?,
        };
        broadcaster.publish(
            job_id,
            EventKind::Info,
            format!("Manifest lists {} videos", manifest.len()),
        );

        if cancel.is_cancelled() {
            return Ok(cancelled);
        }

        let media_dir = self.inner.registry.media_dir(source);
        let library = scan_source_dir(&media_dir, source.id())?;
        if library.partial_files_cleaned > 0 {
            broadcaster.publish(
                job_id,
                EventKind::Info,
                format!(
                    "Cleaned up {} partial downloads",
                    library.partial_files_cleaned
                ),
            );
        }

        let plan = retention::plan(source, &manifest, &library.records, Utc::now());
        broadcaster.publish(
            job_id,
            EventKind::Info,
            format!(
                "Plan: {} to download, {} to delete",
                plan.to_fetch.len(),
                plan.to_evict.len()
            ),
        );

        Ok(self
            .inner
            .pipeline
            .execute(job_id, source, &plan, &media_dir, cancel)
            .await)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown cause".to_string()
    }
}
