// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::FetchError;
use crate::fetcher::SharedFetcher;
use crate::library::{VideoRecord, hash_file, remove_video, write_record};
use crate::manifest::ManifestEntry;
use crate::progress::{EventKind, JobId, ProgressBroadcaster};
use crate::retention::SyncPlan;
use crate::source::Source;

/// Outcome of executing a sync plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineOutcome {
    /// Number of videos downloaded
    pub downloaded: usize,
    /// Number of videos deleted
    pub deleted: usize,
    /// Per-video failures (video id, error message)
    pub failures: Vec<(String, String)>,
    /// The job was cancelled before every step ran
    pub cancelled: bool,
}

impl PipelineOutcome {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} downloaded, {} deleted, {} failed",
            self.downloaded,
            self.deleted,
            self.failed()
        )
    }
}

/// Executes a [`SyncPlan`]: deletes evicted videos, then downloads new ones in
/// plan order. A failing video is reported and skipped; it never aborts the job.
#[derive(Clone)]
pub struct DownloadPipeline {
    fetcher: SharedFetcher,
    broadcaster: ProgressBroadcaster,
    fetch_timeout: Duration,
}

impl DownloadPipeline {
    pub fn new(
        fetcher: SharedFetcher,
        broadcaster: ProgressBroadcaster,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            broadcaster,
            fetch_timeout,
        }
    }

    /// Run the plan for `source`, storing videos under `media_dir`.
    ///
    /// On completion a `Complete` event closes the job's progress log. When
    /// `cancel` fires, remaining steps are skipped and the log is left open
    /// for the caller to finish.
    pub async fn execute(
        &self,
        job_id: JobId,
        source: &Source,
        plan: &SyncPlan,
        media_dir: &Path,
        cancel: &CancellationToken,
    ) -> PipelineOutcome {
        let mut outcome = PipelineOutcome::default();

        for record in &plan.to_evict {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                return outcome;
            }

            match remove_video(record, media_dir).await {
                Ok(()) => {
                    outcome.deleted += 1;
                    self.broadcaster.publish(
                        job_id,
                        EventKind::Deleted,
                        format!("Deleted {}", record.video_id),
                    );
                }
                Err(e) => {
                    warn!(%job_id, video_id = %record.video_id, "Failed to delete video: {}", e);
                    self.broadcaster.publish(
                        job_id,
                        EventKind::Error,
                        format!("Failed to delete {}: {}", record.video_id, e),
                    );
                    outcome.failures.push((record.video_id.clone(), e.to_string()));
                }
            }
        }

        let total = plan.to_fetch.len();
        for (index, entry) in plan.to_fetch.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                return outcome;
            }

            self.broadcaster.publish(
                job_id,
                EventKind::Info,
                format!("[{}/{}] Downloading {}", index + 1, total, entry.video_id),
            );

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    outcome.cancelled = true;
                    return outcome;
                }
                result = self.fetch_one(source, entry, media_dir) => result,
            };

            match result {
                Ok(record) => {
                    outcome.downloaded += 1;
                    self.broadcaster.publish(
                        job_id,
                        EventKind::Downloaded,
                        format!("Downloaded {}", record.video_id),
                    );
                }
                Err(e) => {
                    let transient = e.is_transient();
                    warn!(
                        %job_id,
                        video_id = %entry.video_id,
                        transient,
                        "Failed to download video: {}",
                        e
                    );
                    let retry_note = if transient {
                        " (temporary, retried on next sync)"
                    } else {
                        ""
                    };
                    self.broadcaster.publish(
                        job_id,
                        EventKind::Error,
                        format!("Failed to download {}: {}{}", entry.video_id, e, retry_note),
                    );
                    outcome.failures.push((entry.video_id.clone(), e.to_string()));
                }
            }
        }

        info!(%job_id, source_id = source.id(), "Pipeline finished: {}", outcome.summary());
        self.broadcaster.finish(
            job_id,
            EventKind::Complete,
            format!("Sync complete: {}", outcome.summary()),
        );
        outcome
    }

    async fn fetch_one(
        &self,
        source: &Source,
        entry: &ManifestEntry,
        media_dir: &Path,
    ) -> Result<VideoRecord, PipelineStepError> {
        let file_path = tokio::time::timeout(
            self.fetch_timeout,
            self.fetcher.fetch_video(source, &entry.video_id, media_dir),
        )
        .await
        .map_err(|_| FetchError::Timeout(self.fetch_timeout))??;

        let content_hash = match hash_file(&file_path).await {
            Ok(hash) => Some(hash),
            Err(e) => {
                warn!(path = %file_path.display(), "Failed to hash video: {}", e);
                None
            }
        };

        let record = VideoRecord {
            video_id: entry.video_id.clone(),
            source_id: source.id().to_string(),
            published_at: entry.published_at,
            downloaded_at: Utc::now(),
            file_path: absolute(file_path),
            content_hash,
        };
        write_record(&record, media_dir)?;
        Ok(record)
    }
}

fn absolute(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}

/// A single pipeline step failed
#[derive(Debug, thiserror::Error)]
enum PipelineStepError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Library(#[from] crate::error::LibraryError),
}

impl PipelineStepError {
    fn is_transient(&self) -> bool {
        match self {
            PipelineStepError::Fetch(e) => e.is_transient(),
            PipelineStepError::Library(_) => false,
        }
    }
}
