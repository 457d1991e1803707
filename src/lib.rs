// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ytsync - keep local mirrors of YouTube channels and playlists
//!
//! Sources are registered in a [`SourceRegistry`]. The [`SyncJobScheduler`]
//! fetches each source's manifest, asks the retention policy what to download
//! and delete, and runs the plan through the [`DownloadPipeline`] while
//! publishing progress to any number of subscribers.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod library;
pub mod manifest;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod retention;
pub mod scheduler;
pub mod source;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::{ConfigHandle, GlobalConfig, default_config_dir, migrate_legacy_config};
pub use error::{
    ConfigError, FetchError, JobError, LibraryError, RegistryError, SchedulerError, StoreError,
    ValidationError,
};
pub use fetcher::{Fetcher, SharedFetcher, YtDlpFetcher, YtDlpOptions};
pub use library::VideoRecord;
pub use manifest::{Manifest, ManifestCache, ManifestEntry};
pub use pipeline::{DownloadPipeline, PipelineOutcome};
pub use progress::{EventKind, JobId, ProgressBroadcaster, ProgressEvent, ProgressSubscription};
pub use registry::{RegistryChanges, SourceRegistry};
pub use retention::SyncPlan;
pub use scheduler::{JobState, SchedulerOptions, SyncJob, SyncJobScheduler};
pub use source::{ChannelUpdate, FetchParams, Source, SourceKind};
