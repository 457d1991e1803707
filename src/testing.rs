// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::fetcher::Fetcher;
use crate::manifest::{Manifest, ManifestEntry};
use crate::source::Source;

/// Scriptable in-memory fetcher
#[derive(Default)]
pub struct MockFetcher {
    manifest: Mutex<Vec<ManifestEntry>>,
    manifest_fails: bool,
    manifest_panics: bool,
    manifest_delay: Option<Duration>,
    failing_videos: HashSet<String>,
    slow_videos: HashMap<String, Duration>,
    pub manifest_calls: AtomicUsize,
    pub video_calls: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_manifest(self, entries: Vec<ManifestEntry>) -> Self {
        self.set_manifest(entries);
        self
    }

    pub fn set_manifest(&self, entries: Vec<ManifestEntry>) {
        *self.manifest.lock().unwrap() = entries;
    }

    pub fn failing_manifest(mut self) -> Self {
        self.manifest_fails = true;
        self
    }

    pub fn panicking_manifest(mut self) -> Self {
        self.manifest_panics = true;
        self
    }

    pub fn slow_manifest(mut self, delay: Duration) -> Self {
        self.manifest_delay = Some(delay);
        self
    }

    pub fn failing_video(mut self, video_id: &str) -> Self {
        self.failing_videos.insert(video_id.to_string());
        self
    }

    pub fn slow_video(mut self, video_id: &str, delay: Duration) -> Self {
        self.slow_videos.insert(video_id.to_string(), delay);
        self
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch_manifest(&self, _source: &Source) -> Result<Manifest, FetchError> {
        self.manifest_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.manifest_delay {
            tokio::time::sleep(delay).await;
        }
        if self.manifest_panics {
            panic!("manifest parser crashed");
        }
        if self.manifest_fails {
            return Err(FetchError::ProcessFailed {
                program: "mock".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "upstream unavailable".to_string(),
            });
        }
        Ok(Manifest::new(self.manifest.lock().unwrap().clone()))
    }

    async fn fetch_video(
        &self,
        _source: &Source,
        video_id: &str,
        destination_dir: &Path,
    ) -> Result<PathBuf, FetchError> {
        self.video_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.slow_videos.get(video_id) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing_videos.contains(video_id) {
            return Err(FetchError::InvalidOutput(format!("{} is unavailable", video_id)));
        }

        let io_err = |e| FetchError::Io {
            path: destination_dir.to_path_buf(),
            source: e,
        };
        tokio::fs::create_dir_all(destination_dir).await.map_err(io_err)?;
        let path = destination_dir.join(format!("{}.mp4", video_id));
        tokio::fs::write(&path, video_id.as_bytes())
            .await
            .map_err(io_err)?;
        Ok(path)
    }
}
