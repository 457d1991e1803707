// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ConfigHandle, GlobalConfig};
use crate::error::ConfigError;

/// One upstream video as listed by a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub video_id: String,
    pub published_at: DateTime<Utc>,
}

/// Snapshot of a source's upstream videos, in upstream order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
    pub fetched_at: DateTime<Utc>,
}

impl Manifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self {
            entries,
            fetched_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, video_id: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.video_id == video_id)
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or_default()
    }
}

/// Last fetched manifest per source.
///
/// Whether cached entries are served is decided by the `maintain_manifest_cache`
/// flag on the shared [`ConfigHandle`], read on every lookup. Turning maintenance
/// off bypasses the cache without dropping what it holds.
#[derive(Debug, Clone)]
pub struct ManifestCache {
    config: ConfigHandle,
    ttl: Option<Duration>,
    entries: Arc<RwLock<HashMap<String, Arc<Manifest>>>>,
}

impl ManifestCache {
    /// Cache whose staleness threshold follows the configured check interval
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            ttl: None,
            entries: Arc::default(),
        }
    }

    /// Cache with a fixed staleness threshold
    pub fn with_ttl(config: ConfigHandle, ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::new(config)
        }
    }

    fn ttl(&self) -> Duration {
        self.ttl.unwrap_or_else(|| self.config.check_interval())
    }

    /// Return the cached manifest when maintenance is on and it is fresh,
    /// otherwise run `fetch` and store its result.
    pub async fn get_or_fetch<F, Fut, E>(&self, source_id: &str, fetch: F) -> Result<Arc<Manifest>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Manifest, E>>,
    {
        if self.config.maintain_manifest_cache()
            && let Some(cached) = self.fresh(source_id)
        {
            debug!(source_id, "Serving cached manifest");
            return Ok(cached);
        }

        debug!(source_id, "Fetching live manifest");
        let manifest = Arc::new(fetch().await?);
        self.store(source_id, manifest.clone());
        Ok(manifest)
    }

    fn fresh(&self, source_id: &str) -> Option<Arc<Manifest>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(source_id)
            .filter(|m| m.age(Utc::now()) < self.ttl())
            .cloned()
    }

    fn store(&self, source_id: &str, manifest: Arc<Manifest>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(source_id.to_string(), manifest);
    }

    /// Peek at the cached manifest regardless of freshness
    pub fn cached(&self, source_id: &str) -> Option<Arc<Manifest>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(source_id).cloned()
    }

    /// Drop the cached manifest for a source
    pub fn invalidate(&self, source_id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.remove(source_id).is_some() {
            debug!(source_id, "Invalidated cached manifest");
        }
    }

    /// Turn cache maintenance on or off process-wide
    pub fn set_maintenance(&self, enabled: bool) -> Result<GlobalConfig, ConfigError> {
        self.config.set_manifest_maintenance(enabled)
    }
}
