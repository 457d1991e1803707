// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::{ConfigHandle, SOURCES_FILENAME, read_json, write_json};
use crate::error::{RegistryError, ValidationError};
use crate::library::{count_records, purge_source_dir};
use crate::source::Source;

/// Sources changed on disk by another process since the last reload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryChanges {
    /// Sources that were removed
    pub removed: Vec<Source>,
    /// Ids of sources that were reset
    pub reset: Vec<String>,
}

impl RegistryChanges {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.reset.is_empty()
    }
}

/// Durable catalog of configured sources.
///
/// Several processes may share one `sources.json`. Every mutation starts from
/// the file's current content, and [`SourceRegistry::reload`] reports what
/// other processes removed or reset in the meantime.
#[derive(Debug)]
pub struct SourceRegistry {
    config: ConfigHandle,
    path: Option<PathBuf>,
    sources: RwLock<Vec<Source>>,
    video_counts: RwLock<HashMap<String, usize>>,
    changes: Mutex<RegistryChanges>,
}

impl SourceRegistry {
    /// Registry that is never persisted
    pub fn in_memory(config: ConfigHandle) -> Self {
        Self {
            config,
            path: None,
            sources: RwLock::default(),
            video_counts: RwLock::default(),
            changes: Mutex::default(),
        }
    }

    /// Load `sources.json` from the config directory; a missing file is an empty registry
    pub fn load(config_dir: &Path, config: ConfigHandle) -> Result<Self, RegistryError> {
        let path = config_dir.join(SOURCES_FILENAME);
        let sources = if path.exists() {
            read_json(&path)?
        } else {
            Vec::new()
        };

        Ok(Self {
            config,
            path: Some(path),
            sources: RwLock::new(sources),
            video_counts: RwLock::default(),
            changes: Mutex::default(),
        })
    }

    /// Re-read `sources.json` and return what changed on disk since the last call
    pub fn reload(&self) -> Result<RegistryChanges, RegistryError> {
        {
            let mut sources = self.write();
            self.sync_from_disk(&mut sources)?;
        }
        let changes = {
            let mut pending = self.changes.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        if !changes.is_empty() {
            self.counts().clear();
        }
        Ok(changes)
    }

    /// Replace the in-memory list with the file's content, recording removals
    /// and resets made by other processes
    fn sync_from_disk(&self, sources: &mut Vec<Source>) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let latest: Vec<Source> = read_json(path)?;
        let mut changes = self.changes.lock().unwrap_or_else(|e| e.into_inner());
        for known in sources.iter() {
            match latest.iter().find(|s| s.id == known.id) {
                None => {
                    debug!(source_id = %known.id, "Source removed on disk");
                    changes.removed.push(known.clone());
                }
                Some(current) if current.generation != known.generation => {
                    debug!(source_id = %known.id, "Source reset on disk");
                    changes.reset.push(known.id.clone());
                }
                Some(_) => {}
            }
        }
        *sources = latest;
        Ok(())
    }

    /// Write lock on the source list, refreshed from disk first
    fn write_latest(&self) -> RwLockWriteGuard<'_, Vec<Source>> {
        let mut sources = self.write();
        if let Err(e) = self.sync_from_disk(&mut sources) {
            warn!("Failed to re-read sources, using the loaded list: {}", e);
        }
        sources
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Source>> {
        self.sources.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Source>> {
        self.sources.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, sources: &[Source]) -> Result<(), RegistryError> {
        if let Some(path) = &self.path {
            write_json(path, &sources)?;
        }
        Ok(())
    }

    /// Add a new source
    pub fn create(&self, source: Source) -> Result<Source, RegistryError> {
        source.validate()?;

        let mut sources = self.write_latest();
        if sources.iter().any(|s| s.id == source.id) {
            return Err(ValidationError::DuplicateId { id: source.id }.into());
        }

        sources.push(source.clone());
        if let Err(e) = self.persist(&sources) {
            sources.pop();
            return Err(e);
        }

        info!(source_id = source.id(), kind = source.kind_name(), "Created source");
        Ok(source)
    }

    /// Replace a source's name and settings; id, creation time and last check are kept
    pub fn update(&self, id: &str, source: Source) -> Result<Source, RegistryError> {
        let mut sources = self.write_latest();
        let index = sources
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let existing = &sources[index];
        if existing.kind_name() != source.kind_name() {
            return Err(ValidationError::KindMismatch {
                existing: existing.kind_name(),
                requested: source.kind_name(),
            }
            .into());
        }

        let updated = Source {
            id: existing.id.clone(),
            created_at: existing.created_at,
            last_checked: existing.last_checked,
            generation: existing.generation,
            ..source
        };
        updated.validate()?;

        let previous = std::mem::replace(&mut sources[index], updated.clone());
        if let Err(e) = self.persist(&sources) {
            sources[index] = previous;
            return Err(e);
        }

        info!(source_id = id, "Updated source");
        Ok(updated)
    }

    /// Remove a source together with its downloaded videos and records
    pub async fn delete(&self, id: &str) -> Result<Source, RegistryError> {
        let removed = {
            let mut sources = self.write_latest();
            let index = sources
                .iter()
                .position(|s| s.id == id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            let removed = sources.remove(index);
            if let Err(e) = self.persist(&sources) {
                sources.insert(index, removed);
                return Err(e);
            }
            removed
        };

        purge_source_dir(&self.media_dir(&removed)).await?;
        self.counts().remove(id);

        info!(source_id = id, "Deleted source");
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<Source> {
        self.read().iter().find(|s| s.id == id).cloned()
    }

    pub fn list(&self) -> Vec<Source> {
        self.read().clone()
    }

    /// Where a source's videos live under the current media root
    pub fn media_dir(&self, source: &Source) -> PathBuf {
        source.media_dir(&self.config.media_root())
    }

    fn counts(&self) -> RwLockWriteGuard<'_, HashMap<String, usize>> {
        self.video_counts.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of local videos for a source, from the last count taken
    pub fn video_count(&self, id: &str) -> usize {
        let cached = self
            .video_counts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied();
        match cached {
            Some(count) => count,
            None => self.refresh_video_count(id),
        }
    }

    /// Recount a source's local videos
    pub fn refresh_video_count(&self, id: &str) -> usize {
        let Some(source) = self.get(id) else {
            return 0;
        };
        let count = count_records(&self.media_dir(&source), id);
        self.counts().insert(id.to_string(), count);
        count
    }

    /// Record when a source was last synchronized
    pub fn mark_checked(&self, id: &str, at: DateTime<Utc>) -> Result<(), RegistryError> {
        let mut sources = self.write_latest();
        let Some(index) = sources.iter().position(|s| s.id == id) else {
            return Err(RegistryError::NotFound(id.to_string()));
        };

        let previous = sources[index].last_checked.replace(at);
        if let Err(e) = self.persist(&sources) {
            sources[index].last_checked = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Record a reset: forget the last check and bump the source's generation
    /// so other processes notice
    pub fn mark_reset(&self, id: &str) -> Result<(), RegistryError> {
        let mut sources = self.write_latest();
        let Some(index) = sources.iter().position(|s| s.id == id) else {
            return Err(RegistryError::NotFound(id.to_string()));
        };

        let previous = sources[index].clone();
        sources[index].last_checked = None;
        sources[index].generation = previous.generation.wrapping_add(1);
        if let Err(e) = self.persist(&sources) {
            sources[index] = previous;
            return Err(e);
        }
        Ok(())
    }
}
