// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::error::{ConfigError, StoreError};
use crate::source::Source;

pub const SETTINGS_FILENAME: &str = "settings.json";
pub const SOURCES_FILENAME: &str = "sources.json";
const LEGACY_CONFIG_FILENAME: &str = "config.json";

/// Longest allowed check interval, one year
pub const MAX_CHECK_INTERVAL_MINUTES: u64 = 365 * 24 * 60;

/// Process-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub background_tasks_paused: bool,
    #[serde(default)]
    pub maintain_manifest_cache: bool,
    pub check_interval_minutes: u64,
    pub server_address: String,
    pub media_root_path: PathBuf,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            background_tasks_paused: false,
            maintain_manifest_cache: false,
            check_interval_minutes: 240,
            server_address: "localhost:8080".to_string(),
            media_root_path: PathBuf::from("/media/youtube"),
        }
    }
}

/// Default directory for settings and the source registry
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("ytsync")
}

/// Shared, thread-safe handle on the [`GlobalConfig`].
///
/// Flags and the interval are atomics so readers always see the latest value
/// without taking a lock. Every mutation is written back to `settings.json`
/// when the handle was loaded from disk.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<ConfigInner>,
}

#[derive(Debug)]
struct ConfigInner {
    paused: AtomicBool,
    maintain_cache: AtomicBool,
    check_interval_minutes: AtomicU64,
    server_address: RwLock<String>,
    media_root: RwLock<PathBuf>,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl ConfigHandle {
    /// Handle that is never persisted
    pub fn in_memory(config: GlobalConfig) -> Self {
        Self::from_parts(config, None)
    }

    fn from_parts(config: GlobalConfig, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(ConfigInner {
                paused: AtomicBool::new(config.background_tasks_paused),
                maintain_cache: AtomicBool::new(config.maintain_manifest_cache),
                check_interval_minutes: AtomicU64::new(config.check_interval_minutes),
                server_address: RwLock::new(config.server_address),
                media_root: RwLock::new(config.media_root_path),
                path,
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// Load `settings.json` from the config directory, writing defaults if it is missing
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        migrate_legacy_config(config_dir)?;

        let path = config_dir.join(SETTINGS_FILENAME);
        let config: GlobalConfig = if path.exists() {
            read_json(&path)?
        } else {
            let config = GlobalConfig::default();
            write_json(&path, &config)?;
            info!("Created default settings at {}", path.display());
            config
        };

        validate_interval(config.check_interval_minutes)?;

        Ok(Self::from_parts(config, Some(path)))
    }

    /// Re-read `settings.json` so changes written by another process take
    /// effect. Returns whether anything changed; in-memory handles never do.
    pub fn reload(&self) -> Result<bool, ConfigError> {
        let Some(path) = &self.inner.path else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }

        let latest: GlobalConfig = read_json(path)?;
        validate_interval(latest.check_interval_minutes)?;

        let _guard = self
            .inner
            .write_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if self.snapshot() == latest {
            return Ok(false);
        }

        self.inner
            .paused
            .store(latest.background_tasks_paused, Ordering::SeqCst);
        self.inner
            .maintain_cache
            .store(latest.maintain_manifest_cache, Ordering::SeqCst);
        self.inner
            .check_interval_minutes
            .store(latest.check_interval_minutes, Ordering::SeqCst);
        *write_lock(&self.inner.server_address) = latest.server_address;
        *write_lock(&self.inner.media_root) = latest.media_root_path;
        debug!("Reloaded settings from {}", path.display());
        Ok(true)
    }

    pub fn snapshot(&self) -> GlobalConfig {
        GlobalConfig {
            background_tasks_paused: self.background_tasks_paused(),
            maintain_manifest_cache: self.maintain_manifest_cache(),
            check_interval_minutes: self.inner.check_interval_minutes.load(Ordering::SeqCst),
            server_address: self.server_address(),
            media_root_path: self.media_root(),
        }
    }

    pub fn background_tasks_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn maintain_manifest_cache(&self) -> bool {
        self.inner.maintain_cache.load(Ordering::SeqCst)
    }

    pub fn check_interval(&self) -> Duration {
        let minutes = self.inner.check_interval_minutes.load(Ordering::SeqCst);
        Duration::from_secs(minutes.saturating_mul(60))
    }

    pub fn server_address(&self) -> String {
        read_lock(&self.inner.server_address).clone()
    }

    pub fn media_root(&self) -> PathBuf {
        read_lock(&self.inner.media_root).clone()
    }

    /// Flip `background_tasks_paused` and return the new state
    pub fn toggle_background_tasks(&self) -> Result<GlobalConfig, ConfigError> {
        let previous = self.inner.paused.fetch_xor(true, Ordering::SeqCst);
        info!(paused = !previous, "Toggled background tasks");
        self.persist_or(|| self.inner.paused.store(previous, Ordering::SeqCst))
    }

    /// Flip `maintain_manifest_cache` and return the new state
    pub fn toggle_manifest_maintenance(&self) -> Result<GlobalConfig, ConfigError> {
        let previous = self.inner.maintain_cache.fetch_xor(true, Ordering::SeqCst);
        info!(enabled = !previous, "Toggled manifest cache maintenance");
        self.persist_or(|| self.inner.maintain_cache.store(previous, Ordering::SeqCst))
    }

    pub fn set_manifest_maintenance(&self, enabled: bool) -> Result<GlobalConfig, ConfigError> {
        let previous = self.inner.maintain_cache.swap(enabled, Ordering::SeqCst);
        self.persist_or(|| self.inner.maintain_cache.store(previous, Ordering::SeqCst))
    }

    pub fn set_check_interval(&self, minutes: u64) -> Result<GlobalConfig, ConfigError> {
        validate_interval(minutes)?;
        let previous = self
            .inner
            .check_interval_minutes
            .swap(minutes, Ordering::SeqCst);
        self.persist_or(|| {
            self.inner
                .check_interval_minutes
                .store(previous, Ordering::SeqCst)
        })
    }

    /// Set the address media players use to reach this server; `http://` is added when missing
    pub fn set_server_address(&self, address: &str) -> Result<GlobalConfig, ConfigError> {
        let address = if address.starts_with("http") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        Url::parse(&address).map_err(|source| ConfigError::InvalidServerAddress {
            address: address.clone(),
            source,
        })?;

        let previous =
            std::mem::replace(&mut *write_lock(&self.inner.server_address), address);
        self.persist_or(|| *write_lock(&self.inner.server_address) = previous.clone())
    }

    pub fn set_media_root(&self, path: &Path) -> Result<GlobalConfig, ConfigError> {
        if !path.is_dir() {
            return Err(ConfigError::MediaRootMissing(path.to_path_buf()));
        }
        let previous =
            std::mem::replace(&mut *write_lock(&self.inner.media_root), path.to_path_buf());
        self.persist_or(|| *write_lock(&self.inner.media_root) = previous.clone())
    }

    fn persist_or(&self, rollback: impl Fn()) -> Result<GlobalConfig, ConfigError> {
        let Some(path) = &self.inner.path else {
            return Ok(self.snapshot());
        };

        let _guard = self
            .inner
            .write_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let snapshot = self.snapshot();
        if let Err(e) = write_json(path, &snapshot) {
            rollback();
            return Err(e.into());
        }
        Ok(snapshot)
    }
}

fn validate_interval(minutes: u64) -> Result<(), ConfigError> {
    if minutes == 0 || minutes > MAX_CHECK_INTERVAL_MINUTES {
        return Err(ConfigError::InvalidInterval {
            minutes,
            max: MAX_CHECK_INTERVAL_MINUTES,
        });
    }
    Ok(())
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Read a JSON state file
pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let content = std::fs::read_to_string(path).map_err(|e| StoreError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    serde_json::from_str(&content).map_err(|e| StoreError::JsonParseFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Write a JSON state file, creating its parent directory if needed
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::CreateDirectoryFailed {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).map_err(|e| StoreError::WriteFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Single-file layout used before settings and sources were split
#[derive(Debug, Deserialize)]
struct LegacyConfig {
    channels: Vec<LegacyChannel>,
    check_interval: u64,
    jellyfin_media_path: PathBuf,
    server_address: String,
    #[serde(default)]
    background_tasks_paused: bool,
    #[serde(default)]
    maintain_manifest_cache: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyChannel {
    Tagged {
        id: String,
        source: LegacySource,
        #[serde(default)]
        last_checked: Option<SystemTime>,
    },
    Flat {
        handle: String,
        name: String,
        max_videos: Option<usize>,
        max_age_days: Option<u32>,
        #[serde(default)]
        last_checked: Option<SystemTime>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum LegacySource {
    Channel {
        handle: String,
        name: String,
        max_videos: Option<usize>,
        max_age_days: Option<u32>,
    },
    Playlist {
        id: String,
        name: String,
    },
}

impl LegacyChannel {
    fn into_source(self) -> Source {
        let (mut converted, last_checked) = match self {
            LegacyChannel::Tagged {
                id,
                source,
                last_checked,
            } => {
                let mut converted = match source {
                    LegacySource::Channel {
                        handle,
                        name,
                        max_videos,
                        max_age_days,
                    } => Source::channel(handle, name, max_videos, max_age_days),
                    LegacySource::Playlist { id, name } => Source::playlist(id, name),
                };
                converted.id = id;
                (converted, last_checked)
            }
            LegacyChannel::Flat {
                handle,
                name,
                max_videos,
                max_age_days,
                last_checked,
            } => (
                Source::channel(handle, name, max_videos, max_age_days),
                last_checked,
            ),
        };

        // The epoch marked sources that were never checked
        converted.last_checked = last_checked
            .filter(|t| *t > UNIX_EPOCH)
            .map(DateTime::<Utc>::from);
        converted
    }
}

/// Split a legacy `config.json` into `settings.json` and `sources.json`.
///
/// Does nothing when the legacy file is absent or the new files already exist.
/// The legacy file is renamed to `config.json.migrated` afterwards.
pub fn migrate_legacy_config(config_dir: &Path) -> Result<bool, ConfigError> {
    let legacy_path = config_dir.join(LEGACY_CONFIG_FILENAME);
    if !legacy_path.exists() || config_dir.join(SETTINGS_FILENAME).exists() {
        return Ok(false);
    }

    info!("Migrating legacy config at {}", legacy_path.display());
    let legacy: LegacyConfig = read_json(&legacy_path)?;

    let settings = GlobalConfig {
        background_tasks_paused: legacy.background_tasks_paused,
        maintain_manifest_cache: legacy.maintain_manifest_cache,
        check_interval_minutes: legacy.check_interval.clamp(1, MAX_CHECK_INTERVAL_MINUTES),
        server_address: legacy.server_address,
        media_root_path: legacy.jellyfin_media_path,
    };
    let sources: Vec<Source> = legacy
        .channels
        .into_iter()
        .map(LegacyChannel::into_source)
        .collect();

    write_json(&config_dir.join(SOURCES_FILENAME), &sources)?;
    write_json(&config_dir.join(SETTINGS_FILENAME), &settings)?;

    let migrated = config_dir.join(format!("{}.migrated", LEGACY_CONFIG_FILENAME));
    std::fs::rename(&legacy_path, &migrated).map_err(|e| StoreError::WriteFailed {
        path: migrated,
        source: e,
    })?;

    info!("Migrated {} sources from legacy config", sources.len());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_writes_defaults_when_missing() {
        let dir = tempdir().unwrap();

        let handle = ConfigHandle::load(dir.path()).unwrap();

        assert_eq!(handle.snapshot(), GlobalConfig::default());
        assert!(dir.path().join(SETTINGS_FILENAME).exists());
    }

    #[test]
    fn toggles_persist_and_return_new_state() {
        let dir = tempdir().unwrap();
        let handle = ConfigHandle::load(dir.path()).unwrap();

        let state = handle.toggle_background_tasks().unwrap();
        assert!(state.background_tasks_paused);
        assert!(handle.background_tasks_paused());

        let state = handle.toggle_manifest_maintenance().unwrap();
        assert!(state.maintain_manifest_cache);

        let reloaded = ConfigHandle::load(dir.path()).unwrap().snapshot();
        assert!(reloaded.background_tasks_paused);
        assert!(reloaded.maintain_manifest_cache);

        let state = handle.toggle_background_tasks().unwrap();
        assert!(!state.background_tasks_paused);
    }

    #[test]
    fn clones_share_state() {
        let handle = ConfigHandle::in_memory(GlobalConfig::default());
        let other = handle.clone();

        handle.toggle_background_tasks().unwrap();

        assert!(other.background_tasks_paused());
    }

    #[test]
    fn server_address_gets_scheme() {
        let handle = ConfigHandle::in_memory(GlobalConfig::default());

        let state = handle.set_server_address("192.168.1.10:8080").unwrap();

        assert_eq!(state.server_address, "http://192.168.1.10:8080");
    }

    #[test]
    fn invalid_server_address_is_rejected() {
        let handle = ConfigHandle::in_memory(GlobalConfig::default());

        let result = handle.set_server_address("http://exa mple.com");

        assert!(matches!(
            result,
            Err(ConfigError::InvalidServerAddress { .. })
        ));
        assert_eq!(handle.server_address(), "localhost:8080");
    }

    #[test]
    fn interval_and_media_root_are_validated() {
        let dir = tempdir().unwrap();
        let handle = ConfigHandle::in_memory(GlobalConfig::default());

        assert!(matches!(
            handle.set_check_interval(0),
            Err(ConfigError::InvalidInterval { .. })
        ));
        assert!(matches!(
            handle.set_check_interval(u64::MAX),
            Err(ConfigError::InvalidInterval { .. })
        ));
        assert!(matches!(
            handle.set_media_root(&dir.path().join("missing")),
            Err(ConfigError::MediaRootMissing(_))
        ));

        handle.set_check_interval(30).unwrap();
        handle.set_media_root(dir.path()).unwrap();
        assert_eq!(handle.check_interval(), Duration::from_secs(1800));
        assert_eq!(handle.media_root(), dir.path());
    }

    #[test]
    fn load_rejects_out_of_range_interval() {
        for minutes in [0, u64::MAX] {
            let dir = tempdir().unwrap();
            let settings = GlobalConfig {
                check_interval_minutes: minutes,
                ..GlobalConfig::default()
            };
            write_json(&dir.path().join(SETTINGS_FILENAME), &settings).unwrap();

            assert!(matches!(
                ConfigHandle::load(dir.path()),
                Err(ConfigError::InvalidInterval { .. })
            ));
        }
    }

    #[test]
    fn check_interval_does_not_overflow() {
        let handle = ConfigHandle::in_memory(GlobalConfig {
            check_interval_minutes: u64::MAX,
            ..GlobalConfig::default()
        });

        assert_eq!(handle.check_interval(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn reload_picks_up_changes_from_another_handle() {
        let dir = tempdir().unwrap();
        let daemon = ConfigHandle::load(dir.path()).unwrap();
        let cli = ConfigHandle::load(dir.path()).unwrap();

        cli.toggle_background_tasks().unwrap();
        cli.set_check_interval(15).unwrap();
        assert!(!daemon.background_tasks_paused());

        assert!(daemon.reload().unwrap());
        assert!(daemon.background_tasks_paused());
        assert_eq!(daemon.check_interval(), Duration::from_secs(900));
        assert!(!daemon.reload().unwrap());
    }

    #[test]
    fn reload_keeps_values_when_file_is_invalid() {
        let dir = tempdir().unwrap();
        let handle = ConfigHandle::load(dir.path()).unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILENAME),
            r#"{"check_interval_minutes": 0, "server_address": "x", "media_root_path": "/m"}"#,
        )
        .unwrap();

        assert!(handle.reload().is_err());
        assert_eq!(handle.snapshot(), GlobalConfig::default());
    }

    #[test]
    fn migrates_legacy_config() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{
                "channels": [
                    {"id": "@a", "source": {"type": "Channel", "handle": "@a", "name": "A", "max_videos": 5, "max_age_days": null}, "last_checked": {"secs_since_epoch": 1700000000, "nanos_since_epoch": 0}, "media_dir": "/m/@a"},
                    {"id": "PL1", "source": {"type": "Playlist", "id": "PL1", "name": "List"}, "last_checked": {"secs_since_epoch": 0, "nanos_since_epoch": 0}, "media_dir": "/m/PL1"},
                    {"id": "old", "handle": "@old", "name": "Old", "max_videos": null, "max_age_days": 7}
                ],
                "check_interval": 60,
                "jellyfin_media_path": "/m",
                "server_address": "host:8080",
                "background_tasks_paused": true
            }"#,
        )
        .unwrap();

        let handle = ConfigHandle::load(dir.path()).unwrap();
        let settings = handle.snapshot();
        assert!(settings.background_tasks_paused);
        assert!(!settings.maintain_manifest_cache);
        assert_eq!(settings.check_interval_minutes, 60);
        assert_eq!(settings.media_root_path, PathBuf::from("/m"));

        let sources: Vec<Source> = read_json(&dir.path().join(SOURCES_FILENAME)).unwrap();
        assert_eq!(sources.len(), 3);
        assert_eq!(sources[0].max_videos(), Some(5));
        assert_eq!(
            sources[0].last_checked,
            DateTime::from_timestamp(1_700_000_000, 0)
        );
        assert!(sources[1].last_checked.is_none());
        assert_eq!(sources[1].kind_name(), "playlist");
        assert_eq!(sources[2].id, "@old");
        assert_eq!(sources[2].max_age_days(), Some(7));

        assert!(!dir.path().join("config.json").exists());
        assert!(dir.path().join("config.json.migrated").exists());
    }
}
