// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::progress::JobId;

/// Errors that can occur when reading or writing JSON state files
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize state: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),

    #[error("Failed to create directory {path}: {source}")]
    CreateDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur when scanning or purging a source's media directory
#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("Failed to read directory {path}: {source}")]
    ReadDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create directory {path}: {source}")]
    CreateDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    RemoveFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to hash {path}: {source}")]
    HashFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Record error: {0}")]
    Store(#[from] StoreError),
}

/// Rejected source configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field '{field}' is missing")]
    MissingField { field: &'static str },

    #[error("'{id}' cannot be used as a source id; it must be a plain file name")]
    InvalidId { id: String },

    #[error("'{field}' must be a positive integer")]
    NonPositiveLimit { field: &'static str },

    #[error("A source with id '{id}' already exists")]
    DuplicateId { id: String },

    #[error("Cannot change a {existing} into a {requested}")]
    KindMismatch {
        existing: &'static str,
        requested: &'static str,
    },
}

/// Errors from the source registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid source: {0}")]
    Validation(#[from] ValidationError),

    #[error("Source '{0}' not found")]
    NotFound(String),

    #[error("Failed to persist sources: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to remove videos: {0}")]
    Library(#[from] LibraryError),
}

/// Errors from global configuration updates
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid server address '{address}'")]
    InvalidServerAddress {
        address: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Media root {0} does not exist")]
    MediaRootMissing(PathBuf),

    #[error("Check interval must be between 1 and {max} minutes, got {minutes}")]
    InvalidInterval { minutes: u64, max: u64 },

    #[error("Failed to persist settings: {0}")]
    Store(#[from] StoreError),
}

/// Errors reported by a fetcher for a manifest or a single video
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Failed to launch {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    ProcessFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("No videos found at {url}")]
    EmptyManifest { url: String },

    #[error("Fetcher produced unusable output: {0}")]
    InvalidOutput(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// Whether retrying the same request later could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout(_) | FetchError::ProcessFailed { .. } | FetchError::EmptyManifest { .. }
        )
    }
}

/// Errors that abort a whole sync job
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Failed to fetch manifest for '{source_id}': {source}")]
    ManifestFetch {
        source_id: String,
        #[source]
        source: FetchError,
    },

    #[error("Manifest fetch for '{source_id}' timed out after {after:?}")]
    ManifestTimeout { source_id: String, after: Duration },

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    #[error("Sync job panicked: {0}")]
    Panicked(String),
}

/// Reasons a trigger or reset request is rejected by the scheduler
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Background tasks are paused")]
    Paused,

    #[error("A sync job ({job_id}) is already running for '{source_id}'")]
    AlreadyRunning { source_id: String, job_id: JobId },

    #[error("Unknown source '{0}'")]
    UnknownSource(String),

    #[error("'{0}' is being reset")]
    Resetting(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Settings error: {0}")]
    Config(#[from] ConfigError),

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),
}
