// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::config::{read_json, write_json};
use crate::error::LibraryError;

/// Extension yt-dlp uses for interrupted downloads
const PARTIAL_EXTENSION: &str = "part";

/// A video present in the local library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub video_id: String,
    pub source_id: String,
    pub published_at: DateTime<Utc>,
    pub downloaded_at: DateTime<Utc>,
    pub file_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl VideoRecord {
    /// Path of the JSON file describing this record
    pub fn record_path(&self, media_dir: &Path) -> PathBuf {
        record_path(media_dir, &self.video_id)
    }
}

/// Videos found in a source's media directory
#[derive(Debug, Clone, Default)]
pub struct LibraryState {
    /// Records ordered by publish date, newest first
    pub records: Vec<VideoRecord>,
    /// Number of partial files that were cleaned up during scan
    pub partial_files_cleaned: usize,
}

/// Location of a record file for a video id
pub fn record_path(media_dir: &Path, video_id: &str) -> PathBuf {
    media_dir.join(format!("{}.json", sanitize_filename::sanitize(video_id)))
}

/// Write a record next to its video file
pub fn write_record(record: &VideoRecord, media_dir: &Path) -> Result<(), LibraryError> {
    write_json(&record.record_path(media_dir), record)?;
    Ok(())
}

/// Scan a source's media directory for video records.
///
/// Creates the directory when missing and removes partial files left behind by
/// interrupted downloads.
pub fn scan_source_dir(media_dir: &Path, source_id: &str) -> Result<LibraryState, LibraryError> {
    let mut state = LibraryState::default();

    if !media_dir.exists() {
        std::fs::create_dir_all(media_dir).map_err(|e| LibraryError::CreateDirectoryFailed {
            path: media_dir.to_path_buf(),
            source: e,
        })?;
        return Ok(state);
    }

    let entries = std::fs::read_dir(media_dir).map_err(|e| LibraryError::ReadDirectoryFailed {
        path: media_dir.to_path_buf(),
        source: e,
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| LibraryError::ReadDirectoryFailed {
            path: media_dir.to_path_buf(),
            source: e,
        })?;
        let path = entry.path();

        match path.extension().and_then(|e| e.to_str()) {
            Some(PARTIAL_EXTENSION) => {
                if std::fs::remove_file(&path).is_ok() {
                    state.partial_files_cleaned += 1;
                }
            }
            Some("json") => {
                if let Ok(record) = read_json::<VideoRecord>(&path)
                    && record.source_id == source_id
                {
                    state.records.push(record);
                }
            }
            _ => {}
        }
    }

    state.records.sort_by(|a, b| {
        b.published_at
            .cmp(&a.published_at)
            .then_with(|| a.video_id.cmp(&b.video_id))
    });

    Ok(state)
}

/// Count the records in a source's media directory without touching anything
pub fn count_records(media_dir: &Path, source_id: &str) -> usize {
    let Ok(entries) = std::fs::read_dir(media_dir) else {
        return 0;
    };

    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|e| e == "json"))
        .filter_map(|path| read_json::<VideoRecord>(&path).ok())
        .filter(|record| record.source_id == source_id)
        .count()
}

/// Delete a video's file and its record. A file that is already gone is not an error.
pub async fn remove_video(record: &VideoRecord, media_dir: &Path) -> Result<(), LibraryError> {
    remove_if_exists(&record.file_path).await?;
    remove_if_exists(&record.record_path(media_dir)).await
}

async fn remove_if_exists(path: &Path) -> Result<(), LibraryError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LibraryError::RemoveFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Remove a source's whole media directory
pub async fn purge_source_dir(media_dir: &Path) -> Result<(), LibraryError> {
    match tokio::fs::remove_dir_all(media_dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LibraryError::RemoveFailed {
            path: media_dir.to_path_buf(),
            source: e,
        }),
    }
}

/// SHA-256 of a file, formatted as `sha256:<hex>`
pub async fn hash_file(path: &Path) -> Result<String, LibraryError> {
    let hash_err = |e| LibraryError::HashFailed {
        path: path.to_path_buf(),
        source: e,
    };

    let mut file = tokio::fs::File::open(path).await.map_err(hash_err)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).await.map_err(hash_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let hex: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    Ok(format!("sha256:{}", hex))
}
