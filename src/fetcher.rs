// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::manifest::{Manifest, ManifestEntry};
use crate::source::Source;

/// Upstream access: lists a source's videos and downloads single videos.
///
/// Implementations may retry internally; callers treat every error as final
/// for the request at hand.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// List the source's current upstream videos
    async fn fetch_manifest(&self, source: &Source) -> Result<Manifest, FetchError>;

    /// Download one video into `destination_dir` and return the file's path
    async fn fetch_video(
        &self,
        source: &Source,
        video_id: &str,
        destination_dir: &Path,
    ) -> Result<PathBuf, FetchError>;
}

/// A shared reference to a fetcher
pub type SharedFetcher = Arc<dyn Fetcher>;

/// Settings for the yt-dlp backed fetcher
#[derive(Debug, Clone)]
pub struct YtDlpOptions {
    /// Program to run
    pub program: PathBuf,
    /// Netscape cookies file passed with `--cookies`
    pub cookies: Option<PathBuf>,
    /// Format selector passed with `-f`
    pub format: Option<String>,
}

impl Default for YtDlpOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from("yt-dlp"),
            cookies: None,
            format: None,
        }
    }
}

/// Fetcher that shells out to yt-dlp
#[derive(Debug, Clone, Default)]
pub struct YtDlpFetcher {
    options: YtDlpOptions,
}

impl YtDlpFetcher {
    pub fn new(options: YtDlpOptions) -> Self {
        Self { options }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.options.program);
        cmd.kill_on_drop(true).arg("--no-warnings");
        if let Some(cookies) = &self.options.cookies {
            cmd.arg("--cookies").arg(cookies);
        }
        cmd
    }

    async fn run(&self, mut cmd: Command) -> Result<Output, FetchError> {
        let program = self.options.program.display().to_string();
        debug!(?cmd, "Running fetcher process");

        cmd.output()
            .await
            .map_err(|e| FetchError::SpawnFailed { program, source: e })
    }

    fn process_failed(&self, output: &Output) -> FetchError {
        FetchError::ProcessFailed {
            program: self.options.program.display().to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

#[async_trait]
impl Fetcher for YtDlpFetcher {
    async fn fetch_manifest(&self, source: &Source) -> Result<Manifest, FetchError> {
        let params = source.fetch_params(Utc::now());

        let mut cmd = self.command();
        cmd.args(["--dump-json", "--ignore-errors"]);
        if let Some(date) = params.date_after {
            cmd.arg("--dateafter").arg(date.format("%Y%m%d").to_string());
        }
        if let Some(end) = params.playlist_end {
            cmd.args(["--playlist-start", "1", "--playlist-end"])
                .arg(end.to_string());
        }
        cmd.arg(&params.url);

        let output = self.run(cmd).await?;
        let entries = parse_manifest_output(&output.stdout);

        if entries.is_empty() {
            if !output.status.success() {
                return Err(self.process_failed(&output));
            }
            return Err(FetchError::EmptyManifest { url: params.url });
        }

        if !output.stderr.is_empty() {
            warn!(
                source_id = source.id(),
                "Some videos were skipped: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(Manifest::new(entries))
    }

    async fn fetch_video(
        &self,
        _source: &Source,
        video_id: &str,
        destination_dir: &Path,
    ) -> Result<PathBuf, FetchError> {
        tokio::fs::create_dir_all(destination_dir)
            .await
            .map_err(|e| FetchError::Io {
                path: destination_dir.to_path_buf(),
                source: e,
            })?;

        let template = destination_dir.join("%(upload_date)s - %(id)s.%(ext)s");

        let mut cmd = self.command();
        cmd.args(["--no-playlist", "--no-progress", "--print", "after_move:filepath"])
            .arg("-o")
            .arg(&template);
        if let Some(format) = &self.options.format {
            cmd.arg("-f").arg(format);
        }
        cmd.arg(format!("https://www.youtube.com/watch?v={}", video_id));

        let output = self.run(cmd).await?;
        if !output.status.success() {
            return Err(self.process_failed(&output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let path = stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| FetchError::InvalidOutput("no file path printed".to_string()))?;

        if !path.exists() {
            return Err(FetchError::InvalidOutput(format!(
                "reported file {} does not exist",
                path.display()
            )));
        }

        Ok(path)
    }
}

/// Parse yt-dlp `--dump-json` output, one JSON object per line.
///
/// Lines without an id or a usable publish date are skipped.
pub fn parse_manifest_output(stdout: &[u8]) -> Vec<ManifestEntry> {
    stdout
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_slice::<serde_json::Value>(line).ok())
        .filter_map(|v| {
            let video_id = v["id"].as_str()?.to_string();
            let published_at = v["timestamp"]
                .as_i64()
                .and_then(|ts| DateTime::from_timestamp(ts, 0))
                .or_else(|| parse_upload_date(v["upload_date"].as_str()?))?;
            Some(ManifestEntry {
                video_id,
                published_at,
            })
        })
        .collect()
}

/// Parse yt-dlp's `YYYYMMDD` upload date as midnight UTC
fn parse_upload_date(date: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(date, "%Y%m%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
}
