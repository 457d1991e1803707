// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A configured upstream origin to mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Stable external identifier (channel handle or playlist id)
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// When the last sync job for this source finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    /// Bumped by every reset; a running scheduler treats a change as a reset request
    #[serde(default)]
    pub generation: u64,
    #[serde(flatten)]
    pub kind: SourceKind,
}

/// Variant-specific source settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceKind {
    Channel {
        handle: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_videos: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_age_days: Option<u32>,
    },
    Playlist { playlist_id: String },
}

/// Parameters a fetcher needs to list a source's upstream videos
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchParams {
    pub url: String,
    /// Only list videos published on or after this instant
    pub date_after: Option<DateTime<Utc>>,
    /// Only list the first N upstream entries
    pub playlist_end: Option<usize>,
}

impl Source {
    /// Create a channel source; the handle doubles as the id
    pub fn channel(
        handle: impl Into<String>,
        name: impl Into<String>,
        max_videos: Option<usize>,
        max_age_days: Option<u32>,
    ) -> Self {
        let handle = handle.into();
        Self {
            id: handle.clone(),
            name: name.into(),
            created_at: Utc::now(),
            last_checked: None,
            generation: 0,
            kind: SourceKind::Channel {
                handle,
                max_videos,
                max_age_days,
            },
        }
    }

    /// Create a playlist source; the playlist id doubles as the id
    pub fn playlist(playlist_id: impl Into<String>, name: impl Into<String>) -> Self {
        let playlist_id = playlist_id.into();
        Self {
            id: playlist_id.clone(),
            name: name.into(),
            created_at: Utc::now(),
            last_checked: None,
            generation: 0,
            kind: SourceKind::Playlist { playlist_id },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn max_videos(&self) -> Option<usize> {
        match self.kind {
            SourceKind::Channel { max_videos, .. } => max_videos,
            SourceKind::Playlist { .. } => None,
        }
    }

    pub fn max_age_days(&self) -> Option<u32> {
        match self.kind {
            SourceKind::Channel { max_age_days, .. } => max_age_days,
            SourceKind::Playlist { .. } => None,
        }
    }

    /// Oldest publish date a video may have and still be kept.
    ///
    /// A limit reaching back past the earliest representable date keeps everything.
    pub fn age_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let days = Duration::try_days(i64::from(self.max_age_days()?))?;
        now.checked_sub_signed(days)
    }

    /// Upstream listing parameters for this source
    pub fn fetch_params(&self, now: DateTime<Utc>) -> FetchParams {
        match &self.kind {
            SourceKind::Channel {
                handle, max_videos, ..
            } => FetchParams {
                url: format!(
                    "https://www.youtube.com/@{}/videos",
                    handle.trim_start_matches('@')
                ),
                date_after: self.age_cutoff(now),
                playlist_end: *max_videos,
            },
            SourceKind::Playlist { playlist_id } => FetchParams {
                url: format!("https://www.youtube.com/playlist?list={}", playlist_id),
                date_after: None,
                playlist_end: None,
            },
        }
    }

    /// Directory holding this source's videos, always a direct child of the media root
    pub fn media_dir(&self, media_root: &Path) -> PathBuf {
        let name = sanitize_filename::sanitize(&self.id);
        match name.trim() {
            "" | "." | ".." => media_root.join(format!("_{}", name.trim())),
            _ => media_root.join(name),
        }
    }

    /// Apply a partial channel update; omitted fields keep their current value.
    /// Only the name applies to playlists.
    pub fn with_update(&self, update: &ChannelUpdate) -> Source {
        let mut updated = self.clone();
        if let Some(name) = &update.name {
            updated.name = name.clone();
        }
        if let SourceKind::Channel {
            max_videos,
            max_age_days,
            ..
        } = &mut updated.kind
        {
            if let Some(limit) = update.max_videos {
                *max_videos = limit;
            }
            if let Some(limit) = update.max_age_days {
                *max_age_days = limit;
            }
        }
        updated
    }

    /// Check required fields and limits
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::MissingField { field: "id" });
        }
        let sanitized = sanitize_filename::sanitize(&self.id);
        if sanitized != self.id || matches!(sanitized.as_str(), "." | "..") {
            return Err(ValidationError::InvalidId {
                id: self.id.clone(),
            });
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField { field: "name" });
        }

        match &self.kind {
            SourceKind::Channel {
                handle,
                max_videos,
                max_age_days,
            } => {
                if handle.trim().is_empty() {
                    return Err(ValidationError::MissingField { field: "handle" });
                }
                if *max_videos == Some(0) {
                    return Err(ValidationError::NonPositiveLimit {
                        field: "max_videos",
                    });
                }
                if *max_age_days == Some(0) {
                    return Err(ValidationError::NonPositiveLimit {
                        field: "max_age_days",
                    });
                }
            }
            SourceKind::Playlist { playlist_id } => {
                if playlist_id.trim().is_empty() {
                    return Err(ValidationError::MissingField {
                        field: "playlist_id",
                    });
                }
            }
        }

        Ok(())
    }
}

/// Changes to a channel's settings. `None` keeps the current value; for the
/// limits, `Some(None)` removes the limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelUpdate {
    pub name: Option<String>,
    pub max_videos: Option<Option<usize>>,
    pub max_age_days: Option<Option<u32>>,
}

impl ChannelUpdate {
    /// Limit change from a `--limit <n>` flag and its `--no-limit` counterpart
    pub fn limit<T>(value: Option<T>, clear: bool) -> Option<Option<T>> {
        if clear { Some(None) } else { value.map(Some) }
    }
}

impl SourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::Channel { .. } => "channel",
            SourceKind::Playlist { .. } => "playlist",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn limit_flags_map_to_changes() {
        assert_eq!(ChannelUpdate::limit(Some(5usize), false), Some(Some(5)));
        assert_eq!(ChannelUpdate::limit(None::<usize>, false), None);
        assert_eq!(ChannelUpdate::limit(None::<u32>, true), Some(None));
    }

    #[test]
    fn channel_fetch_params_include_limits() {
        let now = Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap();
        let source = Source::channel("@rustlang", "Rust", Some(10), Some(30));

        let params = source.fetch_params(now);

        assert_eq!(params.url, "https://www.youtube.com/@rustlang/videos");
        assert_eq!(
            params.date_after,
            Some(Utc.with_ymd_and_hms(2024, 5, 31, 0, 0, 0).unwrap())
        );
        assert_eq!(params.playlist_end, Some(10));
    }

    #[test]
    fn playlist_fetch_params_have_no_limits() {
        let source = Source::playlist("PL123", "Talks");
        let params = source.fetch_params(Utc::now());

        assert_eq!(params.url, "https://www.youtube.com/playlist?list=PL123");
        assert!(params.date_after.is_none());
        assert!(params.playlist_end.is_none());
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let source = Source::channel("@x", "X", Some(0), None);
        assert_eq!(
            source.validate(),
            Err(ValidationError::NonPositiveLimit {
                field: "max_videos"
            })
        );

        let source = Source::channel("@x", "X", None, Some(0));
        assert!(source.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_name() {
        let source = Source::playlist("PL1", "  ");
        assert_eq!(
            source.validate(),
            Err(ValidationError::MissingField { field: "name" })
        );
    }

    #[test]
    fn media_dir_sanitizes_id() {
        let source = Source::playlist("PL/../evil", "Evil");
        let dir = source.media_dir(Path::new("/media"));
        assert_eq!(dir.parent(), Some(Path::new("/media")));
    }

    #[test]
    fn media_dir_is_never_the_media_root() {
        let root = Path::new("/media");
        for id in ["..", ".", "/", "", "  "] {
            let dir = Source::playlist(id, "X").media_dir(root);
            assert_ne!(dir, root, "id {:?}", id);
            assert_eq!(dir.parent(), Some(root), "id {:?}", id);
            assert!(dir.file_name().is_some(), "id {:?}", id);
        }
    }

    #[test]
    fn validate_rejects_path_like_ids() {
        for id in ["..", ".", "/", "PL/1", "a\\b"] {
            let result = Source::playlist(id, "X").validate();
            assert!(
                matches!(result, Err(ValidationError::InvalidId { .. })),
                "id {:?} gave {:?}",
                id,
                result
            );
        }
        assert!(Source::channel("@rust-lang", "Rust", None, None).validate().is_ok());
    }

    #[test]
    fn huge_age_limit_means_no_cutoff() {
        let source = Source::channel("@c", "C", None, Some(200_000_000));
        assert!(source.validate().is_ok());

        let now = Utc::now();
        assert!(source.age_cutoff(now).is_none());
        assert!(source.fetch_params(now).date_after.is_none());

        let source = Source::channel("@c", "C", None, Some(u32::MAX));
        assert!(source.age_cutoff(now).is_none());
    }

    #[test]
    fn update_keeps_omitted_limits() {
        let source = Source::channel("@x", "X", Some(5), Some(30));

        let renamed = source.with_update(&ChannelUpdate {
            name: Some("Renamed".to_string()),
            ..ChannelUpdate::default()
        });
        assert_eq!(renamed.name, "Renamed");
        assert_eq!(renamed.max_videos(), Some(5));
        assert_eq!(renamed.max_age_days(), Some(30));

        let cleared = source.with_update(&ChannelUpdate {
            max_videos: Some(None),
            max_age_days: Some(Some(7)),
            ..ChannelUpdate::default()
        });
        assert_eq!(cleared.name, "X");
        assert_eq!(cleared.max_videos(), None);
        assert_eq!(cleared.max_age_days(), Some(7));
    }

    #[test]
    fn serializes_with_type_tag() {
        let source = Source::channel("@x", "X", Some(5), None);
        let json = serde_json::to_value(&source).unwrap();

        assert_eq!(json["type"], "Channel");
        assert_eq!(json["handle"], "@x");
        assert_eq!(json["max_videos"], 5);

        let back: Source = serde_json::from_value(json).unwrap();
        assert_eq!(back, source);
    }
}
