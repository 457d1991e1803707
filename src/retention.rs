// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::library::VideoRecord;
use crate::manifest::{Manifest, ManifestEntry};
use crate::source::Source;

/// What a sync job has to do to bring the library in line with a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Videos to download, in manifest order
    pub to_fetch: Vec<ManifestEntry>,
    /// Local videos to delete
    pub to_evict: Vec<VideoRecord>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.to_fetch.is_empty() && self.to_evict.is_empty()
    }

    pub fn fetch_ids(&self) -> Vec<&str> {
        self.to_fetch.iter().map(|e| e.video_id.as_str()).collect()
    }

    pub fn evict_ids(&self) -> Vec<&str> {
        self.to_evict.iter().map(|r| r.video_id.as_str()).collect()
    }
}

/// Decide which videos to download and which to delete.
///
/// Videos no longer listed upstream are always evicted. The age limit is applied
/// before the count limit. When publish dates tie under the count limit, the
/// video listed earlier in the manifest is kept.
pub fn plan(
    source: &Source,
    manifest: &Manifest,
    local_records: &[VideoRecord],
    now: DateTime<Utc>,
) -> SyncPlan {
    let position: HashMap<&str, usize> = manifest
        .entries
        .iter()
        .enumerate()
        .rev()
        .map(|(i, e)| (e.video_id.as_str(), i))
        .collect();
    let local_ids: HashSet<&str> = local_records.iter().map(|r| r.video_id.as_str()).collect();

    let mut seen = HashSet::new();
    let mut to_fetch: Vec<&ManifestEntry> = manifest
        .entries
        .iter()
        .filter(|e| !local_ids.contains(e.video_id.as_str()))
        .filter(|e| seen.insert(e.video_id.as_str()))
        .collect();

    let mut evicted: HashSet<&str> = local_records
        .iter()
        .filter(|r| !position.contains_key(r.video_id.as_str()))
        .map(|r| r.video_id.as_str())
        .collect();

    if let Some(cutoff) = source.age_cutoff(now) {
        to_fetch.retain(|e| e.published_at >= cutoff);
        evicted.extend(
            local_records
                .iter()
                .filter(|r| r.published_at < cutoff)
                .map(|r| r.video_id.as_str()),
        );
    }

    if let Some(max_videos) = source.max_videos() {
        // (published_at, manifest position, is_local, id)
        let mut ranked: Vec<(DateTime<Utc>, usize, bool, &str)> = local_records
            .iter()
            .filter(|r| !evicted.contains(r.video_id.as_str()))
            .map(|r| {
                let pos = position[r.video_id.as_str()];
                (r.published_at, pos, true, r.video_id.as_str())
            })
            .chain(to_fetch.iter().map(|e| {
                let pos = position[e.video_id.as_str()];
                (e.published_at, pos, false, e.video_id.as_str())
            }))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut dropped = HashSet::new();
        for &(_, _, is_local, id) in ranked.iter().skip(max_videos) {
            if is_local {
                evicted.insert(id);
            } else {
                dropped.insert(id);
            }
        }
        to_fetch.retain(|e| !dropped.contains(e.video_id.as_str()));
    }

    let mut evict_seen = HashSet::new();
    SyncPlan {
        to_fetch: to_fetch.into_iter().cloned().collect(),
        to_evict: local_records
            .iter()
            .filter(|r| evicted.contains(r.video_id.as_str()))
            .filter(|r| evict_seen.insert(r.video_id.as_str()))
            .cloned()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::path::PathBuf;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn entry(id: &str, published_at: DateTime<Utc>) -> ManifestEntry {
        ManifestEntry {
            video_id: id.to_string(),
            published_at,
        }
    }

    fn record(id: &str, published_at: DateTime<Utc>) -> VideoRecord {
        VideoRecord {
            video_id: id.to_string(),
            source_id: "@chan".to_string(),
            published_at,
            downloaded_at: published_at,
            file_path: PathBuf::from(format!("/media/@chan/{}.mp4", id)),
            content_hash: None,
        }
    }

    fn manifest(entries: Vec<ManifestEntry>) -> Manifest {
        Manifest::new(entries)
    }

    fn apply(plan: &SyncPlan, local: &[VideoRecord]) -> Vec<VideoRecord> {
        let mut next: Vec<VideoRecord> = local
            .iter()
            .filter(|r| !plan.to_evict.iter().any(|e| e.video_id == r.video_id))
            .cloned()
            .collect();
        next.extend(plan.to_fetch.iter().map(|e| record(&e.video_id, e.published_at)));
        next
    }

    #[test]
    fn fetches_everything_new_in_manifest_order() {
        let source = Source::playlist("PL1", "List");
        let m = manifest(vec![entry("b", at(1)), entry("a", at(3)), entry("c", at(2))]);

        let plan = plan(&source, &m, &[], Utc::now());

        assert_eq!(plan.fetch_ids(), vec!["b", "a", "c"]);
        assert!(plan.to_evict.is_empty());
    }

    #[test]
    fn count_limit_evicts_oldest_local() {
        let source = Source::channel("@chan", "Chan", Some(2), None);
        let local = vec![record("A", at(1)), record("B", at(2))];
        let m = manifest(vec![entry("A", at(1)), entry("B", at(2)), entry("C", at(3))]);

        let plan = plan(&source, &m, &local, Utc::now());

        assert_eq!(plan.fetch_ids(), vec!["C"]);
        assert_eq!(plan.evict_ids(), vec!["A"]);
    }

    #[test]
    fn count_limit_skips_old_candidates() {
        let source = Source::channel("@chan", "Chan", Some(2), None);
        let local = vec![record("B", at(5)), record("C", at(6))];
        let m = manifest(vec![entry("C", at(6)), entry("B", at(5)), entry("A", at(1))]);

        let plan = plan(&source, &m, &local, Utc::now());

        assert!(plan.is_empty());
    }

    #[test]
    fn video_missing_upstream_is_evicted_regardless_of_limits() {
        let source = Source::channel("@chan", "Chan", Some(10), Some(3650));
        let now = Utc::now();
        let local = vec![record("D", now), record("E", now)];
        let m = manifest(vec![entry("E", now)]);

        let plan = plan(&source, &m, &local, now);

        assert_eq!(plan.evict_ids(), vec!["D"]);
        assert!(plan.to_fetch.is_empty());
    }

    #[test]
    fn missing_upstream_does_not_take_a_slot() {
        let source = Source::channel("@chan", "Chan", Some(1), None);
        let local = vec![record("gone", at(10))];
        let m = manifest(vec![entry("new", at(5))]);

        let plan = plan(&source, &m, &local, Utc::now());

        assert_eq!(plan.fetch_ids(), vec!["new"]);
        assert_eq!(plan.evict_ids(), vec!["gone"]);
    }

    #[test]
    fn age_limit_filters_candidates_and_evicts_old_local() {
        let now = Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap();
        let source = Source::channel("@chan", "Chan", None, Some(7));
        let fresh = now - Duration::days(1);
        let stale = now - Duration::days(30);
        let local = vec![record("old-local", stale), record("new-local", fresh)];
        let m = manifest(vec![
            entry("new-local", fresh),
            entry("old-local", stale),
            entry("new-remote", fresh),
            entry("old-remote", stale),
        ]);

        let plan = plan(&source, &m, &local, now);

        assert_eq!(plan.fetch_ids(), vec!["new-remote"]);
        assert_eq!(plan.evict_ids(), vec!["old-local"]);
    }

    #[test]
    fn age_applies_before_count() {
        let now = Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap();
        let source = Source::channel("@chan", "Chan", Some(2), Some(7));
        let m = manifest(vec![
            entry("a", now - Duration::days(1)),
            entry("b", now - Duration::days(2)),
            entry("c", now - Duration::days(3)),
            entry("d", now - Duration::days(20)),
        ]);

        let plan = plan(&source, &m, &[], now);

        assert_eq!(plan.fetch_ids(), vec!["a", "b"]);
    }

    #[test]
    fn ties_keep_earlier_manifest_entry() {
        let source = Source::channel("@chan", "Chan", Some(1), None);
        let local = vec![record("second", at(7))];
        let m = manifest(vec![entry("first", at(7)), entry("second", at(7))]);

        let plan = plan(&source, &m, &local, Utc::now());

        assert_eq!(plan.fetch_ids(), vec!["first"]);
        assert_eq!(plan.evict_ids(), vec!["second"]);
    }

    #[test]
    fn duplicate_manifest_entries_are_fetched_once() {
        let source = Source::playlist("PL1", "List");
        let m = manifest(vec![entry("a", at(1)), entry("a", at(1))]);

        let plan = plan(&source, &m, &[], Utc::now());

        assert_eq!(plan.fetch_ids(), vec!["a"]);
    }

    #[test]
    fn plan_properties_hold_across_limits() {
        let now = at(100 * 86_400);
        let manifests = [
            vec![],
            vec![entry("a", at(99 * 86_400)), entry("b", at(50 * 86_400))],
            vec![
                entry("c", at(98 * 86_400)),
                entry("a", at(99 * 86_400)),
                entry("d", at(98 * 86_400)),
                entry("e", at(10 * 86_400)),
            ],
        ];
        let locals = [
            vec![],
            vec![record("a", at(99 * 86_400)), record("z", at(97 * 86_400))],
            vec![record("e", at(10 * 86_400)), record("b", at(50 * 86_400))],
        ];
        let limits = [(None, None), (Some(1), None), (None, Some(5)), (Some(2), Some(60))];

        for entries in &manifests {
            let m = manifest(entries.clone());
            for local in &locals {
                for &(max_videos, max_age_days) in &limits {
                    let source = Source::channel("@chan", "Chan", max_videos, max_age_days);
                    let first = plan(&source, &m, local, now);

                    for id in first.fetch_ids() {
                        assert!(!first.evict_ids().contains(&id));
                    }

                    let after = apply(&first, local);
                    if let Some(n) = max_videos {
                        assert!(after.len() <= n);
                    }
                    if let Some(cutoff) = source.age_cutoff(now) {
                        assert!(after.iter().all(|r| r.published_at >= cutoff));
                    }

                    let second = plan(&source, &m, &after, now);
                    assert!(second.is_empty(), "second plan not empty: {:?}", second);
                }
            }
        }
    }
}
