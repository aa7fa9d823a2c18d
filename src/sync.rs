use crate::config::FreshnessTuning;
use crate::merkle::{build_merkle_index, MerkleIndex, WalkOptions};
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessMode {
    Fresh,
    Aging,
    SkippedRecent,
    Synced,
}

#[derive(Debug, Clone)]
pub struct FreshnessResult {
    pub mode: FreshnessMode,
    pub checked_at: SystemTime,
    pub threshold_ms: u64,
}

/// Tracks last-checked/last-synced timestamps per codebase so
/// `ensureFreshness` can apply the check-debounce window (spec §4.E).
#[derive(Default)]
pub struct FreshnessTracker {
    last_checked: Mutex<HashMap<PathBuf, SystemTime>>,
    last_synced: Mutex<HashMap<PathBuf, SystemTime>>,
}

impl FreshnessTracker {
    pub fn record_synced(&self, path: &Path, at: SystemTime) {
        self.last_synced.lock().unwrap().insert(path.to_path_buf(), at);
        self.last_checked.lock().unwrap().insert(path.to_path_buf(), at);
    }

    /// `ensureFreshness(path, nowFn, thresholdMs)` (spec §4.E).
    pub fn ensure_freshness(&self, path: &Path, now: SystemTime, tuning: &FreshnessTuning) -> FreshnessResult {
        let mut last_checked = self.last_checked.lock().unwrap();
        let debounce = Duration::from_millis(tuning.check_debounce_ms);

        if let Some(checked) = last_checked.get(path) {
            if now.duration_since(*checked).unwrap_or_default() < debounce {
                return FreshnessResult {
                    mode: FreshnessMode::SkippedRecent,
                    checked_at: now,
                    threshold_ms: tuning.check_debounce_ms,
                };
            }
        }
        last_checked.insert(path.to_path_buf(), now);
        drop(last_checked);

        let last_synced = self.last_synced.lock().unwrap();
        let age = last_synced
            .get(path)
            .and_then(|t| now.duration_since(*t).ok())
            .unwrap_or(Duration::MAX);

        let (mode, threshold_ms) = if age < Duration::from_millis(tuning.fresh_threshold_ms) {
            (FreshnessMode::Fresh, tuning.fresh_threshold_ms)
        } else if age < Duration::from_millis(tuning.aging_threshold_ms) {
            (FreshnessMode::Aging, tuning.aging_threshold_ms)
        } else {
            (FreshnessMode::Synced, tuning.aging_threshold_ms)
        };

        FreshnessResult {
            mode,
            checked_at: now,
            threshold_ms,
        }
    }
}

/// Result of diffing two Merkle maps (spec §4.E `reindexByChange`).
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl ChangeSet {
    pub fn changed_files(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .added
            .iter()
            .chain(self.removed.iter())
            .chain(self.modified.iter())
            .cloned()
            .collect();
        all.sort();
        all.dedup();
        all
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Diffs `old` against `new`: `added` = new∖old, `removed` = old∖new,
/// `modified` = paths present in both whose hash differs (spec §4.E).
pub fn diff_merkle_maps(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> ChangeSet {
    let mut changes = ChangeSet::default();
    for (path, hash) in new {
        match old.get(path) {
            None => changes.added.push(path.clone()),
            Some(old_hash) if old_hash != hash => changes.modified.push(path.clone()),
            Some(_) => {}
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            changes.removed.push(path.clone());
        }
    }
    changes.added.sort();
    changes.removed.sort();
    changes.modified.sort();
    changes
}

/// Recomputes the Merkle index for `repo_root` and diffs it against the
/// previously persisted map, returning the change set (spec §4.E).
pub fn reindex_by_change(
    repo_root: &Path,
    previous: &BTreeMap<String, String>,
    options: &WalkOptions,
) -> Result<(ChangeSet, MerkleIndex)> {
    let current = build_merkle_index(repo_root, options)?;
    let changes = diff_merkle_maps(previous, &current.entries);
    Ok((changes, current))
}

/// File extensions that trigger a call-graph sidecar rebuild when any
/// changed path matches (spec §4.E "supported-source delta policy").
const SUPPORTED_SOURCE_EXTENSIONS: &[&str] = &["ts", "tsx", "py"];

pub fn should_rebuild_call_graph(changed_files: &[String]) -> bool {
    changed_files.iter().any(|path| {
        Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| SUPPORTED_SOURCE_EXTENSIONS.contains(&ext))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_classifies_added_removed_modified() {
        let mut old = BTreeMap::new();
        old.insert("a.rs".to_string(), "hash_a".to_string());
        old.insert("b.rs".to_string(), "hash_b".to_string());
        old.insert("c.rs".to_string(), "hash_c".to_string());

        let mut new = BTreeMap::new();
        new.insert("a.rs".to_string(), "hash_a".to_string()); // unchanged
        new.insert("b.rs".to_string(), "hash_b2".to_string()); // modified
        new.insert("d.rs".to_string(), "hash_d".to_string()); // added
        // c.rs removed

        let changes = diff_merkle_maps(&old, &new);
        assert_eq!(changes.added, vec!["d.rs".to_string()]);
        assert_eq!(changes.removed, vec!["c.rs".to_string()]);
        assert_eq!(changes.modified, vec!["b.rs".to_string()]);
        assert_eq!(
            changes.changed_files(),
            vec!["b.rs".to_string(), "c.rs".to_string(), "d.rs".to_string()]
        );
    }

    #[test]
    fn skipped_recent_when_within_debounce() {
        let tracker = FreshnessTracker::default();
        let tuning = FreshnessTuning::default();
        let path = PathBuf::from("/repo");
        let now = SystemTime::now();
        let first = tracker.ensure_freshness(&path, now, &tuning);
        assert_ne!(first.mode, FreshnessMode::SkippedRecent);
        let second = tracker.ensure_freshness(&path, now, &tuning);
        assert_eq!(second.mode, FreshnessMode::SkippedRecent);
    }

    #[test]
    fn call_graph_rebuild_triggers_on_supported_extension() {
        assert!(should_rebuild_call_graph(&["src/app.ts".to_string()]));
        assert!(should_rebuild_call_graph(&["pkg/mod.py".to_string()]));
        assert!(!should_rebuild_call_graph(&["README.md".to_string(), "Cargo.toml".to_string()]));
    }
}
