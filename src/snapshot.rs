use crate::fingerprint::{Fingerprint, FingerprintSource};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One status at any moment (I1), enforced by the type system rather than by
/// convention: each variant only carries the fields valid for it.
#[derive(Debug, Clone, PartialEq)]
pub enum CodebaseStatus {
    Indexing {
        indexing_percentage: u8,
    },
    Indexed {
        indexed_files: u64,
        total_chunks: u64,
    },
    SyncCompleted {
        indexed_files: u64,
        total_chunks: u64,
    },
    RequiresReindex {
        reindex_reason: String,
    },
    IndexFailed {
        error_message: String,
    },
}

impl CodebaseStatus {
    fn label(&self) -> &'static str {
        match self {
            CodebaseStatus::Indexing { .. } => "indexing",
            CodebaseStatus::Indexed { .. } => "indexed",
            CodebaseStatus::SyncCompleted { .. } => "sync_completed",
            CodebaseStatus::RequiresReindex { .. } => "requires_reindex",
            CodebaseStatus::IndexFailed { .. } => "indexfailed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodebaseEntry {
    pub status: CodebaseStatus,
    pub fingerprint: Fingerprint,
    pub fingerprint_source: FingerprintSource,
    pub last_updated: DateTime<Utc>,
}

/// Wire representation matching spec §3's flat JSON shape exactly: one
/// struct with optional fields, used only at the serialization boundary so
/// the in-memory type can stay an enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawEntry {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    indexed_files: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_chunks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    indexing_percentage: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reindex_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    fingerprint: Fingerprint,
    fingerprint_source: FingerprintSource,
    last_updated: DateTime<Utc>,
}

impl From<&CodebaseEntry> for RawEntry {
    fn from(e: &CodebaseEntry) -> Self {
        let mut raw = RawEntry {
            status: e.status.label().to_string(),
            indexed_files: None,
            total_chunks: None,
            indexing_percentage: None,
            reindex_reason: None,
            error_message: None,
            fingerprint: e.fingerprint.clone(),
            fingerprint_source: e.fingerprint_source,
            last_updated: e.last_updated,
        };
        match &e.status {
            CodebaseStatus::Indexing { indexing_percentage } => {
                raw.indexing_percentage = Some(*indexing_percentage);
            }
            CodebaseStatus::Indexed {
                indexed_files,
                total_chunks,
            }
            | CodebaseStatus::SyncCompleted {
                indexed_files,
                total_chunks,
            } => {
                raw.indexed_files = Some(*indexed_files);
                raw.total_chunks = Some(*total_chunks);
            }
            CodebaseStatus::RequiresReindex { reindex_reason } => {
                raw.reindex_reason = Some(reindex_reason.clone());
            }
            CodebaseStatus::IndexFailed { error_message } => {
                raw.error_message = Some(error_message.clone());
            }
        }
        raw
    }
}

impl TryFrom<RawEntry> for CodebaseEntry {
    type Error = anyhow::Error;

    fn try_from(raw: RawEntry) -> Result<Self> {
        let status = match raw.status.as_str() {
            "indexing" => CodebaseStatus::Indexing {
                indexing_percentage: raw.indexing_percentage.unwrap_or(0),
            },
            "indexed" => CodebaseStatus::Indexed {
                indexed_files: raw.indexed_files.unwrap_or(0),
                total_chunks: raw.total_chunks.unwrap_or(0),
            },
            "sync_completed" => CodebaseStatus::SyncCompleted {
                indexed_files: raw.indexed_files.unwrap_or(0),
                total_chunks: raw.total_chunks.unwrap_or(0),
            },
            "requires_reindex" => CodebaseStatus::RequiresReindex {
                reindex_reason: raw.reindex_reason.unwrap_or_default(),
            },
            "indexfailed" => CodebaseStatus::IndexFailed {
                error_message: raw.error_message.unwrap_or_default(),
            },
            other => anyhow::bail!("unknown codebase status: {other}"),
        };
        Ok(CodebaseEntry {
            status,
            fingerprint: raw.fingerprint,
            fingerprint_source: raw.fingerprint_source,
            last_updated: raw.last_updated,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format_version: String,
    codebases: HashMap<String, RawEntry>,
    last_updated: DateTime<Utc>,
}

/// Stats recorded by `setCodebaseIndexed` (spec §4.B).
#[derive(Debug, Clone, Copy)]
pub struct IndexedStats {
    pub indexed_files: u64,
    pub total_chunks: u64,
}

/// In-memory snapshot state guarded by a process-wide exclusive lock. Every
/// public method below is a critical section (spec §5); none suspend.
struct SnapshotState {
    codebases: HashMap<PathBuf, CodebaseEntry>,
    /// Per-path guard set backing the "at most one active indexing /
    /// reindex / watcher" rule (spec §5).
    in_flight: HashSet<PathBuf>,
}

pub struct SnapshotStore {
    path: PathBuf,
    state: Mutex<SnapshotState>,
}

impl SnapshotStore {
    /// `~/.context/mcp-codebase-snapshot.json`, or `$HOME`-overridden per
    /// spec §6's environment variable table.
    pub fn default_path() -> Result<PathBuf> {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .context("cannot resolve HOME for ~/.context")?;
        Ok(home.join(".context").join("mcp-codebase-snapshot.json"))
    }

    /// Loads from `path`; a `v2` envelope is migrated in-memory (every entry
    /// becomes `fingerprint_source = assumed_v2`, status unchanged) and
    /// persisted back as `v3` immediately (spec §3/§4.B).
    pub fn load(path: PathBuf) -> Result<Self> {
        let codebases = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let envelope: Envelope = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            let migrating = envelope.format_version == "v2";
            let mut codebases = HashMap::new();
            for (key, mut raw_entry) in envelope.codebases {
                if migrating {
                    raw_entry.fingerprint_source = FingerprintSource::AssumedV2;
                }
                let entry = CodebaseEntry::try_from(raw_entry)?;
                codebases.insert(PathBuf::from(key), entry);
            }
            codebases
        } else {
            HashMap::new()
        };

        let store = SnapshotStore {
            path,
            state: Mutex::new(SnapshotState {
                codebases,
                in_flight: HashSet::new(),
            }),
        };
        store.save()?;
        Ok(store)
    }

    pub fn get_codebase_info(&self, path: &Path) -> Option<CodebaseEntry> {
        let state = self.state.lock().expect("snapshot lock poisoned");
        state.codebases.get(path).cloned()
    }

    pub fn get_all_codebases(&self) -> HashMap<PathBuf, CodebaseEntry> {
        let state = self.state.lock().expect("snapshot lock poisoned");
        state.codebases.clone()
    }

    pub fn get_indexing_codebases(&self) -> Vec<PathBuf> {
        let state = self.state.lock().expect("snapshot lock poisoned");
        state
            .codebases
            .iter()
            .filter(|(_, e)| matches!(e.status, CodebaseStatus::Indexing { .. }))
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn get_indexed_codebases(&self) -> Vec<PathBuf> {
        let state = self.state.lock().expect("snapshot lock poisoned");
        state
            .codebases
            .iter()
            .filter(|(_, e)| {
                matches!(
                    e.status,
                    CodebaseStatus::Indexed { .. } | CodebaseStatus::SyncCompleted { .. }
                )
            })
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn get_codebase_status(&self, path: &Path) -> Option<CodebaseStatus> {
        self.get_codebase_info(path).map(|e| e.status)
    }

    pub fn set_codebase_indexing(&self, path: &Path, pct: u8, fingerprint: &Fingerprint) -> Result<()> {
        self.mutate(path, |entry| {
            entry.status = CodebaseStatus::Indexing {
                indexing_percentage: pct,
            };
            entry.fingerprint = fingerprint.clone();
        })
    }

    pub fn set_codebase_indexed(
        &self,
        path: &Path,
        stats: IndexedStats,
        fingerprint: &Fingerprint,
        source: FingerprintSource,
    ) -> Result<()> {
        self.mutate(path, |entry| {
            entry.status = CodebaseStatus::Indexed {
                indexed_files: stats.indexed_files,
                total_chunks: stats.total_chunks,
            };
            entry.fingerprint = fingerprint.clone();
            entry.fingerprint_source = source;
        })
    }

    pub fn set_codebase_sync_completed(
        &self,
        path: &Path,
        stats: IndexedStats,
        fingerprint: &Fingerprint,
        source: FingerprintSource,
    ) -> Result<()> {
        self.mutate(path, |entry| {
            entry.status = CodebaseStatus::SyncCompleted {
                indexed_files: stats.indexed_files,
                total_chunks: stats.total_chunks,
            };
            entry.fingerprint = fingerprint.clone();
            entry.fingerprint_source = source;
        })
    }

    pub fn set_codebase_requires_reindex(&self, path: &Path, reason: impl Into<String>) -> Result<()> {
        self.mutate(path, |entry| {
            entry.status = CodebaseStatus::RequiresReindex {
                reindex_reason: reason.into(),
            };
        })
    }

    pub fn set_codebase_failed(&self, path: &Path, error_message: impl Into<String>) -> Result<()> {
        self.mutate(path, |entry| {
            entry.status = CodebaseStatus::IndexFailed {
                error_message: error_message.into(),
            };
        })
    }

    pub fn remove_codebase_completely(&self, path: &Path) -> Result<()> {
        {
            let mut state = self.state.lock().expect("snapshot lock poisoned");
            state.codebases.remove(path);
            state.in_flight.remove(path);
        }
        self.save()
    }

    /// Tries to mark `path` as having an in-flight operation. Returns
    /// `false` if one is already running (spec §5 "at most one" rules); the
    /// caller must release it by calling `release_in_flight` once done.
    pub fn try_acquire_in_flight(&self, path: &Path) -> bool {
        let mut state = self.state.lock().expect("snapshot lock poisoned");
        state.in_flight.insert(path.to_path_buf())
    }

    pub fn release_in_flight(&self, path: &Path) {
        let mut state = self.state.lock().expect("snapshot lock poisoned");
        state.in_flight.remove(path);
    }

    /// Inserts a brand-new entry (used by `orchestrator::create`), returning
    /// an error if one already exists for this path.
    pub fn insert_new(&self, path: &Path, fingerprint: Fingerprint) -> Result<()> {
        let mut state = self.state.lock().expect("snapshot lock poisoned");
        state.codebases.insert(
            path.to_path_buf(),
            CodebaseEntry {
                status: CodebaseStatus::Indexing {
                    indexing_percentage: 0,
                },
                fingerprint,
                fingerprint_source: FingerprintSource::RuntimeAssumed,
                last_updated: Utc::now(),
            },
        );
        drop(state);
        self.save()
    }

    fn mutate(&self, path: &Path, f: impl FnOnce(&mut CodebaseEntry)) -> Result<()> {
        {
            let mut state = self.state.lock().expect("snapshot lock poisoned");
            let entry = state
                .codebases
                .entry(path.to_path_buf())
                .or_insert_with(|| CodebaseEntry {
                    status: CodebaseStatus::Indexing {
                        indexing_percentage: 0,
                    },
                    fingerprint: Fingerprint::current(
                        crate::fingerprint::EmbeddingProvider::OpenAI,
                        "unknown",
                        0,
                        crate::fingerprint::VectorStoreProvider::Milvus,
                    ),
                    fingerprint_source: FingerprintSource::RuntimeAssumed,
                    last_updated: Utc::now(),
                });
            f(entry);
            entry.last_updated = Utc::now();
        }
        self.save()
    }

    /// Writes the envelope atomically: temp-file + rename (I4). The new
    /// state only becomes observable once the rename completes.
    fn save(&self) -> Result<()> {
        let envelope = {
            let state = self.state.lock().expect("snapshot lock poisoned");
            let codebases = state
                .codebases
                .iter()
                .map(|(path, entry)| (path.to_string_lossy().to_string(), RawEntry::from(entry)))
                .collect();
            Envelope {
                format_version: "v3".to_string(),
                codebases,
                last_updated: Utc::now(),
            }
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let serialized = serde_json::to_vec_pretty(&envelope)?;
        std::fs::write(&tmp_path, &serialized)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to finalize {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{EmbeddingProvider, VectorStoreProvider};

    fn runtime_fp() -> Fingerprint {
        Fingerprint::current(EmbeddingProvider::OpenAI, "text-embedding-3-small", 1536, VectorStoreProvider::Milvus)
    }

    #[test]
    fn round_trips_through_disk() {
        // P1: the resulting envelope on disk decodes back to the same
        // in-memory state.
        let dir = tempfile::tempdir().unwrap();
        let snapshot_path = dir.path().join("snapshot.json");
        let store = SnapshotStore::load(snapshot_path.clone()).unwrap();
        let codebase = dir.path().join("repo");
        std::fs::create_dir_all(&codebase).unwrap();

        store.insert_new(&codebase, runtime_fp()).unwrap();
        store
            .set_codebase_indexed(
                &codebase,
                IndexedStats {
                    indexed_files: 42,
                    total_chunks: 128,
                },
                &runtime_fp(),
                FingerprintSource::Verified,
            )
            .unwrap();

        let reloaded = SnapshotStore::load(snapshot_path).unwrap();
        let entry = reloaded.get_codebase_info(&codebase).unwrap();
        assert_eq!(
            entry.status,
            CodebaseStatus::Indexed {
                indexed_files: 42,
                total_chunks: 128
            }
        );
    }

    #[test]
    fn v2_envelope_migrates_to_v3_with_assumed_source() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot_path = dir.path().join("snapshot.json");
        let codebase = dir.path().join("legacy-repo");

        let mut raw_entry = RawEntry::from(&CodebaseEntry {
            status: CodebaseStatus::Indexed {
                indexed_files: 10,
                total_chunks: 20,
            },
            fingerprint: runtime_fp(),
            fingerprint_source: FingerprintSource::Verified,
            last_updated: Utc::now(),
        });
        raw_entry.fingerprint_source = FingerprintSource::Verified; // pre-migration on-disk value
        let mut codebases = HashMap::new();
        codebases.insert(codebase.to_string_lossy().to_string(), raw_entry);
        let v2 = Envelope {
            format_version: "v2".to_string(),
            codebases,
            last_updated: Utc::now(),
        };
        std::fs::write(&snapshot_path, serde_json::to_vec_pretty(&v2).unwrap()).unwrap();

        let store = SnapshotStore::load(snapshot_path.clone()).unwrap();
        let entry = store.get_codebase_info(&codebase).unwrap();
        assert_eq!(entry.fingerprint_source, FingerprintSource::AssumedV2);

        let on_disk = std::fs::read_to_string(&snapshot_path).unwrap();
        let envelope: Envelope = serde_json::from_str(&on_disk).unwrap();
        assert_eq!(envelope.format_version, "v3");
    }

    #[test]
    fn in_flight_guard_prevents_double_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::load(dir.path().join("snapshot.json")).unwrap();
        let codebase = dir.path().join("repo");
        assert!(store.try_acquire_in_flight(&codebase));
        assert!(!store.try_acquire_in_flight(&codebase));
        store.release_in_flight(&codebase);
        assert!(store.try_acquire_in_flight(&codebase));
    }
}
