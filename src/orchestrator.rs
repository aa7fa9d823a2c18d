use crate::callgraph::{rebuild_for_codebase, sidecar_path, write_sidecar_atomic};
use crate::completion::{CompletionMarker, MARKER_KIND};
use crate::fingerprint::{Fingerprint, FingerprintSource, VectorStoreProvider};
use crate::merkle::{
    build_merkle_index, canonicalize_codebase_path, load_merkle_index, merkle_sidecar_path, write_merkle_index_atomic,
    WalkOptions,
};
use crate::providers::{Chunk, EmbeddingProvider, ManagedCollection, Splitter, VectorStore};
use crate::snapshot::{IndexedStats, SnapshotStore};
use crate::sync::{reindex_by_change, should_rebuild_call_graph, ChangeSet};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const COLLECTION_LIMIT_MESSAGE: &str =
    "Vector store collection limit reached. Remove an existing codebase with `manage_index action=clear` before indexing a new one.";

/// Collection name: `hybrid_code_chunks_<md5(canonical path)[0:8]>` (spec
/// §4.F).
pub fn resolve_collection_name(path: &Path) -> String {
    let canon = path.to_string_lossy();
    let digest = md5::compute(canon.as_bytes());
    let hex = format!("{digest:x}");
    format!("hybrid_code_chunks_{}", &hex[0..8])
}

/// Legacy collection name predating the hybrid schema, still matched when
/// `force` drops stale collections (spec §4.F.2).
pub fn legacy_collection_name(path: &Path) -> String {
    let canon = path.to_string_lossy();
    let digest = md5::compute(canon.as_bytes());
    let hex = format!("{digest:x}");
    format!("code_chunks_{}", &hex[0..8])
}

pub struct CreateOptions {
    pub force: bool,
    pub custom_extensions: Vec<String>,
    pub ignore_patterns: Vec<String>,
    pub zilliz_drop_collection: Option<String>,
}

pub enum CreateOutcome {
    Success {
        indexed_files: u64,
        total_chunks: u64,
        dropped_collections: u32,
    },
    NotReady {
        reason: &'static str,
    },
    CollectionLimit {
        message: String,
    },
    ZillizOnlyFlagOnNonZilliz {
        message: String,
    },
}

pub struct IndexOrchestrator {
    pub snapshot: Arc<SnapshotStore>,
    pub vector_store: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub splitter: Arc<dyn Splitter>,
    pub vector_store_provider: VectorStoreProvider,
    /// `~/.context` (or override) — where the call-graph sidecar lives.
    pub context_dir: PathBuf,
    /// The actually-configured embedding provider/model (spec §3), resolved
    /// once at startup from `EMBEDDING_PROVIDER`/`EMBEDDING_MODEL`. Every
    /// fingerprint this orchestrator writes comes from here, never from a
    /// placeholder, so it agrees with the fingerprint `search_codebase`
    /// gates against.
    pub runtime_fingerprint: Fingerprint,
}

/// `sync(path)` (spec §4.E `reindexByChange`, delegated from §4.F).
pub struct SyncOptions {
    pub custom_extensions: Vec<String>,
    pub ignore_patterns: Vec<String>,
}

pub enum SyncOutcome {
    Success {
        added: Vec<String>,
        removed: Vec<String>,
        modified: Vec<String>,
        changed_files: Vec<String>,
    },
    NotReady {
        reason: &'static str,
    },
    NotFound,
}

impl IndexOrchestrator {
    /// `create(path, force?, splitter?, customExtensions?, ignorePatterns?,
    /// zillizDropCollection?)` (spec §4.F).
    pub async fn create(&self, path: &Path, options: CreateOptions) -> Result<CreateOutcome> {
        let canonical = canonicalize_codebase_path(path)?;

        if !self.snapshot.try_acquire_in_flight(&canonical) {
            return Ok(CreateOutcome::NotReady { reason: "indexing" });
        }
        let outcome = self.create_locked(&canonical, options).await;
        self.snapshot.release_in_flight(&canonical);
        outcome
    }

    async fn create_locked(&self, canonical: &Path, options: CreateOptions) -> Result<CreateOutcome> {
        let collection = resolve_collection_name(canonical);
        let legacy = legacy_collection_name(canonical);

        let mut dropped_collections = 0u32;
        if options.force {
            for name in [&legacy, &collection] {
                if self.vector_store.drop_collection(name).await? {
                    dropped_collections += 1;
                }
            }
        }

        if let Some(target) = options.zilliz_drop_collection.as_ref() {
            if self.vector_store_provider != VectorStoreProvider::Zilliz {
                return Ok(CreateOutcome::ZillizOnlyFlagOnNonZilliz {
                    message: "zillizDropCollection is only valid when the vector store backend is Zilliz"
                        .to_string(),
                });
            }
            if self.vector_store.collection_exists(target).await? {
                self.vector_store.drop_collection(target).await?;
            }
        }

        if !self.vector_store.check_collection_limit().await? {
            let message = if self.vector_store_provider == VectorStoreProvider::Zilliz {
                self.build_eviction_guidance().await?
            } else {
                COLLECTION_LIMIT_MESSAGE.to_string()
            };
            return Ok(CreateOutcome::CollectionLimit { message });
        }

        let runtime_fp = self.runtime_fingerprint.clone();
        self.snapshot.insert_new(canonical, runtime_fp.clone())?;

        let walk_options = WalkOptions {
            custom_extensions: options.custom_extensions,
            ignore_patterns: options.ignore_patterns,
        };

        let result = self
            .run_indexing(canonical, &collection, &walk_options, &runtime_fp)
            .await;

        match result {
            Ok((indexed_files, total_chunks)) => {
                self.snapshot.set_codebase_indexed(
                    canonical,
                    IndexedStats {
                        indexed_files,
                        total_chunks,
                    },
                    &runtime_fp,
                    FingerprintSource::Verified,
                )?;
                Ok(CreateOutcome::Success {
                    indexed_files,
                    total_chunks,
                    dropped_collections,
                })
            }
            Err(e) => {
                self.snapshot.set_codebase_failed(canonical, e.to_string())?;
                Err(e)
            }
        }
    }

    async fn run_indexing(
        &self,
        canonical: &Path,
        collection: &str,
        walk_options: &WalkOptions,
        fingerprint: &Fingerprint,
    ) -> Result<(u64, u64)> {
        let merkle = build_merkle_index(canonical, walk_options)?;
        let total_files = merkle.entries.len() as u64;
        let mut total_chunks = 0u64;
        let mut indexed_files = 0u64;
        let mut all_chunks: Vec<Chunk> = Vec::new();

        for (idx, relative_path) in merkle.entries.keys().enumerate() {
            let pct = if total_files == 0 {
                100
            } else {
                (((idx + 1) as f64 / total_files as f64) * 100.0) as u8
            };
            self.snapshot.set_codebase_indexing(canonical, pct, fingerprint)?;

            let abs_path = canonical.join(relative_path);
            let content = std::fs::read_to_string(&abs_path)
                .with_context(|| format!("failed to read {}", abs_path.display()))?;
            let split = self.splitter.split(relative_path, &content);

            let mut chunks = Vec::with_capacity(split.len());
            for piece in split {
                let vector = self.embedder.embed(&piece.content).await?;
                chunks.push(Chunk {
                    id: format!("{relative_path}:{}", piece.start_line),
                    collection_name: collection.to_string(),
                    relative_path: relative_path.clone(),
                    start_line: piece.start_line,
                    end_line: piece.end_line,
                    language: piece.language,
                    symbol_id: piece.symbol_id,
                    symbol_label: piece.symbol_label,
                    content: piece.content,
                    vector,
                    sparse_vector: None,
                    fingerprint: fingerprint.clone(),
                    indexed_at: Utc::now(),
                    references: piece.references,
                });
            }
            total_chunks += chunks.len() as u64;
            all_chunks.extend(chunks.iter().cloned());
            self.vector_store.upsert(collection, chunks).await?;
            indexed_files += 1;
        }

        let marker = CompletionMarker {
            kind: MARKER_KIND.to_string(),
            codebase_path: canonical.to_string_lossy().to_string(),
            fingerprint: fingerprint.clone(),
            indexed_files,
            total_chunks,
            completed_at: Utc::now(),
            run_id: uuid_like_run_id(),
        };
        self.vector_store.write_completion_marker(collection, &marker).await?;

        let sidecar = rebuild_for_codebase(&all_chunks);
        let path = sidecar_path(&self.context_dir, canonical);
        if let Err(e) = write_sidecar_atomic(&path, &sidecar) {
            tracing::warn!(error = %e, "failed to write call-graph sidecar");
        }

        let merkle_path = merkle_sidecar_path(&self.context_dir, canonical);
        if let Err(e) = write_merkle_index_atomic(&merkle_path, &merkle) {
            tracing::warn!(error = %e, "failed to persist merkle index");
        }

        Ok((indexed_files, total_chunks))
    }

    /// `reindexByChange(path)` (spec §4.E): diffs the current Merkle map
    /// against the one persisted at the last `create`/`sync`, deletes
    /// removed paths from the vector store, re-splits and re-embeds
    /// added/modified paths, and returns the diff rather than the
    /// full-reindex `create` response shape.
    pub async fn sync(&self, path: &Path, options: SyncOptions) -> Result<SyncOutcome> {
        let canonical = canonicalize_codebase_path(path)?;

        if !self.snapshot.try_acquire_in_flight(&canonical) {
            return Ok(SyncOutcome::NotReady { reason: "indexing" });
        }
        let outcome = self.sync_locked(&canonical, options).await;
        self.snapshot.release_in_flight(&canonical);
        outcome
    }

    async fn sync_locked(&self, canonical: &Path, options: SyncOptions) -> Result<SyncOutcome> {
        if self.snapshot.get_codebase_info(canonical).is_none() {
            return Ok(SyncOutcome::NotFound);
        }

        let collection = resolve_collection_name(canonical);
        let merkle_path = merkle_sidecar_path(&self.context_dir, canonical);
        let previous = load_merkle_index(&merkle_path)?;

        let walk_options = WalkOptions {
            custom_extensions: options.custom_extensions,
            ignore_patterns: options.ignore_patterns,
        };

        let result = self.run_sync(canonical, &collection, &merkle_path, &previous.entries, &walk_options).await;

        match result {
            Ok((changes, current)) => {
                let current_files = current.entries.len() as u64;
                let prior_stats = match self.snapshot.get_codebase_status(canonical) {
                    Some(crate::snapshot::CodebaseStatus::Indexed { total_chunks, .. })
                    | Some(crate::snapshot::CodebaseStatus::SyncCompleted { total_chunks, .. }) => total_chunks,
                    _ => 0,
                };
                self.snapshot.set_codebase_sync_completed(
                    canonical,
                    IndexedStats {
                        indexed_files: current_files,
                        total_chunks: prior_stats,
                    },
                    &self.runtime_fingerprint,
                    FingerprintSource::Verified,
                )?;
                Ok(SyncOutcome::Success {
                    changed_files: changes.changed_files(),
                    added: changes.added,
                    removed: changes.removed,
                    modified: changes.modified,
                })
            }
            Err(e) => {
                self.snapshot.set_codebase_failed(canonical, e.to_string())?;
                Err(e)
            }
        }
    }

    async fn run_sync(
        &self,
        canonical: &Path,
        collection: &str,
        merkle_path: &Path,
        previous: &std::collections::BTreeMap<String, String>,
        walk_options: &WalkOptions,
    ) -> Result<(ChangeSet, crate::merkle::MerkleIndex)> {
        let (changes, current) = reindex_by_change(canonical, previous, walk_options)?;

        if !changes.removed.is_empty() {
            self.vector_store.delete_paths(collection, &changes.removed).await?;
        }

        let touched: Vec<String> = changes.added.iter().chain(changes.modified.iter()).cloned().collect();
        let mut touched_chunks: Vec<Chunk> = Vec::new();
        for relative_path in &touched {
            let abs_path = canonical.join(relative_path);
            let content = std::fs::read_to_string(&abs_path)
                .with_context(|| format!("failed to read {}", abs_path.display()))?;
            let split = self.splitter.split(relative_path, &content);

            let mut chunks = Vec::with_capacity(split.len());
            for piece in split {
                let vector = self.embedder.embed(&piece.content).await?;
                chunks.push(Chunk {
                    id: format!("{relative_path}:{}", piece.start_line),
                    collection_name: collection.to_string(),
                    relative_path: relative_path.clone(),
                    start_line: piece.start_line,
                    end_line: piece.end_line,
                    language: piece.language,
                    symbol_id: piece.symbol_id,
                    symbol_label: piece.symbol_label,
                    content: piece.content,
                    vector,
                    sparse_vector: None,
                    fingerprint: self.runtime_fingerprint.clone(),
                    indexed_at: Utc::now(),
                    references: piece.references,
                });
            }
            touched_chunks.extend(chunks.iter().cloned());
            if !chunks.is_empty() {
                self.vector_store.upsert(collection, chunks).await?;
            }
        }

        write_merkle_index_atomic(merkle_path, &current)?;

        let marker = CompletionMarker {
            kind: MARKER_KIND.to_string(),
            codebase_path: canonical.to_string_lossy().to_string(),
            fingerprint: self.runtime_fingerprint.clone(),
            indexed_files: current.entries.len() as u64,
            total_chunks: touched_chunks.len() as u64,
            completed_at: Utc::now(),
            run_id: uuid_like_run_id(),
        };
        self.vector_store.write_completion_marker(collection, &marker).await?;

        if should_rebuild_call_graph(&changes.changed_files()) {
            // `VectorStore` has no "fetch all chunks" op, so this sidecar
            // only reflects the touched files, not the whole codebase; a
            // full rebuild requires `create`/`force`.
            let sidecar = rebuild_for_codebase(&touched_chunks);
            let path = sidecar_path(&self.context_dir, canonical);
            if let Err(e) = write_sidecar_atomic(&path, &sidecar) {
                tracing::warn!(error = %e, "failed to write call-graph sidecar");
            }
        }

        Ok((changes, current))
    }

    async fn build_eviction_guidance(&self) -> Result<String> {
        let mut collections = self.vector_store.list_managed_collections().await?;
        collections.sort_by_key(|c| c.created_at);

        let mut lines = vec![
            "Collection limit reached on the Zilliz backend. Evict the oldest Satori-managed \
             collections below before creating a new one. Do not auto-delete without explicit \
             user confirmation."
                .to_string(),
        ];
        for (idx, collection) in collections.iter().enumerate() {
            let marker = if idx == 0 {
                "[oldest]"
            } else if idx == collections.len() - 1 {
                "[newest]"
            } else {
                ""
            };
            lines.push(format!(
                "{marker} {} (codebase: {})",
                collection.name,
                collection.codebase_path.as_deref().unwrap_or("unknown")
            ));
        }
        if let Some(oldest) = collections.first() {
            lines.push(format!(
                "Suggested: manage_index {{\"action\":\"create\",\"path\":\"…\",\"zillizDropCollection\":\"{}\"}}",
                oldest.name
            ));
        }
        Ok(lines.join("\n"))
    }

    pub async fn clear(&self, path: &Path) -> Result<()> {
        let canonical = canonicalize_codebase_path(path)?;
        let collection = resolve_collection_name(&canonical);
        self.vector_store.drop_collection(&collection).await?;
        self.snapshot.remove_codebase_completely(&canonical)?;
        Ok(())
    }

    pub fn status(&self, path: &Path) -> Option<crate::snapshot::CodebaseEntry> {
        self.snapshot.get_codebase_info(path)
    }
}

/// A simple, dependency-free run-id generator (time + process-local
/// counter); good enough for marker uniqueness without pulling in `uuid`
/// purely for this.
fn uuid_like_run_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let now = Utc::now().timestamp_millis();
    format!("run-{now}-{n}")
}

/// Flattens a Zilliz-shaped error object `{code, reason, details?}` into a
/// human-readable message, never `[object Object]` (spec §4.F).
pub fn render_zilliz_error(code: Option<i64>, reason: &str, details: Option<&str>) -> String {
    let mut message = match code {
        Some(code) => format!("Reason: {reason} (code {code})"),
        None => format!("Reason: {reason}"),
    };
    if let Some(details) = details {
        message.push_str(&format!(" Details: {details}"));
    }
    message
}
