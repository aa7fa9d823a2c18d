use crate::fingerprint::Fingerprint;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Unit inserted into the vector store (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub collection_name: String,
    pub relative_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub language: String,
    pub symbol_id: Option<String>,
    pub symbol_label: Option<String>,
    pub content: String,
    pub vector: Vec<f32>,
    pub sparse_vector: Option<Vec<(u32, f32)>>,
    pub fingerprint: Fingerprint,
    pub indexed_at: chrono::DateTime<chrono::Utc>,
    /// Intra-codebase references this chunk makes, as extracted by the
    /// pluggable AST splitter (out of scope — only this contract is
    /// specified here). Feeds the call-graph sidecar builder (spec §4.H).
    pub references: Vec<ChunkReference>,
}

/// A single reference a chunk's definition makes to another symbol. `Call`/
/// `Import` carry the referenced label when the splitter could name it
/// statically; `DynamicUnresolvable` marks a call site the splitter knows is
/// dispatched dynamically and will never resolve to a static target (spec
/// §4.H).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkReference {
    pub target_label: Option<String>,
    pub kind: ReferenceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceKind {
    Call,
    Import,
    DynamicUnresolvable,
}

/// A single retrieval hit returned by the vector store (spec §4.G).
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub dense_score: f32,
    pub sparse_score: Option<f32>,
}

/// Pluggable embedding HTTP client (out of scope per spec §1/§6 — only the
/// contract is specified here).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn dimension(&self) -> u32;
}

/// Pluggable vector-store wire client (out of scope per spec §1/§6 — only
/// the contract is specified here).
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, collection: &str, chunks: Vec<Chunk>) -> Result<()>;
    async fn delete_paths(&self, collection: &str, relative_paths: &[String]) -> Result<()>;
    async fn drop_collection(&self, collection: &str) -> Result<bool>;
    async fn collection_exists(&self, collection: &str) -> Result<bool>;
    async fn check_collection_limit(&self) -> Result<bool>;

    async fn hybrid_search(
        &self,
        collection: &str,
        dense_query: &[f32],
        sparse_query: Option<&[(u32, f32)]>,
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>>;

    async fn write_completion_marker(
        &self,
        collection: &str,
        marker: &crate::completion::CompletionMarker,
    ) -> Result<()>;

    async fn fetch_completion_marker(
        &self,
        collection: &str,
    ) -> Result<crate::completion::RawMarkerPayload>;

    /// Satori-managed collections with their creation time, used to build
    /// eviction guidance when `check_collection_limit` returns false on a
    /// Zilliz backend (spec §4.F.4).
    async fn list_managed_collections(&self) -> Result<Vec<ManagedCollection>>;
}

#[derive(Debug, Clone)]
pub struct ManagedCollection {
    pub name: String,
    pub codebase_path: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Pluggable AST-aware code splitter (out of scope per spec §1/§6).
pub trait Splitter: Send + Sync {
    fn split(&self, relative_path: &str, content: &str) -> Vec<SplitChunk>;
}

#[derive(Debug, Clone)]
pub struct SplitChunk {
    pub start_line: u32,
    pub end_line: u32,
    pub language: String,
    pub symbol_id: Option<String>,
    pub symbol_label: Option<String>,
    pub content: String,
    pub references: Vec<ChunkReference>,
}

/// Pluggable filesystem watcher (out of scope per spec §1/§6).
pub trait Watcher: Send + Sync {
    fn watch(&self, path: &std::path::Path) -> Result<()>;
    fn poll_changes(&self) -> Vec<std::path::PathBuf>;
}

/// Pluggable neural reranker (out of scope per spec §1/§6 — only the
/// contract is specified). Returns one relevance score per input doc, same
/// order as given.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, docs: &[String]) -> Result<Vec<f32>>;
}

#[cfg(test)]
pub mod test_doubles {
    //! Minimal in-memory implementations used only to exercise the
    //! orchestrator/search pipeline in tests. Not a production backend and
    //! never selected by `capability.rs`.
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub struct InMemoryEmbeddingProvider {
        pub dim: u32,
    }

    #[async_trait]
    impl EmbeddingProvider for InMemoryEmbeddingProvider {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            // Deterministic pseudo-embedding: bag-of-bytes histogram folded
            // into `dim` buckets, good enough for ordering-sensitive tests
            // without depending on a real model.
            let mut v = vec![0f32; self.dim as usize];
            for (i, b) in text.bytes().enumerate() {
                v[i % v.len()] += b as f32;
            }
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
            for x in v.iter_mut() {
                *x /= norm;
            }
            Ok(v)
        }

        fn dimension(&self) -> u32 {
            self.dim
        }
    }

    #[derive(Default)]
    pub struct InMemoryVectorStore {
        collections: Mutex<HashMap<String, Vec<Chunk>>>,
        markers: Mutex<HashMap<String, crate::completion::CompletionMarker>>,
    }

    #[async_trait]
    impl VectorStore for InMemoryVectorStore {
        async fn upsert(&self, collection: &str, chunks: Vec<Chunk>) -> Result<()> {
            let mut collections = self.collections.lock().unwrap();
            let entry = collections.entry(collection.to_string()).or_default();
            for chunk in chunks {
                entry.retain(|c| c.id != chunk.id);
                entry.push(chunk);
            }
            Ok(())
        }

        async fn delete_paths(&self, collection: &str, relative_paths: &[String]) -> Result<()> {
            let mut collections = self.collections.lock().unwrap();
            if let Some(entry) = collections.get_mut(collection) {
                entry.retain(|c| !relative_paths.contains(&c.relative_path));
            }
            Ok(())
        }

        async fn drop_collection(&self, collection: &str) -> Result<bool> {
            let mut collections = self.collections.lock().unwrap();
            Ok(collections.remove(collection).is_some())
        }

        async fn collection_exists(&self, collection: &str) -> Result<bool> {
            let collections = self.collections.lock().unwrap();
            Ok(collections.contains_key(collection))
        }

        async fn check_collection_limit(&self) -> Result<bool> {
            Ok(true)
        }

        async fn hybrid_search(
            &self,
            collection: &str,
            dense_query: &[f32],
            _sparse_query: Option<&[(u32, f32)]>,
            limit: usize,
        ) -> Result<Vec<RetrievedChunk>> {
            let collections = self.collections.lock().unwrap();
            let mut hits: Vec<RetrievedChunk> = collections
                .get(collection)
                .into_iter()
                .flatten()
                .map(|c| RetrievedChunk {
                    chunk: c.clone(),
                    dense_score: cosine(dense_query, &c.vector),
                    sparse_score: None,
                })
                .collect();
            hits.sort_by(|a, b| b.dense_score.partial_cmp(&a.dense_score).unwrap());
            hits.truncate(limit);
            Ok(hits)
        }

        async fn write_completion_marker(
            &self,
            collection: &str,
            marker: &crate::completion::CompletionMarker,
        ) -> Result<()> {
            self.markers
                .lock()
                .unwrap()
                .insert(collection.to_string(), marker.clone());
            Ok(())
        }

        async fn fetch_completion_marker(
            &self,
            collection: &str,
        ) -> Result<crate::completion::RawMarkerPayload> {
            let markers = self.markers.lock().unwrap();
            Ok(match markers.get(collection) {
                None => crate::completion::RawMarkerPayload::default(),
                Some(m) => crate::completion::RawMarkerPayload {
                    present: true,
                    kind: Some(m.kind.clone()),
                    codebase_path: Some(m.codebase_path.clone()),
                    fingerprint: Some(m.fingerprint.clone()),
                    indexed_files: Some(m.indexed_files as f64),
                    total_chunks: Some(m.total_chunks as f64),
                    completed_at: Some(m.completed_at.to_rfc3339()),
                    run_id: Some(m.run_id.clone()),
                },
            })
        }

        async fn list_managed_collections(&self) -> Result<Vec<ManagedCollection>> {
            Ok(vec![])
        }
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            0.0
        } else {
            dot / (na * nb)
        }
    }
}
