use crate::providers::{Chunk, ReferenceKind};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;

pub const SIDECAR_FORMAT_VERSION: &str = "v3";

const SUPPORTED_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "py"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Call,
    Import,
    Dynamic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallGraphNode {
    pub symbol_id: String,
    pub symbol_label: String,
    pub file: String,
    pub language: String,
    pub start_line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallGraphEdge {
    pub src_symbol_id: String,
    pub dst_symbol_id: String,
    pub kind: EdgeKind,
    pub start_line: u32,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallGraphNote {
    pub note_type: String,
    pub file: String,
    pub start_line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol_id: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sidecar {
    pub format_version: String,
    pub nodes: Vec<CallGraphNode>,
    pub edges: Vec<CallGraphEdge>,
    pub notes: Vec<CallGraphNote>,
}

/// `rebuildForCodebase(path)` (spec §4.H): derives nodes from chunk
/// `symbolId`/`symbolLabel` metadata (chunks missing a `symbolId` are
/// excluded and get a `missing_symbol_metadata` note), resolves each
/// chunk's declared references into edges or `unresolved_edge`/
/// `dynamic_edge` notes, and suppresses literal self-loops.
pub fn rebuild_for_codebase(chunks: &[Chunk]) -> Sidecar {
    let mut nodes = Vec::new();
    let mut label_to_id: HashMap<String, String> = HashMap::new();
    let mut seen_ids = std::collections::HashSet::new();
    let mut notes = Vec::new();

    for chunk in chunks {
        match &chunk.symbol_id {
            None => {
                notes.push(CallGraphNote {
                    note_type: "missing_symbol_metadata".to_string(),
                    file: chunk.relative_path.clone(),
                    start_line: chunk.start_line,
                    symbol_id: None,
                    detail: "chunk has no symbolId; no synthetic id is ever assigned".to_string(),
                });
            }
            Some(symbol_id) => {
                if seen_ids.insert(symbol_id.clone()) {
                    let label = chunk.symbol_label.clone().unwrap_or_else(|| symbol_id.clone());
                    nodes.push(CallGraphNode {
                        symbol_id: symbol_id.clone(),
                        symbol_label: label.clone(),
                        file: chunk.relative_path.clone(),
                        language: chunk.language.clone(),
                        start_line: chunk.start_line,
                        end_line: chunk.end_line,
                    });
                    label_to_id.insert(label, symbol_id.clone());
                }
            }
        }
    }

    let mut edges = Vec::new();
    for chunk in chunks {
        let Some(src_id) = chunk.symbol_id.as_ref() else { continue };
        for reference in &chunk.references {
            match reference.kind {
                ReferenceKind::DynamicUnresolvable => {
                    notes.push(CallGraphNote {
                        note_type: "dynamic_edge".to_string(),
                        file: chunk.relative_path.clone(),
                        start_line: chunk.start_line,
                        symbol_id: Some(src_id.clone()),
                        detail: "call site is dynamically dispatched".to_string(),
                    });
                }
                ReferenceKind::Call | ReferenceKind::Import => {
                    let Some(target_label) = reference.target_label.as_ref() else {
                        continue;
                    };
                    match label_to_id.get(target_label) {
                        Some(dst_id) if dst_id == src_id => {
                            // Declaration self-loop: suppressed.
                        }
                        Some(dst_id) => {
                            edges.push(CallGraphEdge {
                                src_symbol_id: src_id.clone(),
                                dst_symbol_id: dst_id.clone(),
                                kind: match reference.kind {
                                    ReferenceKind::Import => EdgeKind::Import,
                                    _ => EdgeKind::Call,
                                },
                                start_line: chunk.start_line,
                                confidence: 0.9,
                            });
                        }
                        None => {
                            notes.push(CallGraphNote {
                                note_type: "unresolved_edge".to_string(),
                                file: chunk.relative_path.clone(),
                                start_line: chunk.start_line,
                                symbol_id: Some(src_id.clone()),
                                detail: format!("reference to unresolved symbol '{target_label}'"),
                            });
                        }
                    }
                }
            }
        }
    }

    // P7.
    edges.sort_by(|a, b| {
        a.src_symbol_id
            .cmp(&b.src_symbol_id)
            .then_with(|| a.dst_symbol_id.cmp(&b.dst_symbol_id))
            .then_with(|| edge_kind_rank(a.kind).cmp(&edge_kind_rank(b.kind)))
            .then_with(|| a.start_line.cmp(&b.start_line))
    });
    notes.sort_by(|a, b| {
        a.file
            .cmp(&b.file)
            .then_with(|| a.start_line.cmp(&b.start_line))
            .then_with(|| a.note_type.cmp(&b.note_type))
    });

    Sidecar {
        format_version: SIDECAR_FORMAT_VERSION.to_string(),
        nodes,
        edges,
        notes,
    }
}

fn edge_kind_rank(kind: EdgeKind) -> u8 {
    match kind {
        EdgeKind::Call => 0,
        EdgeKind::Dynamic => 1,
        EdgeKind::Import => 2,
    }
}

pub fn sidecar_path(context_dir: &Path, codebase_path: &Path) -> std::path::PathBuf {
    let digest = md5::compute(codebase_path.to_string_lossy().as_bytes());
    context_dir.join("call-graph").join(format!("{digest:x}.sidecar.json"))
}

/// Writes the sidecar atomically: temp-file + rename.
pub fn write_sidecar_atomic(path: &Path, sidecar: &Sidecar) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let serialized = serde_json::to_vec_pretty(sidecar)?;
    std::fs::write(&tmp, &serialized).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("failed to finalize {}", path.display()))?;
    Ok(())
}

pub fn load_sidecar(path: &Path) -> Result<Sidecar> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(serde_json::from_str(&raw)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Callers,
    Callees,
    Both,
}

/// Rewrites the `bidirectional` synonym to `both` before schema validation
/// (spec §4.H); any other unrecognized value is left untouched so strict
/// validation fails it downstream.
pub fn normalize_direction(raw: &str) -> String {
    if raw == "bidirectional" {
        "both".to_string()
    } else {
        raw.to_string()
    }
}

pub fn parse_direction(raw: &str) -> Option<Direction> {
    match raw {
        "callers" => Some(Direction::Callers),
        "callees" => Some(Direction::Callees),
        "both" => Some(Direction::Both),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct GraphQueryResult {
    pub nodes: Vec<CallGraphNode>,
    pub edges: Vec<CallGraphEdge>,
}

#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Unsupported { reason: &'static str },
    Result(GraphQueryResult),
}

/// `queryGraph(path, symbolRef, {direction, depth, limit})` (spec §4.H): BFS
/// over the sidecar's node/edge arrays starting from the node matching
/// `symbol_ref` (by id or label), up to `depth` hops, collecting up to
/// `limit` nodes.
pub fn query_graph(
    sidecar: &Sidecar,
    symbol_ref: &str,
    direction: Direction,
    depth: u32,
    limit: usize,
    file_extension: &str,
) -> QueryOutcome {
    if !SUPPORTED_EXTENSIONS.contains(&file_extension) {
        return QueryOutcome::Unsupported {
            reason: "unsupported_language",
        };
    }

    let start = sidecar
        .nodes
        .iter()
        .find(|n| n.symbol_id == symbol_ref || n.symbol_label == symbol_ref);
    let Some(start) = start else {
        return QueryOutcome::Result(GraphQueryResult {
            nodes: Vec::new(),
            edges: Vec::new(),
        });
    };

    let nodes_by_id: HashMap<&str, &CallGraphNode> = sidecar.nodes.iter().map(|n| (n.symbol_id.as_str(), n)).collect();

    let mut visited = std::collections::HashSet::new();
    visited.insert(start.symbol_id.clone());
    let mut queue: VecDeque<(String, u32)> = VecDeque::new();
    queue.push_back((start.symbol_id.clone(), 0));
    let mut result_nodes = vec![start.clone()];
    let mut result_edges = Vec::new();

    while let Some((current, hops)) = queue.pop_front() {
        if hops >= depth || result_nodes.len() >= limit {
            continue;
        }
        for edge in &sidecar.edges {
            let neighbor = if matches!(direction, Direction::Callees | Direction::Both) && edge.src_symbol_id == current {
                Some(edge.dst_symbol_id.clone())
            } else if matches!(direction, Direction::Callers | Direction::Both) && edge.dst_symbol_id == current {
                Some(edge.src_symbol_id.clone())
            } else {
                None
            };
            let Some(neighbor_id) = neighbor else { continue };

            result_edges.push(edge.clone());

            if visited.insert(neighbor_id.clone()) {
                if result_nodes.len() >= limit {
                    continue;
                }
                if let Some(node) = nodes_by_id.get(neighbor_id.as_str()) {
                    result_nodes.push((*node).clone());
                }
                queue.push_back((neighbor_id, hops + 1));
            }
        }
    }

    result_edges.sort_by(|a, b| {
        a.src_symbol_id
            .cmp(&b.src_symbol_id)
            .then_with(|| a.dst_symbol_id.cmp(&b.dst_symbol_id))
            .then_with(|| edge_kind_rank(a.kind).cmp(&edge_kind_rank(b.kind)))
            .then_with(|| a.start_line.cmp(&b.start_line))
    });
    result_edges.dedup_by(|a, b| {
        a.src_symbol_id == b.src_symbol_id && a.dst_symbol_id == b.dst_symbol_id && a.kind == b.kind && a.start_line == b.start_line
    });

    QueryOutcome::Result(GraphQueryResult {
        nodes: result_nodes,
        edges: result_edges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{EmbeddingProvider, Fingerprint, VectorStoreProvider};
    use crate::providers::ChunkReference;

    fn fp() -> Fingerprint {
        Fingerprint::current(EmbeddingProvider::OpenAI, "text-embedding-3-small", 1536, VectorStoreProvider::Milvus)
    }

    fn chunk(symbol: &str, refs: Vec<ChunkReference>, start_line: u32) -> Chunk {
        Chunk {
            id: format!("id-{symbol}"),
            collection_name: "c".to_string(),
            relative_path: "src/app.ts".to_string(),
            start_line,
            end_line: start_line + 5,
            language: "typescript".to_string(),
            symbol_id: Some(format!("sym-{symbol}")),
            symbol_label: Some(symbol.to_string()),
            content: String::new(),
            vector: vec![],
            sparse_vector: None,
            fingerprint: fp(),
            indexed_at: chrono::Utc::now(),
            references: refs,
        }
    }

    fn call_ref(target: &str) -> ChunkReference {
        ChunkReference {
            target_label: Some(target.to_string()),
            kind: ReferenceKind::Call,
        }
    }

    #[test]
    fn missing_symbol_id_is_excluded_with_note() {
        let mut c = chunk("alpha", vec![], 1);
        c.symbol_id = None;
        let sidecar = rebuild_for_codebase(&[c]);
        assert!(sidecar.nodes.is_empty());
        assert_eq!(sidecar.notes[0].note_type, "missing_symbol_metadata");
    }

    #[test]
    fn unresolved_reference_becomes_note_not_edge() {
        let c = chunk("alpha", vec![call_ref("nonexistent")], 1);
        let sidecar = rebuild_for_codebase(&[c]);
        assert!(sidecar.edges.is_empty());
        assert_eq!(sidecar.notes[0].note_type, "unresolved_edge");
    }

    #[test]
    fn dynamic_unresolvable_reference_becomes_dynamic_edge_note() {
        let c = chunk(
            "alpha",
            vec![ChunkReference {
                target_label: None,
                kind: ReferenceKind::DynamicUnresolvable,
            }],
            1,
        );
        let sidecar = rebuild_for_codebase(&[c]);
        assert!(sidecar.edges.is_empty());
        assert_eq!(sidecar.notes[0].note_type, "dynamic_edge");
    }

    #[test]
    fn self_reference_is_suppressed() {
        let c = chunk("alpha", vec![call_ref("alpha")], 1);
        let sidecar = rebuild_for_codebase(&[c]);
        assert!(sidecar.edges.is_empty());
        assert!(sidecar.notes.is_empty());
    }

    /// S8: `alpha` calls `{beta, gamma, beta}`; `gamma` calls `beta`. Querying
    /// callees from `alpha` at depth 2 must surface at least 2 edges, sorted
    /// per P7, every edge with confidence>0, startLine>0.
    #[test]
    fn scenario_s8_callee_traversal_from_alpha() {
        let alpha = chunk("alpha", vec![call_ref("beta"), call_ref("gamma"), call_ref("beta")], 10);
        let beta = chunk("beta", vec![], 30);
        let gamma = chunk("gamma", vec![call_ref("beta")], 50);
        let sidecar = rebuild_for_codebase(&[alpha, beta, gamma]);

        assert!(sidecar.edges.len() >= 2);
        for w in sidecar.edges.windows(2) {
            let (a, b) = (&w[0], &w[1]);
            let key_a = (a.src_symbol_id.clone(), a.dst_symbol_id.clone(), edge_kind_rank(a.kind), a.start_line);
            let key_b = (b.src_symbol_id.clone(), b.dst_symbol_id.clone(), edge_kind_rank(b.kind), b.start_line);
            assert!(key_a <= key_b);
        }
        for edge in &sidecar.edges {
            assert!(edge.confidence > 0.0);
            assert!(edge.start_line > 0);
            assert!(matches!(edge.kind, EdgeKind::Call | EdgeKind::Import | EdgeKind::Dynamic));
        }

        let result = query_graph(&sidecar, "sym-alpha", Direction::Callees, 2, 10, "ts");
        match result {
            QueryOutcome::Result(r) => assert!(r.edges.len() >= 2),
            QueryOutcome::Unsupported { .. } => panic!("expected a result"),
        }
    }

    #[test]
    fn unsupported_extension_is_reported_structurally() {
        let sidecar = Sidecar {
            format_version: SIDECAR_FORMAT_VERSION.to_string(),
            nodes: vec![],
            edges: vec![],
            notes: vec![],
        };
        let result = query_graph(&sidecar, "sym-alpha", Direction::Callees, 1, 10, "rs");
        assert!(matches!(result, QueryOutcome::Unsupported { reason: "unsupported_language" }));
    }

    #[test]
    fn bidirectional_synonym_rewritten_to_both() {
        assert_eq!(normalize_direction("bidirectional"), "both");
        assert_eq!(normalize_direction("callers"), "callers");
    }
}
