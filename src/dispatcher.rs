use crate::callgraph::{self, Direction, QueryOutcome};
use crate::capability::Capabilities;
use crate::completion::{validate_marker, MarkerValidation, RawMarkerPayload};
use crate::config::{FreshnessTuning, SearchTuning};
use crate::fingerprint::Fingerprint;
use crate::merkle::canonicalize_codebase_path;
use crate::orchestrator::{CreateOptions, CreateOutcome, IndexOrchestrator, SyncOptions, SyncOutcome};
use crate::providers::{EmbeddingProvider, Reranker, VectorStore};
use crate::search::{
    ChangedFilesCache, GroupBy, ResultMode, Scope, SearchContext, SearchOutcome, SearchRequest, SearchResultItem,
};
use crate::snapshot::{CodebaseStatus, SnapshotStore};
use crate::sync::FreshnessTracker;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a tool executor needs, bundled once at startup (spec §4.I).
pub struct AppState {
    pub snapshot: Arc<SnapshotStore>,
    pub orchestrator: Arc<IndexOrchestrator>,
    pub vector_store: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub capabilities: Capabilities,
    pub search_tuning: SearchTuning,
    pub freshness_tuning: FreshnessTuning,
    pub freshness: FreshnessTracker,
    pub changed_files_cache: ChangedFilesCache,
    pub context_dir: PathBuf,
    pub runtime_fingerprint: Fingerprint,
}

pub const TOOL_NAMES: &[&str] = &["manage_index", "search_codebase", "call_graph", "read_file", "list_codebases"];

/// `{content:[{type:"text",text}], isError?:true}` (spec §4.I.3).
pub struct ToolEnvelope {
    pub text: String,
    pub is_error: bool,
}

impl ToolEnvelope {
    fn ok(text: impl Into<String>) -> Self {
        ToolEnvelope {
            text: text.into(),
            is_error: false,
        }
    }

    fn err(text: impl Into<String>) -> Self {
        ToolEnvelope {
            text: text.into(),
            is_error: true,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "content": [{"type": "text", "text": self.text}],
            "isError": self.is_error,
        })
    }
}

/// Returns the declared JSON Schema + description for each of the five public
/// tools (spec §4.I).
pub fn tool_schemas() -> Value {
    json!([
        {
            "name": "manage_index",
            "description": "Create, sync, inspect, or clear a codebase's hybrid vector index.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["create", "sync", "status", "clear"]},
                    "path": {"type": "string", "description": "Absolute path to the codebase root."},
                    "force": {"type": "boolean", "description": "Drop any existing collection for this path before creating."},
                    "customExtensions": {"type": "array", "items": {"type": "string"}},
                    "ignorePatterns": {"type": "array", "items": {"type": "string"}},
                    "zillizDropCollection": {"type": "string", "description": "Name of a Zilliz collection to evict before creating."}
                },
                "required": ["action", "path"]
            }
        },
        {
            "name": "search_codebase",
            "description": "Hybrid dense+sparse semantic search over an indexed codebase.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "query": {"type": "string"},
                    "limit": {"type": "integer"},
                    "scope": {"type": "string", "enum": ["runtime", "mixed", "docs"], "default": "runtime"},
                    "resultMode": {"type": "string", "enum": ["grouped", "raw"], "default": "grouped"},
                    "groupBy": {"type": "string", "enum": ["symbol", "file"], "default": "symbol"},
                    "useReranker": {"type": "boolean"},
                    "rankingMode": {"type": "string"},
                    "debug": {"type": "boolean"}
                },
                "required": ["path", "query"]
            }
        },
        {
            "name": "call_graph",
            "description": "Query the call-graph sidecar for callers/callees of a symbol.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "symbolRef": {"type": "string"},
                    "direction": {"type": "string", "enum": ["callers", "callees", "both", "bidirectional"], "default": "callees"},
                    "depth": {"type": "integer", "default": 1},
                    "limit": {"type": "integer", "default": 50}
                },
                "required": ["path", "symbolRef"]
            }
        },
        {
            "name": "read_file",
            "description": "Read a file's contents, relative to an indexed codebase root.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "relativePath": {"type": "string"}
                },
                "required": ["path", "relativePath"]
            }
        },
        {
            "name": "list_codebases",
            "description": "List every codebase Satori currently tracks and its reconciled status.",
            "inputSchema": {
                "type": "object",
                "properties": {}
            }
        }
    ])
}

/// Validates and routes a `tools/call`, returning a `{content, isError}`
/// envelope (spec §4.I). Never panics on malformed input.
pub async fn dispatch(state: &AppState, name: &str, args: &Value) -> ToolEnvelope {
    match name {
        "manage_index" => dispatch_manage_index(state, args).await,
        "search_codebase" => dispatch_search_codebase(state, args).await,
        "call_graph" => dispatch_call_graph(state, args),
        "read_file" => dispatch_read_file(args),
        "list_codebases" => dispatch_list_codebases(state).await,
        other => ToolEnvelope::err(format!("Error: Invalid arguments for '{other}'. unknown tool")),
    }
}

struct ArgErrors {
    tool: &'static str,
    errors: Vec<String>,
}

impl ArgErrors {
    fn new(tool: &'static str) -> Self {
        ArgErrors { tool, errors: Vec::new() }
    }

    fn require_str(&mut self, args: &Value, field: &str) -> Option<String> {
        match args.get(field).and_then(|v| v.as_str()) {
            Some(s) if !s.is_empty() => Some(s.to_string()),
            Some(_) => {
                self.errors.push(format!("{field}: must not be empty"));
                None
            }
            None => {
                self.errors.push(format!("{field}: required"));
                None
            }
        }
    }

    fn into_result<T>(self, ok: T) -> Result<T, ToolEnvelope> {
        if self.errors.is_empty() {
            Ok(ok)
        } else {
            Err(ToolEnvelope::err(format!(
                "Error: Invalid arguments for '{}'. {}",
                self.tool,
                self.errors.join("; ")
            )))
        }
    }
}

async fn dispatch_manage_index(state: &AppState, args: &Value) -> ToolEnvelope {
    let mut errs = ArgErrors::new("manage_index");
    let action = errs.require_str(args, "action");
    let path = errs.require_str(args, "path");
    let (action, path) = match errs.into_result((action, path)) {
        Ok((Some(a), Some(p))) => (a, p),
        Ok(_) => return ToolEnvelope::err("Error: Invalid arguments for 'manage_index'. action: required; path: required".to_string()),
        Err(e) => return e,
    };
    let path = PathBuf::from(path);

    match action.as_str() {
        "create" => {
            let force = args.get("force").and_then(|v| v.as_bool()).unwrap_or(false);
            let custom_extensions = string_array(args, "customExtensions");
            let ignore_patterns = string_array(args, "ignorePatterns");
            let zilliz_drop_collection = args.get("zillizDropCollection").and_then(|v| v.as_str()).map(|s| s.to_string());

            let outcome = state
                .orchestrator
                .create(
                    &path,
                    CreateOptions {
                        force,
                        custom_extensions,
                        ignore_patterns,
                        zilliz_drop_collection,
                    },
                )
                .await;

            match outcome {
                Ok(CreateOutcome::Success {
                    indexed_files,
                    total_chunks,
                    dropped_collections,
                }) => ToolEnvelope::ok(
                    json!({
                        "status": "fully indexed",
                        "indexedFiles": indexed_files,
                        "totalChunks": total_chunks,
                        "droppedCollections": dropped_collections,
                    })
                    .to_string(),
                ),
                Ok(CreateOutcome::NotReady { reason }) => {
                    ToolEnvelope::err(json!({"status": "not_ready", "reason": reason}).to_string())
                }
                Ok(CreateOutcome::CollectionLimit { message }) => ToolEnvelope::err(message),
                Ok(CreateOutcome::ZillizOnlyFlagOnNonZilliz { message }) => ToolEnvelope::err(message),
                Err(e) => ToolEnvelope::err(format!("Reason: {e}")),
            }
        }
        "sync" => {
            let custom_extensions = string_array(args, "customExtensions");
            let ignore_patterns = string_array(args, "ignorePatterns");

            let outcome = state
                .orchestrator
                .sync(
                    &path,
                    SyncOptions {
                        custom_extensions,
                        ignore_patterns,
                    },
                )
                .await;

            match outcome {
                Ok(SyncOutcome::Success {
                    added,
                    removed,
                    modified,
                    changed_files,
                }) => ToolEnvelope::ok(
                    json!({
                        "added": added,
                        "removed": removed,
                        "modified": modified,
                        "changedFiles": changed_files,
                    })
                    .to_string(),
                ),
                Ok(SyncOutcome::NotReady { reason }) => {
                    ToolEnvelope::err(json!({"status": "not_ready", "reason": reason}).to_string())
                }
                Ok(SyncOutcome::NotFound) => ToolEnvelope::ok(json!({"status": "not_found"}).to_string()),
                Err(e) => ToolEnvelope::err(format!("Reason: {e}")),
            }
        }
        "status" => {
            let canonical = match canonicalize_codebase_path(&path) {
                Ok(p) => p,
                Err(e) => return ToolEnvelope::err(format!("Reason: {e}")),
            };
            match state.orchestrator.status(&canonical) {
                None => ToolEnvelope::ok(json!({"status": "not_found"}).to_string()),
                Some(entry) => ToolEnvelope::ok(status_entry_json(&entry.status).to_string()),
            }
        }
        "clear" => match state.orchestrator.clear(&path).await {
            Ok(()) => ToolEnvelope::ok(json!({"status": "cleared"}).to_string()),
            Err(e) => ToolEnvelope::err(format!("Reason: {e}")),
        },
        other => ToolEnvelope::err(format!(
            "Error: Invalid arguments for 'manage_index'. action: unknown action '{other}'"
        )),
    }
}

fn status_entry_json(status: &CodebaseStatus) -> Value {
    match status {
        CodebaseStatus::Indexing { indexing_percentage } => json!({
            "status": "indexing",
            "message": format!("🔄 {indexing_percentage}% being indexed"),
            "indexingPercentage": indexing_percentage,
        }),
        CodebaseStatus::Indexed { indexed_files, total_chunks } | CodebaseStatus::SyncCompleted { indexed_files, total_chunks } => json!({
            "status": "fully indexed",
            "message": format!("✅ fully indexed: {indexed_files} files, {total_chunks} chunks"),
            "indexedFiles": indexed_files,
            "totalChunks": total_chunks,
        }),
        CodebaseStatus::RequiresReindex { reindex_reason } => json!({
            "status": "requires_reindex",
            "reason": reindex_reason,
        }),
        CodebaseStatus::IndexFailed { error_message } => json!({
            "status": "indexfailed",
            "message": error_message,
        }),
    }
}

fn string_array(args: &Value, field: &str) -> Vec<String> {
    args.get(field)
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect())
        .unwrap_or_default()
}

async fn dispatch_search_codebase(state: &AppState, args: &Value) -> ToolEnvelope {
    let mut errs = ArgErrors::new("search_codebase");
    let path = errs.require_str(args, "path");
    let query = errs.require_str(args, "query");
    let (path, query) = match errs.into_result((path, query)) {
        Ok((Some(p), Some(q))) => (p, q),
        Ok(_) => return ToolEnvelope::err("Error: Invalid arguments for 'search_codebase'. path: required; query: required".to_string()),
        Err(e) => return e,
    };

    let canonical = match canonicalize_codebase_path(Path::new(&path)) {
        Ok(p) => p,
        Err(e) => return ToolEnvelope::err(format!("Reason: {e}")),
    };

    let entry = match state.snapshot.get_codebase_info(&canonical) {
        Some(e) => e,
        None => return ToolEnvelope::err(json!({"status": "not_found"}).to_string()),
    };

    let scope = match args.get("scope").and_then(|v| v.as_str()) {
        Some("mixed") => Scope::Mixed,
        Some("docs") => Scope::Docs,
        _ => Scope::Runtime,
    };
    let result_mode = match args.get("resultMode").and_then(|v| v.as_str()) {
        Some("raw") => ResultMode::Raw,
        _ => ResultMode::Grouped,
    };
    let group_by = match args.get("groupBy").and_then(|v| v.as_str()) {
        Some("file") => GroupBy::File,
        _ => GroupBy::Symbol,
    };
    let use_reranker = args.get("useReranker").and_then(|v| v.as_bool());
    let ranking_mode = args.get("rankingMode").and_then(|v| v.as_str()).map(|s| s.to_string());
    let limit = args.get("limit").and_then(|v| v.as_u64()).map(|n| n as u32);

    let request = SearchRequest {
        query,
        limit,
        scope,
        result_mode,
        group_by,
        use_reranker,
        ranking_mode,
    };

    let collection = crate::orchestrator::resolve_collection_name(&canonical);
    let ctx = SearchContext {
        vector_store: state.vector_store.as_ref(),
        embedder: state.embedder.as_ref(),
        reranker: state.reranker.as_deref(),
        freshness: &state.freshness,
        freshness_tuning: &state.freshness_tuning,
        tuning: &state.search_tuning,
        profile: state.capabilities.performance_profile,
        max_search_limit: state.capabilities.max_search_limit,
        changed_files_cache: &state.changed_files_cache,
        codebase_path: &canonical,
        collection: &collection,
        persisted_fingerprint: &entry.fingerprint,
        persisted_source: entry.fingerprint_source,
        runtime_fingerprint: &state.runtime_fingerprint,
    };

    match crate::search::search_codebase(&ctx, &request).await {
        Ok(SearchOutcome::RequiresReindex { reason }) => {
            let reindex_reason = reason.unwrap_or("fingerprint_mismatch");
            if let Err(e) = state.snapshot.set_codebase_requires_reindex(&canonical, reindex_reason) {
                tracing::warn!(error = %e, "failed to persist requires_reindex status");
            }
            ToolEnvelope::err(json!({"status": "requires_reindex", "reason": reason}).to_string())
        }
        Ok(SearchOutcome::Results {
            results,
            noise_warning,
            reranker_used,
        }) => {
            let items: Vec<Value> = results.iter().map(result_item_json).collect();
            ToolEnvelope::ok(
                json!({
                    "status": "ok",
                    "results": items,
                    "noiseWarning": noise_warning,
                    "rerankerUsed": reranker_used,
                })
                .to_string(),
            )
        }
        Err(e) => ToolEnvelope::err(format!("Reason: {e}")),
    }
}

fn result_item_json(item: &SearchResultItem) -> Value {
    match item {
        SearchResultItem::Raw(hit) => json!({
            "relativePath": hit.relative_path,
            "startLine": hit.start_line,
            "endLine": hit.end_line,
            "symbolId": hit.symbol_id,
            "symbolLabel": hit.symbol_label,
            "language": hit.language,
            "score": hit.score,
            "content": hit.content,
        }),
        SearchResultItem::Grouped { head, member_count } => json!({
            "relativePath": head.relative_path,
            "startLine": head.start_line,
            "endLine": head.end_line,
            "symbolId": head.symbol_id,
            "symbolLabel": head.symbol_label,
            "language": head.language,
            "score": head.score,
            "content": head.content,
            "memberCount": member_count,
        }),
    }
}

fn dispatch_call_graph(state: &AppState, args: &Value) -> ToolEnvelope {
    let mut errs = ArgErrors::new("call_graph");
    let path = errs.require_str(args, "path");
    let symbol_ref = errs.require_str(args, "symbolRef");
    let (path, symbol_ref) = match errs.into_result((path, symbol_ref)) {
        Ok((Some(p), Some(s))) => (p, s),
        Ok(_) => return ToolEnvelope::err("Error: Invalid arguments for 'call_graph'. path: required; symbolRef: required".to_string()),
        Err(e) => return e,
    };

    let raw_direction = args.get("direction").and_then(|v| v.as_str()).unwrap_or("callees");
    let normalized = callgraph::normalize_direction(raw_direction);
    let Some(direction) = callgraph::parse_direction(&normalized) else {
        return ToolEnvelope::err(format!(
            "Error: Invalid arguments for 'call_graph'. direction: must be one of callers, callees, both (got '{raw_direction}')"
        ));
    };
    let depth = args.get("depth").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
    let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(50) as usize;

    let canonical = match canonicalize_codebase_path(Path::new(&path)) {
        Ok(p) => p,
        Err(e) => return ToolEnvelope::err(format!("Reason: {e}")),
    };
    let sidecar_path = callgraph::sidecar_path(&state.context_dir, &canonical);
    let sidecar = match callgraph::load_sidecar(&sidecar_path) {
        Ok(s) => s,
        Err(e) => return ToolEnvelope::err(format!("Reason: {e}")),
    };

    let extension = Path::new(&symbol_ref)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_else(|| {
            sidecar
                .nodes
                .iter()
                .find(|n| n.symbol_id == symbol_ref || n.symbol_label == symbol_ref)
                .map(|n| Path::new(&n.file).extension().and_then(|e| e.to_str()).unwrap_or(""))
                .unwrap_or("")
        });

    match callgraph::query_graph(&sidecar, &symbol_ref, direction, depth, limit, extension) {
        QueryOutcome::Unsupported { reason } => ToolEnvelope::ok(
            json!({
                "supported": false,
                "reason": reason,
                "hints": {"supportedExtensions": ["ts", "tsx", "js", "jsx", "py"]},
            })
            .to_string(),
        ),
        QueryOutcome::Result(result) => ToolEnvelope::ok(
            json!({
                "supported": true,
                "nodes": result.nodes,
                "edges": result.edges,
            })
            .to_string(),
        ),
    }
}

fn dispatch_read_file(args: &Value) -> ToolEnvelope {
    let mut errs = ArgErrors::new("read_file");
    let path = errs.require_str(args, "path");
    let relative_path = errs.require_str(args, "relativePath");
    let (path, relative_path) = match errs.into_result((path, relative_path)) {
        Ok((Some(p), Some(r))) => (p, r),
        Ok(_) => return ToolEnvelope::err("Error: Invalid arguments for 'read_file'. path: required; relativePath: required".to_string()),
        Err(e) => return e,
    };

    let canonical = match canonicalize_codebase_path(Path::new(&path)) {
        Ok(p) => p,
        Err(e) => return ToolEnvelope::err(format!("Reason: {e}")),
    };
    let target = canonical.join(&relative_path);
    let Ok(target_canon) = target.canonicalize() else {
        return ToolEnvelope::err(format!("Reason: file not found: {relative_path}"));
    };
    if !target_canon.starts_with(&canonical) {
        return ToolEnvelope::err("Reason: relativePath escapes the codebase root".to_string());
    }

    match std::fs::read_to_string(&target_canon) {
        Ok(content) => ToolEnvelope::ok(content),
        Err(e) => ToolEnvelope::err(format!("Reason: {e}")),
    }
}

/// `list_codebases` reconciles each `indexed`/`sync_completed` entry against
/// the completion-marker proof before reporting it (spec §4.D/§4.I).
async fn dispatch_list_codebases(state: &AppState) -> ToolEnvelope {
    let all = state.snapshot.get_all_codebases();
    let mut entries: Vec<(PathBuf, Value)> = Vec::new();

    for (path, entry) in all {
        let reported_status = match &entry.status {
            CodebaseStatus::Indexed { .. } | CodebaseStatus::SyncCompleted { .. } => {
                let collection = crate::orchestrator::resolve_collection_name(&path);
                let raw = state
                    .vector_store
                    .fetch_completion_marker(&collection)
                    .await
                    .unwrap_or_else(|_| RawMarkerPayload::default());
                let validation = if raw.present {
                    validate_marker(&raw, &path, &state.runtime_fingerprint)
                } else {
                    MarkerValidation::ProbeFailed
                };
                match validation {
                    MarkerValidation::Valid => "ready",
                    MarkerValidation::FingerprintMismatch => {
                        if let Err(e) = state.snapshot.set_codebase_requires_reindex(&path, validation.as_reason()) {
                            tracing::warn!(error = %e, "failed to persist requires_reindex status");
                        }
                        "requires_reindex"
                    }
                    MarkerValidation::StaleLocal(reason) => {
                        if let Err(e) = state.snapshot.set_codebase_failed(&path, reason) {
                            tracing::warn!(error = %e, "failed to persist indexfailed status");
                        }
                        "failed"
                    }
                    MarkerValidation::ProbeFailed => status_label(&entry.status),
                }
            }
            other => status_label(other),
        };
        entries.push((
            path.clone(),
            json!({
                "path": path.to_string_lossy(),
                "status": reported_status,
            }),
        ));
    }

    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let items: Vec<Value> = entries.into_iter().map(|(_, v)| v).collect();
    ToolEnvelope::ok(json!({"codebases": items}).to_string())
}

fn status_label(status: &CodebaseStatus) -> &'static str {
    match status {
        CodebaseStatus::Indexing { .. } => "indexing",
        CodebaseStatus::Indexed { .. } => "indexed",
        CodebaseStatus::SyncCompleted { .. } => "sync_completed",
        CodebaseStatus::RequiresReindex { .. } => "requires_reindex",
        CodebaseStatus::IndexFailed { .. } => "indexfailed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_arguments_message_matches_spec_format() {
        let mut errs = ArgErrors::new("manage_index");
        errs.require_str(&json!({}), "action");
        errs.require_str(&json!({}), "path");
        let result: Result<(), ToolEnvelope> = errs.into_result(());
        let err = result.unwrap_err();
        assert!(err.is_error);
        assert_eq!(err.text, "Error: Invalid arguments for 'manage_index'. action: required; path: required");
    }

    #[test]
    fn tool_schemas_cover_all_five_tools() {
        let schemas = tool_schemas();
        let names: Vec<&str> = schemas.as_array().unwrap().iter().map(|s| s["name"].as_str().unwrap()).collect();
        for expected in TOOL_NAMES {
            assert!(names.contains(expected));
        }
    }
}
