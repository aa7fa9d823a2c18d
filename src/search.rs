use crate::capability::PerformanceProfile;
use crate::config::{FreshnessTuning, SearchTuning};
use crate::fingerprint::{evaluate_gate, Fingerprint, FingerprintSource};
use crate::providers::{EmbeddingProvider, Reranker, RetrievedChunk, VectorStore};
use crate::sync::{FreshnessMode, FreshnessTracker};
use crate::telemetry::emit_search_telemetry;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Runtime,
    Mixed,
    Docs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultMode {
    Grouped,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Symbol,
    File,
}

/// Path-shape classification feeding `SCOPE_PATH_MULTIPLIERS` (spec §4.G.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathCategory {
    Entrypoint,
    Core,
    SrcRuntime,
    Neutral,
    Tests,
    Docs,
    Generated,
}

const ENTRYPOINT_BASENAMES: &[&str] = &[
    "main.rs", "main.py", "main.go", "index.ts", "index.js", "cli.rs", "app.py", "server.rs",
];

pub fn classify_path_category(relative_path: &str) -> PathCategory {
    let lower = relative_path.to_ascii_lowercase();
    let basename = lower.rsplit('/').next().unwrap_or(&lower);

    if ENTRYPOINT_BASENAMES.contains(&basename) {
        return PathCategory::Entrypoint;
    }
    if lower.contains("test")
        || lower.contains("__tests__")
        || lower.contains(".spec.")
        || lower.contains(".test.")
        || lower.contains("fixture")
    {
        return PathCategory::Tests;
    }
    if lower.contains("generated") || lower.contains("/dist/") || lower.starts_with("dist/") || lower.contains(".gen.") {
        return PathCategory::Generated;
    }
    if lower.ends_with(".md") || lower.starts_with("docs/") || lower.contains("/docs/") {
        return PathCategory::Docs;
    }
    if lower.starts_with("src/") || lower.contains("/src/") {
        let depth = lower.matches('/').count();
        if depth <= 2 {
            return PathCategory::Core;
        }
        return PathCategory::SrcRuntime;
    }
    PathCategory::Neutral
}

/// `SCOPE_PATH_MULTIPLIERS[scope][category]` (spec §4.G.4 — exact values are
/// an implementation-defined constant table; suppression/mild-preference
/// directions follow the spec's text exactly).
fn scope_path_multiplier(scope: Scope, category: PathCategory) -> f64 {
    use PathCategory::*;
    use Scope::*;
    match (scope, category) {
        (Runtime, Entrypoint) => 1.15,
        (Runtime, Core) => 1.10,
        (Runtime, SrcRuntime) => 1.05,
        (Runtime, Neutral) => 1.0,
        (Runtime, Tests) => 0.05,
        (Runtime, Docs) => 0.05,
        (Runtime, Generated) => 0.5,

        (Mixed, Entrypoint) => 1.10,
        (Mixed, Core) => 1.05,
        (Mixed, SrcRuntime) => 1.0,
        (Mixed, Neutral) => 1.0,
        (Mixed, Tests) => 0.85,
        (Mixed, Docs) => 0.85,
        (Mixed, Generated) => 0.7,

        (Docs, Entrypoint) => 0.5,
        (Docs, Core) => 0.5,
        (Docs, SrcRuntime) => 0.05,
        (Docs, Neutral) => 0.8,
        (Docs, Tests) => 0.05,
        (Docs, Docs) => 1.2,
        (Docs, Generated) => 0.6,
    }
}

const NOISE_HINT_PATTERNS: &[&str] = &["test", "__tests__", "fixture", "coverage", ".spec."];

fn matches_noise_hint(relative_path: &str) -> bool {
    let lower = relative_path.to_ascii_lowercase();
    NOISE_HINT_PATTERNS.iter().any(|p| lower.contains(p))
}

#[derive(Debug, Clone)]
struct MustClause {
    prefix: &'static str,
    value: String,
}

const MUST_CLAUSE_PREFIXES: &[&str] = &["path:", "lang:", "symbol:"];

/// Extracts `path:`/`lang:`/`symbol:` operator-prefixed tokens from `query`
/// (spec §4.G.3 "operator prefixes"). Ignored entirely once `query` exceeds
/// 200 chars.
fn parse_must_clauses(query: &str) -> Vec<MustClause> {
    if query.len() > 200 {
        return Vec::new();
    }
    let mut clauses = Vec::new();
    for token in query.split_whitespace() {
        for prefix in MUST_CLAUSE_PREFIXES {
            if let Some(value) = token.strip_prefix(prefix) {
                if !value.is_empty() {
                    clauses.push(MustClause {
                        prefix,
                        value: value.to_ascii_lowercase(),
                    });
                }
            }
        }
    }
    clauses
}

fn matches_must_clauses(chunk: &RetrievedChunk, clauses: &[MustClause]) -> bool {
    clauses.iter().all(|clause| match clause.prefix {
        "path:" => chunk.chunk.relative_path.to_ascii_lowercase().contains(&clause.value),
        "lang:" => chunk.chunk.language.to_ascii_lowercase() == clause.value,
        "symbol:" => chunk
            .chunk
            .symbol_id
            .as_deref()
            .map(|s| s.to_ascii_lowercase().contains(&clause.value))
            .unwrap_or(false),
        _ => true,
    })
}

/// Reciprocal-rank fusion of dense and (optional) sparse scores (spec
/// §4.G.3). Returns each chunk paired with its fused score.
fn rrf_fuse(chunks: Vec<RetrievedChunk>, k: f64) -> Vec<(RetrievedChunk, f64)> {
    let n = chunks.len();
    let mut dense_order: Vec<usize> = (0..n).collect();
    dense_order.sort_by(|&a, &b| {
        chunks[b]
            .dense_score
            .partial_cmp(&chunks[a].dense_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut dense_rank = vec![0usize; n];
    for (rank, &idx) in dense_order.iter().enumerate() {
        dense_rank[idx] = rank;
    }

    let mut sparse_order: Vec<usize> = (0..n).filter(|&i| chunks[i].sparse_score.is_some()).collect();
    sparse_order.sort_by(|&a, &b| {
        chunks[b]
            .sparse_score
            .unwrap()
            .partial_cmp(&chunks[a].sparse_score.unwrap())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut sparse_rank: Vec<Option<usize>> = vec![None; n];
    for (rank, &idx) in sparse_order.iter().enumerate() {
        sparse_rank[idx] = Some(rank);
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut score = 1.0 / (k + dense_rank[i] as f64 + 1.0);
            if let Some(r) = sparse_rank[i] {
                score += 1.0 / (k + r as f64 + 1.0);
            }
            (chunk, score)
        })
        .collect()
}

/// 5-second TTL cache of the current codebase's changed-file set, consulted
/// by the "changed-first" ranking stage (spec §4.G.6).
#[derive(Default)]
pub struct ChangedFilesCache {
    inner: Mutex<Option<(Instant, HashSet<String>)>>,
}

impl ChangedFilesCache {
    pub fn set(&self, files: HashSet<String>) {
        *self.inner.lock().unwrap() = Some((Instant::now(), files));
    }

    fn get_if_fresh(&self, ttl: Duration) -> Option<HashSet<String>> {
        let guard = self.inner.lock().unwrap();
        guard
            .as_ref()
            .and_then(|(at, files)| if at.elapsed() < ttl { Some(files.clone()) } else { None })
    }
}

#[derive(Debug, Clone)]
pub struct ScoredHit {
    pub relative_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub symbol_id: Option<String>,
    pub symbol_label: Option<String>,
    pub language: String,
    pub content: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub enum SearchResultItem {
    Raw(ScoredHit),
    Grouped { head: ScoredHit, member_count: usize },
}

#[derive(Debug, Clone)]
pub enum SearchOutcome {
    RequiresReindex {
        reason: Option<&'static str>,
    },
    Results {
        results: Vec<SearchResultItem>,
        noise_warning: bool,
        reranker_used: bool,
    },
}

pub struct SearchRequest {
    pub query: String,
    pub limit: Option<u32>,
    pub scope: Scope,
    pub result_mode: ResultMode,
    pub group_by: GroupBy,
    pub use_reranker: Option<bool>,
    pub ranking_mode: Option<String>,
}

pub struct SearchContext<'a> {
    pub vector_store: &'a dyn VectorStore,
    pub embedder: &'a dyn EmbeddingProvider,
    pub reranker: Option<&'a dyn Reranker>,
    pub freshness: &'a FreshnessTracker,
    pub freshness_tuning: &'a FreshnessTuning,
    pub tuning: &'a SearchTuning,
    pub profile: PerformanceProfile,
    pub max_search_limit: u32,
    pub changed_files_cache: &'a ChangedFilesCache,
    pub codebase_path: &'a std::path::Path,
    pub collection: &'a str,
    pub persisted_fingerprint: &'a Fingerprint,
    pub persisted_source: FingerprintSource,
    pub runtime_fingerprint: &'a Fingerprint,
}

/// Runs the full 11-stage pipeline (spec §4.G). Deterministic throughout
/// given an identical candidate set.
pub async fn search_codebase(ctx: &SearchContext<'_>, request: &SearchRequest) -> Result<SearchOutcome> {
    let started = Instant::now();

    // 1. Gate.
    let gate = evaluate_gate(ctx.persisted_fingerprint, ctx.persisted_source, ctx.runtime_fingerprint);
    if !gate.allowed {
        emit_search_telemetry(&serde_json::json!({
            "event": "search_executed",
            "tool_name": "search_codebase",
            "profile": profile_label(ctx.profile),
            "query_length": request.query.len(),
            "limit_requested": request.limit,
            "results_before_filter": 0,
            "results_after_filter": 0,
            "results_returned": 0,
            "excluded_by_ignore": 0,
            "reranker_used": false,
            "latency_ms": started.elapsed().as_millis(),
            "error": gate.reason,
        }));
        return Ok(SearchOutcome::RequiresReindex { reason: gate.reason });
    }

    // 2. Freshness — never fails the search.
    let freshness = ctx
        .freshness
        .ensure_freshness(ctx.codebase_path, std::time::SystemTime::now(), ctx.freshness_tuning);

    let limit = request
        .limit
        .unwrap_or(ctx.max_search_limit)
        .min(ctx.max_search_limit)
        .max(1) as usize;

    // 3. Candidate retrieval with must-clause retry.
    let must_clauses = parse_must_clauses(&request.query);
    let dense_query = ctx.embedder.embed(&request.query).await?;
    let mut fetch_limit = ctx.tuning.max_candidates;
    let mut filtered: Vec<RetrievedChunk> = Vec::new();
    let mut results_before_filter = 0usize;

    for round in 0..=ctx.tuning.must_retry_rounds {
        let candidates = ctx
            .vector_store
            .hybrid_search(ctx.collection, &dense_query, None, fetch_limit)
            .await?;
        results_before_filter = candidates.len();
        filtered = if must_clauses.is_empty() {
            candidates
        } else {
            candidates
                .into_iter()
                .filter(|c| matches_must_clauses(c, &must_clauses))
                .collect()
        };
        if !filtered.is_empty() || must_clauses.is_empty() || round == ctx.tuning.must_retry_rounds {
            break;
        }
        fetch_limit *= ctx.tuning.must_retry_multiplier as usize;
    }
    let results_after_filter = filtered.len();

    let fused = rrf_fuse(filtered, ctx.tuning.rrf_k as f64);

    let mut hits: Vec<ScoredHit> = fused
        .into_iter()
        .map(|(chunk, score)| ScoredHit {
            relative_path: chunk.chunk.relative_path,
            start_line: chunk.chunk.start_line,
            end_line: chunk.chunk.end_line,
            symbol_id: chunk.chunk.symbol_id,
            symbol_label: chunk.chunk.symbol_label,
            language: chunk.chunk.language,
            content: chunk.chunk.content,
            score,
        })
        .collect();

    // 4. Scope/path weighting.
    for hit in hits.iter_mut() {
        let category = classify_path_category(&hit.relative_path);
        hit.score *= scope_path_multiplier(request.scope, category);
    }

    // 5. Noise hint.
    let top_k = ctx.tuning.noise_hint_top_k.min(hits.len());
    let noise_warning = if top_k > 0 {
        let mut ranked_for_noise = hits.clone();
        ranked_for_noise.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let noisy = ranked_for_noise[..top_k].iter().filter(|h| matches_noise_hint(&h.relative_path)).count();
        (noisy as f64 / top_k as f64) > ctx.tuning.noise_hint_threshold
    } else {
        false
    };

    // 6. Changed-first (auto).
    if request.ranking_mode.as_deref() == Some("auto_changed_first") {
        if let Some(changed) = ctx.changed_files_cache.get_if_fresh(Duration::from_secs(5)) {
            if changed.len() <= ctx.tuning.changed_first_max_changed_files {
                for hit in hits.iter_mut() {
                    if changed.contains(&hit.relative_path) {
                        hit.score *= 1.10;
                    }
                }
            }
        }
    }

    // 7. Optional rerank.
    let mut reranker_used = false;
    let use_reranker_requested = request.use_reranker != Some(false);
    if let Some(reranker) = ctx.reranker {
        if use_reranker_requested && ctx.profile != PerformanceProfile::Slow {
            hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            let top_n = ctx.tuning.rerank_top_k.min(hits.len());
            if top_n > 0 {
                let docs: Vec<String> = hits[..top_n].iter().map(|h| truncate_doc(&h.content)).collect();
                let rerank_scores = reranker.rerank(&request.query, &docs).await?;
                if rerank_scores.len() == top_n {
                    let rerank_rank_order = {
                        let mut order: Vec<usize> = (0..top_n).collect();
                        order.sort_by(|&a, &b| rerank_scores[b].partial_cmp(&rerank_scores[a]).unwrap_or(std::cmp::Ordering::Equal));
                        order
                    };
                    let mut rerank_rank = vec![0usize; top_n];
                    for (rank, &idx) in rerank_rank_order.iter().enumerate() {
                        rerank_rank[idx] = rank;
                    }
                    for i in 0..top_n {
                        let rerank_rrf = 1.0 / (ctx.tuning.rerank_rrf_k as f64 + rerank_rank[i] as f64 + 1.0);
                        hits[i].score += rerank_rrf;
                    }
                    reranker_used = true;
                }
            }
        }
    }

    // 10 runs after 8/9 below but we sort first to make diversity selection
    // greedy-by-score, matching "highest-score member" semantics.
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    // 8. Diversity.
    let mut picked: Vec<usize> = select_with_cap(&hits, ctx.tuning.diversity_max_per_file, ctx.tuning.diversity_max_per_symbol, limit);
    if picked.len() < limit.min(hits.len()) {
        picked = select_with_cap(&hits, ctx.tuning.diversity_relaxed_max_per_file, ctx.tuning.diversity_max_per_symbol, limit);
    }
    let diverse: Vec<ScoredHit> = picked.into_iter().map(|i| hits[i].clone()).collect();

    // 9. Grouping.
    let results = match request.result_mode {
        ResultMode::Raw => diverse.into_iter().map(SearchResultItem::Raw).collect(),
        ResultMode::Grouped => group_hits(diverse, request.group_by),
    };

    // 10. Ordering (total order over the final set).
    let mut results = results;
    results.sort_by(|a, b| {
        let (score_a, path_a, line_a, sym_a) = sort_key(a);
        let (score_b, path_b, line_b, sym_b) = sort_key(b);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| path_a.cmp(path_b))
            .then_with(|| line_a.cmp(&line_b))
            .then_with(|| sym_a.cmp(sym_b))
    });

    // 11. Telemetry.
    emit_search_telemetry(&serde_json::json!({
        "event": "search_executed",
        "tool_name": "search_codebase",
        "profile": profile_label(ctx.profile),
        "query_length": request.query.len(),
        "limit_requested": limit,
        "results_before_filter": results_before_filter,
        "results_after_filter": results_after_filter,
        "results_returned": results.len(),
        "excluded_by_ignore": 0,
        "reranker_used": reranker_used,
        "latency_ms": started.elapsed().as_millis(),
        "freshness_mode": freshness_mode_label(freshness.mode),
    }));

    Ok(SearchOutcome::Results {
        results,
        noise_warning,
        reranker_used,
    })
}

fn select_with_cap(hits: &[ScoredHit], max_per_file: usize, max_per_symbol: usize, limit: usize) -> Vec<usize> {
    let mut per_file: HashMap<&str, usize> = HashMap::new();
    let mut per_symbol: HashMap<&str, usize> = HashMap::new();
    let mut picked = Vec::new();
    for (i, hit) in hits.iter().enumerate() {
        if picked.len() >= limit {
            break;
        }
        let file_count = *per_file.get(hit.relative_path.as_str()).unwrap_or(&0);
        if file_count >= max_per_file {
            continue;
        }
        if let Some(sym) = hit.symbol_id.as_deref() {
            let sym_count = *per_symbol.get(sym).unwrap_or(&0);
            if sym_count >= max_per_symbol {
                continue;
            }
        }
        picked.push(i);
        *per_file.entry(hit.relative_path.as_str()).or_insert(0) += 1;
        if let Some(sym) = hit.symbol_id.as_deref() {
            *per_symbol.entry(sym).or_insert(0) += 1;
        }
    }
    picked
}

fn group_hits(hits: Vec<ScoredHit>, group_by: GroupBy) -> Vec<SearchResultItem> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<ScoredHit>> = HashMap::new();
    for hit in hits {
        let key = match group_by {
            GroupBy::Symbol => hit.symbol_id.clone().unwrap_or_else(|| format!("{}:{}", hit.relative_path, hit.start_line)),
            GroupBy::File => hit.relative_path.clone(),
        };
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(hit);
    }
    order
        .into_iter()
        .map(|key| {
            let mut members = groups.remove(&key).unwrap();
            members.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            let member_count = members.len();
            let head = members.remove(0);
            SearchResultItem::Grouped { head, member_count }
        })
        .collect()
}

fn sort_key(item: &SearchResultItem) -> (f64, &str, u32, &str) {
    match item {
        SearchResultItem::Raw(h) => (h.score, h.relative_path.as_str(), h.start_line, h.symbol_id.as_deref().unwrap_or("")),
        SearchResultItem::Grouped { head, .. } => {
            (head.score, head.relative_path.as_str(), head.start_line, head.symbol_id.as_deref().unwrap_or(""))
        }
    }
}

fn truncate_doc(content: &str) -> String {
    let by_lines: String = content.lines().take(200).collect::<Vec<_>>().join("\n");
    if by_lines.len() > 4000 {
        by_lines[..4000].to_string()
    } else {
        by_lines
    }
}

fn profile_label(profile: PerformanceProfile) -> &'static str {
    match profile {
        PerformanceProfile::Fast => "fast",
        PerformanceProfile::Standard => "standard",
        PerformanceProfile::Slow => "slow",
    }
}

fn freshness_mode_label(mode: FreshnessMode) -> &'static str {
    match mode {
        FreshnessMode::Fresh => "fresh",
        FreshnessMode::Aging => "aging",
        FreshnessMode::SkippedRecent => "skipped_recent",
        FreshnessMode::Synced => "synced",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entrypoint_classified_before_src_prefix() {
        assert_eq!(classify_path_category("src/main.rs"), PathCategory::Entrypoint);
    }

    #[test]
    fn test_files_classified_as_tests_even_under_src() {
        assert_eq!(classify_path_category("src/foo.test.ts"), PathCategory::Tests);
    }

    #[test]
    fn docs_markdown_classified_as_docs() {
        assert_eq!(classify_path_category("README.md"), PathCategory::Docs);
    }

    #[test]
    fn runtime_scope_suppresses_tests() {
        assert!(scope_path_multiplier(Scope::Runtime, PathCategory::Tests) < 0.1);
    }

    #[test]
    fn docs_scope_suppresses_src_runtime() {
        assert!(scope_path_multiplier(Scope::Docs, PathCategory::SrcRuntime) < 0.1);
    }

    #[test]
    fn must_clause_parsing_extracts_path_prefix() {
        let clauses = parse_must_clauses("find path:src/lib.rs usage");
        assert_eq!(clauses.len(), 1);
        assert_eq!(clauses[0].value, "src/lib.rs");
    }

    #[test]
    fn must_clause_parsing_ignores_long_queries() {
        let long_query = "a".repeat(201);
        assert!(parse_must_clauses(&long_query).is_empty());
    }

    #[test]
    fn diversity_cap_limits_hits_per_file() {
        let hits = vec![
            ScoredHit {
                relative_path: "a.rs".into(),
                start_line: 1,
                end_line: 2,
                symbol_id: Some("s1".into()),
                symbol_label: None,
                language: "rust".into(),
                content: String::new(),
                score: 3.0,
            },
            ScoredHit {
                relative_path: "a.rs".into(),
                start_line: 10,
                end_line: 12,
                symbol_id: Some("s2".into()),
                symbol_label: None,
                language: "rust".into(),
                content: String::new(),
                score: 2.0,
            },
            ScoredHit {
                relative_path: "a.rs".into(),
                start_line: 20,
                end_line: 22,
                symbol_id: Some("s3".into()),
                symbol_label: None,
                language: "rust".into(),
                content: String::new(),
                score: 1.0,
            },
        ];
        let picked = select_with_cap(&hits, 2, 1, 10);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn sort_key_orders_by_score_then_path_then_line() {
        let a = SearchResultItem::Raw(ScoredHit {
            relative_path: "a.rs".into(),
            start_line: 5,
            end_line: 6,
            symbol_id: None,
            symbol_label: None,
            language: "rust".into(),
            content: String::new(),
            score: 1.0,
        });
        let b = SearchResultItem::Raw(ScoredHit {
            relative_path: "a.rs".into(),
            start_line: 1,
            end_line: 2,
            symbol_id: None,
            symbol_label: None,
            language: "rust".into(),
            content: String::new(),
            score: 1.0,
        });
        let mut items = vec![a, b];
        items.sort_by(|x, y| {
            let (sx, px, lx, symx) = sort_key(x);
            let (sy, py, ly, symy) = sort_key(y);
            sy.partial_cmp(&sx)
                .unwrap()
                .then_with(|| px.cmp(py))
                .then_with(|| lx.cmp(&ly))
                .then_with(|| symx.cmp(symy))
        });
        match &items[0] {
            SearchResultItem::Raw(h) => assert_eq!(h.start_line, 1),
            _ => unreachable!(),
        }
    }
}
