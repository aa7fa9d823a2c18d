use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use satori::capability::{resolve_capabilities, CapabilityInputs};
use satori::cli_bridge::{classify_retry_eligibility, CliSession, RetryClassifierInput};
use satori::completion::{decide_interrupted_indexing_recovery, RawMarkerPayload, RecoveryDecision};
use satori::config::{default_context_dir, guard_mode_from_env, load_config};
use satori::dispatcher::{tool_schemas, AppState};
use satori::error::SatoriError;
use satori::fingerprint::{EmbeddingProvider as FpEmbeddingProvider, Fingerprint, VectorStoreProvider};
use satori::snapshot::{IndexedStats, SnapshotStore};
use satori::sync::FreshnessTracker;
use satori::{server, stdio_guard, telemetry};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "satori")]
#[command(version)]
#[command(about = "Hybrid code-search and call-graph MCP server")]
struct Cli {
    /// Per-call timeout for tool invocations spawned via the CLI bridge.
    #[arg(long, default_value_t = 30_000, global = true)]
    call_timeout_ms: u64,

    /// Timeout for the child process's `initialize` handshake.
    #[arg(long, default_value_t = 10_000, global = true)]
    startup_timeout_ms: u64,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the MCP stdio server in-process.
    Mcp,
    /// `tools list` — print the declared JSON tool schemas and exit 0.
    Tools {
        #[command(subcommand)]
        action: ToolsAction,
    },
    /// Any other subcommand is a tool invocation: `<toolName> --field value ...`.
    #[command(external_subcommand)]
    ToolCall(Vec<String>),
}

#[derive(Debug, Subcommand)]
enum ToolsAction {
    List,
}

fn main() -> Result<()> {
    telemetry::init();
    let cli = Cli::parse();

    match cli.cmd {
        Command::Mcp => run_mcp(),
        Command::Tools { action: ToolsAction::List } => {
            println!("{}", serde_json::to_string_pretty(&tool_schemas())?);
            Ok(())
        }
        Command::ToolCall(rest) => {
            run_cli_tool_call(rest, Duration::from_millis(cli.call_timeout_ms), Duration::from_millis(cli.startup_timeout_ms))
        }
    }
}

fn run_mcp() -> Result<()> {
    let _guard = stdio_guard::install(guard_mode_from_env());
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let state = build_app_state().map_err(|e| {
            anyhow::anyhow!("{}", SatoriError::CapacityOrConfig { message: e.to_string() })
        })?;
        recover_interrupted_indexing(&state).await;
        server::run_stdio_server(state).await
    })
}

/// Scenario S7 (spec §4.D): an `indexing`-status entry found at startup means
/// the previous process died mid-index. Re-probes each one's completion
/// marker and promotes, fails, or leaves it exactly as `list_codebases`
/// reconciles any other entry — just run once, up front, instead of waiting
/// for a caller to ask.
async fn recover_interrupted_indexing(state: &AppState) {
    for path in state.snapshot.get_indexing_codebases() {
        let collection = satori::orchestrator::resolve_collection_name(&path);
        let raw = state
            .vector_store
            .fetch_completion_marker(&collection)
            .await
            .unwrap_or_else(|_| RawMarkerPayload::default());

        let decision = decide_interrupted_indexing_recovery(&raw, &path, &state.runtime_fingerprint);
        let result = match decision {
            RecoveryDecision::PromoteIndexed {
                indexed_files,
                total_chunks,
                ..
            } => state.snapshot.set_codebase_indexed(
                &path,
                IndexedStats {
                    indexed_files,
                    total_chunks,
                },
                &state.runtime_fingerprint,
                satori::fingerprint::FingerprintSource::Verified,
            ),
            RecoveryDecision::MarkFailed { reason } => state.snapshot.set_codebase_failed(&path, reason),
            RecoveryDecision::KeepLocal => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, path = %path.display(), "failed to reconcile interrupted indexing on startup");
        }
    }
}

/// Resolves the capability profile from spec §6's env vars and constructs
/// `AppState`. `EmbeddingProvider`/`VectorStore` are pluggable external
/// collaborators (spec §1) — only their contracts live in this crate, so
/// this fails with a configuration error rather than fabricating a backend
/// when no deployment has wired one in via `providers.rs`.
fn build_app_state() -> Result<AppState> {
    let embedding_provider = std::env::var("EMBEDDING_PROVIDER").ok().and_then(|v| match v.as_str() {
        "OpenAI" => Some(FpEmbeddingProvider::OpenAI),
        "VoyageAI" => Some(FpEmbeddingProvider::VoyageAI),
        "Gemini" => Some(FpEmbeddingProvider::Gemini),
        "Ollama" => Some(FpEmbeddingProvider::Ollama),
        _ => None,
    });
    let inputs = CapabilityInputs {
        embedding_provider,
        milvus_endpoint: std::env::var("MILVUS_ADDRESS").ok(),
        milvus_api_token: std::env::var("MILVUS_TOKEN").ok(),
        voyage_key: std::env::var("VOYAGEAI_API_KEY").ok(),
    };
    let capabilities = resolve_capabilities(&inputs);

    anyhow::ensure!(
        capabilities.has_vector_store,
        "no vector store backend configured (set MILVUS_ADDRESS/MILVUS_TOKEN); \
         the wire client itself is a pluggable external collaborator (spec §1/§6)"
    );

    let context_dir = default_context_dir();
    let snapshot_path = SnapshotStore::default_path().unwrap_or_else(|_| context_dir.join("mcp-codebase-snapshot.json"));
    let snapshot = Arc::new(SnapshotStore::load(snapshot_path)?);

    let embedding_model = std::env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "unknown".to_string());
    let vector_store_provider = if std::env::var("MILVUS_ADDRESS").map(|v| v.contains("zilliz")).unwrap_or(false) {
        VectorStoreProvider::Zilliz
    } else {
        VectorStoreProvider::Milvus
    };

    // Concrete `EmbeddingProvider`/`VectorStore`/`Splitter`/`Reranker` impls
    // are out of scope (spec §1) — a real deployment supplies them here.
    let embedder: Arc<dyn satori::providers::EmbeddingProvider> = unimplemented_provider("EmbeddingProvider")?;
    let vector_store: Arc<dyn satori::providers::VectorStore> = unimplemented_provider("VectorStore")?;
    let splitter: Arc<dyn satori::providers::Splitter> = unimplemented_provider("Splitter")?;

    let runtime_fingerprint = Fingerprint::current(
        embedding_provider.unwrap_or(FpEmbeddingProvider::OpenAI),
        embedding_model,
        0,
        vector_store_provider,
    );

    let orchestrator = Arc::new(satori::orchestrator::IndexOrchestrator {
        snapshot: snapshot.clone(),
        vector_store: vector_store.clone(),
        embedder: embedder.clone(),
        splitter,
        vector_store_provider,
        context_dir: context_dir.clone(),
        runtime_fingerprint: runtime_fingerprint.clone(),
    });

    let cfg = load_config(&std::env::current_dir().context("failed to resolve current dir")?);

    Ok(AppState {
        snapshot,
        orchestrator,
        vector_store,
        embedder,
        reranker: None,
        capabilities,
        search_tuning: cfg.search,
        freshness_tuning: cfg.freshness,
        freshness: FreshnessTracker::default(),
        changed_files_cache: satori::search::ChangedFilesCache::default(),
        context_dir,
        runtime_fingerprint,
    })
}

fn unimplemented_provider<T: ?Sized>(name: &str) -> Result<Arc<T>> {
    anyhow::bail!(
        "{name} has no concrete implementation wired into this binary; it is a pluggable \
         external collaborator (spec §1/§6) a deployment must supply"
    )
}

/// Parses `toolName --field value --field2 value2 ... [--debug]` into
/// `(tool_name, arguments, debug)`. Values that parse as JSON become typed
/// fields; everything else stays a string (spec §6's CLI surface).
fn parse_tool_invocation(rest: &[String]) -> Result<(String, Value, bool)> {
    let (tool_name, flags) = rest.split_first().context("missing tool name")?;
    let mut args = serde_json::Map::new();
    let mut debug = false;
    let mut i = 0;
    while i < flags.len() {
        let flag = &flags[i];
        let Some(field) = flag.strip_prefix("--") else {
            i += 1;
            continue;
        };
        if field == "debug" {
            debug = true;
            i += 1;
            continue;
        }
        let value = flags.get(i + 1).cloned().unwrap_or_default();
        let parsed: Value = serde_json::from_str(&value).unwrap_or(Value::String(value));
        args.insert(camel_case(field), parsed);
        i += 2;
    }
    if debug {
        args.insert("debug".to_string(), Value::Bool(true));
    }
    Ok((tool_name.clone(), Value::Object(args), debug))
}

fn camel_case(kebab: &str) -> String {
    let mut out = String::new();
    let mut upper_next = false;
    for c in kebab.chars() {
        if c == '-' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn run_cli_tool_call(rest: Vec<String>, call_timeout: Duration, startup_timeout: Duration) -> Result<()> {
    let (tool_name, args, _debug) = parse_tool_invocation(&rest)?;
    let binary = std::env::current_exe().context("failed to resolve current executable")?;

    let mut session = match CliSession::spawn(&binary, startup_timeout) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(e.exit_code());
        }
    };

    if tool_name == "manage_index" {
        return run_manage_index_cli(&mut session, args, call_timeout);
    }

    let response = match session.call_tool(&tool_name, args.clone(), call_timeout) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{e}");
            let _ = session.shutdown();
            std::process::exit(e.exit_code());
        }
    };
    print_and_exit(&session, &tool_name, &response, call_timeout)
}

/// `manage_index create`/`reindex`: poll `action:status` until the text
/// contains "fully indexed" (spec §4.J / scenario S4).
fn run_manage_index_cli(session: &mut CliSession, args: Value, call_timeout: Duration) -> Result<()> {
    let result = session.call_tool("manage_index", args.clone(), call_timeout);
    let payload = match result {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(e.exit_code());
        }
    };

    let text = extract_text(&payload);
    let is_error = payload
        .get("result")
        .and_then(|r| r.get("isError"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let status = satori::cli_bridge::extract_envelope_status(&payload.get("result").cloned().unwrap_or(Value::Null));

    if is_error || status.as_deref() == Some("not_ready") {
        eprintln!("E_TOOL_ERROR status={} reason=indexing", status.as_deref().unwrap_or("not_ready"));
        std::process::exit(1);
    }

    let mut path = args.get("path").and_then(|v| v.as_str()).map(|s| s.to_string()).unwrap_or_default();
    if path.is_empty() {
        path = ".".to_string();
    }
    let mut polls = 0u32;
    let mut last_text = text;
    while !last_text.contains("fully indexed") {
        polls += 1;
        let status_payload = session.call_tool("manage_index", json!({"action": "status", "path": path}), call_timeout)?;
        last_text = extract_text(&status_payload);
        if polls > 10_000 {
            break;
        }
    }
    println!("{last_text} polls={polls}");
    std::process::exit(0);
}

fn extract_text(response: &Value) -> String {
    response
        .get("result")
        .and_then(|r| r.get("content"))
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .and_then(|item| item.get("text"))
        .and_then(|t| t.as_str())
        .unwrap_or("")
        .to_string()
}

fn print_and_exit(_session: &CliSession, tool_name: &str, response: &Value, _call_timeout: Duration) -> Result<()> {
    let result = response.get("result").cloned().unwrap_or(Value::Null);
    let is_error = result.get("isError").and_then(|v| v.as_bool()).unwrap_or(false);
    let text = extract_text(response);

    if is_error {
        let status = satori::cli_bridge::extract_envelope_status(&result);
        let classification = classify_retry_eligibility(&RetryClassifierInput {
            tool_name,
            stderr: &text,
            parsed_payload: Some(&result),
        });
        let _ = classification;
        eprintln!(
            "E_TOOL_ERROR status={} reason={}",
            status.as_deref().unwrap_or("unknown"),
            "tool_error"
        );
        println!("{text}");
        std::process::exit(1);
    }

    println!("{text}");
    std::process::exit(0);
}
