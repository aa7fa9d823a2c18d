use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. Must write to stderr only — stdout
/// is reserved for JSON-RPC framing in `mcp` mode (the same invariant the
/// stdout guard in `stdio_guard` enforces for accidental writes).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

/// Emits the search telemetry line specified in spec §6 verbatim:
/// `[TELEMETRY] <json>` on stderr. This is a protocol-visible line, not a
/// tracing event, so it bypasses the subscriber entirely.
pub fn emit_search_telemetry(event: &serde_json::Value) {
    eprintln!("[TELEMETRY] {event}");
}
