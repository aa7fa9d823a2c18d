//! MCP-mode JSON-RPC transport (spec §4.I/§4.J).
//!
//! Every tool call already carries an explicit `path`, so unlike the
//! teacher's workspace-root inference cascade this layer has nothing to
//! bootstrap: it just reads line-delimited JSON-RPC requests off stdin,
//! routes `tools/call` through `dispatcher::dispatch`, and writes the
//! response back through [`crate::stdio_guard::write_protocol_line`] — the
//! one writer the stdout guard never intercepts.

use crate::dispatcher::{dispatch, tool_schemas, AppState};
use crate::stdio_guard::write_protocol_line;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

const PROTOCOL_VERSION: &str = "2024-11-05";

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    })
}

fn result_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

async fn handle_request(state: &AppState, id: Value, method: &str, params: &Value) -> Value {
    match method {
        "initialize" => result_response(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {"name": "satori", "version": env!("CARGO_PKG_VERSION")},
                "capabilities": {"tools": {}},
            }),
        ),
        "ping" => result_response(id, json!({})),
        "tools/list" => result_response(id, json!({"tools": tool_schemas()})),
        "tools/call" => {
            let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
            let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            let envelope = dispatch(state, name, &args).await;
            result_response(id, envelope.to_json())
        }
        "resources/list" => result_response(id, json!({"resources": []})),
        "prompts/list" => result_response(id, json!({"prompts": []})),
        other => error_response(id, -32601, &format!("method not found: {other}")),
    }
}

/// Drives the stdin/stdout JSON-RPC loop until stdin closes. Malformed or
/// empty lines are skipped; notifications (no `id`) are processed but never
/// answered.
pub async fn run_stdio_server(state: AppState) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let has_id = parsed.get("id").is_some();
        let method = parsed.get("method").and_then(|m| m.as_str()).unwrap_or("");
        let params = parsed.get("params").cloned().unwrap_or_else(|| json!({}));

        if !has_id {
            // Notification: dispatch for effect (none currently has any) but
            // never reply.
            continue;
        }
        let id = parsed.get("id").cloned().unwrap_or(Value::Null);
        let reply = handle_request(&state, id, method, &params).await;
        write_protocol_line(&reply.to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_uses_jsonrpc_shape() {
        let resp = error_response(json!(1), -32601, "method not found: foo");
        assert_eq!(resp["error"]["code"], json!(-32601));
        assert_eq!(resp["jsonrpc"], json!("2.0"));
    }
}
