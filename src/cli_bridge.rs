use crate::error::SatoriError;
use anyhow::{Context, Result};
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Spawns the server as a child process over stdio and drives a single
/// `initialize` + `tools/call` round-trip, each phase bounded by its own
/// timeout (spec §4.J).
pub struct CliSession {
    child: Child,
    reader: BufReader<std::process::ChildStdout>,
    next_id: i64,
}

impl CliSession {
    pub fn spawn(binary: &std::path::Path, startup_timeout: Duration) -> Result<Self, SatoriError> {
        let mut child = Command::new(binary)
            .arg("mcp")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| SatoriError::startup_timeout(format!("spawn failed: {e}")))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let reader = BufReader::new(stdout);
        let mut session = CliSession {
            child,
            reader,
            next_id: 1,
        };

        let started = Instant::now();
        session
            .call_raw(
                "initialize",
                serde_json::json!({ "protocolVersion": "2024-11-05" }),
            )
            .map_err(|e| {
                if started.elapsed() > startup_timeout {
                    SatoriError::startup_timeout(e.to_string())
                } else {
                    SatoriError::protocol_failure(e.to_string())
                }
            })?;

        if started.elapsed() > startup_timeout {
            return Err(SatoriError::startup_timeout("initialize exceeded timeout"));
        }

        Ok(session)
    }

    fn call_raw(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let stdin = self.child.stdin.as_mut().context("child stdin closed")?;
        writeln!(stdin, "{request}").context("failed to write to child stdin")?;

        loop {
            let mut line = String::new();
            let n = self
                .reader
                .read_line(&mut line)
                .context("failed to read child stdout")?;
            if n == 0 {
                anyhow::bail!("child closed stdout before responding");
            }
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(&line).context("stdout line was not JSON")?;
            if value.get("id").and_then(|v| v.as_i64()) == Some(id) {
                return Ok(value);
            }
        }
    }

    /// Calls `tools/call` for `tool_name`, bounded by `call_timeout`. Returns
    /// the raw JSON-RPC response payload.
    pub fn call_tool(
        &mut self,
        tool_name: &str,
        arguments: Value,
        call_timeout: Duration,
    ) -> Result<Value, SatoriError> {
        let started = Instant::now();
        let result = self.call_raw(
            "tools/call",
            serde_json::json!({ "name": tool_name, "arguments": arguments }),
        );
        if started.elapsed() > call_timeout {
            return Err(SatoriError::call_timeout(format!(
                "{tool_name} exceeded {call_timeout:?}"
            )));
        }
        result.map_err(|e| SatoriError::protocol_failure(e.to_string()))
    }

    pub fn shutdown(mut self) -> Result<()> {
        drop(self.child.stdin.take());
        let _ = self.child.wait();
        Ok(())
    }
}

/// True when `text` matches one of the retryable protocol signatures (spec
/// §4.J).
pub fn has_retryable_protocol_signature(text: &str) -> bool {
    const TOKENS: &[&str] = &[
        "E_PROTOCOL_FAILURE",
        "E_STARTUP_TIMEOUT",
        "E_CALL_TIMEOUT",
        "Request timed out",
        "[STDOUT_BLOCKED_BINARY len=",
    ];
    if TOKENS.iter().any(|t| text.contains(t)) {
        return true;
    }
    matches_mcp_error_code(text)
}

fn matches_mcp_error_code(text: &str) -> bool {
    // `MCP error -?\d+`
    if let Some(idx) = text.find("MCP error ") {
        let rest = &text[idx + "MCP error ".len()..];
        let rest = rest.strip_prefix('-').unwrap_or(rest);
        return rest.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false);
    }
    false
}

/// Extracts the `status` field from the first JSON object embedded in
/// `content[0].text`, if parseable (spec §4.J).
pub fn extract_envelope_status(payload: &Value) -> Option<String> {
    let text = payload
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .and_then(|item| item.get("text"))
        .and_then(|t| t.as_str())?;
    let parsed: Value = serde_json::from_str(text).ok()?;
    parsed
        .get("status")
        .and_then(|s| s.as_str())
        .map(|s| s.to_string())
}

/// Shape check for a `{isError, content:[{type:"text", text}]}` payload
/// (spec §4.J).
pub fn is_call_tool_payload(payload: &Value) -> bool {
    let has_is_error = payload.get("isError").map(|v| v.is_boolean()).unwrap_or(false);
    let content_ok = payload
        .get("content")
        .and_then(|c| c.as_array())
        .map(|arr| {
            arr.iter().all(|item| {
                item.get("type").and_then(|t| t.as_str()) == Some("text")
                    && item.get("text").map(|t| t.is_string()).unwrap_or(false)
            })
        })
        .unwrap_or(false);
    has_is_error && content_ok
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEligibility {
    pub retryable: bool,
    pub reason: &'static str,
}

#[derive(Debug, Clone)]
pub struct RetryClassifierInput<'a> {
    pub tool_name: &'a str,
    pub stderr: &'a str,
    pub parsed_payload: Option<&'a Value>,
}

/// Pure function (P3): decides whether the CLI should retry a failed call
/// (spec §4.J).
pub fn classify_retry_eligibility(input: &RetryClassifierInput) -> RetryEligibility {
    if let Some(payload) = input.parsed_payload {
        if is_call_tool_payload(payload) && extract_envelope_status(payload).is_some() {
            return RetryEligibility {
                retryable: false,
                reason: "valid_response",
            };
        }
    }

    if has_retryable_protocol_signature(input.stderr) {
        let is_startup_timeout = input.stderr.contains("E_STARTUP_TIMEOUT");
        if input.tool_name == "manage_index" && !is_startup_timeout {
            return RetryEligibility {
                retryable: false,
                reason: "manage_index_retry_blocked",
            };
        }
        return RetryEligibility {
            retryable: true,
            reason: "protocol_retry_allowed",
        };
    }

    RetryEligibility {
        retryable: false,
        reason: "no_signature",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn valid_response_never_retries_even_on_error_status() {
        let payload = serde_json::json!({
            "isError": false,
            "content": [{"type": "text", "text": "{\"status\":\"not_ready\"}"}]
        });
        let input = RetryClassifierInput {
            tool_name: "search_codebase",
            stderr: "",
            parsed_payload: Some(&payload),
        };
        assert_eq!(
            classify_retry_eligibility(&input),
            RetryEligibility {
                retryable: false,
                reason: "valid_response"
            }
        );
    }

    #[test]
    fn manage_index_blocks_retry_unless_startup_timeout() {
        let input = RetryClassifierInput {
            tool_name: "manage_index",
            stderr: "E_CALL_TIMEOUT exceeded",
            parsed_payload: None,
        };
        assert_eq!(
            classify_retry_eligibility(&input),
            RetryEligibility {
                retryable: false,
                reason: "manage_index_retry_blocked"
            }
        );

        let input2 = RetryClassifierInput {
            tool_name: "manage_index",
            stderr: "E_STARTUP_TIMEOUT exceeded",
            parsed_payload: None,
        };
        assert_eq!(
            classify_retry_eligibility(&input2),
            RetryEligibility {
                retryable: true,
                reason: "protocol_retry_allowed"
            }
        );
    }

    #[test]
    fn non_manage_index_tool_retries_on_any_signature() {
        let input = RetryClassifierInput {
            tool_name: "search_codebase",
            stderr: "Request timed out after 30s",
            parsed_payload: None,
        };
        assert_eq!(
            classify_retry_eligibility(&input),
            RetryEligibility {
                retryable: true,
                reason: "protocol_retry_allowed"
            }
        );
    }

    #[test]
    fn no_signature_is_not_retryable() {
        let input = RetryClassifierInput {
            tool_name: "search_codebase",
            stderr: "some unrelated panic",
            parsed_payload: None,
        };
        assert_eq!(
            classify_retry_eligibility(&input),
            RetryEligibility {
                retryable: false,
                reason: "no_signature"
            }
        );
    }

    #[test]
    fn mcp_error_code_signature_is_detected() {
        assert!(has_retryable_protocol_signature("MCP error -32000: boom"));
        assert!(has_retryable_protocol_signature("MCP error 500"));
        assert!(!has_retryable_protocol_signature("totally unrelated"));
    }

    proptest! {
        #[test]
        fn classifier_is_pure(
            tool_name in "[a-z_]{1,20}",
            stderr in ".{0,80}",
        ) {
            // P3: classifyRetryEligibility is a pure function of its inputs.
            let input = RetryClassifierInput {
                tool_name: &tool_name,
                stderr: &stderr,
                parsed_payload: None,
            };
            let a = classify_retry_eligibility(&input);
            let b = classify_retry_eligibility(&input);
            prop_assert_eq!(a, b);
        }
    }
}
