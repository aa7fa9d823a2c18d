//! Hybrid code-search and call-graph MCP server.
//!
//! `main.rs` is the thin CLI/transport entry point; everything that knows
//! how to index, search, and answer call-graph queries lives here so the
//! CLI-bridge test harness (`cli_bridge.rs`, `tests/mcp_stdio_smoke.rs`) can
//! drive the same binary it ships.

pub mod callgraph;
pub mod capability;
pub mod cli_bridge;
pub mod completion;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fingerprint;
pub mod merkle;
pub mod orchestrator;
pub mod providers;
pub mod search;
pub mod server;
pub mod snapshot;
pub mod stdio_guard;
pub mod sync;
pub mod telemetry;
