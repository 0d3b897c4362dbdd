//! MCP JSON-RPC stdio server exposing the pillar verbs.
//!
//! The transport is deliberately thin: protocol negotiation, tool listing,
//! and dispatch into [`Pillar::handle`]. Everything interesting happens in
//! the orchestration layer.

use crate::engine::Engine;
use crate::pillars::Pillar;
use std::io::{self, BufRead, Write as IoWrite};
use std::sync::Arc;
use tracing::info;

const PROTOCOL_VERSION: &str = "2025-06-18";

// ---------------------------------------------------------------------------
// Tool definitions
// ---------------------------------------------------------------------------

fn tool_definitions() -> serde_json::Value {
    let ro = serde_json::json!({
        "readOnlyHint": true,
        "destructiveHint": false,
        "idempotentHint": true,
        "openWorldHint": false
    });
    let mutating = serde_json::json!({
        "readOnlyHint": false,
        "destructiveHint": false,
        "idempotentHint": false,
        "openWorldHint": false
    });

    serde_json::json!([
        {
            "name": "explore",
            "annotations": ro,
            "description": "Find the smallest relevant context for a query or path set. Returns ranked doc and code items grouped into clusters, a pack id for follow-ups, and cursors for paging (cursor + packId) or full-content expansion without re-running the search.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Natural-language or structural query" },
                    "paths": { "type": "array", "items": { "type": "string" }, "description": "Explicit path prefixes to list instead of searching" },
                    "view": { "type": "string", "enum": ["preview", "full"], "description": "preview (default) or full content" },
                    "limits": {
                        "type": "object",
                        "properties": {
                            "maxResults": { "type": "integer" },
                            "maxChars": { "type": "integer" },
                            "maxItemChars": { "type": "integer" }
                        }
                    },
                    "include": {
                        "type": "object",
                        "properties": {
                            "docs": { "type": "boolean" },
                            "comments": { "type": "boolean" }
                        }
                    },
                    "cursor": { "type": "string", "description": "Items or content cursor from a prior response" },
                    "packId": { "type": "string", "description": "Evidence pack to page instead of searching" },
                    "allowSensitive": { "type": "boolean" }
                }
            }
        },
        {
            "name": "understand",
            "annotations": ro,
            "description": "Deep structural context for a query: expanded call/type relationships, hot-spot files, and guidance. Heavier than explore; use when the question is about how things connect.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "depth": { "type": "string", "enum": ["shallow", "deep"] },
                    "include": { "type": "object" },
                    "limits": { "type": "object" }
                },
                "required": ["query"]
            }
        },
        {
            "name": "change",
            "annotations": ro,
            "description": "Resolve an edit target to an exact line range and content hash. Returns ambiguity guidance when the snippet is not unique and hash_mismatch when the file drifted.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "snippet": { "type": "string" },
                    "expectedHash": { "type": "string" }
                },
                "required": ["path", "snippet"]
            }
        },
        {
            "name": "manage",
            "annotations": mutating,
            "description": "Engine maintenance: stats, invalidate (with cascade), pack compaction, full reindex.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": ["stats", "invalidate", "compact", "reindex"] },
                    "path": { "type": "string" },
                    "cascade": { "type": "boolean" }
                }
            }
        },
        {
            "name": "write",
            "annotations": ro,
            "description": "Plan a file write: existence check and base content hash for the applier.",
            "inputSchema": {
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }
        }
    ])
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

fn dispatch(
    engine: &Arc<Engine>,
    pillar: &Pillar,
    msg: &serde_json::Value,
) -> Option<serde_json::Value> {
    let id = msg.get("id").cloned()?;
    let method = msg["method"].as_str().unwrap_or("");

    let result = match method {
        "initialize" => serde_json::json!({
            "protocolVersion": msg["params"]["protocolVersion"]
                .as_str()
                .unwrap_or(PROTOCOL_VERSION),
            "capabilities": { "tools": {} },
            "serverInfo": {
                "name": "scopegraph",
                "version": env!("CARGO_PKG_VERSION"),
            }
        }),
        "ping" => serde_json::json!({}),
        "tools/list" => serde_json::json!({ "tools": tool_definitions() }),
        "tools/call" => {
            let name = msg["params"]["name"].as_str().unwrap_or("");
            let args = msg["params"]
                .get("arguments")
                .cloned()
                .unwrap_or(serde_json::json!({}));
            let response = pillar.handle(engine, name, &args);
            let is_error = response["success"] == serde_json::json!(false);
            serde_json::json!({
                "content": [{
                    "type": "text",
                    "text": serde_json::to_string_pretty(&response).unwrap_or_default(),
                }],
                "isError": is_error,
            })
        }
        _ => {
            return Some(serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("Method not found: {method}") }
            }));
        }
    };

    Some(serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

/// Blocking stdio loop. Returns when stdin closes.
pub fn run_mcp(engine: Arc<Engine>) {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let reader = stdin.lock();
    let pillar = Pillar::new();
    let mut initialized = false;

    let stats = engine.stats();
    info!(
        files = stats.trigram.files,
        ucg_files = stats.ucg.files,
        "MCP server ready"
    );

    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let msg: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => {
                let err = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": "Parse error" }
                });
                let mut out = stdout.lock();
                let _ = writeln!(out, "{err}");
                let _ = out.flush();
                continue;
            }
        };

        let method = msg["method"].as_str().unwrap_or("");
        if method.starts_with("notifications/") {
            continue;
        }
        if !initialized && method != "initialize" && method != "ping" {
            if let Some(id) = msg.get("id").cloned() {
                let err = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": -32002,
                        "message": "Server not initialized. Send 'initialize' first."
                    }
                });
                let mut out = stdout.lock();
                let _ = writeln!(out, "{}", serde_json::to_string(&err).unwrap());
                let _ = out.flush();
            }
            continue;
        }

        if let Some(response) = dispatch(&engine, &pillar, &msg) {
            if method == "initialize" {
                initialized = true;
            }
            let mut out = stdout.lock();
            let _ = writeln!(out, "{}", serde_json::to_string(&response).unwrap());
            let _ = out.flush();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, EngineMode};

    fn engine() -> (tempfile::TempDir, Arc<Engine>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.ts"), "export const alpha = 1;\n").unwrap();
        let storage = tempfile::tempdir().unwrap();
        std::env::set_var("SCOPEGRAPH_STORAGE", storage.path());
        Box::leak(Box::new(storage));
        let mut config = EngineConfig::default();
        config.mode = EngineMode::Test;
        let engine = Engine::open(dir.path(), config).unwrap();
        engine.index_workspace().unwrap();
        (dir, engine)
    }

    #[test]
    fn test_initialize_and_tools_list() {
        let (_dir, engine) = engine();
        let pillar = Pillar::new();

        let init = dispatch(
            &engine,
            &pillar,
            &serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }),
        )
        .unwrap();
        assert_eq!(init["result"]["serverInfo"]["name"], "scopegraph");

        let list = dispatch(
            &engine,
            &pillar,
            &serde_json::json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
        )
        .unwrap();
        let tools = list["result"]["tools"].as_array().unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["explore", "understand", "change", "manage", "write"]);
    }

    #[test]
    fn test_tools_call_routes_to_pillar() {
        let (_dir, engine) = engine();
        let pillar = Pillar::new();
        let response = dispatch(
            &engine,
            &pillar,
            &serde_json::json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": { "name": "manage", "arguments": { "action": "stats" } }
            }),
        )
        .unwrap();
        assert_eq!(response["result"]["isError"], serde_json::json!(false));
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("trigram"));
    }

    #[test]
    fn test_unknown_method_errors() {
        let (_dir, engine) = engine();
        let pillar = Pillar::new();
        let response = dispatch(
            &engine,
            &pillar,
            &serde_json::json!({ "jsonrpc": "2.0", "id": 4, "method": "resources/list" }),
        )
        .unwrap();
        assert_eq!(response["error"]["code"], serde_json::json!(-32601));
    }

    #[test]
    fn test_notifications_have_no_id_and_no_response() {
        let (_dir, engine) = engine();
        let pillar = Pillar::new();
        assert!(dispatch(
            &engine,
            &pillar,
            &serde_json::json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
        )
        .is_none());
    }
}
