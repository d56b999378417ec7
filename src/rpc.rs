//! JSON-RPC tool surface over stdio.
//!
//! Line-delimited JSON-RPC 2.0: one request per line on stdin, one
//! response per line on stdout. Exposes the engine to code-assistant
//! clients as four tools:
//!
//! | Tool | Purpose |
//! |------|---------|
//! | `search_docs` | Ranked hybrid search results |
//! | `get_snippets` | Budget-shaped formatted snippets |
//! | `index_docs` | Create/resume indexing of a docset |
//! | `index_status` | Per-docset crawl progress |
//!
//! Unknown methods and tools answer `-32601`; internal failures answer
//! `-32603`. The request `id` is echoed back verbatim; notifications
//! (requests without an id) are consumed silently.

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::orchestrator::{IndexRequest, Orchestrator};
use crate::search::SearchOptions;

/// Serve JSON-RPC on stdin/stdout until stdin closes.
pub async fn run_stdio(orchestrator: Arc<Orchestrator>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(_) => continue,
        };
        let method = message
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        if method.starts_with("notifications/") {
            continue;
        }
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let response = dispatch(&orchestrator, &method, id, params).await;
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn dispatch(orchestrator: &Arc<Orchestrator>, method: &str, id: Value, params: Value) -> Value {
    match method {
        "initialize" => rpc_response(
            id,
            json!({
                "protocolVersion": params
                    .get("protocolVersion")
                    .and_then(|v| v.as_str())
                    .unwrap_or("2025-03-26"),
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": {
                    "name": "mem-oracle",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "instructions": "Local documentation oracle. Use search_docs to find \
                    relevant documentation chunks, get_snippets for prompt-ready \
                    formatted snippets, index_docs to add a documentation site, and \
                    index_status to watch crawl progress."
            }),
        ),
        "ping" => rpc_response(id, json!({})),
        "tools/list" => rpc_response(id, json!({ "tools": tool_specs() })),
        "tools/call" => {
            let name = params
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
            match call_tool(orchestrator, &name, arguments).await {
                Ok(text) => rpc_response(
                    id,
                    json!({ "content": [{ "type": "text", "text": text }] }),
                ),
                Err(ToolError::UnknownTool) => {
                    rpc_error(id, -32601, &format!("unknown tool: {}", name))
                }
                Err(ToolError::Internal(message)) => rpc_error(id, -32603, &message),
            }
        }
        _ => rpc_error(id, -32601, "method not found"),
    }
}

fn rpc_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn rpc_error(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

fn tool_specs() -> Vec<Value> {
    vec![
        json!({
            "name": "search_docs",
            "description": "Search indexed documentation with hybrid vector + keyword retrieval.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "docsetIds": { "type": "array", "items": { "type": "string" } },
                    "topK": { "type": "integer", "default": 10 }
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "get_snippets",
            "description": "Retrieve prompt-ready documentation snippets within a character budget.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "docsetIds": { "type": "array", "items": { "type": "string" } },
                    "topK": { "type": "integer", "default": 10 },
                    "maxTotalChars": { "type": "integer" }
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "index_docs",
            "description": "Index a documentation site (crawl, chunk, embed). Idempotent per base URL.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "baseUrl": { "type": "string" },
                    "seedSlug": { "type": "string" },
                    "name": { "type": "string" },
                    "allowedPaths": { "type": "array", "items": { "type": "string" } },
                    "waitForSeed": { "type": "boolean", "default": false }
                },
                "required": ["baseUrl", "seedSlug"]
            }
        }),
        json!({
            "name": "index_status",
            "description": "Crawl and index progress per docset.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "docsetId": { "type": "string" },
                    "refresh": { "type": "boolean", "default": false }
                }
            }
        }),
    ]
}

enum ToolError {
    UnknownTool,
    Internal(String),
}

async fn call_tool(
    orchestrator: &Arc<Orchestrator>,
    name: &str,
    arguments: Value,
) -> Result<String, ToolError> {
    match name {
        "search_docs" => tool_search_docs(orchestrator, arguments).await,
        "get_snippets" => tool_get_snippets(orchestrator, arguments).await,
        "index_docs" => tool_index_docs(orchestrator, arguments).await,
        "index_status" => tool_index_status(orchestrator, arguments).await,
        _ => Err(ToolError::UnknownTool),
    }
}

fn internal(e: impl std::fmt::Display) -> ToolError {
    ToolError::Internal(e.to_string())
}

async fn tool_search_docs(
    orchestrator: &Arc<Orchestrator>,
    arguments: Value,
) -> Result<String, ToolError> {
    let mut options: SearchOptions = serde_json::from_value(arguments).map_err(internal)?;
    options.format_snippets = Some(false);
    let response = orchestrator.search(options).await.map_err(internal)?;

    if response.results.is_empty() {
        return Ok("No results.".to_string());
    }
    let mut out = String::new();
    for (i, hit) in response.results.iter().enumerate() {
        let title = hit.title.as_deref().unwrap_or("Untitled");
        out.push_str(&format!(
            "{}. [{:.3}] {} — {}\n",
            i + 1,
            hit.score,
            title,
            hit.url
        ));
        let excerpt: String = hit.content.chars().take(300).collect();
        out.push_str(&format!("   {}\n", excerpt.replace('\n', " ")));
    }
    Ok(out)
}

async fn tool_get_snippets(
    orchestrator: &Arc<Orchestrator>,
    arguments: Value,
) -> Result<String, ToolError> {
    let mut options: SearchOptions = serde_json::from_value(arguments).map_err(internal)?;
    options.format_snippets = Some(true);
    let response = orchestrator.search(options).await.map_err(internal)?;

    if response.results.is_empty() {
        return Ok("No results.".to_string());
    }
    let snippets: Vec<String> = response
        .results
        .iter()
        .map(|hit| match &hit.snippet {
            Some(snippet) => snippet.formatted.clone(),
            None => hit.content.clone(),
        })
        .collect();
    Ok(snippets.join("\n\n---\n\n"))
}

async fn tool_index_docs(
    orchestrator: &Arc<Orchestrator>,
    arguments: Value,
) -> Result<String, ToolError> {
    let request: IndexRequest = serde_json::from_value(arguments).map_err(internal)?;
    let outcome = orchestrator
        .clone()
        .index_docset(request)
        .await
        .map_err(internal)?;
    Ok(format!(
        "Indexing {} ({}): status {}, seed indexed: {}",
        outcome.docset.name,
        outcome.docset.id,
        outcome.docset.status.as_str(),
        outcome.seed_indexed
    ))
}

async fn tool_index_status(
    orchestrator: &Arc<Orchestrator>,
    arguments: Value,
) -> Result<String, ToolError> {
    let docset_id = arguments
        .get("docsetId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let reports = orchestrator
        .get_status(docset_id.as_deref(), false)
        .await
        .map_err(internal)?;

    if reports.is_empty() {
        return Ok("No docsets indexed.".to_string());
    }
    let mut out = String::new();
    for report in &reports {
        let status = &report.index_status;
        out.push_str(&format!(
            "{} ({}): {} — {}/{} pages indexed, {} pending, {} errors, {} skipped, {} chunks\n",
            report.docset.name,
            report.docset.id,
            report.docset.status.as_str(),
            status.indexed_pages,
            status.total_pages,
            status.pending_pages,
            status.error_pages,
            status.skipped_pages,
            status.total_chunks
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_specs_cover_the_four_tools() {
        let specs = tool_specs();
        let names: Vec<&str> = specs
            .iter()
            .map(|s| s.get("name").and_then(|n| n.as_str()).unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["search_docs", "get_snippets", "index_docs", "index_status"]
        );
        for spec in &specs {
            assert!(spec.get("inputSchema").is_some());
            assert!(spec.get("description").is_some());
        }
    }

    #[test]
    fn error_envelope_shape() {
        let err = rpc_error(json!(7), -32601, "method not found");
        assert_eq!(err["jsonrpc"], "2.0");
        assert_eq!(err["id"], 7);
        assert_eq!(err["error"]["code"], -32601);
    }

    #[test]
    fn response_echoes_id() {
        let resp = rpc_response(json!("abc"), json!({"ok": true}));
        assert_eq!(resp["id"], "abc");
        assert_eq!(resp["result"]["ok"], true);
    }
}
