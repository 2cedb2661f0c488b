// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! MCP (Model Context Protocol) client contract (spec §4.1): `initialize`, `listTools`,
//! `callTool`, `stop`, over either a local child-process transport or a remote
//! SSE+POST transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

use crate::providers::ToolSchema;

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server returned an error: {0}")]
    Server(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerInfo {
    pub name: String,
    pub version: String,
}

#[async_trait]
pub trait McpClient: Send + Sync {
    async fn initialize(&mut self) -> Result<McpServerInfo, McpError>;
    async fn list_tools(&mut self) -> Result<Vec<ToolSchema>, McpError>;
    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value, McpError>;
    async fn stop(&mut self) -> Result<(), McpError>;
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    id: u64,
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    message: String,
}

/// Retains only the environment variables in `allow` (plus `PATH`), so a spawned MCP
/// server never inherits the caller's full environment -- including any secrets -- by
/// accident.
pub fn sanitize_env(base: &HashMap<String, String>, allow: &[String]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if let Some(path) = base.get("PATH") {
        out.insert("PATH".to_string(), path.clone());
    }
    for key in allow {
        if let Some(value) = base.get(key) {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

/// Local transport: spawns the server as a child process and speaks line-delimited
/// JSON-RPC over its stdin/stdout.
pub struct ChildProcessMcpClient {
    child: Child,
    stdin: tokio::process::ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
    next_id: AtomicU64,
}

impl ChildProcessMcpClient {
    pub fn spawn(command: &str, args: &[String], env: HashMap<String, String>) -> Result<Self, McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::Transport(format!("failed to spawn {command}: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("child has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("child has no stdout".into()))?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: AtomicU64::new(1),
        })
    }

    async fn roundtrip(&mut self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let mut line = serde_json::to_string(&req).map_err(|e| McpError::Protocol(e.to_string()))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        self.stdin.flush().await.map_err(|e| McpError::Transport(e.to_string()))?;

        let mut response_line = String::new();
        self.stdout
            .read_line(&mut response_line)
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if response_line.is_empty() {
            return Err(McpError::Transport("server closed the stream".into()));
        }
        let resp: JsonRpcResponse =
            serde_json::from_str(response_line.trim()).map_err(|e| McpError::Protocol(e.to_string()))?;
        if let Some(err) = resp.error {
            return Err(McpError::Server(err.message));
        }
        resp.result.ok_or_else(|| McpError::Protocol("missing result".into()))
    }
}

#[async_trait]
impl McpClient for ChildProcessMcpClient {
    async fn initialize(&mut self) -> Result<McpServerInfo, McpError> {
        let result = self.roundtrip("initialize", serde_json::json!({})).await?;
        serde_json::from_value(result).map_err(|e| McpError::Protocol(e.to_string()))
    }

    async fn list_tools(&mut self) -> Result<Vec<ToolSchema>, McpError> {
        let result = self.roundtrip("tools/list", serde_json::json!({})).await?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| McpError::Protocol("missing tools field".into()))?;
        serde_json::from_value(tools).map_err(|e| McpError::Protocol(e.to_string()))
    }

    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.roundtrip("tools/call", serde_json::json!({ "name": name, "arguments": arguments }))
            .await
    }

    async fn stop(&mut self) -> Result<(), McpError> {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        Ok(())
    }
}

/// Remote transport: a thin SSE+POST client. Each call is a single POST whose body is
/// parsed as either a bare JSON-RPC response or an SSE stream of `data: ...` lines, of
/// which only the final one is taken as the response. This does not implement the full
/// SSE reconnection/event-id semantics -- deliberately out of scope.
pub struct RemoteMcpClient {
    http: reqwest::Client,
    base_url: String,
    next_id: AtomicU64,
}

impl RemoteMcpClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn roundtrip(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let resp = self
            .http
            .post(&self.base_url)
            .header("Accept", "text/event-stream, application/json")
            .json(&req)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        let body = resp.text().await.map_err(|e| McpError::Transport(e.to_string()))?;
        let payload = last_sse_data_line(&body).unwrap_or(body.trim());
        let parsed: JsonRpcResponse = serde_json::from_str(payload).map_err(|e| McpError::Protocol(e.to_string()))?;
        if let Some(err) = parsed.error {
            return Err(McpError::Server(err.message));
        }
        parsed.result.ok_or_else(|| McpError::Protocol("missing result".into()))
    }
}

fn last_sse_data_line(body: &str) -> Option<&str> {
    body.lines().filter_map(|l| l.strip_prefix("data:")).last().map(str::trim)
}

#[async_trait]
impl McpClient for RemoteMcpClient {
    async fn initialize(&mut self) -> Result<McpServerInfo, McpError> {
        let result = self.roundtrip("initialize", serde_json::json!({})).await?;
        serde_json::from_value(result).map_err(|e| McpError::Protocol(e.to_string()))
    }

    async fn list_tools(&mut self) -> Result<Vec<ToolSchema>, McpError> {
        let result = self.roundtrip("tools/list", serde_json::json!({})).await?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| McpError::Protocol("missing tools field".into()))?;
        serde_json::from_value(tools).map_err(|e| McpError::Protocol(e.to_string()))
    }

    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.roundtrip("tools/call", serde_json::json!({ "name": name, "arguments": arguments }))
            .await
    }

    async fn stop(&mut self) -> Result<(), McpError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_env_keeps_only_allowlisted_keys() {
        let mut base = HashMap::new();
        base.insert("PATH".to_string(), "/usr/bin".to_string());
        base.insert("OPENAI_API_KEY".to_string(), "sk-...".to_string());
        base.insert("HOME".to_string(), "/root".to_string());
        let allow = vec!["OPENAI_API_KEY".to_string()];
        let sanitized = sanitize_env(&base, &allow);
        assert_eq!(sanitized.get("PATH"), Some(&"/usr/bin".to_string()));
        assert_eq!(sanitized.get("OPENAI_API_KEY"), Some(&"sk-...".to_string()));
        assert!(!sanitized.contains_key("HOME"));
    }

    #[test]
    fn last_sse_data_line_picks_final_event() {
        let body = "event: ping\ndata: {\"a\":1}\n\ndata: {\"a\":2}\n";
        assert_eq!(last_sse_data_line(body), Some("{\"a\":2}"));
    }
}
