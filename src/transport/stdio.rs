use crate::config::TransportLimits;
use crate::context::RequestContext;
use crate::error::Result;
use crate::tools::Dispatcher;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

/// Line-delimited JSON-RPC framing over stdio.
///
/// Each request line is one JSON-RPC 2.0 object; each response is written as
/// one line. The adapter owns framing and size bounds only; everything else
/// belongs to the dispatcher.
pub struct StdioServer {
    dispatcher: Arc<Dispatcher>,
    limits: TransportLimits,
}

impl StdioServer {
    pub fn new(dispatcher: Arc<Dispatcher>, limits: TransportLimits) -> Self {
        Self { dispatcher, limits }
    }

    /// Read request lines until stdin closes
    pub async fn serve(&self) -> Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        let mut stdout = tokio::io::stdout();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle_line(&line).await;
            let rendered = serde_json::to_string(&response)?;
            stdout.write_all(rendered.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        debug!("stdin closed; shutting down");
        Ok(())
    }

    /// Handle one request line and produce the response object
    pub async fn handle_line(&self, line: &str) -> Value {
        if line.len() > self.limits.max_request_size_bytes {
            warn!(size = line.len(), "Oversized request line rejected");
            return rpc_error(Value::Null, -32600, "Request too large");
        }

        let request: Value = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(_) => return rpc_error(Value::Null, -32700, "Parse error"),
        };
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");
        let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

        match method {
            "initialize" => {
                let info = self.dispatcher.server_info().await;
                rpc_result(id, json!({ "server_info": info }))
            }
            "tools/list" => rpc_result(id, json!({ "tools": self.dispatcher.list_tools() })),
            "tools/call" => {
                let name = match params.get("name").and_then(|n| n.as_str()) {
                    Some(name) => name.to_string(),
                    None => return rpc_error(id, -32602, "Missing tool name"),
                };
                let arguments = params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                let ctx = build_context(&params);
                let envelope = self.dispatcher.dispatch(&name, arguments, &ctx).await;
                rpc_result(id, envelope)
            }
            _ => rpc_error(id, -32601, "Method not found"),
        }
    }
}

/// Adopt the caller's correlation and session ids when present; generate
/// otherwise. A client timeout becomes the request deadline.
fn build_context(params: &Value) -> RequestContext {
    let mut ctx = match params.get("correlation_id").and_then(|c| c.as_str()) {
        Some(correlation_id) => RequestContext::with_correlation_id(correlation_id),
        None => RequestContext::new(),
    };
    if let Some(session_id) = params.get("session_id").and_then(|s| s.as_str()) {
        ctx = ctx.with_session(session_id);
    }
    if let Some(timeout_ms) = params.get("timeout_ms").and_then(|t| t.as_i64()) {
        if timeout_ms > 0 {
            ctx = ctx.with_deadline(Utc::now() + Duration::milliseconds(timeout_ms));
        }
    }
    ctx
}

fn rpc_result(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn rpc_error(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}
