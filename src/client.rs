//! JSON-RPC 2.0 client over a child process's stdio.
//!
//! Frames are line-delimited JSON. A writer task owns the child's stdin; a
//! reader task correlates responses to waiters by id. Request ids are numeric
//! and monotonic per client. Closing the channel (either side) fails every
//! pending waiter with a transport error.

use crate::error::{ProxyError, Result};
use crate::protocol::{
    self, JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND, RequestId, ToolSchema,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

type Waiter = oneshot::Sender<Result<Value>>;
type PendingMap = Arc<Mutex<HashMap<i64, Waiter>>>;

#[derive(Debug)]
pub struct UpstreamClient {
    server: String,
    next_id: AtomicI64,
    pending: PendingMap,
    outbound: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
    child: tokio::sync::Mutex<Child>,
    call_timeout: Duration,
}

impl UpstreamClient {
    /// Spawn the child and wire up its stdio channel. The initialize handshake
    /// is a separate step so the caller can race it against a deadline.
    pub fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        call_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            ProxyError::startup(server, format!("failed to spawn '{command}': {e}"))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProxyError::startup(server, "child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::startup(server, "child stdout unavailable"))?;
        let stderr = child.stderr.take();

        let (outbound, outbound_rx) = mpsc::unbounded_channel::<String>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(stdin, outbound_rx, closed.clone()));
        tokio::spawn(read_loop(
            stdout,
            server.to_string(),
            pending.clone(),
            outbound.clone(),
            closed.clone(),
        ));
        if let Some(stderr) = stderr {
            tokio::spawn(drain_stderr(stderr, server.to_string()));
        }

        Ok(Arc::new(Self {
            server: server.to_string(),
            next_id: AtomicI64::new(1),
            pending,
            outbound,
            closed,
            child: tokio::sync::Mutex::new(child),
            call_timeout,
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Cancelled when the stdio channel goes away, whichever side drops first.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Send one request and await its response, up to `timeout`. A timed-out
    /// waiter is dropped and a best-effort cancellation notification is sent.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if self.closed.is_cancelled() {
            return Err(ProxyError::Transport(format!(
                "connection to server '{}' is closed",
                self.server
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = serde_json::to_string(&JsonRpcRequest::request(id, method, params))
            .map_err(|e| ProxyError::Transport(format!("serialize request: {e}")))?;
        if self.outbound.send(frame).is_err() {
            self.pending.lock().remove(&id);
            return Err(ProxyError::Transport(format!(
                "connection to server '{}' is closed",
                self.server
            )));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProxyError::Transport(format!(
                "connection to server '{}' closed mid-request",
                self.server
            ))),
            Err(_) => {
                self.pending.lock().remove(&id);
                self.notify(
                    "notifications/cancelled",
                    Some(json!({ "requestId": id, "reason": "timeout" })),
                );
                Err(ProxyError::upstream(
                    &self.server,
                    None,
                    format!("'{method}' timed out after {}ms", timeout.as_millis()),
                ))
            }
        }
    }

    /// Fire-and-forget notification.
    pub fn notify(&self, method: &str, params: Option<Value>) {
        if let Ok(frame) = serde_json::to_string(&JsonRpcRequest::notification(method, params)) {
            let _ = self.outbound.send(frame);
        }
    }

    pub async fn initialize(&self, timeout: Duration) -> Result<()> {
        let params = json!({
            "protocolVersion": protocol::MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        self.request("initialize", Some(params), timeout).await?;
        self.notify("notifications/initialized", None);
        Ok(())
    }

    /// `tools/list`, following `nextCursor` pagination to the end.
    pub async fn list_tools(&self) -> Result<Vec<ToolSchema>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.take().map(|c| json!({ "cursor": c }));
            let result = self.request("tools/list", params, self.call_timeout).await?;

            let page = result
                .get("tools")
                .cloned()
                .unwrap_or_else(|| Value::Array(Vec::new()));
            let page: Vec<ToolSchema> = serde_json::from_value(page).map_err(|e| {
                ProxyError::upstream(&self.server, None, format!("malformed tools/list result: {e}"))
            })?;
            tools.extend(page);

            match result.get("nextCursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
                _ => break,
            }
        }

        Ok(tools)
    }

    /// Forward a tool call; the result object is returned untouched.
    pub async fn call_tool(&self, tool: &str, arguments: Value, timeout: Duration) -> Result<Value> {
        self.request(
            "tools/call",
            Some(json!({ "name": tool, "arguments": arguments })),
            timeout,
        )
        .await
    }

    /// Close the channel and reap the child: pending requests get a
    /// cancellation notification, stdin is closed, and the child has `grace`
    /// to exit before it is killed.
    pub async fn close(&self, grace: Duration) {
        let pending_ids: Vec<i64> = self.pending.lock().keys().copied().collect();
        for id in pending_ids {
            self.notify(
                "notifications/cancelled",
                Some(json!({ "requestId": id, "reason": "shutting down" })),
            );
        }
        tokio::task::yield_now().await;

        self.closed.cancel();
        fail_pending(&self.pending, &self.server);

        let mut child = self.child.lock().await;
        if grace > Duration::ZERO
            && tokio::time::timeout(grace, child.wait()).await.is_ok()
        {
            return;
        }
        if let Err(e) = child.kill().await {
            tracing::debug!(server = %self.server, error = %e, "failed to kill child");
        }
    }
}

async fn write_loop(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            frame = rx.recv() => {
                let Some(mut frame) = frame else { break };
                frame.push('\n');
                if stdin.write_all(frame.as_bytes()).await.is_err()
                    || stdin.flush().await.is_err()
                {
                    closed.cancel();
                    break;
                }
            }
        }
    }
    // Dropping stdin here closes the child's input so it can exit on its own.
}

async fn read_loop(
    stdout: ChildStdout,
    server: String,
    pending: PendingMap,
    outbound: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            tracing::warn!(server = %server, "discarding unparseable frame from child");
            continue;
        };

        if value.get("method").is_some() {
            handle_inbound(&server, value, &outbound);
            continue;
        }

        match serde_json::from_value::<JsonRpcResponse>(value) {
            Ok(response) => dispatch_response(&server, response, &pending),
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "malformed response frame from child");
            }
        }
    }

    closed.cancel();
    fail_pending(&pending, &server);
}

/// Server-initiated traffic: answer `ping`, reject other requests, log
/// notifications. This proxy does not forward server-side capabilities.
fn handle_inbound(server: &str, value: Value, outbound: &mpsc::UnboundedSender<String>) {
    let Ok(request) = serde_json::from_value::<JsonRpcRequest>(value) else {
        tracing::warn!(server = %server, "malformed request frame from child");
        return;
    };

    match (request.id, request.method.as_str()) {
        (Some(id), "ping") => {
            let response = JsonRpcResponse::ok(id, json!({}));
            if let Ok(frame) = serde_json::to_string(&response) {
                let _ = outbound.send(frame);
            }
        }
        (Some(id), method) => {
            let response = JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("method '{method}' is not supported by this proxy"),
            );
            if let Ok(frame) = serde_json::to_string(&response) {
                let _ = outbound.send(frame);
            }
        }
        (None, method) => {
            tracing::debug!(server = %server, method = %method, "notification from child");
        }
    }
}

fn dispatch_response(server: &str, response: JsonRpcResponse, pending: &PendingMap) {
    let RequestId::Number(id) = response.id else {
        tracing::warn!(server = %server, id = %response.id, "response with unallocated id");
        return;
    };
    let Some(waiter) = pending.lock().remove(&id) else {
        tracing::debug!(server = %server, id, "response for a request no longer waiting");
        return;
    };

    let outcome = match response.error {
        Some(err) => Err(ProxyError::upstream(server, Some(err.code), err.message)),
        None => Ok(response.result.unwrap_or(Value::Null)),
    };
    let _ = waiter.send(outcome);
}

fn fail_pending(pending: &PendingMap, server: &str) {
    let waiters: Vec<(i64, Waiter)> = pending.lock().drain().collect();
    for (_, waiter) in waiters {
        let _ = waiter.send(Err(ProxyError::Transport(format!(
            "connection to server '{server}' closed"
        ))));
    }
}

async fn drain_stderr(stderr: ChildStderr, server: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, "{line}");
    }
}
