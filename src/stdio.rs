//! Host-facing MCP over stdio: line-delimited JSON-RPC on stdin/stdout.
//!
//! stdout carries protocol frames only; logging goes to stderr. Requests run
//! on their own tasks so slow upstreams never block the read loop; responses
//! funnel through one writer task so frames never interleave. Response order
//! is unconstrained, ids correlate.

use crate::proxy::ProxyServer;
use crate::supervisor::ChildManager;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub async fn run(
    proxy: Arc<ProxyServer>,
    manager: Arc<ChildManager>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(mut frame) = out_rx.recv().await {
            frame.push('\n');
            if stdout.write_all(frame.as_bytes()).await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    tracing::info!("serving MCP on stdio");
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                tracing::info!("shutdown requested");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let frame: Value = match serde_json::from_str(line) {
                            Ok(value) => value,
                            Err(e) => {
                                tracing::warn!(error = %e, "discarding unparseable frame from host");
                                continue;
                            }
                        };
                        let proxy = proxy.clone();
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move {
                            if let Some(response) = proxy.handle_message(frame).await {
                                match serde_json::to_string(&response) {
                                    Ok(frame) => {
                                        let _ = out_tx.send(frame);
                                    }
                                    Err(e) => {
                                        tracing::error!(error = %e, "failed to serialize response");
                                    }
                                }
                            }
                        });
                    }
                    Ok(None) => {
                        tracing::info!("host closed stdin; shutting down");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "stdin read failed; shutting down");
                        break;
                    }
                }
            }
        }
    }

    // Stop children first: in-flight handlers fail fast with transport errors,
    // push their responses, and release their writer handles.
    manager.shutdown_all().await;
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}
