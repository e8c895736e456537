//! Host-facing MCP over loopback HTTP/SSE.
//!
//! `GET /sse` opens the event stream: first an `endpoint` event naming the
//! per-session POST URL, then `message` events carrying JSON-RPC responses.
//! Requests are POSTed to `/message?sessionId=...`. Outgoing frames go through
//! a bounded per-session queue; a full queue closes that session rather than
//! letting a slow reader block peers. A reaper drops sessions idle past the
//! configured window, and TCP keepalive on the listener detects half-open
//! connections.

use crate::proxy::ProxyServer;
use crate::supervisor::ChildManager;
use anyhow::Context as _;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const SESSION_QUEUE_CAPACITY: usize = 64;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

struct SseSession {
    tx: mpsc::Sender<Event>,
    last_activity: Instant,
}

pub struct SseState {
    proxy: Arc<ProxyServer>,
    manager: Arc<ChildManager>,
    sessions: Mutex<HashMap<String, SseSession>>,
    session_timeout: Duration,
}

pub async fn serve(
    proxy: Arc<ProxyServer>,
    manager: Arc<ChildManager>,
    port: u16,
    session_timeout: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let state = Arc::new(SseState {
        proxy,
        manager,
        sessions: Mutex::new(HashMap::new()),
        session_timeout,
    });
    spawn_session_reaper(state.clone(), shutdown.clone());

    let app = Router::new()
        .route("/sse", get(sse_connect))
        .route("/message", post(post_message))
        .route("/status", get(status))
        .route("/health", get(|| async { "ok" }))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = bind_with_keepalive(addr).with_context(|| format!("bind '{addr}'"))?;
    tracing::info!("serving MCP over SSE on http://{addr}/sse");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await
        .context("SSE server failed")?;
    Ok(())
}

/// Keepalive is configured on the listening socket so accepted connections
/// detect half-open peers without per-connection plumbing.
fn bind_with_keepalive(addr: SocketAddr) -> anyhow::Result<tokio::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(15))
        .with_interval(Duration::from_secs(5));
    socket.set_tcp_keepalive(&keepalive)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(tokio::net::TcpListener::from_std(socket.into())?)
}

async fn sse_connect(
    State(state): State<Arc<SseState>>,
) -> Sse<impl futures::Stream<Item = std::result::Result<Event, Infallible>>> {
    let session_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel::<Event>(SESSION_QUEUE_CAPACITY);
    state.sessions.lock().insert(
        session_id.clone(),
        SseSession {
            tx,
            last_activity: Instant::now(),
        },
    );
    tracing::info!(session = %session_id, "SSE client connected");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/message?sessionId={session_id}"));
    let stream = futures::stream::once(std::future::ready(Ok(endpoint))).chain(
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (Ok(event), rx))
        }),
    );

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}

async fn status(State(state): State<Arc<SseState>>) -> Json<Value> {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "runningServers": state.manager.running_count(),
        "sessions": state.sessions.lock().len(),
        "servers": state.manager.status(),
    }))
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn post_message(
    State(state): State<Arc<SseState>>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> axum::response::Response {
    let frame: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid JSON-RPC: {e}")).into_response();
        }
    };
    let is_request = frame.get("id").is_some();

    let response = state.proxy.handle_message(frame).await;

    if let Some(response) = response {
        let json = match serde_json::to_string(&response) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize response");
                return (StatusCode::INTERNAL_SERVER_ERROR, "serialize failed").into_response();
            }
        };
        let event = Event::default().event("message").data(json);

        let mut sessions = state.sessions.lock();
        let Some(session) = sessions.get_mut(&query.session_id) else {
            return (StatusCode::NOT_FOUND, "session not found").into_response();
        };
        session.last_activity = Instant::now();
        match session.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The client stopped reading; close its session instead of
                // letting the backlog block other sessions.
                sessions.remove(&query.session_id);
                tracing::warn!(session = %query.session_id, "session queue full; closing session");
                return (StatusCode::GONE, "session closed (slow consumer)").into_response();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                sessions.remove(&query.session_id);
                return (StatusCode::GONE, "session closed").into_response();
            }
        }
    } else if let Some(session) = state.sessions.lock().get_mut(&query.session_id) {
        session.last_activity = Instant::now();
    }

    if is_request {
        StatusCode::ACCEPTED.into_response()
    } else {
        StatusCode::OK.into_response()
    }
}

/// Dropping a session's sender ends its event stream, which closes the HTTP
/// response. Upstream children are untouched; a reconnecting host sees cached
/// tools immediately.
fn spawn_session_reaper(state: Arc<SseState>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(REAPER_INTERVAL) => {}
            }
            let mut sessions = state.sessions.lock();
            sessions.retain(|id, session| {
                let keep = session.last_activity.elapsed() <= state.session_timeout;
                if !keep {
                    tracing::info!(session = %id, "reaped idle SSE session");
                }
                keep
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SchemaCache;
    use crate::config::{ServerMap, Settings};
    use crate::modes::Passthrough;
    use crate::supervisor::ChildManager;
    use std::path::PathBuf;

    fn test_state() -> Arc<SseState> {
        let cache = Arc::new(SchemaCache::new(
            PathBuf::from("/nonexistent/schema-cache.json"),
            Vec::new(),
        ));
        let manager = ChildManager::new(&ServerMap::default(), &Settings::default());
        Arc::new(SseState {
            proxy: Arc::new(ProxyServer::new(Arc::new(Passthrough::new(
                cache,
                manager.clone(),
                false,
            )))),
            manager,
            sessions: Mutex::new(HashMap::new()),
            session_timeout: Duration::from_secs(300),
        })
    }

    #[tokio::test]
    async fn post_to_unknown_session_is_not_found() {
        let state = test_state();
        let response = post_message(
            State(state),
            Query(MessageQuery {
                session_id: "missing".to_string(),
            }),
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn request_is_answered_on_the_session_stream() {
        let state = test_state();
        let (tx, mut rx) = mpsc::channel::<Event>(SESSION_QUEUE_CAPACITY);
        state.sessions.lock().insert(
            "s1".to_string(),
            SseSession {
                tx,
                last_activity: Instant::now(),
            },
        );

        let response = post_message(
            State(state),
            Query(MessageQuery {
                session_id: "s1".to_string(),
            }),
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn full_session_queue_closes_the_session() {
        let state = test_state();
        let (tx, _rx) = mpsc::channel::<Event>(1);
        tx.try_send(Event::default().data("filler")).unwrap();
        state.sessions.lock().insert(
            "slow".to_string(),
            SseSession {
                tx,
                last_activity: Instant::now(),
            },
        );

        let response = post_message(
            State(state.clone()),
            Query(MessageQuery {
                session_id: "slow".to_string(),
            }),
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::GONE);
        assert!(state.sessions.lock().is_empty());
    }

    #[tokio::test]
    async fn bad_json_is_rejected_before_session_lookup() {
        let state = test_state();
        let response = post_message(
            State(state),
            Query(MessageQuery {
                session_id: "s1".to_string(),
            }),
            "not json".to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
