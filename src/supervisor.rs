//! Child lifecycle management: lazy spawn, coalesced startup, idle reaping.
//!
//! Each configured server owns one `ManagedServer` record. At most one child
//! process exists per server at any instant; concurrent callers that find the
//! server stopped coalesce on a per-server start lock and share the spawn that
//! wins it.

use crate::client::UpstreamClient;
use crate::config::{PreloadPolicy, ServerEntry, ServerMap, Settings, expand_env_string};
use crate::error::{ProxyError, Result};
use crate::protocol::ToolSchema;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Grace given to a child between closing its stdin and killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Delay between sequential preload starts, avoiding a thundering herd at boot.
const PRELOAD_SPACING: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Error,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Stopped => write!(f, "stopped"),
            ServerState::Starting => write!(f, "starting"),
            ServerState::Running => write!(f, "running"),
            ServerState::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub name: String,
    pub state: ServerState,
    pub persistent: bool,
    pub seconds_since_activity: u64,
}

struct ManagedServer {
    name: String,
    config: ServerEntry,
    state: Mutex<ServerState>,
    client: Mutex<Option<Arc<UpstreamClient>>>,
    last_activity: Mutex<Instant>,
    /// Bumped on every activity; a scheduled idle expiry only acts when the
    /// generation it captured is still current.
    idle_generation: AtomicU64,
    /// Coalesces concurrent spawns of the same server.
    start_lock: tokio::sync::Mutex<()>,
}

pub struct ChildManager {
    servers: HashMap<String, Arc<ManagedServer>>,
    order: Vec<String>,
    idle_timeout: Duration,
    startup_timeout: Duration,
    call_timeout: Duration,
}

impl ChildManager {
    pub fn new(servers: &ServerMap, settings: &Settings) -> Arc<Self> {
        let mut map = HashMap::new();
        let mut order = Vec::new();
        for (name, entry) in servers.iter() {
            order.push(name.clone());
            map.insert(
                name.clone(),
                Arc::new(ManagedServer {
                    name: name.clone(),
                    config: entry.clone(),
                    state: Mutex::new(ServerState::Stopped),
                    client: Mutex::new(None),
                    last_activity: Mutex::new(Instant::now()),
                    idle_generation: AtomicU64::new(0),
                    start_lock: tokio::sync::Mutex::new(()),
                }),
            );
        }
        Arc::new(Self {
            servers: map,
            order,
            idle_timeout: settings.idle_timeout_duration(),
            startup_timeout: settings.startup_timeout_duration(),
            call_timeout: settings.call_timeout_duration(),
        })
    }

    pub fn state(&self, name: &str) -> Option<ServerState> {
        self.servers.get(name).map(|s| *s.state.lock())
    }

    pub fn running_count(&self) -> usize {
        self.servers
            .values()
            .filter(|s| *s.state.lock() == ServerState::Running)
            .count()
    }

    pub fn status(&self) -> Vec<ServerStatus> {
        self.order
            .iter()
            .filter_map(|name| self.servers.get(name))
            .map(|s| ServerStatus {
                name: s.name.clone(),
                state: *s.state.lock(),
                persistent: s.config.persistent,
                seconds_since_activity: s.last_activity.lock().elapsed().as_secs(),
            })
            .collect()
    }

    pub fn effective_idle_timeout(&self, entry: &ServerEntry) -> Duration {
        entry
            .idle_timeout
            .map_or(self.idle_timeout, Duration::from_secs)
    }

    /// Return a ready client for `name`, starting the child if needed.
    pub async fn get_client(&self, name: &str) -> Result<Arc<UpstreamClient>> {
        let server = self.server(name)?;
        if let Some(client) = live_client(&server) {
            return Ok(client);
        }

        // Coalesce: whoever wins the lock spawns; everyone else re-checks and
        // shares the client it produced.
        let _start = server.start_lock.lock().await;
        if let Some(client) = live_client(&server) {
            return Ok(client);
        }
        self.start_server(&server).await
    }

    /// `get_client` + `tools/list`.
    pub async fn discover_tools(&self, name: &str) -> Result<Vec<ToolSchema>> {
        let server = self.server(name)?;
        let client = self.get_client(name).await?;
        let tools = client.list_tools().await?;
        self.touch(&server);
        Ok(tools)
    }

    /// Forward a tool call to the owning child, resetting its idle timer.
    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value> {
        let server = self.server(name)?;
        let client = self.get_client(name).await?;

        // Keep a pending idle expiry from firing mid-call.
        server.idle_generation.fetch_add(1, Ordering::SeqCst);

        let result = client.call_tool(tool, arguments, self.call_timeout).await;
        if *server.state.lock() == ServerState::Running {
            self.touch(&server);
        }
        result
    }

    /// Gracefully close the client and transition to `Stopped`.
    pub async fn stop_server(&self, name: &str) {
        if let Some(server) = self.servers.get(name) {
            stop_managed(server).await;
        }
    }

    /// Stop every server concurrently and wait for all of them.
    pub async fn shutdown_all(&self) {
        futures::future::join_all(self.order.iter().map(|name| self.stop_server(name))).await;
    }

    /// Warm servers chosen by the preload policy plus any entry with
    /// `preload: true`. Sequential with spacing; failures are logged and do
    /// not abort the rest.
    pub async fn preload(&self, policy: &PreloadPolicy, servers: &ServerMap) {
        let mut warm: Vec<String> = match policy {
            PreloadPolicy::None => Vec::new(),
            PreloadPolicy::All => self.order.clone(),
            PreloadPolicy::List(names) => self
                .order
                .iter()
                .filter(|name| names.contains(name))
                .cloned()
                .collect(),
        };
        for (name, entry) in servers.iter() {
            if entry.preload && !warm.contains(name) {
                warm.push(name.clone());
            }
        }
        if warm.is_empty() {
            return;
        }

        tracing::info!(servers = ?warm, "preloading servers");
        for (i, name) in warm.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(PRELOAD_SPACING).await;
            }
            match self.get_client(name).await {
                Ok(_) => tracing::debug!(server = %name, "preloaded"),
                Err(e) => tracing::warn!(server = %name, error = %e, "preload failed"),
            }
        }
    }

    fn server(&self, name: &str) -> Result<Arc<ManagedServer>> {
        self.servers
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::Config(format!("server '{name}' is not configured")))
    }

    async fn start_server(
        &self,
        server: &Arc<ManagedServer>,
    ) -> Result<Arc<UpstreamClient>> {
        *server.state.lock() = ServerState::Starting;
        tracing::info!(server = %server.name, "starting MCP server");

        let (command, args, env) = match build_command_parts(&server.name, &server.config) {
            Ok(parts) => parts,
            Err(e) => {
                *server.state.lock() = ServerState::Error;
                return Err(e);
            }
        };

        let client = match UpstreamClient::spawn(
            &server.name,
            &command,
            &args,
            &env,
            self.call_timeout,
        ) {
            Ok(client) => client,
            Err(e) => {
                *server.state.lock() = ServerState::Error;
                return Err(e);
            }
        };

        // The outer deadline is authoritative; the handshake request gets a
        // slightly longer one so a timeout is always reported as a startup
        // timeout rather than a generic request timeout.
        let handshake_timeout = self.startup_timeout.saturating_add(Duration::from_secs(1));
        match tokio::time::timeout(self.startup_timeout, client.initialize(handshake_timeout)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                client.close(Duration::ZERO).await;
                *server.state.lock() = ServerState::Error;
                return Err(ProxyError::startup(&server.name, e.to_string()));
            }
            Err(_) => {
                client.close(Duration::ZERO).await;
                *server.state.lock() = ServerState::Error;
                return Err(ProxyError::startup(
                    &server.name,
                    format!("startup timeout after {}ms", self.startup_timeout.as_millis()),
                ));
            }
        }

        *server.client.lock() = Some(client.clone());
        *server.state.lock() = ServerState::Running;
        tracing::info!(server = %server.name, "MCP server ready");

        // Transition to Stopped when the transport drops out from under us.
        // In-flight calls fail with transport errors; the next call re-spawns.
        {
            let server = server.clone();
            let client = client.clone();
            tokio::spawn(async move {
                client.closed().cancelled().await;
                let mut slot = server.client.lock();
                if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, &client)) {
                    *slot = None;
                    *server.state.lock() = ServerState::Stopped;
                    drop(slot);
                    tracing::info!(server = %server.name, "MCP server connection closed");
                }
            });
        }

        self.touch(server);
        Ok(client)
    }

    /// Record activity and re-arm the one-shot idle timer. Persistent servers
    /// never arm one.
    fn touch(&self, server: &Arc<ManagedServer>) {
        *server.last_activity.lock() = Instant::now();
        if server.config.persistent {
            return;
        }

        let generation = server.idle_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let idle = self.effective_idle_timeout(&server.config);
        let server = server.clone();
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if server.idle_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if *server.state.lock() != ServerState::Running {
                return;
            }
            tracing::info!(
                server = %server.name,
                idle_secs = idle.as_secs(),
                "idle timeout reached; stopping server"
            );
            stop_managed(&server).await;
        });
    }
}

async fn stop_managed(server: &Arc<ManagedServer>) {
    // Invalidate any scheduled idle expiry before tearing the client down.
    server.idle_generation.fetch_add(1, Ordering::SeqCst);

    let client = server.client.lock().take();
    if let Some(client) = client {
        tracing::info!(server = %server.name, "stopping MCP server");
        client.close(SHUTDOWN_GRACE).await;
    }
    *server.state.lock() = ServerState::Stopped;
}

/// Expand `${VAR}` references in the spawn parameters. Env values are secret
/// and are never logged.
fn build_command_parts(
    name: &str,
    entry: &ServerEntry,
) -> Result<(String, Vec<String>, HashMap<String, String>)> {
    let wrap = |e: ProxyError| ProxyError::Config(format!("server '{name}': {e}"));

    let command = expand_env_string(&entry.command).map_err(wrap)?;
    let args = entry
        .args
        .iter()
        .map(|arg| expand_env_string(arg))
        .collect::<Result<Vec<_>>>()
        .map_err(wrap)?;
    let env = entry
        .env
        .iter()
        .map(|(k, v)| Ok((k.clone(), expand_env_string(v)?)))
        .collect::<Result<HashMap<_, _>>>()
        .map_err(wrap)?;
    Ok((command, args, env))
}

fn live_client(server: &Arc<ManagedServer>) -> Option<Arc<UpstreamClient>> {
    server
        .client
        .lock()
        .as_ref()
        .filter(|c| !c.is_closed())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerEntry, ServerMap, Settings};

    fn settings(idle_secs: u64, startup_ms: u64) -> Settings {
        Settings {
            idle_timeout: idle_secs,
            startup_timeout: startup_ms,
            call_timeout: 5,
            ..Settings::default()
        }
    }

    /// Minimal MCP server in POSIX sh: answers initialize, tools/list, and
    /// tools/call with canned results, echoing back the request id.
    #[cfg(unix)]
    fn fake_server() -> ServerEntry {
        let script = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"ping","description":"Reply with pong","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id" ;;
  esac
done
"#;
        ServerEntry {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..ServerEntry::default()
        }
    }

    #[cfg(unix)]
    fn manager_with(entry: ServerEntry, settings: Settings) -> Arc<ChildManager> {
        let mut servers = ServerMap::default();
        servers.insert("fake".to_string(), entry);
        ChildManager::new(&servers, &settings)
    }

    #[test]
    fn idle_timeout_prefers_per_server_override() {
        let mut servers = ServerMap::default();
        servers.insert("a".to_string(), ServerEntry::command("true"));
        let manager = ChildManager::new(&servers, &settings(300, 30_000));

        let default_entry = ServerEntry::command("true");
        assert_eq!(
            manager.effective_idle_timeout(&default_entry),
            Duration::from_secs(300)
        );

        let overridden = ServerEntry {
            idle_timeout: Some(10),
            ..ServerEntry::command("true")
        };
        assert_eq!(
            manager.effective_idle_timeout(&overridden),
            Duration::from_secs(10)
        );
    }

    #[tokio::test]
    async fn unknown_server_is_a_config_error() {
        let manager = ChildManager::new(&ServerMap::default(), &settings(300, 30_000));
        let err = manager.get_client("ghost").await.unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_first_calls_share_one_spawn() {
        let manager = manager_with(fake_server(), settings(300, 10_000));

        let clients = futures::future::join_all(
            (0..8).map(|_| {
                let manager = manager.clone();
                async move { manager.get_client("fake").await }
            }),
        )
        .await;

        let first = clients[0].as_ref().expect("first client").clone();
        for client in &clients {
            let client = client.as_ref().expect("client");
            assert!(Arc::ptr_eq(client, &first));
        }
        assert_eq!(manager.state("fake"), Some(ServerState::Running));
        assert_eq!(manager.running_count(), 1);

        manager.shutdown_all().await;
        assert_eq!(manager.state("fake"), Some(ServerState::Stopped));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn discover_then_call_round_trips() {
        let manager = manager_with(fake_server(), settings(300, 10_000));

        let tools = manager.discover_tools("fake").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "ping");

        let result = manager
            .call_tool("fake", "ping", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "pong");

        manager.shutdown_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn idle_server_is_reaped_after_its_window() {
        let entry = ServerEntry {
            idle_timeout: Some(1),
            ..fake_server()
        };
        let manager = manager_with(entry, settings(300, 10_000));

        manager
            .call_tool("fake", "ping", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(manager.state("fake"), Some(ServerState::Running));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(manager.state("fake"), Some(ServerState::Running));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(manager.state("fake"), Some(ServerState::Stopped));
        assert_eq!(manager.running_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn persistent_server_survives_its_idle_window() {
        let entry = ServerEntry {
            idle_timeout: Some(1),
            persistent: true,
            ..fake_server()
        };
        let manager = manager_with(entry, settings(1, 10_000));

        manager
            .call_tool("fake", "ping", serde_json::json!({}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(manager.state("fake"), Some(ServerState::Running));

        manager.shutdown_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn handshake_timeout_kills_the_child() {
        // `sleep` never speaks MCP, so initialize cannot complete.
        let entry = ServerEntry {
            command: "sleep".to_string(),
            args: vec!["60".to_string()],
            ..ServerEntry::default()
        };
        let manager = manager_with(entry, settings(300, 300));

        let started = Instant::now();
        let err = manager.get_client("fake").await.unwrap_err();
        assert!(matches!(err, ProxyError::Startup { .. }), "{err}");
        assert!(err.to_string().contains("startup timeout"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(manager.state("fake"), Some(ServerState::Error));

        // A later attempt re-enters the spawn path rather than hanging.
        let err = manager.get_client("fake").await.unwrap_err();
        assert!(matches!(err, ProxyError::Startup { .. }), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unexpected_child_exit_transitions_to_stopped() {
        // Child that completes the handshake and then exits immediately.
        let script = r#"
IFS= read -r line
id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0"}}}\n' "$id"
"#;
        let entry = ServerEntry {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..ServerEntry::default()
        };
        let manager = manager_with(entry, settings(300, 10_000));

        manager.get_client("fake").await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(manager.state("fake"), Some(ServerState::Stopped));
    }

    #[test]
    fn env_expansion_failure_names_the_server() {
        let entry = ServerEntry {
            command: "${MCP_ON_DEMAND_MISSING_BINARY_VAR}".to_string(),
            ..ServerEntry::default()
        };
        let err = build_command_parts("broken", &entry).unwrap_err();
        assert!(err.to_string().contains("broken"), "{err}");
    }
}
