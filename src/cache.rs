//! Persistent schema cache and the routing table derived from it.
//!
//! The cache is one JSON document mapping server name to its discovered tool
//! schemas. An in-memory snapshot (cache contents + `tool -> server` routing)
//! lives behind an `Arc` that readers clone and writers replace whole, so a
//! reader never observes a half-applied update.

use crate::config::write_json_atomic;
use crate::error::{ProxyError, Result};
use crate::protocol::ToolSchema;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const CACHE_VERSION: u32 = 1;
pub const CACHE_FILE_NAME: &str = "schema-cache.json";
pub const TOOL_PREFIX_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSchemaCache {
    pub server_name: String,
    pub tools: Vec<ToolSchema>,
    pub cached_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullCache {
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub servers: HashMap<String, ServerSchemaCache>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for FullCache {
    fn default() -> Self {
        Self {
            version: CACHE_VERSION,
            generated_at: Utc::now(),
            servers: HashMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

/// One tool as exposed to the host, together with its owning server.
#[derive(Debug, Clone)]
pub struct ExposedTool {
    /// Host-visible name; carries the `<server>__` prefix when prefixing is on.
    pub name: String,
    pub server: String,
    pub schema: ToolSchema,
}

struct CacheSnapshot {
    full: FullCache,
    /// Server listing order: declared order first, then any cached leftovers.
    order: Vec<String>,
    /// Unprefixed tool name to owning server (collision winner).
    routing: HashMap<String, String>,
}

pub struct SchemaCache {
    path: PathBuf,
    /// Declared server order from the config; collision resolution and listing
    /// order both follow it.
    declared_order: Vec<String>,
    snapshot: RwLock<Arc<CacheSnapshot>>,
    generation: AtomicU64,
}

impl SchemaCache {
    pub fn new(path: PathBuf, declared_order: Vec<String>) -> Self {
        let snapshot = Self::build_snapshot(&declared_order, FullCache::default());
        Self {
            path,
            declared_order,
            snapshot: RwLock::new(Arc::new(snapshot)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Monotonic counter bumped on every snapshot swap. Consumers that derive
    /// state from the cache (the search index) use it for staleness checks.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Read the cache file. Returns `false` when it is missing or unreadable;
    /// both cases behave as an empty cache.
    pub async fn load(&self) -> bool {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return false,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to read schema cache");
                return false;
            }
        };
        let full: FullCache = match serde_json::from_str(&content) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "schema cache is corrupt; treating as missing"
                );
                return false;
            }
        };
        if full.version > CACHE_VERSION {
            tracing::warn!(
                version = full.version,
                "schema cache written by a newer version; extra fields are ignored"
            );
        }
        let tools: usize = full.servers.values().map(|s| s.tools.len()).sum();
        tracing::info!(servers = full.servers.len(), tools, "loaded schema cache");
        self.swap(full);
        true
    }

    /// Persist the current snapshot (temp file + rename, never in place).
    pub async fn save(&self) -> Result<()> {
        let snapshot = self.snapshot.read().clone();
        write_json_atomic(&self.path, &snapshot.full)
            .await
            .map_err(|e| ProxyError::Cache(format!("write {}: {e}", self.path.display())))
    }

    /// Replace one server's entry and rebuild the routing table.
    pub fn update_server(&self, name: &str, tools: Vec<ToolSchema>) {
        let mut full = self.snapshot.read().full.clone();
        full.servers.insert(
            name.to_string(),
            ServerSchemaCache {
                server_name: name.to_string(),
                tools,
                cached_at: Utc::now(),
                extra: serde_json::Map::new(),
            },
        );
        full.generated_at = Utc::now();
        self.swap(full);
    }

    /// Drop cache entries for servers no longer configured.
    pub fn retain_servers(&self, keep: &[String]) {
        let current = self.snapshot.read().clone();
        if current.full.servers.keys().all(|name| keep.contains(name)) {
            return;
        }
        let mut full = current.full.clone();
        full.servers.retain(|name, _| keep.contains(name));
        self.swap(full);
    }

    pub fn is_cached(&self, server: &str) -> bool {
        self.snapshot.read().full.servers.contains_key(server)
    }

    pub fn tool_count(&self) -> usize {
        let snapshot = self.snapshot.read();
        snapshot.full.servers.values().map(|s| s.tools.len()).sum()
    }

    /// Per-server summary in listing order: `(name, tool count, cached at)`.
    pub fn summary(&self) -> Vec<(String, usize, DateTime<Utc>)> {
        let snapshot = self.snapshot.read().clone();
        snapshot
            .order
            .iter()
            .filter_map(|name| {
                snapshot
                    .full
                    .servers
                    .get(name)
                    .map(|s| (name.clone(), s.tools.len(), s.cached_at))
            })
            .collect()
    }

    /// All host-visible tools. With `prefix` every cached tool is listed under
    /// `<server>__<name>`; without it, collision losers are omitted so the
    /// listing never contains duplicates.
    pub fn all_tools(&self, prefix: bool) -> Vec<ExposedTool> {
        let snapshot = self.snapshot.read().clone();
        let mut out = Vec::new();
        for server in &snapshot.order {
            let Some(entry) = snapshot.full.servers.get(server) else {
                continue;
            };
            for tool in &entry.tools {
                if prefix {
                    out.push(ExposedTool {
                        name: format!("{server}{TOOL_PREFIX_SEPARATOR}{}", tool.name),
                        server: server.clone(),
                        schema: tool.clone(),
                    });
                } else if snapshot.routing.get(&tool.name) == Some(server) {
                    out.push(ExposedTool {
                        name: tool.name.clone(),
                        server: server.clone(),
                        schema: tool.clone(),
                    });
                }
            }
        }
        out
    }

    /// Resolve a host-visible tool name to `(server, original name)`.
    ///
    /// With prefixing enabled the `<server>__<tool>` form is authoritative;
    /// unprefixed names fall back to the routing table either way.
    pub fn resolve(&self, exposed: &str, prefix: bool) -> Option<(String, String)> {
        let snapshot = self.snapshot.read().clone();
        if prefix && let Some((server, original)) = exposed.split_once(TOOL_PREFIX_SEPARATOR) {
            if let Some(entry) = snapshot.full.servers.get(server)
                && entry.tools.iter().any(|t| t.name == original)
            {
                return Some((server.to_string(), original.to_string()));
            }
        }
        snapshot
            .routing
            .get(exposed)
            .map(|server| (server.clone(), exposed.to_string()))
    }

    /// Relaxed lookup for tool-search `execute`: case-insensitive and blind to
    /// non-alphanumeric separators. The tool name is the primary key; a
    /// server-qualified form (`server` + `tool`, any separators) disambiguates.
    pub fn resolve_fuzzy(&self, exposed: &str) -> Option<(String, String)> {
        let needle = normalize(exposed);
        if needle.is_empty() {
            return None;
        }
        let snapshot = self.snapshot.read().clone();

        let mut by_tool: Vec<(String, String)> = Vec::new();
        for server in &snapshot.order {
            let Some(entry) = snapshot.full.servers.get(server) else {
                continue;
            };
            for tool in &entry.tools {
                if normalize(&tool.name) == needle {
                    by_tool.push((server.clone(), tool.name.clone()));
                }
            }
        }
        if by_tool.len() == 1 {
            return by_tool.into_iter().next();
        }

        // Ambiguous (or no bare-name hit): accept a server-qualified form.
        for server in &snapshot.order {
            let Some(entry) = snapshot.full.servers.get(server) else {
                continue;
            };
            let server_norm = normalize(server);
            for tool in &entry.tools {
                if format!("{server_norm}{}", normalize(&tool.name)) == needle {
                    return Some((server.clone(), tool.name.clone()));
                }
            }
        }

        // Several servers declare the name: first declared wins, as in routing.
        by_tool.into_iter().next()
    }

    pub fn tool_schema(&self, server: &str, tool: &str) -> Option<ToolSchema> {
        let snapshot = self.snapshot.read();
        snapshot
            .full
            .servers
            .get(server)?
            .tools
            .iter()
            .find(|t| t.name == tool)
            .cloned()
    }

    fn swap(&self, full: FullCache) {
        let snapshot = Self::build_snapshot(&self.declared_order, full);
        *self.snapshot.write() = Arc::new(snapshot);
        self.generation.fetch_add(1, Ordering::Release);
    }

    fn build_snapshot(declared_order: &[String], full: FullCache) -> CacheSnapshot {
        let mut order: Vec<String> = declared_order
            .iter()
            .filter(|name| full.servers.contains_key(*name))
            .cloned()
            .collect();
        let mut leftovers: Vec<String> = full
            .servers
            .keys()
            .filter(|name| !order.contains(name))
            .cloned()
            .collect();
        leftovers.sort();
        order.extend(leftovers);

        let routing = build_routing(&order, &full);
        CacheSnapshot {
            full,
            order,
            routing,
        }
    }
}

fn build_routing(order: &[String], full: &FullCache) -> HashMap<String, String> {
    let mut routing: HashMap<String, String> = HashMap::new();
    for server in order {
        let Some(entry) = full.servers.get(server) else {
            continue;
        };
        for tool in &entry.tools {
            if let Some(winner) = routing.get(&tool.name) {
                tracing::warn!(
                    tool = %tool.name,
                    kept = %winner,
                    dropped = %server,
                    "tool name declared by multiple servers; first declared wins"
                );
            } else {
                routing.insert(tool.name.clone(), server.clone());
            }
        }
    }
    routing
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolSchema;
    use serde_json::json;
    use tempfile::tempdir;

    fn tool(name: &str) -> ToolSchema {
        ToolSchema::new(name, Some("test tool"), json!({ "type": "object" }))
    }

    fn cache_with(order: &[&str]) -> SchemaCache {
        SchemaCache::new(
            PathBuf::from("/nonexistent/schema-cache.json"),
            order.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schema-cache.json");

        let cache = SchemaCache::new(path.clone(), vec!["echo".to_string()]);
        cache.update_server("echo", vec![tool("ping"), tool("shout")]);
        cache.save().await.unwrap();

        let reloaded = SchemaCache::new(path, vec!["echo".to_string()]);
        assert!(reloaded.load().await);
        assert_eq!(reloaded.tool_count(), 2);
        assert_eq!(
            reloaded.resolve("ping", false),
            Some(("echo".to_string(), "ping".to_string()))
        );
    }

    #[tokio::test]
    async fn corrupt_cache_behaves_as_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schema-cache.json");
        std::fs::write(&path, "{{{").unwrap();

        let cache = SchemaCache::new(path, vec![]);
        assert!(!cache.load().await);
        assert_eq!(cache.tool_count(), 0);
    }

    #[tokio::test]
    async fn load_tolerates_forward_compatible_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schema-cache.json");
        std::fs::write(
            &path,
            r#"{
                "version": 1,
                "generatedAt": "2026-01-01T00:00:00Z",
                "compression": "none",
                "servers": {
                    "git": {
                        "serverName": "git",
                        "tools": [{"name": "git_commit", "inputSchema": {"type": "object"}}],
                        "cachedAt": "2026-01-01T00:00:00Z",
                        "etag": "abc"
                    }
                }
            }"#,
        )
        .unwrap();

        let cache = SchemaCache::new(path, vec!["git".to_string()]);
        assert!(cache.load().await);
        assert_eq!(cache.tool_count(), 1);
    }

    #[test]
    fn collision_keeps_first_declared_server() {
        let cache = cache_with(&["alpha", "beta"]);
        cache.update_server("beta", vec![tool("list"), tool("beta_only")]);
        cache.update_server("alpha", vec![tool("list")]);

        // Routing follows declared order, not update order.
        assert_eq!(
            cache.resolve("list", false),
            Some(("alpha".to_string(), "list".to_string()))
        );

        let listed = cache.all_tools(false);
        let list_entries: Vec<_> = listed.iter().filter(|t| t.name == "list").collect();
        assert_eq!(list_entries.len(), 1);
        assert_eq!(list_entries[0].server, "alpha");
        assert!(listed.iter().any(|t| t.name == "beta_only"));
    }

    #[test]
    fn prefixed_listing_exposes_both_sides_of_a_collision() {
        let cache = cache_with(&["alpha", "beta"]);
        cache.update_server("alpha", vec![tool("list")]);
        cache.update_server("beta", vec![tool("list")]);

        let names: Vec<String> = cache.all_tools(true).into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["alpha__list", "beta__list"]);

        assert_eq!(
            cache.resolve("alpha__list", true),
            Some(("alpha".to_string(), "list".to_string()))
        );
        assert_eq!(
            cache.resolve("beta__list", true),
            Some(("beta".to_string(), "list".to_string()))
        );
    }

    #[test]
    fn prefix_resolution_round_trips_every_tool() {
        let cache = cache_with(&["files", "web"]);
        cache.update_server("files", vec![tool("read_file"), tool("write_file")]);
        cache.update_server("web", vec![tool("fetch")]);

        for exposed in cache.all_tools(true) {
            let (server, original) = cache.resolve(&exposed.name, true).unwrap();
            assert_eq!(server, exposed.server);
            assert_eq!(original, exposed.schema.name);
            assert_eq!(exposed.name, format!("{server}__{original}"));
        }
    }

    #[test]
    fn unknown_tool_resolves_to_none() {
        let cache = cache_with(&["echo"]);
        cache.update_server("echo", vec![tool("ping")]);
        assert_eq!(cache.resolve("pong", false), None);
        assert_eq!(cache.resolve("other__ping", true), None);
    }

    #[test]
    fn fuzzy_resolution_ignores_case_and_separators() {
        let cache = cache_with(&["github", "gitlab"]);
        cache.update_server("github", vec![tool("create_issue")]);
        cache.update_server("gitlab", vec![tool("merge_request")]);

        assert_eq!(
            cache.resolve_fuzzy("CreateIssue"),
            Some(("github".to_string(), "create_issue".to_string()))
        );
        // Server-qualified form works when both declare the same name.
        cache.update_server("gitlab", vec![tool("create_issue")]);
        assert_eq!(
            cache.resolve_fuzzy("gitlab.create-issue"),
            Some(("gitlab".to_string(), "create_issue".to_string()))
        );
        // Bare ambiguous name falls back to the first declared server.
        assert_eq!(
            cache.resolve_fuzzy("create_issue"),
            Some(("github".to_string(), "create_issue".to_string()))
        );
    }

    #[test]
    fn retain_drops_unconfigured_servers() {
        let cache = cache_with(&["keep"]);
        cache.update_server("keep", vec![tool("a")]);
        cache.update_server("gone", vec![tool("b")]);
        assert_eq!(cache.tool_count(), 2);

        cache.retain_servers(&["keep".to_string()]);
        assert_eq!(cache.tool_count(), 1);
        assert_eq!(cache.resolve("b", false), None);
    }

    #[test]
    fn generation_bumps_on_update() {
        let cache = cache_with(&["echo"]);
        let before = cache.generation();
        cache.update_server("echo", vec![tool("ping")]);
        assert!(cache.generation() > before);
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schema-cache.json");
        let cache = SchemaCache::new(path.clone(), vec!["echo".to_string()]);
        cache.update_server("echo", vec![tool("ping")]);
        cache.save().await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "schema-cache.json")
            .collect();
        assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
    }
}
