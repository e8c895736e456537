//! Tool exposure strategies sitting in front of the proxy dispatcher.
//!
//! Passthrough exposes the union of all cached upstream tools. Tool-search
//! compresses the catalog into two meta-tools, `discover` and `execute`,
//! backed by the BM25 index.

use crate::cache::{ExposedTool, SchemaCache};
use crate::error::{ProxyError, Result};
use crate::index::Bm25Index;
use crate::supervisor::ChildManager;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::sync::Arc;

pub const DISCOVER_TOOL: &str = "discover";
pub const EXECUTE_TOOL: &str = "execute";

const DEFAULT_MAX_RESULTS: u64 = 10;
const MAX_RESULTS_CEILING: u64 = 30;

/// How tools are presented to the host and how calls are routed.
#[async_trait]
pub trait ExposureMode: Send + Sync {
    /// Tool descriptors for `tools/list`.
    async fn tools_list(&self) -> Vec<Value>;

    /// Handle `tools/call`. The Ok value is the raw MCP tool result object.
    async fn tools_call(&self, name: &str, arguments: Value) -> Result<Value>;
}

pub fn build(
    mode: crate::config::Mode,
    cache: Arc<SchemaCache>,
    manager: Arc<ChildManager>,
    prefix_tools: bool,
) -> Arc<dyn ExposureMode> {
    match mode {
        crate::config::Mode::Passthrough => Arc::new(Passthrough {
            cache,
            manager,
            prefix_tools,
        }),
        crate::config::Mode::ToolSearch => Arc::new(ToolSearch::new(cache, manager)),
    }
}

// ============================================================================
// Passthrough
// ============================================================================

pub struct Passthrough {
    cache: Arc<SchemaCache>,
    manager: Arc<ChildManager>,
    prefix_tools: bool,
}

impl Passthrough {
    pub fn new(cache: Arc<SchemaCache>, manager: Arc<ChildManager>, prefix_tools: bool) -> Self {
        Self {
            cache,
            manager,
            prefix_tools,
        }
    }
}

#[async_trait]
impl ExposureMode for Passthrough {
    async fn tools_list(&self) -> Vec<Value> {
        self.cache
            .all_tools(self.prefix_tools)
            .into_iter()
            .map(exposed_tool_value)
            .collect()
    }

    async fn tools_call(&self, name: &str, arguments: Value) -> Result<Value> {
        let (server, original) = self
            .cache
            .resolve(name, self.prefix_tools)
            .ok_or_else(|| ProxyError::UnknownTool(name.to_string()))?;
        self.manager.call_tool(&server, &original, arguments).await
    }
}

fn exposed_tool_value(tool: ExposedTool) -> Value {
    // The schema serializes with its original name; overwrite with the
    // host-visible (possibly prefixed) one.
    let mut value = serde_json::to_value(&tool.schema).unwrap_or_else(|_| json!({}));
    if let Some(object) = value.as_object_mut() {
        object.insert("name".to_string(), json!(tool.name));
    }
    value
}

// ============================================================================
// Tool-search
// ============================================================================

pub struct ToolSearch {
    cache: Arc<SchemaCache>,
    manager: Arc<ChildManager>,
    /// (cache generation, index built from it). Rebuilt lazily on access when
    /// the cache has moved on.
    index: RwLock<(u64, Arc<Bm25Index>)>,
}

impl ToolSearch {
    pub fn new(cache: Arc<SchemaCache>, manager: Arc<ChildManager>) -> Self {
        let index = Arc::new(build_index(&cache));
        let generation = cache.generation();
        Self {
            cache,
            manager,
            index: RwLock::new((generation, index)),
        }
    }

    fn current_index(&self) -> Arc<Bm25Index> {
        let generation = self.cache.generation();
        {
            let guard = self.index.read();
            if guard.0 == generation {
                return guard.1.clone();
            }
        }
        let rebuilt = Arc::new(build_index(&self.cache));
        tracing::debug!(tools = rebuilt.len(), "rebuilt search index");
        *self.index.write() = (generation, rebuilt.clone());
        rebuilt
    }

    fn discover(&self, arguments: &Value) -> Value {
        let query = arguments
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        if query.is_empty() {
            return crate::protocol::text_tool_result(
                "No query given. Describe the capability you need, for example \
                 {\"query\": \"create a git commit\"}. Matching tools come back with \
                 their full input schemas; invoke one via the execute tool.",
            );
        }

        let limit = arguments
            .get("max_results")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_RESULTS)
            .clamp(1, MAX_RESULTS_CEILING) as usize;

        let hits = self.current_index().query(query, limit);
        let results: Vec<Value> = hits
            .iter()
            .map(|hit| {
                let schema = self.cache.tool_schema(&hit.server, &hit.tool);
                json!({
                    "tool": hit.tool,
                    "server": hit.server,
                    "score": (hit.score * 1000.0).round() / 1000.0,
                    "description": schema.as_ref().and_then(|s| s.description.clone()),
                    "inputSchema": schema.map(|s| s.input_schema),
                })
            })
            .collect();

        let body = json!({
            "query": query,
            "results": results,
            "instructions": "Invoke a tool with execute: \
                {\"tool_name\": \"<tool>\", \"arguments\": { ... }}. \
                Arguments must satisfy the tool's inputSchema.",
        });
        crate::protocol::text_tool_result(
            serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string()),
        )
    }

    async fn execute(&self, arguments: &Value) -> Result<Value> {
        let Some(tool_name) = arguments.get("tool_name").and_then(Value::as_str) else {
            return Err(ProxyError::InvalidArguments(
                "execute requires a 'tool_name' string".to_string(),
            ));
        };
        let call_args = arguments
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));
        if !call_args.is_object() {
            return Err(ProxyError::InvalidArguments(
                "'arguments' must be an object".to_string(),
            ));
        }

        let (server, original) = self
            .cache
            .resolve(tool_name, true)
            .or_else(|| self.cache.resolve_fuzzy(tool_name))
            .ok_or_else(|| ProxyError::UnknownTool(tool_name.to_string()))?;

        self.manager.call_tool(&server, &original, call_args).await
    }
}

#[async_trait]
impl ExposureMode for ToolSearch {
    async fn tools_list(&self) -> Vec<Value> {
        let tool_count = self.cache.tool_count();
        vec![
            json!({
                "name": DISCOVER_TOOL,
                "description": format!(
                    "Search {tool_count} federated MCP tools by keyword. Returns ranked matches \
                     with full input schemas; pass a result's tool name to execute."
                ),
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "Keywords describing the capability you need",
                        },
                        "max_results": {
                            "type": "integer",
                            "minimum": 1,
                            "maximum": MAX_RESULTS_CEILING,
                            "default": DEFAULT_MAX_RESULTS,
                        },
                    },
                    "required": ["query"],
                },
            }),
            json!({
                "name": EXECUTE_TOOL,
                "description": "Invoke a tool found via discover, by its tool name.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "tool_name": { "type": "string" },
                        "arguments": {
                            "type": "object",
                            "description": "Arguments matching the tool's inputSchema",
                            "default": {},
                        },
                    },
                    "required": ["tool_name"],
                },
            }),
        ]
    }

    async fn tools_call(&self, name: &str, arguments: Value) -> Result<Value> {
        match name {
            DISCOVER_TOOL => Ok(self.discover(&arguments)),
            EXECUTE_TOOL => self.execute(&arguments).await,
            other => Err(ProxyError::UnknownTool(format!(
                "'{other}' (this proxy exposes only '{DISCOVER_TOOL}' and '{EXECUTE_TOOL}')"
            ))),
        }
    }
}

fn build_index(cache: &SchemaCache) -> Bm25Index {
    let tools = cache.all_tools(false);
    Bm25Index::build(tools.iter().map(|t| (t.server.as_str(), &t.schema)))
}
