//! Dashboard REST API: thin CRUD over the config file.
//!
//! Every mutation rewrites the config document atomically. The running proxy
//! reads config at startup; edits made here take effect on its next start.

use crate::config::{Config, ServerEntry};
use anyhow::Context as _;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_DASHBOARD_PORT: u16 = 24681;

pub struct DashboardState {
    /// Serializes read-modify-write cycles against the config file.
    config: tokio::sync::Mutex<Config>,
}

pub async fn serve(config: Config, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let state = Arc::new(DashboardState {
        config: tokio::sync::Mutex::new(config),
    });

    let app = router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind '{addr}'"))?;
    tracing::info!("dashboard API on http://{addr}/api/servers");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await
        .context("dashboard server failed")?;
    Ok(())
}

pub fn router(state: Arc<DashboardState>) -> Router {
    Router::new()
        .route("/api/servers", get(list_servers).post(create_server))
        .route(
            "/api/servers/{name}",
            put(upsert_server).delete(delete_server),
        )
        .route("/api/servers/{name}/env/{key}", put(set_server_env))
        .route("/api/settings", put(update_settings))
        .route("/api/import", post(import_servers))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

type ApiError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

async fn list_servers(State(state): State<Arc<DashboardState>>) -> Json<Value> {
    let config = state.config.lock().await;
    let servers: Vec<Value> = config
        .file
        .servers
        .iter()
        .map(|(name, entry)| {
            let mut value = serde_json::to_value(entry).unwrap_or_else(|_| json!({}));
            if let Some(object) = value.as_object_mut() {
                object.insert("name".to_string(), json!(name));
            }
            value
        })
        .collect();
    Json(json!({ "servers": servers }))
}

#[derive(Debug, Deserialize)]
struct CreateServerBody {
    name: String,
    #[serde(flatten)]
    entry: ServerEntry,
}

async fn create_server(
    State(state): State<Arc<DashboardState>>,
    Json(body): Json<CreateServerBody>,
) -> Result<StatusCode, ApiError> {
    if body.name.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "server name is required".into()));
    }
    let mut config = state.config.lock().await;
    if config.file.servers.contains(&body.name) {
        return Err((
            StatusCode::CONFLICT,
            format!("server '{}' already exists", body.name),
        ));
    }
    config.file.servers.insert(body.name.clone(), body.entry);
    config.save().await.map_err(internal)?;
    tracing::info!(server = %body.name, "server added via dashboard");
    Ok(StatusCode::CREATED)
}

async fn upsert_server(
    State(state): State<Arc<DashboardState>>,
    Path(name): Path<String>,
    Json(entry): Json<ServerEntry>,
) -> Result<StatusCode, ApiError> {
    let mut config = state.config.lock().await;
    let created = !config.file.servers.contains(&name);
    config.file.servers.insert(name.clone(), entry);
    config.save().await.map_err(internal)?;
    tracing::info!(server = %name, created, "server updated via dashboard");
    Ok(if created {
        StatusCode::CREATED
    } else {
        StatusCode::NO_CONTENT
    })
}

async fn delete_server(
    State(state): State<Arc<DashboardState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let mut config = state.config.lock().await;
    if config.file.servers.remove(&name).is_none() {
        return Err((StatusCode::NOT_FOUND, format!("no server named '{name}'")));
    }
    config.save().await.map_err(internal)?;
    tracing::info!(server = %name, "server removed via dashboard");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct EnvValueBody {
    value: String,
}

async fn set_server_env(
    State(state): State<Arc<DashboardState>>,
    Path((name, key)): Path<(String, String)>,
    Json(body): Json<EnvValueBody>,
) -> Result<StatusCode, ApiError> {
    let mut config = state.config.lock().await;
    {
        let Some(entry) = config.file.servers.get(&name) else {
            return Err((StatusCode::NOT_FOUND, format!("no server named '{name}'")));
        };
        let mut entry = entry.clone();
        entry.env.insert(key.clone(), body.value);
        config.file.servers.insert(name.clone(), entry);
    }
    config.save().await.map_err(internal)?;
    // The value itself is a secret; log the key only.
    tracing::info!(server = %name, key = %key, "server env updated via dashboard");
    Ok(StatusCode::NO_CONTENT)
}

/// Merge a partial settings object onto the current one; unknown keys ride
/// along via the flattened extras.
async fn update_settings(
    State(state): State<Arc<DashboardState>>,
    Json(patch): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let Value::Object(patch) = patch else {
        return Err((StatusCode::BAD_REQUEST, "expected a JSON object".into()));
    };

    let mut config = state.config.lock().await;
    let mut merged = serde_json::to_value(&config.file.settings).map_err(internal)?;
    if let Some(target) = merged.as_object_mut() {
        for (key, value) in patch {
            target.insert(key, value);
        }
    }
    config.file.settings = serde_json::from_value(merged)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid settings: {e}")))?;
    config.save().await.map_err(internal)?;
    tracing::info!("settings updated via dashboard");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ImportBody {
    path: String,
}

/// Host-style config file: `{ "mcpServers": { "<name>": { command, args, env } } }`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostConfigFile {
    #[serde(default)]
    mcp_servers: HashMap<String, ServerEntry>,
}

/// Merge servers from a host-format config file; existing names are skipped.
async fn import_servers(
    State(state): State<Arc<DashboardState>>,
    Json(body): Json<ImportBody>,
) -> Result<Json<Value>, ApiError> {
    let content = tokio::fs::read_to_string(&body.path)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("read {}: {e}", body.path)))?;
    let host: HostConfigFile = serde_json::from_str(&content)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("parse {}: {e}", body.path)))?;

    let mut config = state.config.lock().await;
    let mut imported = Vec::new();
    let mut skipped = Vec::new();
    for (name, entry) in host.mcp_servers {
        if config.file.servers.contains(&name) {
            skipped.push(name);
        } else {
            config.file.servers.insert(name.clone(), entry);
            imported.push(name);
        }
    }
    config.save().await.map_err(internal)?;
    tracing::info!(imported = imported.len(), skipped = skipped.len(), "import finished");
    Ok(Json(json!({ "imported": imported, "skipped": skipped })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;
    use tempfile::tempdir;

    fn state_with_config(dir: &tempfile::TempDir) -> Arc<DashboardState> {
        let config = Config {
            path: dir.path().join("config.json"),
            file: ConfigFile::default(),
        };
        Arc::new(DashboardState {
            config: tokio::sync::Mutex::new(config),
        })
    }

    #[tokio::test]
    async fn create_then_delete_server_persists() {
        let dir = tempdir().unwrap();
        let state = state_with_config(&dir);

        let body = CreateServerBody {
            name: "echo".to_string(),
            entry: ServerEntry::command("echo-mcp"),
        };
        create_server(State(state.clone()), Json(body)).await.unwrap();

        let written: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("config.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(written["servers"]["echo"]["command"], "echo-mcp");

        delete_server(State(state.clone()), Path("echo".to_string()))
            .await
            .unwrap();
        let written: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("config.json")).unwrap(),
        )
        .unwrap();
        assert!(written["servers"].get("echo").is_none());
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let dir = tempdir().unwrap();
        let state = state_with_config(&dir);

        let body = CreateServerBody {
            name: "echo".to_string(),
            entry: ServerEntry::command("echo-mcp"),
        };
        create_server(State(state.clone()), Json(body)).await.unwrap();

        let body = CreateServerBody {
            name: "echo".to_string(),
            entry: ServerEntry::command("other"),
        };
        let err = create_server(State(state), Json(body)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn settings_patch_merges_known_and_unknown_keys() {
        let dir = tempdir().unwrap();
        let state = state_with_config(&dir);

        update_settings(
            State(state.clone()),
            Json(json!({ "idleTimeout": 42, "themeColor": "teal" })),
        )
        .await
        .unwrap();

        let config = state.config.lock().await;
        assert_eq!(config.settings().idle_timeout, 42);
        assert_eq!(config.settings().extra["themeColor"], "teal");
        // Untouched settings keep their defaults.
        assert_eq!(config.settings().startup_timeout, 30_000);
    }

    #[tokio::test]
    async fn import_skips_existing_names() {
        let dir = tempdir().unwrap();
        let state = state_with_config(&dir);

        let host_config = dir.path().join("host.json");
        std::fs::write(
            &host_config,
            r#"{"mcpServers":{
                "echo": {"command": "imported-echo"},
                "git": {"command": "git-mcp"}
            }}"#,
        )
        .unwrap();

        {
            let mut config = state.config.lock().await;
            config
                .file
                .servers
                .insert("echo".to_string(), ServerEntry::command("original-echo"));
        }

        let Json(result) = import_servers(
            State(state.clone()),
            Json(ImportBody {
                path: host_config.display().to_string(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(result["imported"], json!(["git"]));
        assert_eq!(result["skipped"], json!(["echo"]));
        let config = state.config.lock().await;
        assert_eq!(config.file.servers.get("echo").unwrap().command, "original-echo");
    }
}
