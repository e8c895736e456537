//! Configuration: the persistent config file, effective settings, env overrides.
//!
//! A single JSON document is authoritative:
//! `{ "settings": {...}, "servers": { "<name>": {...} } }`. Server declaration
//! order is significant (it drives tool-name collision resolution) and is
//! preserved across load/save, as are unknown keys at every level.

use crate::error::{ProxyError, Result};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_MODE: &str = "MCP_ON_DEMAND_MODE";
pub const ENV_PRELOAD: &str = "MCP_ON_DEMAND_PRELOAD";
pub const ENV_DEBUG: &str = "MCP_ON_DEMAND_DEBUG";

pub const CONFIG_DIR_NAME: &str = "mcp-on-demand";
pub const CONFIG_FILE_NAME: &str = "config.json";

const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SSE_PORT: u16 = 24680;
const DEFAULT_SSE_SESSION_TIMEOUT_SECS: u64 = 300;

// ============================================================================
// Settings
// ============================================================================

/// Tool exposure strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    #[default]
    Passthrough,
    ToolSearch,
}

/// Which servers to warm after the host-facing transport is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PreloadPolicy {
    #[default]
    None,
    All,
    List(Vec<String>),
}

impl Serialize for PreloadPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            PreloadPolicy::None => serializer.serialize_str("none"),
            PreloadPolicy::All => serializer.serialize_str("all"),
            PreloadPolicy::List(names) => names.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for PreloadPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Word(String),
            List(Vec<String>),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Word(w) => match w.trim().to_ascii_lowercase().as_str() {
                "none" => Ok(PreloadPolicy::None),
                "all" => Ok(PreloadPolicy::All),
                other => Err(serde::de::Error::custom(format!(
                    "expected \"all\", \"none\", or a list of server names, got \"{other}\""
                ))),
            },
            Repr::List(names) => Ok(PreloadPolicy::List(names)),
        }
    }
}

/// Global tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Idle window (seconds) after which a running child is reaped.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Handshake deadline for a starting child (milliseconds).
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: u64,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub preload: PreloadPolicy,
    /// Rewrite exposed tool names as `<server>__<tool>`.
    #[serde(default)]
    pub prefix_tools: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Per-request deadline toward upstream children (seconds).
    #[serde(default = "default_call_timeout")]
    pub call_timeout: u64,
    #[serde(default = "default_sse_port")]
    pub sse_port: u16,
    /// Idle window (seconds) before an SSE session is reaped.
    #[serde(default = "default_sse_session_timeout")]
    pub sse_session_timeout: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}
fn default_startup_timeout() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_MS
}
fn default_call_timeout() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}
fn default_sse_port() -> u16 {
    DEFAULT_SSE_PORT
}
fn default_sse_session_timeout() -> u64 {
    DEFAULT_SSE_SESSION_TIMEOUT_SECS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT_MS,
            mode: Mode::default(),
            preload: PreloadPolicy::default(),
            prefix_tools: false,
            cache_dir: None,
            log_level: None,
            call_timeout: DEFAULT_CALL_TIMEOUT_SECS,
            sse_port: DEFAULT_SSE_PORT,
            sse_session_timeout: DEFAULT_SSE_SESSION_TIMEOUT_SECS,
            extra: serde_json::Map::new(),
        }
    }
}

impl Settings {
    pub fn idle_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn startup_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.startup_timeout)
    }

    pub fn call_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.call_timeout)
    }

    pub fn sse_session_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.sse_session_timeout)
    }
}

// ============================================================================
// Servers
// ============================================================================

/// User-declared configuration for one upstream server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Merged over the proxy's inherited environment; these values win.
    /// Treated as secrets: they never appear in logs or error messages.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub preload: bool,
    /// Per-server override of the global idle timeout (seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<u64>,
    /// Persistent servers are never idle-reaped.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub persistent: bool,
    /// Sometimes present in imported host configs; not enforced here. Entries
    /// carrying it are treated as enabled and a warning is emitted on load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ServerEntry {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }
}

/// Server map preserving declaration order. A plain `HashMap` would lose the
/// order the collision policy depends on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerMap(Vec<(String, ServerEntry)>);

impl ServerMap {
    pub fn get(&self, name: &str) -> Option<&ServerEntry> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, e)| e)
    }

    /// Insert or replace; a replaced entry keeps its original position.
    pub fn insert(&mut self, name: String, entry: ServerEntry) {
        if let Some(slot) = self.0.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = entry;
        } else {
            self.0.push((name, entry));
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<ServerEntry> {
        let idx = self.0.iter().position(|(n, _)| n == name)?;
        Some(self.0.remove(idx).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ServerEntry)> {
        self.0.iter().map(|(n, e)| (n, e))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, ServerEntry)> for ServerMap {
    fn from_iter<T: IntoIterator<Item = (String, ServerEntry)>>(iter: T) -> Self {
        let mut map = Self::default();
        for (name, entry) in iter {
            map.insert(name, entry);
        }
        map
    }
}

impl Serialize for ServerMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, entry) in &self.0 {
            map.serialize_entry(name, entry)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ServerMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct MapVisitor;

        impl<'de> Visitor<'de> for MapVisitor {
            type Value = ServerMap;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map of server name to server entry")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, entry)) = access.next_entry::<String, ServerEntry>()? {
                    entries.push((name, entry));
                }
                Ok(ServerMap(entries))
            }
        }

        deserializer.deserialize_map(MapVisitor)
    }
}

// ============================================================================
// Config file
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub servers: ServerMap,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Loaded configuration plus the path it came from.
#[derive(Debug, Clone)]
pub struct Config {
    pub path: PathBuf,
    pub file: ConfigFile,
}

impl Config {
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir()
            .ok_or_else(|| ProxyError::Config("could not determine the user config directory".to_string()))?;
        Ok(base.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load the config file, creating a defaulted one when missing. A corrupt
    /// file is reported and replaced in memory (not on disk) by defaults.
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(p) => p,
            None => Self::default_path()?,
        };

        let file = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<ConfigFile>(&content) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "config file is not valid; continuing with defaults"
                    );
                    ConfigFile::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let file = ConfigFile::default();
                write_json_atomic(&path, &file)
                    .await
                    .map_err(|e| ProxyError::Config(format!("create {}: {e}", path.display())))?;
                tracing::info!(path = %path.display(), "created default config file");
                file
            }
            Err(e) => {
                return Err(ProxyError::Config(format!("read {}: {e}", path.display())));
            }
        };

        let mut config = Self { path, file };
        config.apply_env_overrides();
        config.warn_on_disabled_entries();
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.file)
            .await
            .map_err(|e| ProxyError::Config(format!("write {}: {e}", self.path.display())))
    }

    pub fn settings(&self) -> &Settings {
        &self.file.settings
    }

    /// Cache file path: `settings.cacheDir` or the config file's directory.
    pub fn cache_file(&self) -> PathBuf {
        let dir = match &self.file.settings.cache_dir {
            Some(dir) => dir.clone(),
            None => self
                .path
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
        };
        dir.join(crate::cache::CACHE_FILE_NAME)
    }

    /// CLI flag beats `MCP_ON_DEMAND_DEBUG`, which beats `settings.logLevel`.
    pub fn effective_log_level(&self, cli: Option<&str>) -> String {
        if let Some(level) = cli {
            return level.to_string();
        }
        if env_flag(ENV_DEBUG) {
            return "debug".to_string();
        }
        self.file
            .settings
            .log_level
            .clone()
            .unwrap_or_else(|| "info".to_string())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(ENV_MODE) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "discover" | "tool-search" => self.file.settings.mode = Mode::ToolSearch,
                "passthrough" => self.file.settings.mode = Mode::Passthrough,
                other => {
                    tracing::warn!(value = %other, "unrecognized {ENV_MODE}; keeping configured mode");
                }
            }
        }
        if let Ok(raw) = std::env::var(ENV_PRELOAD) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "all" => self.file.settings.preload = PreloadPolicy::All,
                "none" => self.file.settings.preload = PreloadPolicy::None,
                other => {
                    tracing::warn!(value = %other, "unrecognized {ENV_PRELOAD}; keeping configured preload");
                }
            }
        }
    }

    fn warn_on_disabled_entries(&self) {
        for (name, entry) in self.file.servers.iter() {
            if entry.disabled == Some(true) {
                tracing::warn!(
                    server = %name,
                    "'disabled' is not enforced; treating server as enabled (delete the entry to remove it)"
                );
            }
        }
    }
}

/// Truthy env flag: `1`, `true`, `yes`, `on` (case-insensitive).
pub fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Expand `${VAR}` occurrences using the process environment. A missing
/// variable is an error so misconfigured secrets fail loudly at spawn time.
pub fn expand_env_string(s: &str) -> Result<String> {
    let mut result = s.to_string();
    let mut search_from = 0usize;

    while let Some(offset) = result[search_from..].find("${") {
        let start = search_from + offset;
        let Some(end) = result[start..].find('}') else {
            break;
        };
        let name = &result[start + 2..start + end];
        let value = std::env::var(name).map_err(|_| {
            ProxyError::Config(format!("environment variable '{name}' is not set"))
        })?;
        result = format!("{}{}{}", &result[..start], value, &result[start + end + 1..]);
        search_from = start + value.len();
    }

    Ok(result)
}

/// Write a JSON document via a sibling temp file and an atomic rename, so
/// concurrent readers see either the old document or the new one.
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(format!(".{}.tmp", std::process::id()));
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await
}
