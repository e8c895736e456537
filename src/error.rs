//! Error types shared across the proxy.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Unreadable or unwritable schema cache. Read failures downgrade to a cache miss.
    #[error("cache error: {0}")]
    Cache(String),

    /// Child process failed to spawn or to complete the initialize handshake.
    #[error("startup error for server '{server}': {message}")]
    Startup { server: String, message: String },

    /// JSON-RPC error response (or a timed-out request) from an upstream child.
    #[error("upstream error from server '{server}': {message}{}", code_suffix(.code))]
    Upstream {
        server: String,
        code: Option<i64>,
        message: String,
    },

    /// The stdio channel to a child closed underneath us.
    #[error("transport error: {0}")]
    Transport(String),

    /// Tool name absent from the routing table.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Malformed tool arguments.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}

fn code_suffix(code: &Option<i64>) -> String {
    code.map(|c| format!(" (code {c})")).unwrap_or_default()
}

impl ProxyError {
    pub fn startup(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Startup {
            server: server.into(),
            message: message.into(),
        }
    }

    pub fn upstream(server: impl Into<String>, code: Option<i64>, message: impl Into<String>) -> Self {
        Self::Upstream {
            server: server.into(),
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_display_carries_the_json_rpc_code() {
        let err = ProxyError::upstream("git", Some(-32602), "invalid params");
        assert_eq!(
            err.to_string(),
            "upstream error from server 'git': invalid params (code -32602)"
        );

        let err = ProxyError::upstream("git", None, "'tools/call' timed out after 5000ms");
        assert_eq!(
            err.to_string(),
            "upstream error from server 'git': 'tools/call' timed out after 5000ms"
        );
    }
}
