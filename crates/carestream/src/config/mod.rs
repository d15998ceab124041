use serde::Deserialize;

/// Environment variable that overrides the configured upstream base URL.
///
/// Set when the backend lives somewhere other than the configured address,
/// and by tests that point the relay at a mock upstream.
pub const UPSTREAM_URL_ENV: &str = "CARESTREAM_UPSTREAM_URL";

/// Main configuration structure for Carestream
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream backend configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

impl Config {
    /// Apply environment variable overrides on top of the loaded config.
    pub fn apply_env_overrides(&mut self) {
        self.override_base_url(std::env::var(UPSTREAM_URL_ENV).ok().as_deref());
    }

    fn override_base_url(&mut self, value: Option<&str>) {
        if let Some(value) = value {
            if !value.trim().is_empty() {
                self.upstream.base_url = value.to_string();
            }
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:5080")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:5080".to_string()
}

/// Upstream backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the care-plan backend (the relay appends
    /// `/stream` and `/initiate-stream` to this)
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Connect timeout in seconds for upstream requests
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Upper bound on the bytes a single pending SSE event may accumulate
    /// before the relay gives up on the stream
    #[serde(default = "default_max_event_bytes")]
    pub max_event_bytes: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_event_bytes: default_max_event_bytes(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:5001/api/careplan".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_event_bytes() -> usize {
    1024 * 1024
}
