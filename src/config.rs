use callcore::backoff::ReconnectConfig;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_WS_BASE_URL: &str = "ws://localhost:8000/ws";

pub const API_URL_ENV: &str = "MATCHCALL_API_URL";
pub const WS_URL_ENV: &str = "MATCHCALL_WS_URL";

/// Public STUN servers used when no others are configured.
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the matching HTTP API, without a trailing slash.
    pub api_base_url: String,
    /// Base URL of the WebSocket server; `/signaling/<id>/` is appended.
    pub ws_base_url: String,
    pub request_timeout: Duration,
    pub location_timeout: Duration,
    pub reconnect: ReconnectConfig,
    pub keepalive_interval: Duration,
    /// When set, a connection that goes this long without a `pong` is
    /// dropped and re-dialed. Off by default.
    pub pong_timeout: Option<Duration>,
    pub ice_servers: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            ws_base_url: DEFAULT_WS_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(10),
            location_timeout: Duration::from_secs(5),
            reconnect: ReconnectConfig::default(),
            keepalive_interval: Duration::from_secs(25),
            pong_timeout: None,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ClientConfig {
    /// Defaults, with the server URLs taken from `MATCHCALL_API_URL` and
    /// `MATCHCALL_WS_URL` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(url) = env_url(API_URL_ENV) {
            config.api_base_url = url;
        }
        if let Some(url) = env_url(WS_URL_ENV) {
            config.ws_base_url = url;
        }
        config
    }

    pub fn with_api_base_url(mut self, url: impl AsRef<str>) -> Self {
        self.api_base_url = normalize_base_url(url.as_ref());
        self
    }

    pub fn with_ws_base_url(mut self, url: impl AsRef<str>) -> Self {
        self.ws_base_url = normalize_base_url(url.as_ref());
        self
    }
}

fn env_url(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| normalize_base_url(&v))
        .filter(|v| !v.is_empty())
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
