use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::media::MediaConstraints;

const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Upper bound on automatic ICE restarts per connectivity episode.
pub const MAX_ICE_RESTARTS_LIMIT: u32 = 2;

/// One STUN/TURN entry handed to the peer transport.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    pub fn turn(urls: Vec<String>, username: String, credential: String) -> Self {
        Self {
            urls,
            username,
            credential,
        }
    }
}

/// Timing and transport settings for one call controller.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long a negotiation may run without connectivity before an ICE restart
    pub connect_timeout: Duration,
    /// Automatic ICE restarts before the call fails; refilled when the call goes active
    pub max_ice_restarts: u32,
    /// How long an incoming call rings before it is treated as missed
    pub ring_timeout: Duration,
    pub ice_servers: Vec<IceServerConfig>,
    pub media: MediaConstraints,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            max_ice_restarts: 1,
            ring_timeout: Duration::from_secs(60),
            ice_servers: DEFAULT_STUN_URLS
                .iter()
                .map(|url| IceServerConfig::stun(*url))
                .collect(),
            media: MediaConstraints::default(),
        }
    }
}

impl CallConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let connect_timeout = env::var("BEACH_CALL_CONNECT_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.connect_timeout);
        let max_ice_restarts = env::var("BEACH_CALL_MAX_ICE_RESTARTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .map_or(defaults.max_ice_restarts, |n| n.min(MAX_ICE_RESTARTS_LIMIT));
        let ring_timeout = env::var("BEACH_CALL_RING_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.ring_timeout);

        let ice_servers = if env::var("BEACH_LOCALHOST_ONLY").is_ok() {
            vec![]
        } else if let Some(servers) = env::var("BEACH_CALL_ICE_SERVERS")
            .ok()
            .and_then(|raw| parse_ice_servers(&raw))
        {
            servers
        } else {
            let mut servers: Vec<IceServerConfig> = match env::var("BEACH_CALL_STUN_URLS") {
                Ok(urls) => split_urls(&urls)
                    .into_iter()
                    .map(IceServerConfig::stun)
                    .collect(),
                Err(_) => defaults.ice_servers,
            };
            if let Ok(urls) = env::var("BEACH_CALL_TURN_URLS") {
                let urls = split_urls(&urls);
                if !urls.is_empty() {
                    servers.push(IceServerConfig::turn(
                        urls,
                        env::var("BEACH_CALL_TURN_USERNAME").unwrap_or_default(),
                        env::var("BEACH_CALL_TURN_CREDENTIAL").unwrap_or_default(),
                    ));
                }
            }
            servers
        };

        Self {
            connect_timeout,
            max_ice_restarts,
            ring_timeout,
            ice_servers,
            media: defaults.media,
        }
    }

    /// No STUN/TURN; host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            ..Default::default()
        }
    }

    pub fn builder() -> CallConfigBuilder {
        CallConfigBuilder::default()
    }
}

/// Parses a JSON array of `{"urls": [...], "username": ..., "credential": ...}`.
/// Invalid input is logged and ignored.
fn parse_ice_servers(raw: &str) -> Option<Vec<IceServerConfig>> {
    match serde_json::from_str::<Vec<IceServerConfig>>(raw) {
        Ok(servers) => Some(servers),
        Err(err) => {
            tracing::warn!(error = %err, "ignoring invalid BEACH_CALL_ICE_SERVERS");
            None
        }
    }
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Default)]
pub struct CallConfigBuilder {
    connect_timeout: Option<Duration>,
    max_ice_restarts: Option<u32>,
    ring_timeout: Option<Duration>,
    ice_servers: Vec<IceServerConfig>,
    media: Option<MediaConstraints>,
}

impl CallConfigBuilder {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn max_ice_restarts(mut self, restarts: u32) -> Self {
        self.max_ice_restarts = Some(restarts);
        self
    }

    pub fn ring_timeout(mut self, timeout: Duration) -> Self {
        self.ring_timeout = Some(timeout);
        self
    }

    pub fn add_ice_server(mut self, server: IceServerConfig) -> Self {
        self.ice_servers.push(server);
        self
    }

    pub fn media(mut self, media: MediaConstraints) -> Self {
        self.media = Some(media);
        self
    }

    pub fn build(self) -> CallConfig {
        let mut config = CallConfig::default();
        if let Some(timeout) = self.connect_timeout {
            config.connect_timeout = timeout;
        }
        if let Some(restarts) = self.max_ice_restarts {
            config.max_ice_restarts = restarts.min(MAX_ICE_RESTARTS_LIMIT);
        }
        if let Some(timeout) = self.ring_timeout {
            config.ring_timeout = timeout;
        }
        if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers;
        }
        if let Some(media) = self.media {
            config.media = media;
        }
        config
    }
}

/// Relay client settings.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub heartbeat_interval: Duration,
    pub join_timeout: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
        }
    }
}
