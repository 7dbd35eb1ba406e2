use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// How often the reaper looks for silent participants
    pub heartbeat_interval: Duration,
    /// Silence after which a registration is dropped
    pub heartbeat_timeout: Duration,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env::var("BEACH_RING_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            heartbeat_interval: env::var("BEACH_RING_HEARTBEAT_INTERVAL")
                .ok()
                .and_then(|v| parse_secs(&v))
                .unwrap_or(defaults.heartbeat_interval),
            heartbeat_timeout: env::var("BEACH_RING_HEARTBEAT_TIMEOUT")
                .ok()
                .and_then(|v| parse_secs(&v))
                .unwrap_or(defaults.heartbeat_timeout),
        }
    }
}

/// Whole seconds, zero excluded.
fn parse_secs(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|&secs| secs > 0)
        .map(Duration::from_secs)
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8090,
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(600), // 10 minutes
        }
    }
}
