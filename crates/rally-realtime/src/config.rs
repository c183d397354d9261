use std::time::Duration;

/// Realtime transport configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// WebSocket endpoint URL.
    pub url: String,
    /// Reconnect attempts after an unexpected close before giving up.
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl RealtimeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(3),
        }
    }

    /// Read configuration from the environment, with a localhost fallback.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let url = std::env::var("RALLY_REALTIME_URL")
            .unwrap_or_else(|_| "ws://localhost:8080/ws".into());
        Self::new(url)
    }
}
