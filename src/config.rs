//! Session configuration
//!
//! The embedding application supplies the agent endpoint and the target
//! service; everything else has defaults matching the agent backend's
//! expectations.

use crate::vad::{VadConfig, VadSensitivity};
use std::time::Duration;

/// Greeting prompt sent with the `start` control message.
pub const DEFAULT_GREETING: &str = "Hi, this is your agent. How can I help you today?";

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Configuration for one voice session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint of the voice agent
    pub ws_url: String,

    /// Target service identifier sent in the `start` message
    pub service: String,

    /// Greeting prompt sent in the `start` message
    pub greeting: String,

    /// Silence after a `speechEnd` edge before the user turn is closed
    pub silence_timeout: Duration,

    /// Delay before the single reconnect attempt after an unexpected close
    pub reconnect_delay: Duration,

    /// Grace period between `cleanup` and closing the socket
    pub close_grace: Duration,

    /// How long VAD stays disabled after an interruption
    pub interrupt_debounce: Duration,

    /// Time slice of each recorded chunk
    pub chunk_interval: Duration,

    /// VAD debouncing and sensitivity
    pub vad: VadConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            service: String::new(),
            greeting: DEFAULT_GREETING.to_string(),
            silence_timeout: Duration::from_millis(2000),
            reconnect_delay: Duration::from_secs(1),
            close_grace: Duration::from_millis(200),
            interrupt_debounce: Duration::from_millis(100),
            chunk_interval: Duration::from_millis(200),
            vad: VadConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Create a configuration for the given endpoint and service with defaults
    /// for everything else.
    pub fn new(ws_url: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            service: service.into(),
            ..Default::default()
        }
    }

    /// Load the configuration from `VOICE_AGENT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let ws_url = lookup("VOICE_AGENT_WS_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("VOICE_AGENT_WS_URL"))?;
        if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                key: "VOICE_AGENT_WS_URL",
                value: ws_url,
            });
        }

        let service = lookup("VOICE_AGENT_SERVICE")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("VOICE_AGENT_SERVICE"))?;

        let mut config = Self::new(ws_url, service);

        if let Some(greeting) = lookup("VOICE_AGENT_GREETING") {
            config.greeting = greeting;
        }

        if let Some(raw) = lookup("VOICE_AGENT_SILENCE_MS") {
            let ms = raw.trim().parse::<u64>().map_err(|_| ConfigError::Invalid {
                key: "VOICE_AGENT_SILENCE_MS",
                value: raw.clone(),
            })?;
            config.silence_timeout = Duration::from_millis(ms);
        }

        if let Some(raw) = lookup("VOICE_AGENT_VAD_MODE") {
            config.vad.sensitivity =
                VadSensitivity::parse(&raw).ok_or(ConfigError::Invalid {
                    key: "VOICE_AGENT_VAD_MODE",
                    value: raw.clone(),
                })?;
        }

        Ok(config)
    }
}
