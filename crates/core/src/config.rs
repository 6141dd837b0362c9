use rand::Rng;
use std::{str::FromStr, time::Duration};

pub const DEFAULT_BASE_URL: &str = "https://play.charisma.ai";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Bounds and pacing of the reconnection loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound of the random delay added to every attempt.
    pub max_jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            base_delay: Duration::from_secs(5),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait before the next attempt: the base delay plus jitter.
    pub fn next_delay(&self) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.base_delay + Duration::from_millis(jitter)
    }
}

/// Client configuration, threaded explicitly into sessions and collaborators.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// HTTP endpoint of the backend (history lookups).
    pub base_url: String,
    /// WebSocket endpoint rooms are opened against.
    pub realtime_url: String,
    pub reconnect: ReconnectPolicy,
    /// Maximum number of events fetched by a single catch-up replay.
    pub replay_limit: usize,
    /// Capacity of each subscriber broadcast channel.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }
}

impl ClientConfig {
    /// Builds a default configuration pointing at `base_url`. The realtime URL
    /// is derived by swapping the scheme (`https` to `wss`, `http` to `ws`).
    pub fn with_base_url(base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            realtime_url: realtime_url_for(&base_url),
            base_url,
            reconnect: ReconnectPolicy::default(),
            replay_limit: 1000,
            event_capacity: 256,
        }
    }

    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let base_url =
            std::env::var("PARLEY_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "PARLEY_BASE_URL".to_string(),
                format!("'{}' is not an http(s) URL", base_url),
            ));
        }
        let mut config = Self::with_base_url(&base_url);

        if let Ok(realtime_url) = std::env::var("PARLEY_REALTIME_URL") {
            config.realtime_url = realtime_url.trim_end_matches('/').to_string();
        }

        let defaults = ReconnectPolicy::default();
        config.reconnect = ReconnectPolicy {
            max_attempts: parse_var("PARLEY_RECONNECT_ATTEMPTS", defaults.max_attempts)?,
            base_delay: Duration::from_millis(parse_var(
                "PARLEY_RECONNECT_DELAY_MS",
                defaults.base_delay.as_millis() as u64,
            )?),
            max_jitter: Duration::from_millis(parse_var(
                "PARLEY_RECONNECT_JITTER_MS",
                defaults.max_jitter.as_millis() as u64,
            )?),
        };
        config.replay_limit = parse_var("PARLEY_REPLAY_LIMIT", config.replay_limit)?;
        config.event_capacity = parse_var("PARLEY_EVENT_CAPACITY", config.event_capacity)?;
        if config.event_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "PARLEY_EVENT_CAPACITY".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        Ok(config)
    }
}

fn realtime_url_for(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}
