//! RelayCast configuration
//!
//! All settings come from environment variables. `REDIS_URL` and `JWT_SECRET`
//! are required; everything else has a default suitable for development.

use std::time::Duration;

use crate::notify::NotificationChannel;

/// Default relay pub/sub channel shared by all pods
pub const DEFAULT_RELAY_CHANNEL: &str = "websocket:messages";

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Pod identifier written into presence entries (POD_NAME, default "dev")
    pub pod_name: String,
    /// Listen address for the WebSocket + REST server (BIND_ADDR)
    pub bind_addr: String,
    /// Redis connection string (REDIS_URL, required)
    pub redis_url: String,
    /// HMAC secret for verifying client tokens (JWT_SECRET, required)
    pub jwt_secret: String,
    /// Base URL of the external profile service (PROFILE_SERVICE_URL)
    pub profile_service_url: String,
    /// Pub/sub channel carrying cross-pod deliveries (RELAY_CHANNEL)
    pub relay_channel: String,
    /// Master switch for the whole offline flow (OFFLINE_MESSAGING_ENABLED)
    pub offline_messaging_enabled: bool,
    /// Store undelivered messages for later retrieval (OFFLINE_MESSAGE_STORAGE_ENABLED)
    pub offline_storage_enabled: bool,
    /// Publish offline push-notification events (OFFLINE_NOTIFICATIONS_ENABLED)
    pub offline_notifications_enabled: bool,
    /// Retention window for stored messages in days (OFFLINE_MESSAGE_TTL_DAYS, default 30)
    pub message_ttl_days: u64,
    /// Channel discriminator for offline notifications (OFFLINE_NOTIFICATION_CHANNEL, default SMS)
    pub notification_channel: NotificationChannel,
    /// Maximum inbound frame size in bytes (MAX_FRAME_BYTES, default 1 MiB)
    pub max_frame_bytes: usize,
    /// Interval of the presence refresh sweep in seconds (PRESENCE_SWEEP_SECS, default 1800)
    pub presence_sweep_secs: u64,
    /// Upper bound on any Redis round trip (REDIS_TIMEOUT_MS, default 3000)
    pub redis_timeout_ms: u64,
    /// Upper bound on a profile service call (PROFILE_TIMEOUT_MS, default 5000)
    pub profile_timeout_ms: u64,
}

impl Config {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let redis_url =
            std::env::var("REDIS_URL").map_err(|_| ConfigError::MissingEnv("REDIS_URL"))?;
        let jwt_secret =
            std::env::var("JWT_SECRET").map_err(|_| ConfigError::MissingEnv("JWT_SECRET"))?;

        let notification_channel = match std::env::var("OFFLINE_NOTIFICATION_CHANNEL") {
            Ok(raw) => raw.parse().map_err(|_| {
                ConfigError::InvalidEnv(
                    "OFFLINE_NOTIFICATION_CHANNEL",
                    "expected SMS, EMAIL or INAPP",
                )
            })?,
            Err(_) => NotificationChannel::Sms,
        };

        Ok(Self {
            pod_name: env_or("POD_NAME", "dev"),
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            redis_url,
            jwt_secret,
            profile_service_url: env_or("PROFILE_SERVICE_URL", "http://localhost:8081"),
            relay_channel: env_or("RELAY_CHANNEL", DEFAULT_RELAY_CHANNEL),
            offline_messaging_enabled: env_flag("OFFLINE_MESSAGING_ENABLED", true)?,
            offline_storage_enabled: env_flag("OFFLINE_MESSAGE_STORAGE_ENABLED", true)?,
            offline_notifications_enabled: env_flag("OFFLINE_NOTIFICATIONS_ENABLED", true)?,
            message_ttl_days: env_parse("OFFLINE_MESSAGE_TTL_DAYS", 30)?,
            notification_channel,
            max_frame_bytes: env_parse("MAX_FRAME_BYTES", 1_048_576)?,
            presence_sweep_secs: env_parse("PRESENCE_SWEEP_SECS", 1800)?,
            redis_timeout_ms: env_parse("REDIS_TIMEOUT_MS", 3000)?,
            profile_timeout_ms: env_parse("PROFILE_TIMEOUT_MS", 5000)?,
        })
    }

    /// Retention window for the undelivered store
    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_days * 24 * 60 * 60)
    }

    /// Bound on Redis round trips
    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_timeout_ms)
    }

    /// Bound on profile service calls
    pub fn profile_timeout(&self) -> Duration {
        Duration::from_millis(self.profile_timeout_ms)
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_flag(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidEnv(name, "expected a boolean")),
        },
        Err(_) => Ok(default),
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv(name, "expected a number")),
        Err(_) => Ok(default),
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnv(&'static str),
    #[error("invalid environment variable {0}: {1}")]
    InvalidEnv(&'static str, &'static str),
}
