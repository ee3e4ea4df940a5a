//! SFU service configuration.
//!
//! Configuration is loaded from environment variables. The media-engine
//! settings (port range, listen/announced address, log level) are handed
//! to the engine bootstrap without interpretation beyond validation.

use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default lower bound of the RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 40000;

/// Default upper bound of the RTC port range.
pub const DEFAULT_RTC_MAX_PORT: u16 = 49999;

/// Default address media transports listen on.
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// Default media engine log level.
pub const DEFAULT_ENGINE_LOG_LEVEL: &str = "warn";

/// Default maximum number of concurrent rooms.
pub const DEFAULT_MAX_ROOMS: usize = 1000;

/// Default maximum number of peers in one room.
pub const DEFAULT_MAX_PEERS_PER_ROOM: usize = 50;

/// Default instance ID prefix.
pub const DEFAULT_SFU_ID_PREFIX: &str = "sfu";

/// Log levels accepted by the media engine.
const ENGINE_LOG_LEVELS: [&str; 4] = ["debug", "warn", "error", "none"];

/// SFU service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this instance.
    pub sfu_id: String,

    /// WebSocket signaling bind address (default: "0.0.0.0:8080").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Lowest UDP port the media engine may allocate.
    pub rtc_min_port: u16,

    /// Highest UDP port the media engine may allocate.
    pub rtc_max_port: u16,

    /// Address media transports bind to.
    pub listen_ip: IpAddr,

    /// Public address advertised in ICE candidates (NAT/cloud deployments).
    pub announced_ip: Option<IpAddr>,

    /// Media engine log verbosity.
    pub engine_log_level: String,

    /// Maximum concurrent rooms on this instance.
    pub max_rooms: usize,

    /// Maximum peers per room.
    pub max_peers_per_room: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("SFU_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let rtc_min_port = parse_or_default(vars, "SFU_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_or_default(vars, "SFU_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_RTC_MIN_PORT ({rtc_min_port}) must not exceed SFU_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let listen_ip = vars
            .get("SFU_LISTEN_IP")
            .map_or(DEFAULT_LISTEN_IP, String::as_str)
            .parse::<IpAddr>()
            .map_err(|e| ConfigError::InvalidValue(format!("SFU_LISTEN_IP: {e}")))?;

        let announced_ip = vars
            .get("SFU_ANNOUNCED_IP")
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<IpAddr>())
            .transpose()
            .map_err(|e| ConfigError::InvalidValue(format!("SFU_ANNOUNCED_IP: {e}")))?;

        let engine_log_level = vars
            .get("SFU_ENGINE_LOG_LEVEL")
            .map_or(DEFAULT_ENGINE_LOG_LEVEL, String::as_str)
            .to_lowercase();
        if !ENGINE_LOG_LEVELS.contains(&engine_log_level.as_str()) {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_ENGINE_LOG_LEVEL must be one of {ENGINE_LOG_LEVELS:?}, got {engine_log_level}"
            )));
        }

        let max_rooms = parse_or_default(vars, "SFU_MAX_ROOMS", DEFAULT_MAX_ROOMS)?;
        let max_peers_per_room =
            parse_or_default(vars, "SFU_MAX_PEERS_PER_ROOM", DEFAULT_MAX_PEERS_PER_ROOM)?;

        let sfu_id = vars.get("SFU_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SFU_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            sfu_id,
            signaling_bind_address,
            health_bind_address,
            rtc_min_port,
            rtc_max_port,
            listen_ip,
            announced_ip,
            engine_log_level,
            max_rooms,
            max_peers_per_room,
        })
    }
}

/// Parse an optional variable, falling back to `default` when unset.
fn parse_or_default<T>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{key}: {e}"))),
        None => Ok(default),
    }
}
