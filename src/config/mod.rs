//! Configuration
//!
//! Runtime settings come from the environment; everything else is a
//! compile-time tunable. The token-signing secret is mandatory — the
//! process refuses to start without it.

use std::net::SocketAddr;
use std::time::Duration;

/// How long a correlated request may wait for its response.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// Snapshot cache TTLs. Device info is effectively static; the rest decay
// on the cadence the host republishes them.
pub const DEVICE_INFO_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const STORAGE_TTL: Duration = Duration::from_secs(5 * 60);
pub const BATTERY_TTL: Duration = Duration::from_secs(30);
pub const DOWNLOADS_TTL: Duration = Duration::from_secs(10);

/// Cadence of the host-directed `status_update` ping.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// Outbound queue depth per client; sends beyond this are dropped.
pub const EGRESS_BUFFER: usize = 64;

/// Maximum inbound frame size.
pub const MAX_FRAME_BYTES: usize = 512 * 1024;

/// A session with no inbound traffic for this long is considered dead.
pub const READ_IDLE: Duration = Duration::from_secs(60);

/// Upper bound on a single transport write.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Keepalive ping cadence; must stay inside the read-idle window.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(54);

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("WRISTLINK_JWT_SECRET is not set; refusing to start without a token secret")]
    MissingSecret,
    #[error("invalid WRISTLINK_BIND address '{value}': {source}")]
    InvalidBind {
        value: String,
        source: std::net::AddrParseError,
    },
}

/// Environment-derived settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind: SocketAddr,
    pub jwt_secret: String,
}

impl Settings {
    /// Resolve settings from `WRISTLINK_JWT_SECRET` and `WRISTLINK_BIND`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = std::env::var("WRISTLINK_JWT_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingSecret)?;

        let raw = std::env::var("WRISTLINK_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
        let bind = raw.parse().map_err(|source| ConfigError::InvalidBind {
            value: raw.clone(),
            source,
        })?;

        Ok(Self { bind, jwt_secret })
    }
}
