// ============================
// crates/backend-lib/src/config.rs
// ============================
//! Configuration management.
//!
//! Settings are layered: built-in defaults, then a TOML file, then
//! `MEETROOM_*` environment variables.
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// File read by [`Settings::load`] from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "meetroom.toml";

/// Prefix for environment overrides, e.g. `MEETROOM_BIND_ADDR`.
pub const ENV_PREFIX: &str = "MEETROOM_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Log level used when `RUST_LOG` is not set
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Whether rooms gate joiners behind a waiting room unless the creator says otherwise
    pub waiting_room_default: bool,
    /// scrypt cost parameter (log2 N) for room passwords
    pub password_hash_log_n: u8,
    /// How long an ended, empty room keeps rejecting joins
    pub ended_room_retention_secs: u64,
    /// Period of the tombstone / lockout sweeper
    pub cleanup_interval_secs: u64,
    /// Wrong passwords tolerated per client address before a lockout
    pub max_join_failures: u32,
    /// Lockout duration after too many wrong passwords
    pub join_lockout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            waiting_room_default: false,
            password_hash_log_n: 15,
            ended_room_retention_secs: 60 * 60,
            cleanup_interval_secs: 60,
            max_join_failures: 5,
            join_lockout_secs: 5 * 60,
        }
    }
}

impl Settings {
    /// Load from `meetroom.toml` (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from an explicit TOML file (if present) and the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            bail!("invalid log level {:?}", self.log_level);
        }
        if !(4..=20).contains(&self.password_hash_log_n) {
            bail!(
                "password_hash_log_n must be between 4 and 20, got {}",
                self.password_hash_log_n
            );
        }
        if self.cleanup_interval_secs == 0 {
            bail!("cleanup_interval_secs must be positive");
        }
        if self.max_join_failures == 0 {
            bail!("max_join_failures must be positive");
        }
        Ok(())
    }

    pub fn ended_room_retention(&self) -> Duration {
        Duration::from_secs(self.ended_room_retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn join_lockout(&self) -> Duration {
        Duration::from_secs(self.join_lockout_secs)
    }
}
