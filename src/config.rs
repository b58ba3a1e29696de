//! Environment-driven configuration.
//!
//! The hashing secret and database path are required at startup; the
//! Lemon Squeezy settings may be absent, in which case checkout-link
//! creation fails at first use with a configuration error.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::error::RpcCode;

pub const ENV_HASH_SECRET: &str = "METERGATE_HASH_SECRET";
pub const ENV_DATABASE_PATH: &str = "METERGATE_DB";
pub const ENV_LISTEN: &str = "METERGATE_LISTEN";
pub const ENV_LEMON_SQUEEZY_API_KEY: &str = "LEMON_SQUEEZY_API_KEY";
pub const ENV_LEMON_SQUEEZY_STORE_ID: &str = "LEMON_SQUEEZY_STORE_ID";
pub const ENV_LEMON_SQUEEZY_VARIANT_ID: &str = "LEMON_SQUEEZY_VARIANT_ID";

const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{ENV_HASH_SECRET} is not set")]
    MissingHashSecret,
    #[error("hashing secret is unusable: {0}")]
    InvalidHashSecret(String),
    #[error("{ENV_DATABASE_PATH} is not set")]
    MissingDatabasePath,
    #[error("invalid listen address {value}: {reason}")]
    InvalidListenAddr { value: String, reason: String },
}

impl ConfigError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigError::MissingHashSecret => "MISSING_HASH_SECRET",
            ConfigError::InvalidHashSecret(_) => "INVALID_HASH_SECRET",
            ConfigError::MissingDatabasePath => "MISSING_DATABASE_PATH",
            ConfigError::InvalidListenAddr { .. } => "INVALID_LISTEN_ADDR",
        }
    }

    pub fn code(&self) -> RpcCode {
        RpcCode::Internal
    }
}

#[derive(Clone)]
pub struct Config {
    pub hash_secret: String,
    pub database_path: PathBuf,
    pub listen: SocketAddr,
    pub lemon_squeezy: LemonSqueezyConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("hash_secret", &"<redacted>")
            .field("database_path", &self.database_path)
            .field("listen", &self.listen)
            .field("lemon_squeezy", &self.lemon_squeezy)
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct LemonSqueezyConfig {
    pub api_key: Option<String>,
    pub store_id: Option<String>,
    pub variant_id: Option<String>,
}

impl std::fmt::Debug for LemonSqueezyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LemonSqueezyConfig")
            .field("api_key", &self.api_key.as_deref().map(|_| "<redacted>"))
            .field("store_id", &self.store_id)
            .field("variant_id", &self.variant_id)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let hash_secret = require_env(ENV_HASH_SECRET).ok_or(ConfigError::MissingHashSecret)?;
        let database_path =
            require_env(ENV_DATABASE_PATH).ok_or(ConfigError::MissingDatabasePath)?;
        let listen_raw = require_env(ENV_LISTEN).unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen = listen_raw
            .parse()
            .map_err(|err: std::net::AddrParseError| ConfigError::InvalidListenAddr {
                value: listen_raw.clone(),
                reason: err.to_string(),
            })?;

        Ok(Self {
            hash_secret,
            database_path: PathBuf::from(database_path),
            listen,
            lemon_squeezy: LemonSqueezyConfig {
                api_key: require_env(ENV_LEMON_SQUEEZY_API_KEY),
                store_id: require_env(ENV_LEMON_SQUEEZY_STORE_ID),
                variant_id: require_env(ENV_LEMON_SQUEEZY_VARIANT_ID),
            },
        })
    }
}

fn require_env(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}
