//! Server configuration.

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Server configuration, with the same knobs available from the
/// environment via [`ServerOptions::from_env`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Label used in the startup banner only.
    pub name: Option<String>,
    /// Listener bind host (default: 0.0.0.0).
    pub address: String,
    /// Listener bind port (default: 3030).
    pub port: u16,
    /// Pre-attach idle close deadline; also the keep-alive ping interval
    /// (default: 30s).
    pub timeout: Duration,
    /// Persistence debounce interval (default: 2s).
    pub debounce: Duration,
    /// Maximum persistence stall under continuous updates (default: 10s).
    pub max_debounce: Duration,
    /// Suppress the startup banner.
    pub quiet: bool,
    /// Disable garbage collection on hosted documents, passed through to
    /// the document constructor.
    pub skip_gc: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            name: None,
            address: "0.0.0.0".to_string(),
            port: 3030,
            timeout: Duration::from_millis(30_000),
            debounce: Duration::from_millis(2_000),
            max_debounce: Duration::from_millis(10_000),
            quiet: false,
            skip_gc: false,
        }
    }
}

impl ServerOptions {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let name = env::var("CHORUS_NAME").ok().filter(|n| !n.is_empty());
        let address = env::var("HOST").unwrap_or(defaults.address);
        let port = match env::var("PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidPort(raw))?,
            Err(_) => defaults.port,
        };

        Ok(Self {
            name,
            address,
            port,
            timeout: duration_from_env("CHORUS_TIMEOUT_MS", defaults.timeout)?,
            debounce: duration_from_env("CHORUS_DEBOUNCE_MS", defaults.debounce)?,
            max_debounce: duration_from_env("CHORUS_MAX_DEBOUNCE_MS", defaults.max_debounce)?,
            quiet: env::var_os("CHORUS_QUIET").is_some(),
            skip_gc: env::var_os("CHORUS_SKIP_GC").is_some(),
        })
    }

    /// The bind address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Banner label.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("chorus")
    }
}

fn duration_from_env(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidDuration {
                key: key.to_string(),
                value: raw,
            }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid PORT value: {0}")]
    InvalidPort(String),
    #[error("invalid {key} value: {value} (expected milliseconds)")]
    InvalidDuration { key: String, value: String },
}
