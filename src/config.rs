//! Runtime configuration.
//!
//! Values come from the `serve` subcommand (see `main.rs`), each of which
//! can also be set through a `DUPLEX_CHESS_*` environment variable.

use std::time::Duration;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;
/// How long a game may sit with both players absent before it is dropped.
pub const DEFAULT_IDLE_EXPIRY_SECS: u64 = 300;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;

/// Settings the session layer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub idle_expiry: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_expiry: Duration::from_secs(DEFAULT_IDLE_EXPIRY_SECS),
        }
    }
}

/// Full server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub session: SessionConfig,
    /// Period of the idle-game sweep.
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            session: SessionConfig::default(),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}
