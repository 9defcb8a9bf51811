use crate::{env_or_default, env_parse, ConfigError, FromEnv};
use std::net::Ipv4Addr;

/// Bind address for the health and admin HTTP server
#[derive(Clone, Debug)]
pub struct HealthServerConfig {
    pub host: String,
    pub port: u16,
}

impl HealthServerConfig {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromEnv for HealthServerConfig {
    /// Reads from environment variables with sensible defaults:
    /// - MQ_HEALTH_HOST: defaults to 0.0.0.0 (all interfaces)
    /// - MQ_HEALTH_PORT, then HEALTH_PORT: defaults to 8082
    fn from_env() -> Result<Self, ConfigError> {
        let host = env_or_default("MQ_HEALTH_HOST", &Ipv4Addr::UNSPECIFIED.to_string());
        let port = match std::env::var("MQ_HEALTH_PORT") {
            Ok(_) => env_parse("MQ_HEALTH_PORT", 8082u16)?,
            Err(_) => env_parse("HEALTH_PORT", 8082u16)?,
        };

        Ok(Self { host, port })
    }
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED.to_string(),
            port: 8082,
        }
    }
}
