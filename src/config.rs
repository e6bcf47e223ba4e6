use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Configuration for a cache-aside [`Client`](crate::Client).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub redis: RedisConfig,
    /// TTL in milliseconds for this client's liveness marker, refreshed
    /// every half TTL. The marker is how other clients learn whether the
    /// holder of a population lock is still alive.
    #[serde(default = "default_client_ttl_ms")]
    pub client_ttl_ms: u64,
}

fn default_client_ttl_ms() -> u64 {
    10_000
}

/// Connection settings for the Redis-compatible store.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Connection string (e.g. `rediss://cache.local:6380`).
    pub endpoint: String,
    /// Enable TLS for the connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the auth token.
    #[serde(default = "default_auth_token_env")]
    pub auth_token_env: String,
}

fn default_auth_token_env() -> String {
    "REDIS_AUTH_TOKEN".to_string()
}

impl Config {
    /// Load and validate a [`Config`] from a YAML file at `path`.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Basic sanity checks that cannot be expressed purely with serde.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.redis.endpoint.is_empty(),
            "redis.endpoint must not be empty"
        );
        anyhow::ensure!(self.client_ttl_ms > 0, "client_ttl_ms must be > 0");
        Ok(())
    }

    pub fn client_ttl(&self) -> Duration {
        Duration::from_millis(self.client_ttl_ms)
    }
}
