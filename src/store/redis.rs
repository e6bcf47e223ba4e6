//! fred-backed [`Store`] over a RESP3 connection with server-assisted
//! client-side caching.
//!
//! Uses a single multiplexed `Client` rather than a pool: CLIENT TRACKING
//! state lives on the connection, so every cached read must flow over the
//! same connection that receives the invalidation pushes. Reconnects
//! surface as connection-level invalidations and re-arm tracking, because
//! the server forgets the tracking table with the old connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fred::clients::Client;
use fred::interfaces::{ClientLike, EventInterface, KeysInterface, TrackingInterface};
use fred::types::config::{Config as FredConfig, ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::scripts::Script;
use fred::types::{Builder, Expiration, RespVersion, SetOptions, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::cache::LocalCache;
use super::{Invalidation, InvalidationStream, Store, StoreError};
use crate::config::RedisConfig;
use crate::scripts;

/// A RESP3 store connection with client tracking enabled.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    cache: Arc<LocalCache>,
    publish_script: Script,
    release_script: Script,
}

impl RedisStore {
    /// Connect, enable client tracking, and spawn the invalidation pump.
    ///
    /// The auth token is read from the environment variable named in
    /// `config.auth_token_env`. Reconnects use exponential backoff
    /// (100 ms base, 30 s cap).
    pub async fn connect(
        config: &RedisConfig,
    ) -> Result<(Self, InvalidationStream), StoreError> {
        let auth_token = std::env::var(&config.auth_token_env).ok();

        let endpoint = config
            .endpoint
            .trim_start_matches("rediss://")
            .trim_start_matches("redis://");
        let (host, port) = parse_host_port(endpoint)?;
        let server_config = ServerConfig::new_centralized(host, port);

        let mut fred_config = FredConfig {
            server: server_config,
            version: RespVersion::RESP3,
            ..FredConfig::default()
        };

        if config.tls {
            fred_config.tls = Some(TlsConnector::default_rustls()?.into());
        }

        if let Some(token) = auth_token {
            fred_config.password = Some(token);
        }

        let mut builder = Builder::from_config(fred_config);
        builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

        let client = builder.build()?;
        client.init().await?;
        client
            .start_tracking(None, false, false, false, false)
            .await?;
        debug!(host, port, tls = config.tls, "store connected, tracking enabled");

        let cache = Arc::new(LocalCache::new());
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_invalidation_pump(client.clone(), Arc::clone(&cache), tx);

        let store = Self {
            client,
            cache,
            publish_script: Script::from_lua(scripts::SET_IF_OWNED),
            release_script: Script::from_lua(scripts::DEL_IF_OWNED),
        };
        Ok((store, rx))
    }
}

/// Forward server pushes into the local cache and the consumer stream.
///
/// A lagged invalidation stream means pushes were dropped, so the staleness
/// of any entry is unknown; both lag and reconnect collapse to a
/// connection-level reset.
fn spawn_invalidation_pump(
    client: Client,
    cache: Arc<LocalCache>,
    tx: mpsc::UnboundedSender<Invalidation>,
) {
    let mut invalidations = client.invalidation_rx();
    let mut reconnects = client.reconnect_rx();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = invalidations.recv() => match msg {
                    Ok(inv) if inv.keys.is_empty() => {
                        cache.clear();
                        if tx.send(Invalidation::All).is_err() {
                            return;
                        }
                    }
                    Ok(inv) => {
                        let keys: Vec<String> = inv
                            .keys
                            .iter()
                            .filter_map(|k| k.as_str().map(str::to_string))
                            .collect();
                        for key in &keys {
                            cache.invalidate(key);
                        }
                        if tx.send(Invalidation::Keys(keys)).is_err() {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "invalidation stream lagged, resetting local cache");
                        cache.clear();
                        if tx.send(Invalidation::All).is_err() {
                            return;
                        }
                    }
                    Err(RecvError::Closed) => return,
                },
                msg = reconnects.recv() => match msg {
                    Ok(server) => {
                        debug!(?server, "reconnected, re-arming client tracking");
                        cache.clear();
                        if let Err(e) = client
                            .start_tracking(None, false, false, false, false)
                            .await
                        {
                            warn!(error = %e, "failed to re-arm client tracking");
                        }
                        if tx.send(Invalidation::All).is_err() {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(_)) => {
                        cache.clear();
                        if tx.send(Invalidation::All).is_err() {
                            return;
                        }
                    }
                    Err(RecvError::Closed) => return,
                },
            }
        }
    });
}

#[async_trait]
impl Store for RedisStore {
    async fn get_cached(
        &self,
        key: &str,
        cache_ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        if let Some(hit) = self.cache.get(key) {
            trace!(%key, "local cache hit");
            return Ok(hit);
        }
        let gen = self.cache.generation();
        let value: Option<String> = self.client.get(key).await?;
        self.cache.insert_if(gen, key, value.clone(), cache_ttl);
        Ok(value)
    }

    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let _: () = self
            .client
            .set(key, value, Some(Expiration::PX(px(ttl))), None, false)
            .await?;
        Ok(())
    }

    async fn set_nx_get(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        let prev: Option<String> = self
            .client
            .set(
                key,
                value,
                Some(Expiration::PX(px(ttl))),
                Some(SetOptions::NX),
                true,
            )
            .await?;
        Ok(prev)
    }

    async fn set_if_owned(
        &self,
        key: &str,
        owner: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let _: Value = self
            .publish_script
            .evalsha_with_reload(
                &self.client,
                vec![key.to_string()],
                vec![owner.to_string(), value.to_string(), px(ttl).to_string()],
            )
            .await?;
        Ok(())
    }

    async fn del_if_owned(&self, key: &str, owner: &str) -> Result<(), StoreError> {
        let _: Value = self
            .release_script
            .evalsha_with_reload(&self.client, vec![key.to_string()], vec![owner.to_string()])
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let _: i64 = self.client.del(key).await?;
        Ok(())
    }

    async fn close(&self) {
        self.cache.clear();
        if let Err(e) = self.client.quit().await {
            debug!(error = %e, "quit returned an error");
        }
    }
}

/// PX arguments must be >= 1.
fn px(ttl: Duration) -> i64 {
    (ttl.as_millis() as i64).max(1)
}

/// Parse a `host:port` string. If the port is omitted, defaults to `6379`.
fn parse_host_port(endpoint: &str) -> Result<(&str, u16), StoreError> {
    // Strip any trailing path segments (e.g. from URIs).
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .map_err(|_| StoreError::InvalidEndpoint(endpoint.to_string()))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_with_port() {
        let (host, port) = parse_host_port("cache.local:6380").unwrap();
        assert_eq!(host, "cache.local");
        assert_eq!(port, 6380);
    }

    #[test]
    fn parse_host_port_default() {
        let (host, port) = parse_host_port("cache.local").unwrap();
        assert_eq!(host, "cache.local");
        assert_eq!(port, 6379);
    }

    #[test]
    fn parse_host_port_rejects_bad_port() {
        assert!(parse_host_port("cache.local:notaport").is_err());
    }

    #[test]
    fn px_floors_at_one_millisecond() {
        assert_eq!(px(Duration::ZERO), 1);
        assert_eq!(px(Duration::from_secs(2)), 2_000);
    }
}
