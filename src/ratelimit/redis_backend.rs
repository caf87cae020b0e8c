use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use redis::{
    AsyncCommands,
    IntoConnectionInfo,
    Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};

use crate::{
    config::RedisConfig,
    error::{BackendError, BackendResult},
    ratelimit::{CounterBackend, CounterSnapshot, KeyTtl, RemoteConnector},
};

const FIXED_WINDOW_HIT_LUA: &str = r#"
local key = KEYS[1]
local window_ms = tonumber(ARGV[1])

local count = redis.call('INCR', key)
local ttl = redis.call('PTTL', key)

if count == 1 or ttl < 0 then
  redis.call('PEXPIRE', key, window_ms)
  ttl = window_ms
end

return {count, ttl}
"#;

const SATURATING_DECR_LUA: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]))
if current == nil then
  return 0
end
if current <= 0 then
  return 0
end
return redis.call('DECR', KEYS[1])
"#;

pub struct RedisCounterBackend {
    manager: ConnectionManager,
    command_timeout: Duration,
}

impl RedisCounterBackend {
    /// Opens the connection manager and proves the server answers before the
    /// store starts routing to it.
    pub async fn connect(cfg: &RedisConfig) -> BackendResult<Self> {
        let mut info = cfg.connection_url().into_connection_info()?;
        info.redis.password = cfg.password.clone();

        let client = redis::Client::open(info)?;
        let retry_factor = cfg.retry_delay.as_millis().max(1) as u64;
        let manager_cfg = ConnectionManagerConfig::new()
            .set_number_of_retries(cfg.max_retries)
            .set_exponent_base(2)
            .set_factor(retry_factor)
            .set_max_delay(retry_factor.saturating_mul(32))
            .set_connection_timeout(cfg.connect_timeout)
            .set_response_timeout(cfg.command_timeout);

        let mut manager = tokio::time::timeout(
            cfg.connect_timeout,
            client.get_connection_manager_with_config(manager_cfg),
        )
        .await
        .map_err(|_| BackendError::Timeout(cfg.connect_timeout))??;

        let pong: String = tokio::time::timeout(
            cfg.connect_timeout,
            redis::cmd("PING").query_async(&mut manager),
        )
        .await
        .map_err(|_| BackendError::Timeout(cfg.connect_timeout))??;
        tracing::debug!(reply = %pong, "redis counter backend answered ping");

        Ok(Self {
            manager,
            command_timeout: cfg.command_timeout,
        })
    }

    async fn bounded<T, F>(&self, call: F) -> BackendResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(self.command_timeout, call)
            .await
            .map_err(|_| BackendError::Timeout(self.command_timeout))?
            .map_err(BackendError::from)
    }
}

/// Dials redis from stored settings, on startup and on reconnect attempts.
pub struct RedisConnector {
    cfg: RedisConfig,
}

impl RedisConnector {
    pub fn new(cfg: RedisConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl RemoteConnector for RedisConnector {
    async fn connect(&self) -> BackendResult<Arc<dyn CounterBackend>> {
        let backend = RedisCounterBackend::connect(&self.cfg).await?;
        Ok(Arc::new(backend))
    }
}

fn ttl_from_pttl(pttl: i64) -> KeyTtl {
    match pttl {
        -2 => KeyTtl::Missing,
        ms if ms < 0 => KeyTtl::Persistent,
        ms => KeyTtl::Remaining(Duration::from_millis(ms as u64)),
    }
}

#[async_trait]
impl CounterBackend for RedisCounterBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn increment(&self, key: &str) -> BackendResult<u64> {
        let mut conn = self.manager.clone();
        let count: i64 = self.bounded(conn.incr(key, 1i64)).await?;
        Ok(count.max(0) as u64)
    }

    async fn decrement(&self, key: &str) -> BackendResult<u64> {
        let mut conn = self.manager.clone();
        let script = Script::new(SATURATING_DECR_LUA);
        let count: i64 = self
            .bounded(script.key(key).invoke_async(&mut conn))
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> BackendResult<()> {
        let mut conn = self.manager.clone();
        let _: bool = self
            .bounded(conn.pexpire(key, ttl.as_millis() as i64))
            .await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> BackendResult<KeyTtl> {
        let mut conn = self.manager.clone();
        let pttl: i64 = self.bounded(conn.pttl(key)).await?;
        Ok(ttl_from_pttl(pttl))
    }

    async fn get(&self, key: &str) -> BackendResult<Option<u64>> {
        let mut conn = self.manager.clone();
        let count: Option<i64> = self.bounded(conn.get(key)).await?;
        Ok(count.map(|c| c.max(0) as u64))
    }

    async fn del(&self, key: &str) -> BackendResult<()> {
        let mut conn = self.manager.clone();
        let _: i64 = self.bounded(conn.del(key)).await?;
        Ok(())
    }

    /// Single round trip: the increment and the window start happen inside
    /// one script, so a crash between them can't leave a key without expiry.
    async fn hit(&self, key: &str, window: Duration) -> BackendResult<CounterSnapshot> {
        let mut conn = self.manager.clone();
        let window_ms = (window.as_millis() as i64).max(1);
        let script = Script::new(FIXED_WINDOW_HIT_LUA);
        let (count, pttl): (i64, i64) = self
            .bounded(script.key(key).arg(window_ms).invoke_async(&mut conn))
            .await?;

        Ok(CounterSnapshot::from_ttl(
            count.max(0) as u64,
            ttl_from_pttl(pttl),
            window,
        ))
    }

    async fn shutdown(&self) {
        // ConnectionManager has no close call; the socket goes when the store
        // drops its last handle right after this.
        tracing::info!("redis counter backend released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pttl_codes_map_to_key_ttl() {
        assert_eq!(ttl_from_pttl(-2), KeyTtl::Missing);
        assert_eq!(ttl_from_pttl(-1), KeyTtl::Persistent);
        assert_eq!(
            ttl_from_pttl(1_500),
            KeyTtl::Remaining(Duration::from_millis(1_500))
        );
    }

    #[tokio::test]
    async fn unreachable_server_fails_within_connect_timeout() {
        let cfg = RedisConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            password: None,
            db: 0,
            tls: false,
            max_retries: 0,
            retry_delay: Duration::from_millis(1),
            connect_timeout: Duration::from_millis(200),
            command_timeout: Duration::from_millis(200),
        };

        assert!(RedisCounterBackend::connect(&cfg).await.is_err());
        assert!(RedisConnector::new(cfg).connect().await.is_err());
    }
}
