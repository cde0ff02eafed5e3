//! Redis-backed cache implementation.
//!
//! Maps the [`CacheBackend`] contract onto any async Redis connection:
//!
//! - Batch reads are split into `MGET` chunks (1000 keys by default)
//! - Batch writes are queued on one pipeline and sent in a single round trip
//! - Prefix reads and deletes walk the keyspace with `SCAN`, handling each
//!   page before requesting the next one
//!
//! # Connections
//!
//! The backend is generic over [`ConnectionLike`] so production code can use
//! a reconnecting [`ConnectionManager`] while tests drive a scripted mock.
//! The handle is cloned per call; multiplexed connections make that cheap.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager, ConnectionManagerConfig};
use redis::{Cmd, RedisError};
use stowage_core::{BackendConfig, CacheError, CacheResult, ConfigError, RedisConfig};

use crate::backend::{require_non_empty, require_scan_count, CacheBackend};
use crate::key::KeyPrefix;

/// Redis cache backend.
///
/// # Example
///
/// ```ignore
/// let backend = RedisCache::connect(&config.redis, &config.backend).await?;
/// backend.set("u:1", "alice", Duration::from_secs(60)).await?;
/// assert_eq!(backend.get("u:1").await?, "alice");
/// ```
pub struct RedisCache<C = ConnectionManager> {
    /// Connection handle; `None` once closed.
    conn: RwLock<Option<C>>,
    prefix: KeyPrefix,
    /// Value stored in place of keys known to be absent at the origin.
    empty: String,
    mget_chunk_size: usize,
    scan_count: u64,
}

impl RedisCache<ConnectionManager> {
    /// Open a reconnecting connection to a single Redis node.
    pub async fn connect(server: &RedisConfig, backend: &BackendConfig) -> CacheResult<Self> {
        let client = redis::Client::open(server.url.as_str()).map_err(|e| {
            CacheError::from(ConfigError::InvalidValue {
                field: "redis.url".to_string(),
                value: server.url.clone(),
                reason: e.to_string(),
            })
        })?;

        let manager = ConnectionManager::new_with_config(client, manager_config(server))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to redis");
                CacheError::internal("connect cache failed")
            })?;

        tracing::info!(prefix = %backend.prefix, "Redis cache connected");
        Ok(Self::new(manager, backend))
    }
}

impl<C> RedisCache<C>
where
    C: ConnectionLike + Clone + Send + Sync,
{
    /// Wrap an existing connection.
    pub fn new(conn: C, config: &BackendConfig) -> Self {
        Self {
            conn: RwLock::new(Some(conn)),
            prefix: KeyPrefix::new(config.prefix.clone()),
            empty: config.empty_marker.clone(),
            mget_chunk_size: config.mget_chunk_size.max(1),
            scan_count: config.scan_count.max(1),
        }
    }

    /// Override the empty marker.
    pub fn with_empty_marker(mut self, marker: impl Into<String>) -> Self {
        self.empty = marker.into();
        self
    }

    /// Override the number of keys per `MGET` round trip.
    pub fn with_mget_chunk_size(mut self, size: usize) -> Self {
        self.mget_chunk_size = size.max(1);
        self
    }

    /// Override the default `SCAN` page size.
    pub fn with_scan_count(mut self, count: u64) -> Self {
        self.scan_count = count.max(1);
        self
    }

    /// Keys per `MGET` round trip.
    pub fn mget_chunk_size(&self) -> usize {
        self.mget_chunk_size
    }

    fn connection(&self) -> CacheResult<C> {
        let guard = self
            .conn
            .read()
            .map_err(|_| CacheError::internal("cache connection lock poisoned"))?;
        guard
            .clone()
            .ok_or_else(|| CacheError::internal("cache backend is closed"))
    }

    /// Prefix every logical key.
    fn handle_keys(&self, keys: &[String]) -> Vec<String> {
        self.prefix.apply_all(keys)
    }

    /// Logical key for a stored key; stored keys outside the prefix are
    /// returned unchanged.
    fn logical_key(&self, full: String) -> String {
        match self.prefix.strip(&full) {
            Some(key) => key.to_string(),
            None => full,
        }
    }

    /// `MGET` over already-prefixed keys, chunked. Returned keys are logical.
    async fn mget_full(
        &self,
        conn: &mut C,
        keys: Vec<String>,
    ) -> CacheResult<HashMap<String, String>> {
        require_non_empty(keys.len())?;

        let mut data = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(self.mget_chunk_size) {
            let mut cmd = redis::cmd("MGET");
            for key in chunk {
                cmd.arg(key);
            }
            let values: Vec<Option<String>> = cmd.query_async(conn).await.map_err(|e| {
                tracing::error!(keys = chunk.len(), error = %e, "redis mget failed");
                CacheError::internal("batch get cache failed")
            })?;

            for (key, value) in chunk.iter().zip(values) {
                if let Some(value) = value {
                    data.insert(self.logical_key(key.clone()), value);
                }
            }
        }
        Ok(data)
    }

    /// `DEL` over already-prefixed keys in one command.
    async fn mdel_full(&self, conn: &mut C, keys: &[String]) -> CacheResult<()> {
        require_non_empty(keys.len())?;

        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async::<()>(conn).await.map_err(|e| {
            tracing::error!(keys = keys.len(), error = %e, "redis del failed");
            CacheError::internal("batch delete cache failed")
        })
    }

    /// Delete every stored key matching `pattern`, one `SCAN` page at a
    /// time.
    async fn delete_matching(
        &self,
        conn: &mut C,
        pattern: &str,
        scan_count: u64,
        failure: &'static str,
    ) -> CacheResult<()> {
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(scan_count)
                .query_async(conn)
                .await
                .map_err(|e| scan_error(pattern, e, failure))?;
            if !keys.is_empty() {
                self.mdel_full(conn, &keys).await?;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(())
    }
}

/// Reconnect and timeout settings for the connection manager. A zero
/// timeout leaves that timeout unset.
fn manager_config(server: &RedisConfig) -> ConnectionManagerConfig {
    let mut config =
        ConnectionManagerConfig::new().set_number_of_retries(server.number_of_retries);
    if let Some(timeout) = server.connection_timeout() {
        config = config.set_connection_timeout(timeout);
    }
    if let Some(timeout) = server.response_timeout() {
        config = config.set_response_timeout(timeout);
    }
    config
}

fn scan_error(pattern: &str, e: RedisError, failure: &'static str) -> CacheError {
    tracing::error!(pattern = %pattern, error = %e, "redis scan failed");
    CacheError::internal(failure)
}

/// `SET` with the expiry encoded the way the store expects: whole seconds
/// as `EX`, anything finer as `PX`, zero as no expiry.
fn set_cmd(key: &str, value: &str, ttl: Duration) -> Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if !ttl.is_zero() {
        if ttl.subsec_nanos() == 0 {
            cmd.arg("EX").arg(ttl.as_secs());
        } else {
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            cmd.arg("PX").arg(millis);
        }
    }
    cmd
}

#[async_trait]
impl<C> CacheBackend for RedisCache<C>
where
    C: ConnectionLike + Clone + Send + Sync,
{
    fn is_empty(&self, value: &str) -> bool {
        value == self.empty
    }

    async fn get(&self, key: &str) -> CacheResult<String> {
        let mut conn = self.connection()?;
        let value: Option<String> = redis::cmd("GET")
            .arg(self.prefix.apply(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                tracing::error!(key = %key, error = %e, "redis get failed");
                CacheError::internal("get cache failed")
            })?;
        value.ok_or_else(|| CacheError::not_found("cache does not exist"))
    }

    async fn mget(&self, keys: &[String]) -> CacheResult<HashMap<String, String>> {
        require_non_empty(keys.len())?;
        let mut conn = self.connection()?;
        self.mget_full(&mut conn, self.handle_keys(keys)).await
    }

    async fn prefix_get(
        &self,
        prefix: &str,
        scan_count: u64,
    ) -> CacheResult<HashMap<String, String>> {
        require_scan_count(scan_count)?;
        let mut conn = self.connection()?;
        let pattern = self.prefix.scan_pattern(prefix);

        let mut data = HashMap::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(scan_count)
                .query_async(&mut conn)
                .await
                .map_err(|e| scan_error(&pattern, e, "prefix get cache failed"))?;
            if !keys.is_empty() {
                data.extend(self.mget_full(&mut conn, keys).await?);
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(data)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.connection()?;
        set_cmd(&self.prefix.apply(key), value, ttl)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| {
                tracing::error!(key = %key, error = %e, "redis set failed");
                CacheError::internal("set cache failed")
            })
    }

    async fn mset(&self, data: &HashMap<String, String>, ttl: Duration) -> CacheResult<()> {
        require_non_empty(data.len())?;
        let mut conn = self.connection()?;

        let mut pipe = redis::pipe();
        for (key, value) in data {
            pipe.add_command(set_cmd(&self.prefix.apply(key), value, ttl))
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(|e| {
            tracing::error!(keys = data.len(), error = %e, "redis pipelined set failed");
            CacheError::internal("batch set cache failed")
        })
    }

    async fn set_empty(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        self.set(key, &self.empty, ttl).await
    }

    async fn mset_empty(&self, keys: &[String], ttl: Duration) -> CacheResult<()> {
        require_non_empty(keys.len())?;
        let mut conn = self.connection()?;

        let mut pipe = redis::pipe();
        for key in keys {
            pipe.add_command(set_cmd(&self.prefix.apply(key), &self.empty, ttl))
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(|e| {
            tracing::error!(keys = keys.len(), error = %e, "redis pipelined set empty failed");
            CacheError::internal("batch set empty cache failed")
        })
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.connection()?;
        redis::cmd("DEL")
            .arg(self.prefix.apply(key))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| {
                tracing::error!(key = %key, error = %e, "redis del failed");
                CacheError::internal("delete cache failed")
            })
    }

    async fn mdel(&self, keys: &[String]) -> CacheResult<()> {
        require_non_empty(keys.len())?;
        let mut conn = self.connection()?;
        self.mdel_full(&mut conn, &self.handle_keys(keys)).await
    }

    async fn prefix_del(&self, prefix: &str, scan_count: u64) -> CacheResult<()> {
        require_scan_count(scan_count)?;
        let mut conn = self.connection()?;
        let pattern = self.prefix.scan_pattern(prefix);
        self.delete_matching(&mut conn, &pattern, scan_count, "prefix delete cache failed")
            .await
    }

    async fn clear(&self, scan_count: u64) -> CacheResult<()> {
        require_scan_count(scan_count)?;
        let mut conn = self.connection()?;
        let pattern = self.prefix.scan_pattern("");
        self.delete_matching(&mut conn, &pattern, scan_count, "clear cache failed")
            .await
    }

    async fn close(&self) -> CacheResult<()> {
        let mut guard = self
            .conn
            .write()
            .map_err(|_| CacheError::internal("cache connection lock poisoned"))?;
        if guard.take().is_some() {
            tracing::info!(prefix = %self.prefix.as_str(), "Redis cache closed");
        }
        Ok(())
    }

    fn scan_count(&self) -> u64 {
        self.scan_count
    }

    fn cache_type(&self) -> &str {
        "redis"
    }

    fn prefix(&self) -> &str {
        self.prefix.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;
    use redis_test::{IntoRedisValue, MockCmd, MockRedisConnection};

    const TTL: Duration = Duration::from_secs(60);
    const END_KEY: &str = "svc:__end";

    /// Backend over a scripted connection. A trailing `GET` is appended so
    /// [`assert_drained`] can tell whether every scripted command was used.
    fn backend(
        mut commands: Vec<MockCmd>,
    ) -> (RedisCache<MockRedisConnection>, MockRedisConnection) {
        commands.push(MockCmd::new(redis::cmd("GET").arg(END_KEY), Ok("end")));
        let mock = MockRedisConnection::new(commands);
        let cache = RedisCache::new(mock.clone(), &BackendConfig::new("svc:"));
        (cache, mock)
    }

    /// The trailing `GET` is the next scripted reply, so every command
    /// before it was sent, in order.
    async fn assert_drained(mut mock: MockRedisConnection) {
        let reply: String = redis::cmd("GET")
            .arg(END_KEY)
            .query_async(&mut mock)
            .await
            .unwrap();
        assert_eq!(reply, "end");
    }

    fn bulk(values: Vec<Value>) -> Value {
        Value::Array(values)
    }

    fn scan_reply(cursor: &str, keys: &[&str]) -> Value {
        let keys = keys.iter().map(|k| (*k).into_redis_value()).collect();
        bulk(vec![cursor.into_redis_value(), bulk(keys)])
    }

    fn scan(cursor: u64, pattern: &str, count: u64) -> Cmd {
        let mut cmd = redis::cmd("SCAN");
        cmd.arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count);
        cmd
    }

    #[test]
    fn test_manager_config_skips_zero_timeouts() {
        let tuned = format!("{:?}", manager_config(&RedisConfig::default()));
        assert!(tuned.contains("number_of_retries: 3"));
        assert!(tuned.contains("connection_timeout: Some(5s)"));
        assert!(tuned.contains("response_timeout: Some(3s)"));

        let unbounded = RedisConfig {
            connection_timeout_ms: 0,
            response_timeout_ms: 0,
            ..RedisConfig::default()
        };
        let unbounded = format!("{:?}", manager_config(&unbounded));
        assert!(unbounded.contains("connection_timeout: None"));
        assert!(unbounded.contains("response_timeout: None"));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let server = RedisConfig {
            url: "not a redis url".to_string(),
            ..RedisConfig::default()
        };
        let err = RedisCache::connect(&server, &BackendConfig::new("svc:"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("redis.url"));
    }

    #[tokio::test]
    async fn test_get_hit_and_miss() {
        let (cache, mock) = backend(vec![
            MockCmd::new(redis::cmd("GET").arg("svc:u:1"), Ok("alice")),
            MockCmd::new(redis::cmd("GET").arg("svc:u:2"), Ok(Value::Nil)),
        ]);

        assert_eq!(cache.get("u:1").await.unwrap(), "alice");
        assert!(cache.get("u:2").await.unwrap_err().is_not_found());
        assert_drained(mock).await;
    }

    #[tokio::test]
    async fn test_store_failure_is_internal() {
        let mock = MockRedisConnection::new(Vec::new());
        let cache = RedisCache::new(mock, &BackendConfig::new("svc:"));

        let err = cache.get("u:1").await.unwrap_err();
        assert!(err.is_internal());
        assert_eq!(err.to_string(), "Internal server error: get cache failed");
    }

    #[tokio::test]
    async fn test_mget_is_chunked_and_strips_prefix() {
        let (cache, mock) = backend(vec![
            MockCmd::new(
                redis::cmd("MGET").arg("svc:a").arg("svc:b"),
                Ok(bulk(vec!["1".into_redis_value(), Value::Nil])),
            ),
            MockCmd::new(
                redis::cmd("MGET").arg("svc:c"),
                Ok(bulk(vec!["3".into_redis_value()])),
            ),
        ]);
        let cache = cache.with_mget_chunk_size(2);
        assert_eq!(cache.mget_chunk_size(), 2);

        let keys: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let data = cache.mget(&keys).await.unwrap();

        assert_eq!(data.len(), 2);
        assert_eq!(data["a"], "1");
        assert_eq!(data["c"], "3");
        assert!(!data.contains_key("b"));
        assert_drained(mock).await;
    }

    #[tokio::test]
    async fn test_empty_batches_send_nothing() {
        let (cache, mock) = backend(Vec::new());

        assert!(cache.mget(&[]).await.unwrap_err().is_bad_request());
        assert!(cache.mdel(&[]).await.unwrap_err().is_bad_request());
        assert!(cache.mset_empty(&[], TTL).await.unwrap_err().is_bad_request());
        assert!(cache
            .mset(&HashMap::new(), TTL)
            .await
            .unwrap_err()
            .is_bad_request());
        assert!(cache.clear(0).await.unwrap_err().is_bad_request());
        assert!(cache.prefix_get("user:", 0).await.unwrap_err().is_bad_request());

        assert_drained(mock).await;
    }

    #[test]
    fn test_set_cmd_expiry_encoding() {
        let mut expected = redis::cmd("SET");
        expected.arg("k").arg("v").arg("EX").arg(60);
        assert_eq!(
            set_cmd("k", "v", TTL).get_packed_command(),
            expected.get_packed_command()
        );

        let mut expected = redis::cmd("SET");
        expected.arg("k").arg("v").arg("PX").arg(1500);
        assert_eq!(
            set_cmd("k", "v", Duration::from_millis(1500)).get_packed_command(),
            expected.get_packed_command()
        );

        let mut expected = redis::cmd("SET");
        expected.arg("k").arg("v");
        assert_eq!(
            set_cmd("k", "v", Duration::ZERO).get_packed_command(),
            expected.get_packed_command()
        );
    }

    #[tokio::test]
    async fn test_set_and_set_empty() {
        let (cache, mock) = backend(vec![
            MockCmd::new(set_cmd("svc:u:1", "alice", TTL), Ok(Value::Okay)),
            MockCmd::new(set_cmd("svc:u:2", "<nil>", TTL), Ok(Value::Okay)),
        ]);
        let cache = cache.with_empty_marker("<nil>");

        cache.set("u:1", "alice", TTL).await.unwrap();
        cache.set_empty("u:2", TTL).await.unwrap();
        assert!(cache.is_empty("<nil>"));
        assert_drained(mock).await;
    }

    #[tokio::test]
    async fn test_mset_is_pipelined() {
        let mut pipe = redis::pipe();
        pipe.add_command(set_cmd("svc:u:1", "alice", TTL)).ignore();

        let (cache, mock) = backend(vec![MockCmd::with_values(pipe, Ok(vec![Value::Okay]))]);

        let data = HashMap::from([("u:1".to_string(), "alice".to_string())]);
        cache.mset(&data, TTL).await.unwrap();
        assert_drained(mock).await;
    }

    #[tokio::test]
    async fn test_mset_empty_is_pipelined() {
        let mut pipe = redis::pipe();
        pipe.add_command(set_cmd("svc:u:9", "", TTL)).ignore();

        let (cache, mock) = backend(vec![MockCmd::with_values(pipe, Ok(vec![Value::Okay]))]);

        cache.mset_empty(&["u:9".to_string()], TTL).await.unwrap();
        assert_drained(mock).await;
    }

    #[tokio::test]
    async fn test_del_and_mdel() {
        let (cache, mock) = backend(vec![
            MockCmd::new(redis::cmd("DEL").arg("svc:u:1"), Ok(1)),
            MockCmd::new(redis::cmd("DEL").arg("svc:u:2").arg("svc:u:3"), Ok(2)),
        ]);

        cache.del("u:1").await.unwrap();
        cache
            .mdel(&["u:2".to_string(), "u:3".to_string()])
            .await
            .unwrap();
        assert_drained(mock).await;
    }

    #[tokio::test]
    async fn test_prefix_get_walks_every_page() {
        let (cache, mock) = backend(vec![
            MockCmd::new(
                scan(0, "svc:user:*", 2),
                Ok(scan_reply("7", &["svc:user:1", "svc:user:2"])),
            ),
            MockCmd::new(
                redis::cmd("MGET").arg("svc:user:1").arg("svc:user:2"),
                Ok(bulk(vec!["x".into_redis_value(), "y".into_redis_value()])),
            ),
            MockCmd::new(scan(7, "svc:user:*", 2), Ok(scan_reply("0", &["svc:user:3"]))),
            MockCmd::new(
                redis::cmd("MGET").arg("svc:user:3"),
                Ok(bulk(vec![Value::Nil])),
            ),
        ]);

        let data = cache.prefix_get("user:", 2).await.unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data["user:1"], "x");
        assert_eq!(data["user:2"], "y");
        assert_drained(mock).await;
    }

    #[tokio::test]
    async fn test_prefix_del_deletes_each_page() {
        let (cache, mock) = backend(vec![
            MockCmd::new(scan(0, "svc:user:*", 100), Ok(scan_reply("3", &["svc:user:1"]))),
            MockCmd::new(redis::cmd("DEL").arg("svc:user:1"), Ok(1)),
            MockCmd::new(scan(3, "svc:user:*", 100), Ok(scan_reply("0", &[]))),
        ]);

        cache.prefix_del("user:", 100).await.unwrap();
        assert_drained(mock).await;
    }

    #[tokio::test]
    async fn test_configured_scan_count_pages_prefix_del() {
        let mock = MockRedisConnection::new(vec![
            MockCmd::new(scan(0, "svc:user:*", 25), Ok(scan_reply("0", &["svc:user:1"]))),
            MockCmd::new(redis::cmd("DEL").arg("svc:user:1"), Ok(1)),
            MockCmd::new(redis::cmd("GET").arg(END_KEY), Ok("end")),
        ]);
        let config = BackendConfig::new("svc:").with_scan_count(25);
        let cache = RedisCache::new(mock.clone(), &config);
        assert_eq!(cache.scan_count(), 25);

        cache.prefix_del("user:", cache.scan_count()).await.unwrap();
        assert_drained(mock).await;
    }

    #[test]
    fn test_scan_count_defaults_and_clamps() {
        let mock = MockRedisConnection::new(Vec::new());
        let cache = RedisCache::new(mock.clone(), &BackendConfig::new("svc:"));
        assert_eq!(cache.scan_count(), stowage_core::DEFAULT_SCAN_COUNT);
        assert_eq!(cache.with_scan_count(0).scan_count(), 1);

        let zero = BackendConfig::new("svc:").with_scan_count(0);
        assert_eq!(RedisCache::new(mock, &zero).scan_count(), 1);
    }

    #[tokio::test]
    async fn test_clear_scopes_to_backend_prefix() {
        let (cache, mock) = backend(vec![
            MockCmd::new(scan(0, "svc:*", 50), Ok(scan_reply("0", &["svc:a", "svc:b"]))),
            MockCmd::new(redis::cmd("DEL").arg("svc:a").arg("svc:b"), Ok(2)),
        ]);

        cache.clear(50).await.unwrap();
        assert_drained(mock).await;
    }

    #[tokio::test]
    async fn test_closed_backend_rejects_calls() {
        let (cache, mock) = backend(Vec::new());

        cache.close().await.unwrap();
        cache.close().await.unwrap();
        let err = cache.get("__end").await.unwrap_err();
        assert!(err.is_internal());
        assert_eq!(err.to_string(), "Internal server error: cache backend is closed");
        assert_eq!(cache.cache_type(), "redis");
        assert_eq!(cache.prefix(), "svc:");
        assert_drained(mock).await;
    }
}
