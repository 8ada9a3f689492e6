//! Redis-backed [`KeyStore`].
//!
//! Connections go through [`ConnectionManager`], which reconnects with
//! exponential backoff when the link drops, so there is no liveness poll.
//! The dual-index operations run as Lua scripts evaluated by the server.
//!
//! Only standalone Redis (or a single primary with replicas) is supported.
//! The scripts touch keys that do not share a hash slot, and the live
//! session scan builds session keys from a prefix instead of declaring them
//! in `KEYS`, so Redis Cluster would reject or misroute them.

use super::{KeyStore, SessionIndex, SessionMap, StoreResult};
use crate::error::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use std::time::Duration;
use tracing::info;

const BIND_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
local ttl = tonumber(ARGV[3])
redis.call('SET', KEYS[1], ARGV[2], 'PX', ttl)
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
if redis.call('PTTL', KEYS[2]) < ttl then
  redis.call('PEXPIRE', KEYS[2], ttl)
end
return 1
"#;

const RENEW_SCRIPT: &str = r#"
local node = redis.call('GET', KEYS[1])
if not node then
  redis.call('HDEL', KEYS[2], ARGV[1])
  return 0
end
if redis.call('HGET', KEYS[2], ARGV[1]) ~= node then
  return 0
end
local ttl = tonumber(ARGV[2])
redis.call('PEXPIRE', KEYS[1], ttl)
if redis.call('PTTL', KEYS[2]) < ttl then
  redis.call('PEXPIRE', KEYS[2], ttl)
end
return 1
"#;

const UNBIND_SCRIPT: &str = r#"
if redis.call('HDEL', KEYS[2], ARGV[1]) == 0 then
  return 0
end
redis.call('DEL', KEYS[1])
return 1
"#;

// ARGV[1] is the session key prefix; session keys are derived inside the
// script and are not listed in KEYS.
const LIVE_SCRIPT: &str = r#"
local out = {}
for i, user_key in ipairs(KEYS) do
  local fields = redis.call('HGETALL', user_key)
  local live = {}
  for j = 1, #fields, 2 do
    local sid, node = fields[j], fields[j + 1]
    if redis.call('GET', ARGV[1] .. sid) == node then
      table.insert(live, sid)
      table.insert(live, node)
    else
      redis.call('HDEL', user_key, sid)
    end
  end
  out[i] = live
end
return out
"#;

pub(crate) fn map_redis_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Internal(e.to_string())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX/PEXPIRE reject zero.
    (ttl.as_millis() as u64).max(1)
}

/// Redis key-value store.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    bind: Script,
    renew: Script,
    unbind: Script,
    live: Script,
}

impl RedisStore {
    /// Connect to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the first connection fails.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(map_redis_error)?;
        Self::from_client(client).await
    }

    /// Wrap an existing client.
    ///
    /// # Errors
    ///
    /// Returns an error if the first connection fails.
    pub async fn from_client(client: Client) -> StoreResult<Self> {
        let conn = ConnectionManager::new(client)
            .await
            .map_err(map_redis_error)?;
        let store = Self {
            conn,
            bind: Script::new(BIND_SCRIPT),
            renew: Script::new(RENEW_SCRIPT),
            unbind: Script::new(UNBIND_SCRIPT),
            live: Script::new(LIVE_SCRIPT),
        };
        store.ping().await?;
        info!("Connected to Redis key store");
        Ok(store)
    }

    /// A cloned handle to the managed connection.
    #[must_use]
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl KeyStore for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(map_redis_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn.pset_ex(key, value, ttl_millis(ttl)).await,
            None => conn.set(key, value).await,
        }
        .map_err(map_redis_error)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        conn.pexpire(key, ttl_millis(ttl) as i64)
            .await
            .map_err(map_redis_error)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await.map_err(map_redis_error)?;
        Ok(removed > 0)
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        // MGET with a single key still replies with an array.
        redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn incr(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1u64).await.map_err(map_redis_error)
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let added: u64 = conn.sadd(key, member).await.map_err(map_redis_error)?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.srem(key, member).await.map_err(map_redis_error)?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(map_redis_error)
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        conn.sismember(key, member).await.map_err(map_redis_error)
    }

    async fn bind_session(
        &self,
        index: &SessionIndex,
        node: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let bound: i64 = self
            .bind
            .key(&index.session_key)
            .key(&index.user_key)
            .arg(&index.session_id)
            .arg(node)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(bound == 1)
    }

    async fn renew_session(&self, index: &SessionIndex, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .renew
            .key(&index.session_key)
            .key(&index.user_key)
            .arg(&index.session_id)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(renewed == 1)
    }

    async fn unbind_session(&self, index: &SessionIndex) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .unbind
            .key(&index.session_key)
            .key(&index.user_key)
            .arg(&index.session_id)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(removed == 1)
    }

    async fn live_sessions(
        &self,
        user_keys: &[String],
        session_prefix: &str,
    ) -> StoreResult<Vec<SessionMap>> {
        if user_keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut invocation = self.live.prepare_invoke();
        for key in user_keys {
            invocation.key(key);
        }
        invocation.arg(session_prefix);

        let flat: Vec<Vec<String>> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(flat
            .into_iter()
            .map(|pairs| {
                pairs
                    .chunks_exact(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect()
            })
            .collect())
    }
}
