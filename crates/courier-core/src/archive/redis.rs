//! Redis-backed [`MessageArchive`].
//!
//! Each envelope is a hash `{prefix}:msg:{id}` with an immutable `envelope`
//! JSON field and a mutable `status` field. Each scope is a sorted set
//! `{prefix}:inbox:{scope}` of message ids scored by sequence.

use super::{DeliveryRecord, MessageArchive};
use crate::error::{Result, StoreError};
use crate::store::redis::map_redis_error;
use crate::store::Keyspace;
use async_trait::async_trait;
use courier_protocol::{DeliveryItem, Envelope, MessageStatus, Scope};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

const SET_STATUS_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], 'status', ARGV[1])
return 1
"#;

/// Message archive stored in Redis.
#[derive(Clone)]
pub struct RedisArchive {
    conn: ConnectionManager,
    keys: Keyspace,
    set_status: Script,
}

impl RedisArchive {
    /// Create an archive over an existing managed connection.
    #[must_use]
    pub fn new(conn: ConnectionManager, keys: Keyspace) -> Self {
        Self {
            conn,
            keys,
            set_status: Script::new(SET_STATUS_SCRIPT),
        }
    }

    fn decode(raw: Option<String>, status: Option<u8>) -> Result<Option<Envelope>> {
        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut envelope: Envelope = serde_json::from_str(&raw).map_err(StoreError::from)?;
        if let Some(status) = status.and_then(|s| MessageStatus::try_from(s).ok()) {
            envelope.status = status;
        }
        Ok(Some(envelope))
    }
}

#[async_trait]
impl MessageArchive for RedisArchive {
    async fn store(&self, envelope: &Envelope, deliveries: &[DeliveryRecord]) -> Result<()> {
        let json = serde_json::to_string(envelope).map_err(StoreError::from)?;
        let status: u8 = envelope.status.into();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(self.keys.message(&envelope.message_id), "envelope", json)
            .ignore()
            .hset(self.keys.message(&envelope.message_id), "status", status)
            .ignore();
        for record in deliveries {
            pipe.zadd(
                self.keys.inbox(&record.scope.to_string()),
                &envelope.message_id,
                record.sequence,
            )
            .ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn envelope(&self, message_id: &str) -> Result<Option<Envelope>> {
        let mut conn = self.conn.clone();
        let (raw, status): (Option<String>, Option<u8>) = redis::cmd("HMGET")
            .arg(self.keys.message(message_id))
            .arg("envelope")
            .arg("status")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Self::decode(raw, status)
    }

    async fn range(&self, scope: &Scope, after: u64, limit: usize) -> Result<Vec<DeliveryItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let entries: Vec<(String, u64)> = conn
            .zrangebyscore_limit_withscores(
                self.keys.inbox(&scope.to_string()),
                format!("({after}"),
                "+inf",
                0,
                limit as isize,
            )
            .await
            .map_err(map_redis_error)?;

        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for (message_id, _) in &entries {
            pipe.cmd("HMGET")
                .arg(self.keys.message(message_id))
                .arg("envelope")
                .arg("status");
        }
        let envelopes: Vec<(Option<String>, Option<u8>)> = pipe
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let mut items = Vec::with_capacity(entries.len());
        for ((_, sequence), (raw, status)) in entries.into_iter().zip(envelopes) {
            if let Some(envelope) = Self::decode(raw, status)? {
                items.push(DeliveryItem {
                    scope: scope.clone(),
                    sequence,
                    envelope,
                });
            }
        }
        Ok(items)
    }

    async fn max_sequence(&self, scope: &Scope) -> Result<u64> {
        let mut conn = self.conn.clone();
        let top: Vec<(String, u64)> = conn
            .zrevrange_withscores(self.keys.inbox(&scope.to_string()), 0, 0)
            .await
            .map_err(map_redis_error)?;
        Ok(top.first().map_or(0, |(_, seq)| *seq))
    }

    async fn set_status(&self, message_id: &str, status: MessageStatus) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .set_status
            .key(self.keys.message(message_id))
            .arg(u8::from(status))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(updated == 1)
    }
}
