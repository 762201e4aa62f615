use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::{AsyncCommands, Script};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::error::BookingError;
use crate::models::{HeldLock, LockAcquisition, LockEvent, LockKey, LockStatus, SYSTEM_HOLDER};
use crate::services::lock::SlotLocks;

const LOCK_PREFIX: &str = "slot_lock";
const HOLDER_PREFIX: &str = "slot_lock_holder:";

/// Grant when the key is free or already ours, then refresh the TTL.
/// Returns the holder after the call.
const ACQUIRE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if (not current) or current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    redis.call('SADD', KEYS[2], KEYS[1])
    redis.call('PEXPIRE', KEYS[2], ARGV[2])
    return ARGV[1]
end
return current
"#;

/// Delete when held by ARGV[1] or when ARGV[2] is '1' (system rollback).
/// Returns the removed holder, or an empty string.
const RELEASE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return ''
end
if current == ARGV[1] or ARGV[2] == '1' then
    redis.call('DEL', KEYS[1])
    redis.call('SREM', ARGV[3] .. current, KEYS[1])
    return current
end
return ''
"#;

/// Lock table shared by every API instance through Redis. Redis enforces the
/// TTL, so expiry happens without an `Expired` event reaching subscribers;
/// viewers learn about it on their next `join_appointment_room`.
pub struct RedisLockTable {
    pool: Pool,
    ttl: Duration,
    events: broadcast::Sender<LockEvent>,
}

impl RedisLockTable {
    pub async fn connect(config: &AppConfig) -> Result<Self, BookingError> {
        let redis_url = config.redis_url.clone()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        let cfg = Config::from_url(redis_url);
        let pool = cfg.create_pool(Some(Runtime::Tokio1)).map_err(|e| {
            BookingError::LockBackend(format!("Failed to create Redis pool: {}", e))
        })?;

        let mut conn = pool.get().await.map_err(|e| {
            BookingError::LockBackend(format!("Failed to connect to Redis: {}", e))
        })?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Redis lock table initialized");

        let (events, _) = broadcast::channel(1024);
        Ok(Self {
            pool,
            ttl: Duration::from_secs(config.slot_lock_ttl_seconds),
            events,
        })
    }

    async fn connection(&self) -> Result<Connection, BookingError> {
        self.pool
            .get()
            .await
            .map_err(|e| BookingError::LockBackend(format!("Failed to get Redis connection: {}", e)))
    }

    fn ttl_millis(&self) -> u64 {
        self.ttl.as_millis() as u64
    }

    async fn release_key(&self, conn: &mut Connection, redis_key: &str, holder: &str) -> Result<Option<String>, BookingError> {
        let system = if holder == SYSTEM_HOLDER { "1" } else { "0" };
        let removed: String = Script::new(RELEASE_SCRIPT)
            .key(redis_key)
            .arg(holder)
            .arg(system)
            .arg(HOLDER_PREFIX)
            .invoke_async(conn)
            .await?;
        Ok(if removed.is_empty() { None } else { Some(removed) })
    }
}

pub fn redis_key(key: &LockKey) -> String {
    format!("{}:{}:{}", LOCK_PREFIX, key.schedule_id, key.slot_start)
}

pub fn holder_key(holder: &str) -> String {
    format!("{}{}", HOLDER_PREFIX, holder)
}

/// Inverse of `redis_key`. The slot start itself contains a ':'.
pub fn parse_redis_key(raw: &str) -> Option<LockKey> {
    let rest = raw.strip_prefix(LOCK_PREFIX)?.strip_prefix(':')?;
    let (schedule, slot_start) = rest.split_once(':')?;
    let schedule_id = Uuid::parse_str(schedule).ok()?;
    LockKey::new(schedule_id, slot_start).ok()
}

#[async_trait]
impl SlotLocks for RedisLockTable {
    async fn acquire(&self, key: &LockKey, holder: &str) -> Result<LockAcquisition, BookingError> {
        let mut conn = self.connection().await?;
        let current: String = Script::new(ACQUIRE_SCRIPT)
            .key(redis_key(key))
            .key(holder_key(holder))
            .arg(holder)
            .arg(self.ttl_millis())
            .invoke_async(&mut conn)
            .await?;

        if current != holder {
            debug!("Lock {} denied to {}, held by {}", key, holder, current);
            return Ok(LockAcquisition { granted: false, held_by: Some(current), expires_at: None });
        }

        let expires_at = Utc::now() + chrono::Duration::milliseconds(self.ttl_millis() as i64);
        let _ = self.events.send(LockEvent::Granted {
            key: key.clone(),
            holder: holder.to_string(),
            expires_at,
        });
        debug!("Lock {} granted to {}", key, holder);
        Ok(LockAcquisition { granted: true, held_by: Some(current), expires_at: Some(expires_at) })
    }

    async fn release(&self, key: &LockKey, holder: &str) -> Result<bool, BookingError> {
        let mut conn = self.connection().await?;
        match self.release_key(&mut conn, &redis_key(key), holder).await? {
            Some(previous) => {
                let _ = self.events.send(LockEvent::Released { key: key.clone(), holder: previous });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn is_locked(&self, key: &LockKey) -> Result<LockStatus, BookingError> {
        let mut conn = self.connection().await?;
        let holder: Option<String> = conn.get(redis_key(key)).await?;
        Ok(LockStatus { locked: holder.is_some(), held_by: holder })
    }

    async fn locks_for_schedule(&self, schedule_id: Uuid) -> Result<Vec<HeldLock>, BookingError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}:{}:*", LOCK_PREFIX, schedule_id);
        let keys: Vec<String> = conn.keys(&pattern).await?;

        let mut held = Vec::new();
        for raw in keys {
            let Some(key) = parse_redis_key(&raw) else { continue };
            let holder: Option<String> = conn.get(&raw).await?;
            let remaining_ms: i64 = conn.pttl(&raw).await?;
            if let (Some(holder), true) = (holder, remaining_ms > 0) {
                held.push(HeldLock {
                    slot_start: key.slot_start,
                    held_by: holder,
                    expires_at: Utc::now() + chrono::Duration::milliseconds(remaining_ms),
                });
            }
        }
        held.sort_by(|a, b| a.slot_start.cmp(&b.slot_start));
        Ok(held)
    }

    async fn release_all_held_by(&self, holder: &str) -> Result<Vec<LockKey>, BookingError> {
        let mut conn = self.connection().await?;
        let members: Vec<String> = conn.smembers(holder_key(holder)).await?;

        let mut released = Vec::new();
        for raw in members {
            if self.release_key(&mut conn, &raw, holder).await?.is_some() {
                if let Some(key) = parse_redis_key(&raw) {
                    let _ = self.events.send(LockEvent::Released { key: key.clone(), holder: holder.to_string() });
                    released.push(key);
                }
            }
        }
        let _: () = conn.del(holder_key(holder)).await?;

        if !released.is_empty() {
            debug!("Released {} lock(s) held by {}", released.len(), holder);
        }
        Ok(released)
    }

    fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }
}
