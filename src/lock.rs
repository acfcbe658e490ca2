//! Cross-instance coordination for snapshot cycles: a lease-based mutex and
//! the shared "last snapshot time" of each document.
//!
//! [`RedisCoordinator`] is the production backend. [`MemoryCoordinator`]
//! implements the same contract in-process, for single-instance deployments
//! and tests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tracing::debug;

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub fn snapshot_lock_key(document_id: i64) -> String {
    format!("document-versioning:mutex:{document_id}")
}

pub fn snapshot_time_key(document_id: i64) -> String {
    format!("document-versioning:last-update:{document_id}")
}

/// Proof of holding a lease. Only the holder's token can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub key: String,
    pub token: String,
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire `key` for `ttl` without waiting. `None` if someone else holds it.
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>, LockError>;

    /// Release a lease. Returns false if it had already expired or been taken over.
    async fn unlock(&self, lease: &LeaseToken) -> Result<bool, LockError>;
}

#[async_trait]
pub trait SnapshotTimes: Send + Sync {
    async fn last_snapshot(&self, document_id: i64) -> Result<Option<DateTime<Utc>>, LockError>;

    async fn record_snapshot(
        &self,
        document_id: i64,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), LockError>;
}

fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ============================================================================
// Redis
// ============================================================================

#[derive(Clone)]
pub struct RedisCoordinator {
    conn: ConnectionManager,
}

impl RedisCoordinator {
    pub async fn connect(url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl LockService for RedisCoordinator {
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>, LockError> {
        let mut conn = self.conn.clone();
        let token = new_token();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(reply.map(|_| LeaseToken {
            key: key.to_string(),
            token,
        }))
    }

    async fn unlock(&self, lease: &LeaseToken) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

#[async_trait]
impl SnapshotTimes for RedisCoordinator {
    async fn last_snapshot(&self, document_id: i64) -> Result<Option<DateTime<Utc>>, LockError> {
        let mut conn = self.conn.clone();
        let millis: Option<i64> = redis::cmd("GET")
            .arg(snapshot_time_key(document_id))
            .query_async(&mut conn)
            .await?;
        Ok(millis
            .filter(|ms| *ms > 0)
            .and_then(DateTime::from_timestamp_millis))
    }

    async fn record_snapshot(
        &self,
        document_id: i64,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(snapshot_time_key(document_id))
            .arg(at.timestamp_millis())
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

// ============================================================================
// In-process
// ============================================================================

#[derive(Default)]
pub struct MemoryCoordinator {
    leases: Mutex<HashMap<String, (String, Instant)>>,
    times: Mutex<HashMap<i64, (DateTime<Utc>, Instant)>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for MemoryCoordinator {
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>, LockError> {
        let mut leases = self.leases.lock();
        let now = Instant::now();
        if let Some((_, expires)) = leases.get(key) {
            if *expires > now {
                debug!(key, "Lease held elsewhere");
                return Ok(None);
            }
        }
        let token = new_token();
        leases.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(Some(LeaseToken {
            key: key.to_string(),
            token,
        }))
    }

    async fn unlock(&self, lease: &LeaseToken) -> Result<bool, LockError> {
        let mut leases = self.leases.lock();
        let held = leases
            .get(&lease.key)
            .is_some_and(|(token, expires)| *token == lease.token && *expires > Instant::now());
        if held {
            leases.remove(&lease.key);
        }
        Ok(held)
    }
}

#[async_trait]
impl SnapshotTimes for MemoryCoordinator {
    async fn last_snapshot(&self, document_id: i64) -> Result<Option<DateTime<Utc>>, LockError> {
        let times = self.times.lock();
        Ok(times
            .get(&document_id)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(at, _)| *at))
    }

    async fn record_snapshot(
        &self,
        document_id: i64,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), LockError> {
        self.times
            .lock()
            .insert(document_id, (at, Instant::now() + ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let coordinator = MemoryCoordinator::new();
        let key = snapshot_lock_key(1);

        let lease = coordinator
            .try_lock(&key, Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert!(coordinator
            .try_lock(&key, Duration::from_secs(10))
            .await
            .unwrap()
            .is_none());

        let stranger = LeaseToken {
            key: key.clone(),
            token: "other".into(),
        };
        assert!(!coordinator.unlock(&stranger).await.unwrap());
        assert!(coordinator.unlock(&lease).await.unwrap());
        assert!(coordinator
            .try_lock(&key, Duration::from_secs(10))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let coordinator = MemoryCoordinator::new();
        let key = snapshot_lock_key(2);

        let stale = coordinator
            .try_lock(&key, Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(coordinator
            .try_lock(&key, Duration::from_secs(10))
            .await
            .unwrap()
            .is_some());
        assert!(!coordinator.unlock(&stale).await.unwrap());
    }

    #[tokio::test]
    async fn snapshot_times_expire() {
        let coordinator = MemoryCoordinator::new();
        let at = Utc::now();
        coordinator
            .record_snapshot(3, at, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(coordinator.last_snapshot(3).await.unwrap(), Some(at));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coordinator.last_snapshot(3).await.unwrap(), None);
    }
}
