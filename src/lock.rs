//! Singleton lock and maintenance gate for the reconcilers.
//!
//! Reconciliation passes run once per deployment. Whoever holds the lock
//! runs the pass; everyone else sees [`ReplicationError::LockUnavailable`]
//! and quietly skips. Locks carry a TTL so a crashed holder cannot wedge
//! reconciliation forever.

use crate::error::{ReplicationError, Result};
use crate::queue::connect_with_retry;
use crate::resilience::RetryConfig;
use crate::BoxFuture;
use rand::Rng;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Proof of lock ownership, handed back on release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub token: String,
}

/// Distributed mutual exclusion for reconciliation passes.
pub trait ReconcileLock: Send + Sync + 'static {
    /// Acquire `key` for `ttl`, or fail with `LockUnavailable` if held.
    fn try_acquire<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, LockLease>;

    /// Push the lease's expiry to `ttl` from now.
    ///
    /// Returns `false` when the lease already expired or was taken over;
    /// the caller no longer holds the lock and must stop.
    fn extend<'a>(&'a self, lease: &'a LockLease, ttl: Duration) -> BoxFuture<'a, bool>;

    /// Release a lease. Releasing an expired or foreign lease is a no-op.
    fn release(&self, lease: LockLease) -> BoxFuture<'_, ()>;
}

fn new_token(owner: &str) -> String {
    let nonce: u64 = rand::thread_rng().gen();
    format!("{owner}:{nonce:016x}")
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Lock on a Redis key (`SET key token NX PX ttl`).
#[derive(Clone)]
pub struct RedisLock {
    conn: ConnectionManager,
    owner: String,
}

impl RedisLock {
    pub async fn connect(redis_url: &str, owner: &str, retry_config: &RetryConfig) -> Result<Self> {
        let conn = connect_with_retry(redis_url, retry_config).await?;
        Ok(Self {
            conn,
            owner: owner.to_string(),
        })
    }
}

impl ReconcileLock for RedisLock {
    fn try_acquire<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, LockLease> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let token = new_token(&self.owner);
            let acquired: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis().max(1) as u64)
                .query_async(&mut conn)
                .await
                .map_err(|e| ReplicationError::redis("SET NX", e))?;

            match acquired {
                Some(_) => Ok(LockLease {
                    key: key.to_string(),
                    token,
                }),
                None => Err(ReplicationError::LockUnavailable {
                    key: key.to_string(),
                }),
            }
        })
    }

    fn extend<'a>(&'a self, lease: &'a LockLease, ttl: Duration) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
                .key(&lease.key)
                .arg(&lease.token)
                .arg(ttl.as_millis().max(1) as u64)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| ReplicationError::redis("lock extend", e))?;
            Ok(extended == 1)
        })
    }

    fn release(&self, lease: LockLease) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let removed: i64 = redis::Script::new(RELEASE_SCRIPT)
                .key(&lease.key)
                .arg(&lease.token)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| ReplicationError::redis("lock release", e))?;
            if removed == 0 {
                debug!(key = %lease.key, "Lock already expired or taken over");
            }
            Ok(())
        })
    }
}

/// In-process lock for single-node deployments and tests.
pub struct LocalLock {
    owner: String,
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl LocalLock {
    pub fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            held: Mutex::new(HashMap::new()),
        }
    }

    fn lock_table(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>> {
        self.held
            .lock()
            .map_err(|_| ReplicationError::Internal("lock table poisoned".into()))
    }
}

impl ReconcileLock for LocalLock {
    fn try_acquire<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, LockLease> {
        let result = self.lock_table().and_then(|mut held| {
            let now = Instant::now();
            if let Some((_, expires)) = held.get(key) {
                if *expires > now {
                    return Err(ReplicationError::LockUnavailable {
                        key: key.to_string(),
                    });
                }
            }
            let token = new_token(&self.owner);
            held.insert(key.to_string(), (token.clone(), now + ttl));
            Ok(LockLease {
                key: key.to_string(),
                token,
            })
        });
        Box::pin(async move { result })
    }

    fn extend<'a>(&'a self, lease: &'a LockLease, ttl: Duration) -> BoxFuture<'a, bool> {
        let result = self.lock_table().map(|mut held| {
            let now = Instant::now();
            match held.get_mut(&lease.key) {
                Some((token, expires)) if *token == lease.token && *expires > now => {
                    *expires = now + ttl;
                    true
                }
                _ => false,
            }
        });
        Box::pin(async move { result })
    }

    fn release(&self, lease: LockLease) -> BoxFuture<'_, ()> {
        let result = self.lock_table().map(|mut held| {
            if held.get(&lease.key).is_some_and(|(token, _)| *token == lease.token) {
                held.remove(&lease.key);
            }
        });
        Box::pin(async move { result })
    }
}

/// Signals that bulk maintenance is running and background repair must pause.
pub trait MaintenanceGate: Send + Sync + 'static {
    fn in_maintenance(&self) -> bool;
}

/// A gate flipped by whoever coordinates maintenance windows.
#[derive(Debug, Default)]
pub struct MaintenanceFlag(AtomicBool);

impl MaintenanceFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, in_maintenance: bool) {
        self.0.store(in_maintenance, Ordering::Release);
    }
}

impl MaintenanceGate for MaintenanceFlag {
    fn in_maintenance(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
