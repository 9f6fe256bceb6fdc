//! Configuration for the replication worker.
//!
//! Configuration is passed to [`ReplicationService::new()`](crate::ReplicationService::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use replication_worker::config::ReplicationConfig;
//!
//! let mut config = ReplicationConfig::for_testing("worker-1");
//! config.queue.max_workers = 4;
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── node_id: String                # This worker's identity (consumer name, lock owner)
//! ├── queue: QueueConfig             # Stream identity, lease, worker pool
//! ├── change_sync: ChangeSyncConfig  # Sent-mark repair pass
//! ├── scope_sync: ScopeSyncConfig    # Scope drift reconciliation
//! ├── replica: ReplicaConfig         # Replica store + transactional group size
//! ├── ledger: LedgerConfig           # Change ledger store
//! └── lock: LockConfig               # Singleton reconciler lock
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node_id: "worker-a"
//! queue:
//!   redis_url: "redis://queue:6379"
//!   stream_key: "replication:changes"
//!   lease_seconds: 30
//!   max_workers: 10
//! change_sync:
//!   interval: "1m"
//!   base_page_size: 10000
//!   page_size_variance: 1000
//! scope_sync:
//!   backlog_threshold: 1000
//! ```

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest visibility lease the queue honours.
pub const MAX_LEASE_SECONDS: u64 = 60;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationService::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Identity of this worker process.
    /// Used as the queue consumer name and as the lock owner token prefix.
    pub node_id: String,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub change_sync: ChangeSyncConfig,

    #[serde(default)]
    pub scope_sync: ScopeSyncConfig,

    #[serde(default)]
    pub replica: ReplicaConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub lock: LockConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_id: "replication-worker-default".to_string(),
            queue: QueueConfig::default(),
            change_sync: ChangeSyncConfig::default(),
            scope_sync: ScopeSyncConfig::default(),
            replica: ReplicaConfig::default(),
            ledger: LedgerConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config for testing: in-memory stores, short intervals.
    pub fn for_testing(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            queue: QueueConfig::for_testing(),
            change_sync: ChangeSyncConfig::for_testing(),
            scope_sync: ScopeSyncConfig::default(),
            replica: ReplicaConfig::in_memory(),
            ledger: LedgerConfig::in_memory(),
            lock: LockConfig::default(),
        }
    }

    /// Reject configurations the worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(ReplicationError::Config("node_id must not be empty".into()));
        }
        if self.queue.stream_key.trim().is_empty() || self.queue.consumer_group.trim().is_empty() {
            return Err(ReplicationError::Config(
                "queue.stream_key and queue.consumer_group are required".into(),
            ));
        }
        if self.queue.max_workers == 0 {
            return Err(ReplicationError::Config("queue.max_workers must be > 0".into()));
        }
        let fraction = self.queue.deadline_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ReplicationError::Config(
                "queue.deadline_fraction must be in (0, 1]".into(),
            ));
        }
        if self.change_sync.base_page_size == 0 {
            return Err(ReplicationError::Config(
                "change_sync.base_page_size must be > 0".into(),
            ));
        }
        if self.replica.group_size == 0 {
            return Err(ReplicationError::Config("replica.group_size must be > 0".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueueConfig: queue identity, lease, worker pool
// ═══════════════════════════════════════════════════════════════════════════════

/// Managed queue and consumer pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// When false the consumer pool never polls.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Stream holding change messages.
    #[serde(default = "default_stream_key")]
    pub stream_key: String,

    /// Consumer group shared by every worker process.
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Consumer name within the group. Defaults to the node id.
    #[serde(default)]
    pub consumer_name: Option<String>,

    /// Upper bound on concurrently running handlers per process.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Visibility lease in seconds. Clamped to [`MAX_LEASE_SECONDS`].
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,

    /// Messages leased per worker slot in a single receive.
    #[serde(default = "default_max_messages_per_worker")]
    pub max_messages_per_worker: usize,

    /// Sleep between polls when the queue returned nothing (e.g., "1s").
    #[serde(default = "default_idle_poll_delay")]
    pub idle_poll_delay: String,

    /// Fraction of the lease after which running workers are abandoned.
    #[serde(default = "default_deadline_fraction")]
    pub deadline_fraction: f64,
}

fn default_true() -> bool {
    true
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_stream_key() -> String {
    "replication:changes".to_string()
}

fn default_consumer_group() -> String {
    "replication-workers".to_string()
}

fn default_max_workers() -> usize {
    10
}

fn default_lease_seconds() -> u64 {
    30
}

fn default_max_messages_per_worker() -> usize {
    1
}

fn default_idle_poll_delay() -> String {
    "1s".to_string()
}

fn default_deadline_fraction() -> f64 {
    0.9
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: default_redis_url(),
            stream_key: default_stream_key(),
            consumer_group: default_consumer_group(),
            consumer_name: None,
            max_workers: default_max_workers(),
            lease_seconds: default_lease_seconds(),
            max_messages_per_worker: default_max_messages_per_worker(),
            idle_poll_delay: default_idle_poll_delay(),
            deadline_fraction: default_deadline_fraction(),
        }
    }
}

impl QueueConfig {
    pub fn for_testing() -> Self {
        Self {
            max_workers: 4,
            lease_seconds: 2,
            idle_poll_delay: "10ms".to_string(),
            ..Self::default()
        }
    }

    /// Lease duration, clamped to `1..=MAX_LEASE_SECONDS`.
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds.clamp(1, MAX_LEASE_SECONDS))
    }

    /// Soft deadline measured from the start of a poll cycle.
    pub fn soft_deadline(&self) -> Duration {
        self.lease().mul_f64(self.deadline_fraction.clamp(0.01, 1.0))
    }

    pub fn idle_poll_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.idle_poll_delay).unwrap_or(Duration::from_secs(1))
    }

    /// Maximum messages requested per receive call.
    pub fn max_messages(&self) -> usize {
        self.max_workers
            .saturating_mul(self.max_messages_per_worker.max(1))
    }

    pub fn consumer_name_or<'a>(&'a self, node_id: &'a str) -> &'a str {
        self.consumer_name.as_deref().unwrap_or(node_id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ChangeSyncConfig: sent-mark repair
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the periodic pass that republishes unsent changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Time between passes (e.g., "1m").
    #[serde(default = "default_change_sync_interval")]
    pub interval: String,

    /// Minimum window width in change numbers.
    #[serde(default = "default_base_page_size")]
    pub base_page_size: u64,

    /// Random extra width drawn per pass from `0..page_size_variance`.
    #[serde(default = "default_page_size_variance")]
    pub page_size_variance: u64,

    /// Unsent records younger than this are left to the normal publish path.
    #[serde(default = "default_unsent_grace")]
    pub unsent_grace: String,

    /// Republish throughput cap (records per second).
    #[serde(default = "default_publish_rate_per_sec")]
    pub publish_rate_per_sec: u32,

    #[serde(default = "default_publish_burst")]
    pub publish_burst: u32,
}

fn default_change_sync_interval() -> String {
    "1m".to_string()
}

fn default_base_page_size() -> u64 {
    10_000
}

fn default_page_size_variance() -> u64 {
    1_000
}

fn default_unsent_grace() -> String {
    "1m".to_string()
}

fn default_publish_rate_per_sec() -> u32 {
    1_000
}

fn default_publish_burst() -> u32 {
    100
}

impl Default for ChangeSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_change_sync_interval(),
            base_page_size: default_base_page_size(),
            page_size_variance: default_page_size_variance(),
            unsent_grace: default_unsent_grace(),
            publish_rate_per_sec: default_publish_rate_per_sec(),
            publish_burst: default_publish_burst(),
        }
    }
}

impl ChangeSyncConfig {
    pub fn for_testing() -> Self {
        Self {
            interval: "100ms".to_string(),
            base_page_size: 30,
            page_size_variance: 0,
            unsent_grace: "0s".to_string(),
            publish_rate_per_sec: 100_000,
            publish_burst: 10_000,
            ..Self::default()
        }
    }

    pub fn interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.interval).unwrap_or(Duration::from_secs(60))
    }

    pub fn unsent_grace_duration(&self) -> Duration {
        humantime::parse_duration(&self.unsent_grace).unwrap_or(Duration::from_secs(60))
    }

    pub fn rate_limit_config(&self) -> crate::resilience::RateLimitConfig {
        crate::resilience::RateLimitConfig {
            burst_size: self.publish_burst,
            refill_rate: self.publish_rate_per_sec,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ScopeSyncConfig: scope drift reconciliation
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for trigger-driven scope reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeSyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// A pass only starts while the queue backlog is at or below this.
    #[serde(default = "default_backlog_threshold")]
    pub backlog_threshold: u64,

    /// Accepted triggers per second; extra triggers are dropped.
    #[serde(default = "default_trigger_rate_per_sec")]
    pub trigger_rate_per_sec: u32,

    #[serde(default = "default_trigger_burst")]
    pub trigger_burst: u32,

    /// Pending triggers buffered before new ones are dropped.
    #[serde(default = "default_trigger_queue_depth")]
    pub trigger_queue_depth: usize,

    /// Expansion aborts once a scope exceeds this many members.
    #[serde(default = "default_max_scope_members")]
    pub max_scope_members: usize,
}

fn default_backlog_threshold() -> u64 {
    1_000
}

fn default_trigger_rate_per_sec() -> u32 {
    1
}

fn default_trigger_burst() -> u32 {
    5
}

fn default_trigger_queue_depth() -> usize {
    64
}

fn default_max_scope_members() -> usize {
    100_000
}

impl Default for ScopeSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backlog_threshold: default_backlog_threshold(),
            trigger_rate_per_sec: default_trigger_rate_per_sec(),
            trigger_burst: default_trigger_burst(),
            trigger_queue_depth: default_trigger_queue_depth(),
            max_scope_members: default_max_scope_members(),
        }
    }
}

impl ScopeSyncConfig {
    pub fn rate_limit_config(&self) -> crate::resilience::RateLimitConfig {
        crate::resilience::RateLimitConfig {
            burst_size: self.trigger_burst,
            refill_rate: self.trigger_rate_per_sec,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store configs
// ═══════════════════════════════════════════════════════════════════════════════

/// Replica store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub sqlite_path: String,

    /// Records applied per transaction.
    #[serde(default = "default_group_size")]
    pub group_size: usize,

    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_group_size() -> usize {
    25
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replica.db".to_string(),
            group_size: default_group_size(),
            wal_mode: true,
        }
    }
}

impl ReplicaConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            group_size: default_group_size(),
            wal_mode: false,
        }
    }
}

/// Change ledger store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub sqlite_path: String,

    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "ledger.db".to_string(),
            wal_mode: true,
        }
    }
}

impl LedgerConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

/// Singleton lock for the reconcilers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_prefix")]
    pub key_prefix: String,

    /// Lock expiry. Must exceed the longest expected pass.
    #[serde(default = "default_lock_ttl")]
    pub ttl: String,
}

fn default_lock_prefix() -> String {
    "replication:lock:".to_string()
}

fn default_lock_ttl() -> String {
    "10m".to_string()
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_lock_prefix(),
            ttl: default_lock_ttl(),
        }
    }
}

impl LockConfig {
    pub fn ttl_duration(&self) -> Duration {
        humantime::parse_duration(&self.ttl).unwrap_or(Duration::from_secs(600))
    }

    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
