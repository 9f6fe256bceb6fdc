//! # Replication Worker
//!
//! Keeps a replica store eventually consistent with a source of truth by
//! moving change events through a durable queue.
//!
//! ## Architecture
//!
//! ```text
//!  ChangeLedger ──publish──► MessageQueue ──lease──► QueueConsumerPool
//!  + sent marks              (Redis stream)                  │
//!       ▲                         ▲                          ▼
//!       │ checksum windows        │ synthetic records   ReplicationManager
//!       │                         │                     (guarded upserts)
//!  ChangeSendReconciler     ReplicationReconciler            │
//!  (lost sends)             (scope drift)                    ▼
//!                                                       ReplicaStore
//! ```
//!
//! ## Three layers of repair
//!
//! 1. **Delivery**: the queue redelivers anything not deleted before its lease
//!    expires. Consumers are idempotent, so redelivery is always safe.
//! 2. **Send repair**: [`ChangeSendReconciler`] compares the ledger with the
//!    sent marks window by window and republishes what never left.
//! 3. **Scope repair**: [`ReplicationReconciler`] diffs a container on both
//!    sides and enqueues synthetic changes for whatever differs.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replication_worker::{MaintenanceFlag, ObjectSource, ReplicationConfig, ReplicationService};
//! use std::sync::Arc;
//!
//! # async fn run(source: Arc<dyn ObjectSource>) -> replication_worker::Result<()> {
//! let config = ReplicationConfig::for_testing("worker-1");
//! let service = ReplicationService::connect(config, source, Arc::new(MaintenanceFlag::new())).await?;
//! service.start().await?;
//!
//! service.request_scope_reconcile("container-42");
//!
//! service.shutdown(None).await;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod change;
pub mod change_sync;
pub mod circuit_breaker;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod manager;
pub mod metrics;
pub mod publisher;
pub mod queue;
pub mod replica;
pub mod resilience;
pub mod scope;
pub mod scope_sync;
pub mod source;
mod sqlite;

/// Boxed future returned by the port traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

// Re-exports for convenience
pub use change::{ChangeMessage, ChangeRecord, ChangeType, Checksum, RangeChecksum};
pub use change_sync::{ChangeSendReconciler, PassOutcome, PassStats};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, ReplicationCircuit};
pub use config::{
    ChangeSyncConfig, LedgerConfig, LockConfig, QueueConfig, ReplicaConfig, ReplicationConfig,
    ScopeSyncConfig,
};
pub use consumer::{ChangeHandler, CycleStats, Deadline, QueueConsumerPool};
pub use coordinator::{HealthCheck, ReplicationService, ServicePorts, ServiceState};
pub use error::{Disposition, ReplicationError, Result};
pub use ledger::{ChangeLedger, SqliteLedger};
pub use lock::{LocalLock, LockLease, MaintenanceFlag, MaintenanceGate, ReconcileLock, RedisLock};
pub use manager::{ReplicationManager, ReplicationStats};
pub use publisher::ChangePublisher;
pub use queue::{MessageQueue, QueueMessage, RedisStreamQueue};
pub use replica::{ReplicaRecord, ReplicaStore, ReplicaWrite, SqliteReplicaStore, WriteOutcome};
pub use scope::{ReconciliationScope, ScopeMember};
pub use scope_sync::{ReplicationReconciler, ScopeOutcome, ScopeStats};
pub use source::{ObjectSnapshot, ObjectSource};
