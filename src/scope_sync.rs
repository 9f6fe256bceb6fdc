//! Scope reconciliation.
//!
//! Detects drift for one container independent of message delivery, so a
//! change whose message was silently lost is still repaired. A pass:
//!
//! 1. checks the queue backlog and does nothing above the threshold,
//! 2. takes the singleton lock (held elsewhere: nothing to do),
//! 3. expands the container on the source and on the replica,
//! 4. emits one synthetic change record per difference.
//!
//! The synthetic records go through the queue like any other change. This
//! module never writes the replica.
//!
//! | Source | Replica | Emitted |
//! |--------|---------|---------|
//! | present | absent | CREATE |
//! | etag A | etag B | UPDATE |
//! | absent | present, object still exists upstream | UPDATE (moved out of scope) |
//! | absent | present, object gone upstream | DELETE |
//!
//! Nothing is kept between passes.

use crate::change::{ChangeRecord, ChangeType};
use crate::config::{LockConfig, ScopeSyncConfig};
use crate::error::{ReplicationError, Result};
use crate::ledger::ChangeLedger;
use crate::lock::ReconcileLock;
use crate::metrics;
use crate::publisher::ChangePublisher;
use crate::queue::MessageQueue;
use crate::replica::ReplicaStore;
use crate::scope::{ExpandLimits, ReconciliationScope, ReplicaSide, ScopeMember, SourceSide};
use crate::source::ObjectSource;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

const LOCK_NAME: &str = "scope-sync";

/// One difference between the source and the replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drift {
    /// In the source scope, missing from the replica.
    Missing(ScopeMember),
    /// In both, with different etags. Carries the source member.
    Changed(ScopeMember),
    /// In the replica scope only. Carries the replica member.
    Extra(ScopeMember),
}

/// Compare two expansions of the same container, member by `(type, id)`.
pub fn diff_scopes(source: &ReconciliationScope, replica: &ReconciliationScope) -> Vec<Drift> {
    let mut drift = Vec::new();
    for (key, member) in &source.members {
        match replica.members.get(key) {
            None => drift.push(Drift::Missing(member.clone())),
            Some(held) if held.etag != member.etag => drift.push(Drift::Changed(member.clone())),
            Some(_) => {}
        }
    }
    for (key, member) in &replica.members {
        if !source.members.contains_key(key) {
            drift.push(Drift::Extra(member.clone()));
        }
    }
    drift
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeSkip {
    Disabled,
    Backlog { backlog: u64, threshold: u64 },
    LockHeld,
}

impl ScopeSkip {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeSkip::Disabled => "disabled",
            ScopeSkip::Backlog { .. } => "backlog",
            ScopeSkip::LockHeld => "lock_held",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeStats {
    pub source_members: usize,
    pub replica_members: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub send_failures: usize,
    /// Synthetic records actually sent, in order.
    pub emitted: Vec<ChangeRecord>,
}

impl ScopeStats {
    pub fn deltas(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeOutcome {
    Reconciled(ScopeStats),
    Skipped(ScopeSkip),
}

pub struct ReplicationReconciler {
    source: Arc<dyn ObjectSource>,
    replica: Arc<dyn ReplicaStore>,
    ledger: Arc<dyn ChangeLedger>,
    queue: Arc<dyn MessageQueue>,
    publisher: ChangePublisher,
    lock: Arc<dyn ReconcileLock>,
    config: ScopeSyncConfig,
    lock_key: String,
    lock_ttl: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ReplicationReconciler {
    pub fn new(
        source: Arc<dyn ObjectSource>,
        replica: Arc<dyn ReplicaStore>,
        ledger: Arc<dyn ChangeLedger>,
        queue: Arc<dyn MessageQueue>,
        lock: Arc<dyn ReconcileLock>,
        config: ScopeSyncConfig,
        lock_config: &LockConfig,
    ) -> Self {
        let publisher = ChangePublisher::new(Arc::clone(&queue), Arc::clone(&ledger));
        Self {
            source,
            replica,
            ledger,
            queue,
            publisher,
            lock,
            config,
            lock_key: lock_config.key(LOCK_NAME),
            lock_ttl: lock_config.ttl_duration(),
            shutdown: None,
        }
    }

    /// Abort expansion once `shutdown` flips to true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn config(&self) -> &ScopeSyncConfig {
        &self.config
    }

    /// Reconcile one container scope.
    #[instrument(skip(self), name = "scope_sync")]
    pub async fn reconcile(&self, container_id: &str) -> Result<ScopeOutcome> {
        if !self.config.enabled {
            return Ok(self.skipped(ScopeSkip::Disabled));
        }

        let backlog = self.queue.approximate_backlog().await?;
        metrics::set_queue_backlog(backlog);
        if backlog > self.config.backlog_threshold {
            return Ok(self.skipped(ScopeSkip::Backlog {
                backlog,
                threshold: self.config.backlog_threshold,
            }));
        }

        let lease = match self.lock.try_acquire(&self.lock_key, self.lock_ttl).await {
            Ok(lease) => lease,
            Err(ReplicationError::LockUnavailable { .. }) => {
                return Ok(self.skipped(ScopeSkip::LockHeld));
            }
            Err(e) => return Err(e),
        };

        let result = self.pass(container_id).await;

        if let Err(e) = self.lock.release(lease).await {
            warn!(key = %self.lock_key, error = %e, "Failed to release scope-sync lock");
        }
        if let Err(e) = &result {
            warn!(container_id, error = %e, "Scope reconciliation failed, next trigger will retry");
            metrics::record_error("scope_sync", e.kind());
        }
        result.map(ScopeOutcome::Reconciled)
    }

    fn skipped(&self, reason: ScopeSkip) -> ScopeOutcome {
        debug!(reason = reason.as_str(), ?reason, "Scope pass skipped");
        metrics::record_scope_skipped(reason.as_str());
        ScopeOutcome::Skipped(reason)
    }

    async fn pass(&self, container_id: &str) -> Result<ScopeStats> {
        let started = Instant::now();
        let limits = ExpandLimits {
            max_members: Some(self.config.max_scope_members),
            cancel: self.shutdown.as_ref(),
        };

        let source_scope =
            ReconciliationScope::expand(&SourceSide(self.source.as_ref()), container_id, limits.clone())
                .await?;
        let replica_scope =
            ReconciliationScope::expand(&ReplicaSide(self.replica.as_ref()), container_id, limits)
                .await?;

        let mut stats = ScopeStats {
            source_members: source_scope.len(),
            replica_members: replica_scope.len(),
            ..Default::default()
        };

        let drift = diff_scopes(&source_scope, &replica_scope);
        if drift.is_empty() {
            debug!(container_id, members = stats.source_members, "Scope in sync");
            metrics::record_scope_pass(stats.source_members, started.elapsed());
            return Ok(stats);
        }

        let stamp = self.ledger.current_change_number().await?.unwrap_or(0);

        for delta in drift {
            let (member, change_type) = match delta {
                Drift::Missing(member) => (member, ChangeType::Create),
                Drift::Changed(member) => (member, ChangeType::Update),
                Drift::Extra(member) => {
                    let upstream = self.source.fetch(&member.object_type, &member.object_id).await?;
                    let change_type = if upstream.is_some() {
                        ChangeType::Update
                    } else {
                        ChangeType::Delete
                    };
                    (member, change_type)
                }
            };

            let record = ChangeRecord::synthetic(stamp, &member.object_type, &member.object_id, change_type);
            match self.publisher.send_unmarked(&record).await {
                Ok(_) => {
                    match change_type {
                        ChangeType::Create => stats.creates += 1,
                        ChangeType::Update => stats.updates += 1,
                        ChangeType::Delete => stats.deletes += 1,
                    }
                    stats.emitted.push(record);
                }
                Err(e) => {
                    warn!(
                        container_id,
                        object_id = %member.object_id,
                        change_type = %change_type,
                        error = %e,
                        "Failed to send synthetic change"
                    );
                    stats.send_failures += 1;
                }
            }
        }

        metrics::record_scope_deltas(stats.creates, stats.updates, stats.deletes);
        metrics::record_scope_pass(stats.source_members, started.elapsed());
        info!(
            container_id,
            source_members = stats.source_members,
            replica_members = stats.replica_members,
            creates = stats.creates,
            updates = stats.updates,
            deletes = stats.deletes,
            send_failures = stats.send_failures,
            "Scope reconciled"
        );
        Ok(stats)
    }
}
