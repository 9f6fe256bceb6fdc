// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication manager: applies change batches to the replica.
//!
//! # Processing a batch
//!
//! ```text
//! records ──► validate ──► dedup (latest per object) ──► build writes ──► apply in groups
//!               │                                          │                 │
//!               └ malformed: skipped, logged               │                 └ one transaction
//!                                                          ├ CREATE/UPDATE: fetch snapshot,
//!                                                          │   upsert guarded by (version, cn)
//!                                                          ├ DELETE (no version): remove object
//!                                                          └ DELETE (versioned): no-op
//! ```
//!
//! Applying the same batch twice leaves the replica exactly as applying it
//! once: upserts are guarded, deletes are guarded by change number, and the
//! content written is always the source's current snapshot.
//!
//! A transient failure (source or replica) fails the whole batch so the
//! message is redelivered. A record that can never apply is skipped so its
//! siblings still complete.

use crate::change::{ChangeRecord, ChangeType};
use crate::circuit_breaker::ReplicationCircuit;
use crate::consumer::{ChangeHandler, Deadline};
use crate::error::{Disposition, ReplicationError, Result};
use crate::metrics;
use crate::replica::{ReplicaRecord, ReplicaStore, ReplicaWrite, WriteOutcome};
use crate::source::ObjectSource;
use crate::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Per-batch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    pub records: usize,
    /// Dropped because a later change for the same object was in the batch.
    pub deduped: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub stale: usize,
    pub deleted: usize,
    /// Deletes for objects the replica never held.
    pub absent: usize,
    /// Upserts whose object no longer exists upstream.
    pub not_found: usize,
    /// Malformed or otherwise unrecoverable records.
    pub skipped: usize,
    /// Version-scoped deletes, which this layer ignores.
    pub ignored_deletes: usize,
}

impl ReplicationStats {
    fn tally(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Applied => self.applied += 1,
            WriteOutcome::Unchanged => self.unchanged += 1,
            WriteOutcome::Stale => self.stale += 1,
            WriteOutcome::Deleted => self.deleted += 1,
            WriteOutcome::Absent => self.absent += 1,
        }
    }
}

/// Keep only the highest change number per object, in change-number order.
pub fn latest_per_object(records: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
    let mut latest: HashMap<(String, String), ChangeRecord> = HashMap::with_capacity(records.len());
    for record in records {
        let key = (record.object_type.clone(), record.object_id.clone());
        match latest.get(&key) {
            Some(existing) if existing.change_number >= record.change_number => {}
            _ => {
                latest.insert(key, record);
            }
        }
    }
    let mut records: Vec<ChangeRecord> = latest.into_values().collect();
    records.sort_by_key(|r| r.change_number);
    records
}

pub struct ReplicationManager {
    replica: Arc<dyn ReplicaStore>,
    source: Arc<dyn ObjectSource>,
    circuit: ReplicationCircuit,
    group_size: usize,
}

impl ReplicationManager {
    pub fn new(replica: Arc<dyn ReplicaStore>, source: Arc<dyn ObjectSource>, group_size: usize) -> Self {
        Self {
            replica,
            source,
            circuit: ReplicationCircuit::new(),
            group_size: group_size.max(1),
        }
    }

    pub fn with_circuit(mut self, circuit: ReplicationCircuit) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn replica(&self) -> &Arc<dyn ReplicaStore> {
        &self.replica
    }

    pub fn circuit(&self) -> &ReplicationCircuit {
        &self.circuit
    }

    /// Apply `batch` with no deadline.
    pub async fn replicate(&self, batch: Vec<ChangeRecord>) -> Result<ReplicationStats> {
        self.replicate_until(batch, None).await
    }

    /// Apply `batch`, stopping between groups once `deadline` has passed.
    ///
    /// Stopping early returns `RecoverableDelivery`: the groups already
    /// applied stay applied and the redelivery redoes the rest.
    #[instrument(skip_all, fields(records = batch.len()))]
    pub async fn replicate_until(
        &self,
        batch: Vec<ChangeRecord>,
        deadline: Option<Deadline>,
    ) -> Result<ReplicationStats> {
        let started = Instant::now();
        let mut stats = ReplicationStats {
            records: batch.len(),
            ..Default::default()
        };

        let mut valid = Vec::with_capacity(batch.len());
        for record in batch {
            match record.validate() {
                Ok(()) => valid.push(record),
                Err(e) => {
                    warn!(change_number = record.change_number, error = %e, "Skipping malformed record");
                    stats.skipped += 1;
                }
            }
        }

        let before = valid.len();
        let records = latest_per_object(valid);
        stats.deduped = before - records.len();
        metrics::record_batch_dedup(before, records.len());

        let mut writes = Vec::with_capacity(records.len());
        for record in &records {
            match self.write_for(record).await {
                Ok(Some(write)) => writes.push(write),
                Ok(None) => stats.ignored_deletes += 1,
                Err(e) => match e.disposition() {
                    Disposition::Acknowledge => {
                        if matches!(e, ReplicationError::NotFound { .. }) {
                            debug!(change_number = record.change_number, "Object gone upstream");
                            stats.not_found += 1;
                        } else {
                            warn!(change_number = record.change_number, error = %e, "Skipping record");
                            stats.skipped += 1;
                        }
                    }
                    Disposition::Retain => return Err(e),
                },
            }
        }

        for group in writes.chunks(self.group_size) {
            if let Some(deadline) = deadline {
                if deadline.is_expired() {
                    warn!(
                        applied = stats.applied + stats.deleted,
                        remaining = group.len(),
                        "Deadline passed mid-batch, leaving rest for redelivery"
                    );
                    return Err(ReplicationError::recoverable(
                        "replicate",
                        "deadline passed before batch completed",
                    ));
                }
            }

            let outcomes = self
                .circuit
                .writes
                .guard("replica_apply", || self.replica.apply(group))
                .await?;
            for outcome in outcomes {
                stats.tally(outcome);
            }
        }

        if stats.stale > 0 {
            debug!(stale = stats.stale, "Ignored out-of-order redeliveries");
        }
        metrics::record_replication_batch(
            stats.records,
            stats.applied,
            stats.unchanged,
            stats.stale,
            stats.deleted,
            stats.skipped,
            started.elapsed(),
        );
        Ok(stats)
    }

    /// Turn a record into a replica write. `None` means nothing to do.
    async fn write_for(&self, record: &ChangeRecord) -> Result<Option<ReplicaWrite>> {
        match record.change_type {
            ChangeType::Delete if record.object_version.is_some() => {
                debug!(
                    change_number = record.change_number,
                    object_id = %record.object_id,
                    "Ignoring version-scoped delete"
                );
                Ok(None)
            }
            ChangeType::Delete => Ok(Some(ReplicaWrite::Delete {
                object_type: record.object_type.clone(),
                object_id: record.object_id.clone(),
                change_number: record.change_number,
            })),
            ChangeType::Create | ChangeType::Update => {
                let snapshot = self
                    .circuit
                    .reads
                    .guard("source_fetch", || {
                        self.source.fetch(&record.object_type, &record.object_id)
                    })
                    .await?
                    .ok_or_else(|| ReplicationError::not_found(&record.object_type, &record.object_id))?;

                Ok(Some(ReplicaWrite::Upsert(ReplicaRecord {
                    object_type: snapshot.object_type,
                    object_id: snapshot.object_id,
                    object_version: snapshot.object_version,
                    etag: snapshot.etag,
                    parent_id: snapshot.parent_id,
                    is_container: snapshot.is_container,
                    change_number: record.change_number,
                    payload: snapshot.payload,
                })))
            }
        }
    }
}

impl ChangeHandler for ReplicationManager {
    fn process(&self, batch: Vec<ChangeRecord>, deadline: Deadline) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.replicate_until(batch, Some(deadline)).await?;
            Ok(())
        })
    }
}
