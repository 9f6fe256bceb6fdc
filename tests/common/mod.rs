//! Shared test utilities for scenario, property and integration tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - An in-memory leased queue driven by the tokio clock
//! - An in-memory object source with a containment tree
//! - Handlers that script failures per change number

#![allow(dead_code)]

pub mod containers;

pub use containers::*;

use replication_worker::{
    BoxFuture, ChangeHandler, ChangeMessage, ChangeRecord, Deadline, MessageQueue, ObjectSnapshot,
    ObjectSource, QueueMessage, ReplicationError, ScopeMember,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub const ENTITY: &str = "entity";
pub const FOLDER: &str = "folder";

// =============================================================================
// MemoryQueue
// =============================================================================

#[derive(Debug, Clone)]
struct Slot {
    id: String,
    body: String,
    leased_until: Option<Instant>,
    deliveries: u32,
}

/// FIFO queue with visibility leases.
///
/// A received message is invisible until its lease expires, then it is
/// handed out again with `redelivered = true`.
#[derive(Default)]
pub struct MemoryQueue {
    slots: Mutex<Vec<Slot>>,
    next_id: AtomicUsize,
    deleted: Mutex<Vec<String>>,
    pub fail_sends: AtomicBool,
    /// Overrides the reported backlog when set.
    pub backlog_override: Mutex<Option<u64>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message carrying `records`.
    pub fn push_records(&self, records: Vec<ChangeRecord>) -> String {
        let body = ChangeMessage { changes: records }.encode().unwrap();
        self.push_body(body)
    }

    pub fn push_body(&self, body: String) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{n}-0");
        self.slots.lock().unwrap().push(Slot {
            id: id.clone(),
            body,
            leased_until: None,
            deliveries: 0,
        });
        id
    }

    /// Messages not yet deleted.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    /// Every record carried by a message still in the queue.
    pub fn queued_records(&self) -> Vec<ChangeRecord> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter_map(|slot| ChangeMessage::decode(&slot.body).ok())
            .flat_map(|message| message.changes)
            .collect()
    }

    /// Change numbers of every queued record, sorted.
    pub fn queued_change_numbers(&self) -> Vec<i64> {
        let mut numbers: Vec<i64> = self.queued_records().iter().map(|r| r.change_number).collect();
        numbers.sort_unstable();
        numbers
    }

    pub fn deliveries(&self, id: &str) -> u32 {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .find(|slot| slot.id == id)
            .map(|slot| slot.deliveries)
            .unwrap_or(0)
    }
}

impl MessageQueue for MemoryQueue {
    fn receive(&self, max_messages: usize, lease: Duration) -> BoxFuture<'_, Vec<QueueMessage>> {
        let now = Instant::now();
        let mut slots = self.slots.lock().unwrap();
        let mut batch = Vec::new();
        for slot in slots.iter_mut() {
            if batch.len() >= max_messages {
                break;
            }
            let visible = slot.leased_until.map_or(true, |until| until <= now);
            if !visible {
                continue;
            }
            slot.leased_until = Some(now + lease);
            slot.deliveries += 1;
            batch.push(QueueMessage {
                id: slot.id.clone(),
                body: slot.body.clone(),
                redelivered: slot.deliveries > 1,
            });
        }
        Box::pin(async move { Ok(batch) })
    }

    fn delete_batch<'a>(&'a self, messages: &'a [QueueMessage]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let ids: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
            self.slots.lock().unwrap().retain(|slot| !ids.contains(slot.id.as_str()));
            self.deleted
                .lock()
                .unwrap()
                .extend(messages.iter().map(|m| m.id.clone()));
            Ok(())
        })
    }

    fn send<'a>(&'a self, payload: &'a str) -> BoxFuture<'a, String> {
        Box::pin(async move {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(ReplicationError::redis_msg("XADD", "queue unavailable"));
            }
            Ok(self.push_body(payload.to_string()))
        })
    }

    fn approximate_backlog(&self) -> BoxFuture<'_, u64> {
        let backlog = self
            .backlog_override
            .lock()
            .unwrap()
            .unwrap_or(self.len() as u64);
        Box::pin(async move { Ok(backlog) })
    }
}

// =============================================================================
// MemorySource
// =============================================================================

/// Source of truth held in memory.
#[derive(Default)]
pub struct MemorySource {
    /// Keyed by `(object_type, object_id)`.
    objects: Mutex<BTreeMap<(String, String), ObjectSnapshot>>,
    /// Fail this many upcoming fetches with a recoverable error.
    pub failing_fetches: AtomicUsize,
    pub fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_entity(&self, id: &str, parent: &str, version: i64, etag: &str) {
        self.put(snapshot(ENTITY, id, Some(parent), Some(version), etag, false));
    }

    pub fn put_folder(&self, id: &str, parent: Option<&str>) {
        self.put(snapshot(FOLDER, id, parent, Some(1), "folder", true));
    }

    pub fn put(&self, snapshot: ObjectSnapshot) {
        self.objects
            .lock()
            .unwrap()
            .insert((snapshot.object_type.clone(), snapshot.object_id.clone()), snapshot);
    }

    /// Remove every object with `id`, whatever its type.
    pub fn remove(&self, id: &str) {
        self.objects.lock().unwrap().retain(|(_, oid), _| oid != id);
    }

    /// First object with `id`, whatever its type.
    pub fn get(&self, id: &str) -> Option<ObjectSnapshot> {
        self.objects
            .lock()
            .unwrap()
            .values()
            .find(|o| o.object_id == id)
            .cloned()
    }

    pub fn get_typed(&self, object_type: &str, id: &str) -> Option<ObjectSnapshot> {
        self.objects
            .lock()
            .unwrap()
            .get(&(object_type.to_string(), id.to_string()))
            .cloned()
    }
}

pub fn snapshot(
    object_type: &str,
    id: &str,
    parent: Option<&str>,
    version: Option<i64>,
    etag: &str,
    is_container: bool,
) -> ObjectSnapshot {
    ObjectSnapshot {
        object_type: object_type.to_string(),
        object_id: id.to_string(),
        object_version: version,
        etag: etag.to_string(),
        parent_id: parent.map(str::to_string),
        is_container,
        payload: serde_json::json!({ "id": id, "etag": etag }),
    }
}

impl ObjectSource for MemorySource {
    fn fetch<'a>(&'a self, object_type: &'a str, object_id: &'a str) -> BoxFuture<'a, Option<ObjectSnapshot>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing_fetches.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_fetches.store(failing - 1, Ordering::SeqCst);
                return Err(ReplicationError::recoverable("source_fetch", "source timed out"));
            }
            Ok(self.get_typed(object_type, object_id))
        })
    }

    fn list_children<'a>(&'a self, container_id: &'a str) -> BoxFuture<'a, Vec<ScopeMember>> {
        Box::pin(async move {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .values()
                .filter(|o| o.parent_id.as_deref() == Some(container_id))
                .map(ObjectSnapshot::summary)
                .collect())
        })
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Records every change number it sees; fails the ones it is told to.
#[derive(Default)]
pub struct ScriptedHandler {
    pub seen: Mutex<Vec<i64>>,
    /// Change number -> number of attempts that fail recoverably.
    pub recoverable_failures: Mutex<HashMap<i64, usize>>,
    pub permanent: Mutex<HashSet<i64>>,
    pub calls: AtomicUsize,
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_recoverably(&self, change_number: i64, times: usize) {
        self.recoverable_failures
            .lock()
            .unwrap()
            .insert(change_number, times);
    }

    pub fn fail_permanently(&self, change_number: i64) {
        self.permanent.lock().unwrap().insert(change_number);
    }

    pub fn seen(&self) -> Vec<i64> {
        self.seen.lock().unwrap().clone()
    }
}

impl ChangeHandler for ScriptedHandler {
    fn process(&self, batch: Vec<ChangeRecord>, _deadline: Deadline) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for record in &batch {
                self.seen.lock().unwrap().push(record.change_number);
                if self.permanent.lock().unwrap().contains(&record.change_number) {
                    return Err(ReplicationError::permanent(record.change_number, "unresolvable"));
                }
                let mut failures = self.recoverable_failures.lock().unwrap();
                if let Some(left) = failures.get_mut(&record.change_number) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(ReplicationError::recoverable("handler", "downstream busy"));
                    }
                }
            }
            Ok(())
        })
    }
}

/// Sleeps for `delay` on every call.
pub struct SlowHandler {
    pub delay: Duration,
    pub finished: AtomicUsize,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            finished: AtomicUsize::new(0),
        }
    }
}

impl ChangeHandler for SlowHandler {
    fn process(&self, _batch: Vec<ChangeRecord>, _deadline: Deadline) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// A change record with an explicit version.
pub fn entity_change(
    change_number: i64,
    id: &str,
    version: Option<i64>,
    change_type: replication_worker::ChangeType,
) -> ChangeRecord {
    let record = ChangeRecord::new(change_number, ENTITY, id, change_type);
    match version {
        Some(v) => record.with_version(v),
        None => record,
    }
}
