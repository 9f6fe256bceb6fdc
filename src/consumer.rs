// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue consumer pool.
//!
//! One poller leases messages and feeds a bounded set of worker tasks.
//! Each poll cycle has a soft deadline, a fraction of the lease measured
//! from the start of the cycle. The deadline decides every message's fate:
//!
//! ```text
//!  cycle start                      soft deadline         lease expiry
//!  │ receive │ workers run ...           │                     │
//!  ├─────────┼──────────────────────────-┼─────────────────────┤
//!  │         finished before deadline:   │ still running:      │
//!  │         ok / permanent / not found  │ abandoned, message  │
//!  │         → delete (batched by 10)    │ left for redelivery │
//!  │         recoverable / panic → keep  │                     │
//! ```
//!
//! Abandoned workers are not cancelled. They keep their pool slot until
//! they finish, so handlers must be idempotent under duplicate delivery.
//!
//! The queue's lease is the only coordination between consumer processes;
//! any number of pools can poll the same queue.

use crate::change::{ChangeMessage, ChangeRecord};
use crate::config::QueueConfig;
use crate::error::{Disposition, ReplicationError, Result};
use crate::metrics;
use crate::queue::{MessageQueue, QueueMessage, DELETE_BATCH_SIZE};
use crate::resilience::Bulkhead;
use crate::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Point in time by which a unit of work should be finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn after(duration: Duration) -> Self {
        Self(Instant::now() + duration)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }
}

/// Processes the change records of one queue message.
///
/// The error decides the message's fate (see [`ReplicationError::disposition`]).
/// The deadline is advisory: work past it still completes, but the message
/// will be redelivered.
pub trait ChangeHandler: Send + Sync + 'static {
    fn process(&self, batch: Vec<ChangeRecord>, deadline: Deadline) -> BoxFuture<'_, ()>;
}

/// Per-cycle counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub received: usize,
    /// Handled successfully.
    pub processed: usize,
    /// Failed permanently (or not found / undecodable) and deleted anyway.
    pub acknowledged: usize,
    /// Failed recoverably; left for redelivery.
    pub retained: usize,
    pub panicked: usize,
    /// Still running at the soft deadline.
    pub abandoned: usize,
    pub deleted: usize,
    pub delete_failures: usize,
}

impl CycleStats {
    pub fn merge(&mut self, other: &CycleStats) {
        self.received += other.received;
        self.processed += other.processed;
        self.acknowledged += other.acknowledged;
        self.retained += other.retained;
        self.panicked += other.panicked;
        self.abandoned += other.abandoned;
        self.deleted += other.deleted;
        self.delete_failures += other.delete_failures;
    }
}

enum MessageOutcome {
    Processed,
    Failed(ReplicationError),
    Panicked,
}

async fn process_message(handler: &dyn ChangeHandler, body: &str, deadline: Deadline) -> MessageOutcome {
    let batch = match ChangeMessage::decode(body) {
        Ok(message) => message.changes,
        Err(e) => return MessageOutcome::Failed(e),
    };
    match AssertUnwindSafe(handler.process(batch, deadline)).catch_unwind().await {
        Ok(Ok(())) => MessageOutcome::Processed,
        Ok(Err(e)) => MessageOutcome::Failed(e),
        Err(_) => MessageOutcome::Panicked,
    }
}

/// Bounded worker pool draining the change queue into a [`ChangeHandler`].
pub struct QueueConsumerPool {
    queue: Arc<dyn MessageQueue>,
    handler: Arc<dyn ChangeHandler>,
    config: QueueConfig,
    bulkhead: Bulkhead,
}

impl QueueConsumerPool {
    pub fn new(queue: Arc<dyn MessageQueue>, handler: Arc<dyn ChangeHandler>, config: QueueConfig) -> Self {
        let bulkhead = Bulkhead::for_workers(config.max_workers);
        Self {
            queue,
            handler,
            config,
            bulkhead,
        }
    }

    /// Workers currently holding a slot, including abandoned ones.
    pub fn in_flight(&self) -> usize {
        self.bulkhead.in_use()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Run one poll cycle: receive, dispatch, wait until done or the soft
    /// deadline, delete what should be deleted.
    pub async fn run_cycle(&self) -> Result<CycleStats> {
        let started = Instant::now();
        let deadline = Deadline::at(started + self.config.soft_deadline());
        let per_worker = self.config.max_messages_per_worker.max(1);
        let mut stats = CycleStats::default();

        let free_slots = self.bulkhead.available();
        if free_slots == 0 {
            debug!("All workers busy, skipping receive");
            return Ok(stats);
        }
        let capacity = free_slots.saturating_mul(per_worker).min(self.config.max_messages());

        let messages = self.queue.receive(capacity, self.config.lease()).await?;
        stats.received = messages.len();
        metrics::record_messages_received(messages.len());
        if messages.is_empty() {
            return Ok(stats);
        }

        // Workers report each message as it finishes, so a chunk cut off by
        // the deadline still settles the messages it already handled.
        let (results_tx, mut results) = mpsc::unbounded_channel::<(QueueMessage, MessageOutcome)>();
        let mut outstanding = 0usize;
        for chunk in messages.chunks(per_worker) {
            let Some(permit) = self.bulkhead.try_acquire() else {
                // Left leased; redelivered after the lease.
                warn!(count = chunk.len(), "No free worker slot, leaving messages leased");
                stats.retained += chunk.len();
                continue;
            };
            let handler = Arc::clone(&self.handler);
            let results_tx = results_tx.clone();
            let chunk = chunk.to_vec();
            outstanding += chunk.len();
            tokio::spawn(async move {
                let _permit = permit;
                for message in chunk {
                    let outcome = process_message(handler.as_ref(), &message.body, deadline).await;
                    // The cycle stopped listening at its deadline.
                    let _ = results_tx.send((message, outcome));
                }
            });
        }
        drop(results_tx);
        metrics::set_in_flight_workers(self.bulkhead.in_use());

        let mut pending: Vec<QueueMessage> = Vec::with_capacity(DELETE_BATCH_SIZE);
        let expiry = tokio::time::sleep_until(deadline.instant());
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                biased;

                settled = results.recv() => {
                    let Some((message, outcome)) = settled else { break };
                    outstanding = outstanding.saturating_sub(1);
                    if self.settle(message, outcome, &mut stats, &mut pending) {
                        self.flush(&mut pending, &mut stats).await;
                    }
                }

                _ = &mut expiry => {
                    stats.abandoned = outstanding;
                    metrics::record_workers_abandoned(outstanding);
                    for _ in 0..outstanding {
                        metrics::record_message_outcome("abandoned");
                    }
                    warn!(
                        abandoned = outstanding,
                        deadline_ms = self.config.soft_deadline().as_millis() as u64,
                        "Soft deadline passed, abandoning running workers"
                    );
                    break;
                }
            }
        }

        self.flush(&mut pending, &mut stats).await;
        metrics::record_poll_cycle(stats.received, started.elapsed());
        metrics::set_in_flight_workers(self.bulkhead.in_use());
        debug!(?stats, "Poll cycle complete");
        Ok(stats)
    }

    /// Apply a message's outcome. Returns true when the delete batch is full.
    fn settle(
        &self,
        message: QueueMessage,
        outcome: MessageOutcome,
        stats: &mut CycleStats,
        pending: &mut Vec<QueueMessage>,
    ) -> bool {
        match outcome {
            MessageOutcome::Processed => {
                stats.processed += 1;
                metrics::record_message_outcome("processed");
                pending.push(message);
            }
            MessageOutcome::Failed(e) => match e.disposition() {
                Disposition::Acknowledge => {
                    let label = match &e {
                        ReplicationError::NotFound { .. } => "not_found",
                        ReplicationError::Codec(_) => "undecodable",
                        _ => "permanent",
                    };
                    warn!(message_id = %message.id, error = %e, "Dropping unrecoverable message");
                    stats.acknowledged += 1;
                    metrics::record_message_outcome(label);
                    pending.push(message);
                }
                Disposition::Retain => {
                    warn!(
                        message_id = %message.id,
                        redelivered = message.redelivered,
                        error = %e,
                        "Message left for redelivery"
                    );
                    stats.retained += 1;
                    metrics::record_message_outcome("retained");
                    metrics::record_error("consumer", e.kind());
                }
            },
            MessageOutcome::Panicked => {
                error!(message_id = %message.id, "Handler panicked, message left for redelivery");
                stats.panicked += 1;
                metrics::record_message_outcome("panicked");
            }
        }
        pending.len() >= DELETE_BATCH_SIZE
    }

    async fn flush(&self, pending: &mut Vec<QueueMessage>, stats: &mut CycleStats) {
        if pending.is_empty() {
            return;
        }
        let batch = std::mem::take(pending);
        match self.queue.delete_batch(&batch).await {
            Ok(()) => {
                stats.deleted += batch.len();
                metrics::record_delete_flush(batch.len(), true);
            }
            Err(e) => {
                // Undeleted messages are redelivered and handled again.
                error!(count = batch.len(), error = %e, "Failed to delete messages");
                stats.delete_failures += batch.len();
                metrics::record_delete_flush(batch.len(), false);
            }
        }
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let span = info_span!("consumer_pool", max_workers = self.config.max_workers);
        async {
            if !self.config.enabled {
                info!("Queue consumption disabled");
                let _ = shutdown.wait_for(|stop| *stop).await;
                return;
            }

            info!(lease_secs = self.config.lease().as_secs(), "Consumer pool started");
            let idle_delay = self.config.idle_poll_delay_duration();

            loop {
                if *shutdown.borrow() {
                    break;
                }

                let idle = match self.run_cycle().await {
                    Ok(stats) => stats.received == 0,
                    Err(e) => {
                        warn!(error = %e, "Poll cycle failed");
                        metrics::record_error("consumer", e.kind());
                        true
                    }
                };

                if idle {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(idle_delay) => {}
                    }
                }
            }

            info!("Consumer pool stopped");
        }
        .instrument(span)
        .await
    }

    /// Run cycles until a receive comes back empty or `timeout` elapses.
    ///
    /// Defaults to ten leases.
    pub async fn drain(&self, timeout: Option<Duration>) -> Result<CycleStats> {
        let timeout = timeout.unwrap_or(self.config.lease() * 10);
        let until = Instant::now() + timeout;
        let mut total = CycleStats::default();

        while Instant::now() < until {
            let stats = self.run_cycle().await?;
            total.merge(&stats);
            if stats.received == 0 {
                break;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeType;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Queue that hands out a fixed set of messages once and records deletes.
    #[derive(Default)]
    struct ScriptedQueue {
        waiting: Mutex<VecDeque<QueueMessage>>,
        deleted: Mutex<Vec<Vec<String>>>,
        fail_deletes: bool,
    }

    impl ScriptedQueue {
        fn with_bodies(bodies: &[String]) -> Self {
            let waiting = bodies
                .iter()
                .enumerate()
                .map(|(i, body)| QueueMessage {
                    id: format!("m{}", i + 1),
                    body: body.clone(),
                    redelivered: false,
                })
                .collect();
            Self {
                waiting: Mutex::new(waiting),
                ..Default::default()
            }
        }

        fn deleted_ids(&self) -> Vec<String> {
            self.deleted.lock().unwrap().iter().flatten().cloned().collect()
        }
    }

    impl MessageQueue for ScriptedQueue {
        fn receive(&self, max: usize, _lease: Duration) -> BoxFuture<'_, Vec<QueueMessage>> {
            let mut waiting = self.waiting.lock().unwrap();
            let n = max.min(waiting.len());
            let batch: Vec<_> = waiting.drain(..n).collect();
            Box::pin(async move { Ok(batch) })
        }

        fn delete_batch<'a>(&'a self, messages: &'a [QueueMessage]) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                if self.fail_deletes {
                    return Err(ReplicationError::redis_msg("XACK/XDEL", "connection reset"));
                }
                self.deleted
                    .lock()
                    .unwrap()
                    .push(messages.iter().map(|m| m.id.clone()).collect());
                Ok(())
            })
        }

        fn send<'a>(&'a self, _payload: &'a str) -> BoxFuture<'a, String> {
            Box::pin(async { Ok("0-0".to_string()) })
        }

        fn approximate_backlog(&self) -> BoxFuture<'_, u64> {
            let len = self.waiting.lock().unwrap().len() as u64;
            Box::pin(async move { Ok(len) })
        }
    }

    /// Handler whose behaviour is chosen by the object id of the first record.
    #[derive(Default)]
    struct ScriptedHandler {
        calls: AtomicUsize,
    }

    impl ChangeHandler for ScriptedHandler {
        fn process(&self, batch: Vec<ChangeRecord>, _deadline: Deadline) -> BoxFuture<'_, ()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let id = batch.first().map(|r| r.object_id.clone()).unwrap_or_default();
                match id.as_str() {
                    "recoverable" => Err(ReplicationError::recoverable("replica_apply", "locked")),
                    "permanent" => Err(ReplicationError::permanent(1, "bad")),
                    "gone" => Err(ReplicationError::not_found("entity", "gone")),
                    "panic" => panic!("handler blew up"),
                    "slow" => {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(())
                    }
                    _ => Ok(()),
                }
            })
        }
    }

    fn body(id: &str) -> String {
        ChangeMessage::single(ChangeRecord::new(1, "entity", id, ChangeType::Update))
            .encode()
            .unwrap()
    }

    fn pool(queue: Arc<ScriptedQueue>, handler: Arc<ScriptedHandler>) -> QueueConsumerPool {
        let config = QueueConfig {
            max_workers: 4,
            lease_seconds: 10,
            ..QueueConfig::default()
        };
        QueueConsumerPool::new(queue, handler, config)
    }

    #[tokio::test]
    async fn test_deadline() {
        let deadline = Deadline::after(Duration::from_secs(5));
        assert!(!deadline.is_expired());
        assert!(deadline.remaining() <= Duration::from_secs(5));
        assert!(Deadline::after(Duration::ZERO).is_expired());
    }

    #[tokio::test]
    async fn test_cycle_outcomes() {
        let queue = Arc::new(ScriptedQueue::with_bodies(&[
            body("ok"),
            body("recoverable"),
            body("permanent"),
            body("gone"),
        ]));
        let handler = Arc::new(ScriptedHandler::default());
        let stats = pool(queue.clone(), handler).run_cycle().await.unwrap();

        assert_eq!(stats.received, 4);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.acknowledged, 2);
        assert_eq!(stats.retained, 1);
        assert_eq!(stats.deleted, 3);

        let mut deleted = queue.deleted_ids();
        deleted.sort();
        assert_eq!(deleted, vec!["m1", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_deleted() {
        let queue = Arc::new(ScriptedQueue::with_bodies(&["not json".to_string()]));
        let handler = Arc::new(ScriptedHandler::default());
        let stats = pool(queue.clone(), handler.clone()).run_cycle().await.unwrap();

        assert_eq!(stats.acknowledged, 1);
        assert_eq!(queue.deleted_ids(), vec!["m1"]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let queue = Arc::new(ScriptedQueue::with_bodies(&[body("panic"), body("ok")]));
        let handler = Arc::new(ScriptedHandler::default());
        let stats = pool(queue.clone(), handler).run_cycle().await.unwrap();

        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(queue.deleted_ids(), vec!["m2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_worker_abandoned_at_soft_deadline() {
        let queue = Arc::new(ScriptedQueue::with_bodies(&[body("slow"), body("ok")]));
        let handler = Arc::new(ScriptedHandler::default());
        let pool = pool(queue.clone(), handler);

        let started = Instant::now();
        let stats = pool.run_cycle().await.unwrap();

        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(queue.deleted_ids(), vec!["m2"]);
        // 90% of a 10s lease
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(9) && elapsed < Duration::from_secs(10));
        // The abandoned worker still holds its slot until it finishes.
        assert_eq!(pool.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_messages_of_abandoned_chunk_are_deleted() {
        let queue = Arc::new(ScriptedQueue::with_bodies(&[body("ok"), body("permanent"), body("slow")]));
        let handler = Arc::new(ScriptedHandler::default());
        let config = QueueConfig {
            max_workers: 1,
            max_messages_per_worker: 3,
            lease_seconds: 10,
            ..QueueConfig::default()
        };
        let pool = QueueConsumerPool::new(queue.clone(), handler, config);
        let stats = pool.run_cycle().await.unwrap();

        assert_eq!(stats.received, 3);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(queue.deleted_ids(), vec!["m1", "m2"]);
        assert_eq!(pool.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_deletes_flush_in_groups_of_ten() {
        let bodies: Vec<String> = (0..25).map(|i| body(&format!("o{i}"))).collect();
        let queue = Arc::new(ScriptedQueue::with_bodies(&bodies));
        let handler = Arc::new(ScriptedHandler::default());
        let config = QueueConfig {
            max_workers: 25,
            lease_seconds: 10,
            ..QueueConfig::default()
        };
        let stats = QueueConsumerPool::new(queue.clone(), handler, config)
            .run_cycle()
            .await
            .unwrap();

        assert_eq!(stats.deleted, 25);
        let batches = queue.deleted.lock().unwrap().clone();
        assert!(batches.iter().all(|b| b.len() <= DELETE_BATCH_SIZE));
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 25);
    }

    #[tokio::test]
    async fn test_delete_failure_is_counted_not_raised() {
        let queue = Arc::new(ScriptedQueue {
            fail_deletes: true,
            ..ScriptedQueue::with_bodies(&[body("ok")])
        });
        let handler = Arc::new(ScriptedHandler::default());
        let stats = pool(queue, handler).run_cycle().await.unwrap();

        assert_eq!(stats.processed, 1);
        assert_eq!(stats.deleted, 0);
        assert_eq!(stats.delete_failures, 1);
    }

    #[tokio::test]
    async fn test_receive_bounded_by_workers() {
        let bodies: Vec<String> = (0..10).map(|i| body(&format!("o{i}"))).collect();
        let queue = Arc::new(ScriptedQueue::with_bodies(&bodies));
        let handler = Arc::new(ScriptedHandler::default());
        let stats = pool(queue.clone(), handler).run_cycle().await.unwrap();

        assert_eq!(stats.received, 4);
        assert_eq!(queue.approximate_backlog().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_drain_until_empty() {
        let bodies: Vec<String> = (0..10).map(|i| body(&format!("o{i}"))).collect();
        let queue = Arc::new(ScriptedQueue::with_bodies(&bodies));
        let handler = Arc::new(ScriptedHandler::default());
        let stats = pool(queue.clone(), handler).drain(None).await.unwrap();

        assert_eq!(stats.received, 10);
        assert_eq!(stats.deleted, 10);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let queue = Arc::new(ScriptedQueue::default());
        let handler = Arc::new(ScriptedHandler::default());
        let pool = Arc::new(pool(queue, handler));
        let (tx, rx) = watch::channel(false);

        let runner = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.run(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("pool should stop")
            .unwrap();
    }
}
