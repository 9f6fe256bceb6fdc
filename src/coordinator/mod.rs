// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service coordinator.
//!
//! [`ReplicationService`] wires the ports into the three long-running loops
//! and owns their lifecycle:
//!
//! - the queue consumer pool, feeding the replication manager,
//! - the change-send reconciler, on a fixed interval,
//! - the scope reconciler, driven by [`ReplicationService::request_scope_reconcile`].
//!
//! Scope triggers are rate limited and buffered in a bounded channel. A
//! trigger that finds either full is dropped; the next one for the same
//! container covers it.

mod types;

pub use types::{HealthCheck, ServiceState};

use crate::change_sync::{ChangeSendReconciler, PassOutcome};
use crate::config::ReplicationConfig;
use crate::consumer::QueueConsumerPool;
use crate::error::{ReplicationError, Result};
use crate::ledger::{ChangeLedger, SqliteLedger};
use crate::lock::{MaintenanceGate, ReconcileLock, RedisLock};
use crate::manager::ReplicationManager;
use crate::metrics;
use crate::publisher::ChangePublisher;
use crate::queue::{MessageQueue, RedisStreamQueue};
use crate::replica::{ReplicaStore, SqliteReplicaStore};
use crate::resilience::{RateLimiter, RetryConfig};
use crate::scope_sync::{ReplicationReconciler, ScopeOutcome};
use crate::source::ObjectSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Default time `shutdown()` waits for each loop.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// External dependencies of the service.
#[derive(Clone)]
pub struct ServicePorts {
    pub queue: Arc<dyn MessageQueue>,
    pub ledger: Arc<dyn ChangeLedger>,
    pub replica: Arc<dyn ReplicaStore>,
    pub source: Arc<dyn ObjectSource>,
    pub lock: Arc<dyn ReconcileLock>,
    pub gate: Arc<dyn MaintenanceGate>,
}

impl ServicePorts {
    /// Build the production adapters: Redis queue and lock, SQLite stores.
    ///
    /// The object source and maintenance gate belong to the host application.
    pub async fn connect(
        config: &ReplicationConfig,
        source: Arc<dyn ObjectSource>,
        gate: Arc<dyn MaintenanceGate>,
    ) -> Result<Self> {
        let retry = RetryConfig::startup();
        let consumer = config.queue.consumer_name_or(&config.node_id);

        let queue = RedisStreamQueue::connect(&config.queue, consumer, &retry).await?;
        let lock = RedisLock::connect(&config.queue.redis_url, &config.node_id, &retry).await?;
        let ledger = SqliteLedger::new(&config.ledger.sqlite_path, config.ledger.wal_mode).await?;
        let replica =
            SqliteReplicaStore::new(&config.replica.sqlite_path, config.replica.wal_mode).await?;

        Ok(Self {
            queue: Arc::new(queue),
            ledger: Arc::new(ledger),
            replica: Arc::new(replica),
            source,
            lock: Arc::new(lock),
            gate,
        })
    }
}

/// The replication worker process.
pub struct ReplicationService {
    config: ReplicationConfig,
    ports: ServicePorts,

    manager: Arc<ReplicationManager>,
    pool: Arc<QueueConsumerPool>,
    change_sync: Arc<ChangeSendReconciler>,
    scope_sync: Arc<ReplicationReconciler>,

    state_tx: watch::Sender<ServiceState>,
    state_rx: watch::Receiver<ServiceState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    trigger_limiter: RateLimiter,
    trigger_tx: mpsc::Sender<String>,
    trigger_rx: Mutex<Option<mpsc::Receiver<String>>>,

    handles: RwLock<Vec<JoinHandle<()>>>,
}

impl ReplicationService {
    /// Create a service. Nothing runs until [`start()`](Self::start).
    pub fn new(config: ReplicationConfig, ports: ServicePorts) -> Self {
        let (state_tx, state_rx) = watch::channel(ServiceState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (trigger_tx, trigger_rx) = mpsc::channel(config.scope_sync.trigger_queue_depth.max(1));

        let manager = Arc::new(ReplicationManager::new(
            Arc::clone(&ports.replica),
            Arc::clone(&ports.source),
            config.replica.group_size,
        ));

        let pool = Arc::new(QueueConsumerPool::new(
            Arc::clone(&ports.queue),
            Arc::clone(&manager) as _,
            config.queue.clone(),
        ));

        let publisher = ChangePublisher::new(Arc::clone(&ports.queue), Arc::clone(&ports.ledger));
        let change_sync = Arc::new(
            ChangeSendReconciler::new(
                Arc::clone(&ports.ledger),
                publisher,
                Arc::clone(&ports.lock),
                Arc::clone(&ports.gate),
                config.change_sync.clone(),
                &config.lock,
            )
            .with_shutdown(shutdown_rx.clone()),
        );

        let scope_sync = Arc::new(
            ReplicationReconciler::new(
                Arc::clone(&ports.source),
                Arc::clone(&ports.replica),
                Arc::clone(&ports.ledger),
                Arc::clone(&ports.queue),
                Arc::clone(&ports.lock),
                config.scope_sync.clone(),
                &config.lock,
            )
            .with_shutdown(shutdown_rx.clone()),
        );

        let trigger_limiter = RateLimiter::new(config.scope_sync.rate_limit_config());

        Self {
            config,
            ports,
            manager,
            pool,
            change_sync,
            scope_sync,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            trigger_limiter,
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Connect the production adapters, then build the service.
    pub async fn connect(
        config: ReplicationConfig,
        source: Arc<dyn ObjectSource>,
        gate: Arc<dyn MaintenanceGate>,
    ) -> Result<Self> {
        config.validate()?;
        let ports = ServicePorts::connect(&config, source, gate).await?;
        Ok(Self::new(config, ports))
    }

    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn ports(&self) -> &ServicePorts {
        &self.ports
    }

    pub fn manager(&self) -> &Arc<ReplicationManager> {
        &self.manager
    }

    pub fn pool(&self) -> &Arc<QueueConsumerPool> {
        &self.pool
    }

    pub fn change_sync(&self) -> &Arc<ChangeSendReconciler> {
        &self.change_sync
    }

    pub fn scope_sync(&self) -> &Arc<ReplicationReconciler> {
        &self.scope_sync
    }

    fn set_state(&self, state: ServiceState) {
        let _ = self.state_tx.send(state);
        metrics::set_service_state(state.as_str());
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    /// Spawn the consumer pool and the reconciler loops.
    pub async fn start(&self) -> Result<()> {
        if self.state() != ServiceState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(node_id = %self.config.node_id, "Starting replication service");
        self.set_state(ServiceState::Starting);

        self.spawn_consumer_pool().await;

        if self.config.change_sync.enabled {
            self.spawn_change_sync().await;
        }

        if self.config.scope_sync.enabled {
            match self.trigger_rx.lock().await.take() {
                Some(rx) => self.spawn_scope_sync(rx).await,
                None => {
                    self.set_state(ServiceState::Failed);
                    return Err(ReplicationError::Internal(
                        "scope trigger receiver already taken".to_string(),
                    ));
                }
            }
        }

        self.set_state(ServiceState::Running);
        info!(
            max_workers = self.config.queue.max_workers,
            change_sync = self.config.change_sync.enabled,
            scope_sync = self.config.scope_sync.enabled,
            "Replication service running"
        );
        Ok(())
    }

    async fn spawn_consumer_pool(&self) {
        let pool = Arc::clone(&self.pool);
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            pool.run(shutdown_rx).await;
        });

        debug!("Spawned consumer pool");
        self.handles.write().await.push(handle);
    }

    async fn spawn_change_sync(&self) {
        let reconciler = Arc::clone(&self.change_sync);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.config.change_sync.interval_duration();

        let handle = tokio::spawn(
            async move {
                let _ = shutdown_rx.borrow_and_update();
                let mut timer =
                    tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                info!(interval_secs = interval.as_secs(), "Change sync loop started");

                loop {
                    tokio::select! {
                        _ = timer.tick() => {
                            match reconciler.run_once().await {
                                Ok(PassOutcome::Completed(stats)) => {
                                    debug!(
                                        windows = stats.windows,
                                        republished = stats.republished,
                                        "Change sync pass finished"
                                    );
                                }
                                Ok(PassOutcome::Skipped(_)) => {}
                                Err(e) => {
                                    warn!(error = %e, "Change sync pass failed");
                                    metrics::record_error("change_sync", e.kind());
                                }
                            }
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }

                info!("Change sync loop stopped");
            }
            .instrument(tracing::info_span!("change_sync_loop")),
        );

        debug!("Spawned change sync loop");
        self.handles.write().await.push(handle);
    }

    async fn spawn_scope_sync(&self, mut triggers: mpsc::Receiver<String>) {
        let reconciler = Arc::clone(&self.scope_sync);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(
            async move {
                let _ = shutdown_rx.borrow_and_update();
                info!("Scope sync loop started");

                loop {
                    tokio::select! {
                        biased;
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        trigger = triggers.recv() => {
                            let Some(container_id) = trigger else { break };
                            match reconciler.reconcile(&container_id).await {
                                Ok(ScopeOutcome::Reconciled(stats)) => {
                                    debug!(
                                        container_id = %container_id,
                                        deltas = stats.deltas(),
                                        "Scope pass finished"
                                    );
                                }
                                Ok(ScopeOutcome::Skipped(_)) => {}
                                Err(e) => {
                                    warn!(container_id = %container_id, error = %e, "Scope pass failed");
                                }
                            }
                        }
                    }
                }

                info!("Scope sync loop stopped");
            }
            .instrument(tracing::info_span!("scope_sync_loop")),
        );

        debug!("Spawned scope sync loop");
        self.handles.write().await.push(handle);
    }

    /// Ask for a scope reconciliation of `container_id`.
    ///
    /// Returns `false` when the trigger was dropped (disabled, rate limited,
    /// queue full, or shutting down).
    pub fn request_scope_reconcile(&self, container_id: &str) -> bool {
        if !self.config.scope_sync.enabled {
            return false;
        }
        if *self.shutdown_rx.borrow() {
            return false;
        }
        if !self.trigger_limiter.try_acquire() {
            debug!(container_id, "Scope trigger rate limited");
            metrics::record_scope_skipped("rate_limited");
            return false;
        }
        match self.trigger_tx.try_send(container_id.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(container_id, "Scope trigger queue full");
                metrics::record_scope_skipped("queue_full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Stop every loop, waiting up to `drain_timeout` for each.
    ///
    /// In-flight workers finish inside their cycle's soft deadline.
    pub async fn shutdown(&self, drain_timeout: Option<Duration>) {
        info!("Shutting down replication service");
        self.set_state(ServiceState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };

        let drain_timeout = drain_timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        self.set_state(ServiceState::Stopped);
        info!("Replication service stopped");
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Health
    // ═══════════════════════════════════════════════════════════════════════════

    /// Current health from in-memory state. No I/O.
    ///
    /// A loop that exited while the service was running moves it to `Failed`.
    pub fn health_check(&self) -> HealthCheck {
        if self.state() == ServiceState::Running && self.any_loop_exited() {
            error!("A service loop exited unexpectedly");
            self.set_state(ServiceState::Failed);
        }

        let state = self.state();
        let circuit = self.manager.circuit();
        let writes_open = circuit.writes.state_hint() == crate::circuit_breaker::CircuitState::Open;
        let reads_open = circuit.reads.state_hint() == crate::circuit_breaker::CircuitState::Open;
        let ready = state == ServiceState::Running;
        let pending = self
            .config
            .scope_sync
            .trigger_queue_depth
            .max(1)
            .saturating_sub(self.trigger_tx.capacity());

        HealthCheck {
            state,
            ready,
            healthy: ready && !writes_open && !reads_open,
            node_id: self.config.node_id.clone(),
            in_flight_workers: self.pool.in_flight(),
            max_workers: self.config.queue.max_workers,
            writes_circuit_open: writes_open,
            reads_circuit_open: reads_open,
            pending_scope_triggers: pending,
        }
    }

    fn any_loop_exited(&self) -> bool {
        match self.handles.try_read() {
            Ok(handles) => handles.iter().any(|h| h.is_finished()),
            Err(_) => false,
        }
    }
}
