//! Service state types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (loops spawned)
//!    ↓                              ↓
//! Stopped ←──── ShuttingDown ←── Running
//!                                   │
//!                     (a loop died) │
//!                                   ↓
//!                                 Failed
//! ```
//!
//! - **Created**: after `ReplicationService::new()`. Nothing is spawned.
//! - **Starting**: `start()` is spawning the consumer pool and reconciler loops.
//! - **Running**: consuming the queue and reconciling on schedule.
//! - **ShuttingDown**: `shutdown()` signalled the loops and is waiting for them.
//! - **Stopped**: every loop has returned or timed out.
//! - **Failed**: a loop exited without a shutdown signal.

/// Lifecycle state of the replication service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Created => "Created",
            ServiceState::Starting => "Starting",
            ServiceState::Running => "Running",
            ServiceState::ShuttingDown => "ShuttingDown",
            ServiceState::Stopped => "Stopped",
            ServiceState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by `ReplicationService::health_check()`.
///
/// Built from in-memory state only.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: ServiceState,
    /// Running and able to take work.
    pub ready: bool,
    /// Ready and no circuit is open.
    pub healthy: bool,
    pub node_id: String,
    pub in_flight_workers: usize,
    pub max_workers: usize,
    pub writes_circuit_open: bool,
    pub reads_circuit_open: bool,
    /// Scope reconcile requests queued and not yet picked up.
    pub pending_scope_triggers: usize,
}
