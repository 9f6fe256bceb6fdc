//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Queue consumption (messages, outcomes, abandoned workers, deletes)
//! - Change-send reconciliation (windows, mismatches, republishes)
//! - Replica application (applied / unchanged / stale / deleted / skipped)
//! - Scope reconciliation (deltas emitted, skip reasons)
//! - Circuit breaker state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The crate never installs a recorder; without one every call is a no-op.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Queue Consumer Metrics
// =============================================================================

/// Record messages leased by one receive call.
pub fn record_messages_received(count: usize) {
    counter!("replication_messages_received_total").increment(count as u64);
}

/// Record the fate of one message.
///
/// `outcome` is one of `processed`, `permanent`, `not_found`, `undecodable`,
/// `retained`, `panicked`, `abandoned`.
pub fn record_message_outcome(outcome: &str) {
    counter!("replication_message_outcomes_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record workers still running when the soft deadline passed.
pub fn record_workers_abandoned(count: usize) {
    if count > 0 {
        counter!("replication_workers_abandoned_total").increment(count as u64);
    }
}

/// Record one delete round trip.
pub fn record_delete_flush(count: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_delete_flushes_total", "status" => status).increment(1);
    if success {
        counter!("replication_messages_deleted_total").increment(count as u64);
    }
}

/// Record a completed poll cycle.
pub fn record_poll_cycle(dispatched: usize, duration: Duration) {
    counter!("replication_poll_cycles_total").increment(1);
    histogram!("replication_poll_cycle_duration_seconds").record(duration.as_secs_f64());
    histogram!("replication_poll_cycle_messages").record(dispatched as f64);
}

/// Gauge for workers currently holding a pool slot.
pub fn set_in_flight_workers(count: usize) {
    gauge!("replication_in_flight_workers").set(count as f64);
}

/// Gauge for the queue's approximate backlog.
pub fn set_queue_backlog(backlog: u64) {
    gauge!("replication_queue_backlog").set(backlog as f64);
}

// =============================================================================
// Change-Send Reconciliation Metrics
// =============================================================================

/// Record one checksum window comparison.
pub fn record_change_sync_window(in_sync: bool) {
    counter!("replication_change_sync_windows_total").increment(1);
    if !in_sync {
        counter!("replication_change_sync_mismatches_total").increment(1);
    }
}

/// Record a finished change-send pass.
pub fn record_change_sync_pass(
    windows: usize,
    republished: usize,
    failed: usize,
    page_size: i64,
    duration: Duration,
) {
    counter!("replication_change_sync_passes_total").increment(1);
    counter!("replication_change_sync_republished_total").increment(republished as u64);
    if failed > 0 {
        counter!("replication_change_sync_publish_failures_total").increment(failed as u64);
    }
    histogram!("replication_change_sync_windows").record(windows as f64);
    histogram!("replication_change_sync_page_size").record(page_size as f64);
    histogram!("replication_change_sync_duration_seconds").record(duration.as_secs_f64());
}

/// Record a change-send pass that did not run.
pub fn record_change_sync_skipped(reason: &str) {
    counter!("replication_change_sync_skipped_total", "reason" => reason.to_string()).increment(1);
}

// =============================================================================
// Replica Application Metrics
// =============================================================================

/// Record the outcome counts of one replicated batch.
pub fn record_replication_batch(
    records: usize,
    applied: usize,
    unchanged: usize,
    stale: usize,
    deleted: usize,
    skipped: usize,
    duration: Duration,
) {
    counter!("replication_records_total").increment(records as u64);
    counter!("replication_records_applied_total").increment(applied as u64);
    counter!("replication_records_unchanged_total").increment(unchanged as u64);
    counter!("replication_records_stale_total").increment(stale as u64);
    counter!("replication_records_deleted_total").increment(deleted as u64);
    if skipped > 0 {
        counter!("replication_records_skipped_total").increment(skipped as u64);
    }
    histogram!("replication_batch_duration_seconds").record(duration.as_secs_f64());
    histogram!("replication_batch_size").record(records as f64);
}

/// Record records dropped because a newer change for the same object was in the batch.
pub fn record_batch_dedup(before_dedup: usize, after_dedup: usize) {
    let deduped = before_dedup.saturating_sub(after_dedup);
    if deduped > 0 {
        counter!("replication_batch_deduped_total").increment(deduped as u64);
    }
}

/// Record a SQLite retry (SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_store_retry(operation: &str) {
    counter!("replication_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Scope Reconciliation Metrics
// =============================================================================

/// Record synthetic records emitted by one scope pass.
pub fn record_scope_deltas(creates: usize, updates: usize, deletes: usize) {
    counter!("replication_scope_deltas_total", "change_type" => "CREATE").increment(creates as u64);
    counter!("replication_scope_deltas_total", "change_type" => "UPDATE").increment(updates as u64);
    counter!("replication_scope_deltas_total", "change_type" => "DELETE").increment(deletes as u64);
}

/// Record one completed scope pass, with or without drift.
pub fn record_scope_pass(members: usize, duration: Duration) {
    counter!("replication_scope_passes_total").increment(1);
    histogram!("replication_scope_members").record(members as f64);
    histogram!("replication_scope_duration_seconds").record(duration.as_secs_f64());
}

/// Record a scope pass that did not run.
pub fn record_scope_skipped(reason: &str) {
    counter!("replication_scope_skipped_total", "reason" => reason.to_string()).increment(1);
}

// =============================================================================
// Service Metrics
// =============================================================================

/// Record errors by component and error kind.
pub fn record_error(component: &str, kind: &str) {
    counter!(
        "replication_errors_total",
        "component" => component.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Gauge for service state.
pub fn set_service_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replication_service_state").set(value);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "replication_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("replication_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}
