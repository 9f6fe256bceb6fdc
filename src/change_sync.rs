// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change-send reconciliation.
//!
//! Repairs the gap between "written to the ledger" and "marked sent",
//! e.g. after a crash between the queue send and the sent mark.
//!
//! # Algorithm
//!
//! ```text
//! [min ............................................... max]
//!  ├── page ──┼── page ──┼── page ──┼── page ──┼─ rest ─┤
//!      │
//!      └─► digest(ledger cns in window) == digest(sent cns in window)?
//!            yes → next window
//!            no  → list unsent (older than grace) → publish each → mark sent
//! ```
//!
//! The page size is `base + random(0..variance)`, drawn again on every
//! pass. Two different sets can digest equally at one window alignment;
//! shifting the alignment between passes keeps such a collision from
//! hiding a gap forever.
//!
//! Passes run under the singleton lock and never while the maintenance
//! gate is closed. The lease is renewed between windows once a third of
//! its TTL has gone by; a pass that lost its lease stops at once. One failed publish is logged and the pass moves on;
//! anything left over is found again by the next pass.

use crate::config::{ChangeSyncConfig, LockConfig};
use crate::error::{ReplicationError, Result};
use crate::ledger::ChangeLedger;
use crate::lock::{LockLease, MaintenanceGate, ReconcileLock};
use crate::metrics;
use crate::publisher::ChangePublisher;
use crate::resilience::RateLimiter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

const LOCK_NAME: &str = "change-sync";

/// Why a pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    Maintenance,
    LockHeld,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Disabled => "disabled",
            SkipReason::Maintenance => "maintenance",
            SkipReason::LockHeld => "lock_held",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub page_size: i64,
    pub windows: usize,
    pub mismatched: usize,
    pub republished: usize,
    pub publish_failures: usize,
    /// Windows whose checksum or unsent listing could not be read.
    pub window_failures: usize,
    /// Stopped early by maintenance, shutdown or a lost lease.
    pub interrupted: bool,
    /// The lock lease could not be renewed.
    pub lock_lost: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(PassStats),
    Skipped(SkipReason),
}

/// Split `[min, max]` into consecutive inclusive windows of `page_size`.
pub fn windows(min: i64, max: i64, page_size: i64) -> Windows {
    Windows {
        next: (min <= max).then_some(min),
        max,
        page_size: page_size.max(1),
    }
}

/// Iterator over the windows of one pass. See [`windows`].
#[derive(Debug, Clone)]
pub struct Windows {
    next: Option<i64>,
    max: i64,
    page_size: i64,
}

impl Iterator for Windows {
    type Item = (i64, i64);

    fn next(&mut self) -> Option<(i64, i64)> {
        let lo = self.next?;
        let hi = lo.saturating_add(self.page_size - 1).min(self.max);
        self.next = if hi >= self.max { None } else { Some(hi + 1) };
        Some((lo, hi))
    }
}

pub struct ChangeSendReconciler {
    ledger: Arc<dyn ChangeLedger>,
    publisher: ChangePublisher,
    lock: Arc<dyn ReconcileLock>,
    gate: Arc<dyn MaintenanceGate>,
    config: ChangeSyncConfig,
    lock_key: String,
    lock_ttl: Duration,
    limiter: RateLimiter,
    rng: Mutex<StdRng>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ChangeSendReconciler {
    pub fn new(
        ledger: Arc<dyn ChangeLedger>,
        publisher: ChangePublisher,
        lock: Arc<dyn ReconcileLock>,
        gate: Arc<dyn MaintenanceGate>,
        config: ChangeSyncConfig,
        lock_config: &LockConfig,
    ) -> Self {
        let limiter = RateLimiter::new(config.rate_limit_config());
        Self {
            ledger,
            publisher,
            lock,
            gate,
            lock_key: lock_config.key(LOCK_NAME),
            lock_ttl: lock_config.ttl_duration(),
            limiter,
            config,
            rng: Mutex::new(StdRng::from_entropy()),
            shutdown: None,
        }
    }

    /// Use a deterministic page-size sequence.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Stop between windows once `shutdown` flips to true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn config(&self) -> &ChangeSyncConfig {
        &self.config
    }

    /// Draw this pass's page size.
    pub fn draw_page_size(&self) -> i64 {
        let base = self.config.base_page_size.max(1);
        let variance = self.config.page_size_variance;
        let extra = if variance == 0 {
            0
        } else {
            match self.rng.lock() {
                Ok(mut rng) => rng.gen_range(0..variance),
                Err(poisoned) => poisoned.into_inner().gen_range(0..variance),
            }
        };
        i64::try_from(base.saturating_add(extra)).unwrap_or(i64::MAX)
    }

    /// Run one pass unless disabled, in maintenance, or another node holds the lock.
    #[instrument(skip_all, name = "change_sync")]
    pub async fn run_once(&self) -> Result<PassOutcome> {
        if !self.config.enabled {
            return Ok(self.skipped(SkipReason::Disabled));
        }
        if self.gate.in_maintenance() {
            return Ok(self.skipped(SkipReason::Maintenance));
        }

        let lease = match self.lock.try_acquire(&self.lock_key, self.lock_ttl).await {
            Ok(lease) => lease,
            Err(ReplicationError::LockUnavailable { .. }) => {
                return Ok(self.skipped(SkipReason::LockHeld));
            }
            Err(e) => return Err(e),
        };

        let result = self.pass(&lease).await;

        if let Err(e) = self.lock.release(lease).await {
            warn!(key = %self.lock_key, error = %e, "Failed to release change-sync lock");
        }
        result.map(PassOutcome::Completed)
    }

    fn skipped(&self, reason: SkipReason) -> PassOutcome {
        debug!(reason = reason.as_str(), "Change-sync pass skipped");
        metrics::record_change_sync_skipped(reason.as_str());
        PassOutcome::Skipped(reason)
    }

    fn should_stop(&self) -> bool {
        self.gate.in_maintenance()
            || self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Renew `lease` once a third of its TTL has passed since `renewed`.
    ///
    /// Returns `false` when the lease is gone and the pass must stop.
    async fn keep_lease(&self, lease: &LockLease, renewed: &mut Instant) -> bool {
        if renewed.elapsed() < self.lock_ttl / 3 {
            return true;
        }
        match self.lock.extend(lease, self.lock_ttl).await {
            Ok(true) => {
                *renewed = Instant::now();
                true
            }
            Ok(false) => {
                warn!(key = %self.lock_key, "Change-sync lease expired mid-pass");
                false
            }
            Err(e) => {
                warn!(key = %self.lock_key, error = %e, "Failed to renew change-sync lease");
                false
            }
        }
    }

    async fn pass(&self, lease: &LockLease) -> Result<PassStats> {
        let started = Instant::now();
        let mut renewed = started;
        let mut stats = PassStats {
            page_size: self.draw_page_size(),
            ..Default::default()
        };

        let min = self.ledger.minimum_change_number().await?;
        let max = self.ledger.current_change_number().await?;
        let (Some(min), Some(max)) = (min, max) else {
            debug!("Ledger empty, nothing to reconcile");
            return Ok(stats);
        };

        let grace_ms = i64::try_from(self.config.unsent_grace_duration().as_millis()).unwrap_or(i64::MAX);
        let older_than = chrono::Utc::now().timestamp_millis().saturating_sub(grace_ms);

        for (lo, hi) in windows(min, max, stats.page_size) {
            if self.should_stop() {
                info!(lo, "Change-sync pass interrupted");
                stats.interrupted = true;
                break;
            }
            if !self.keep_lease(lease, &mut renewed).await {
                metrics::record_change_sync_skipped("lock_lost");
                stats.interrupted = true;
                stats.lock_lost = true;
                break;
            }
            stats.windows += 1;

            let checksum = match self.ledger.checksum_for_range(lo, hi).await {
                Ok(checksum) => checksum,
                Err(e) => {
                    warn!(lo, hi, error = %e, "Failed to read window checksum");
                    stats.window_failures += 1;
                    continue;
                }
            };
            let in_sync = checksum.is_in_sync();
            metrics::record_change_sync_window(in_sync);
            if in_sync {
                continue;
            }

            stats.mismatched += 1;
            warn!(
                lo,
                hi,
                ledger_checksum = %checksum.ledger,
                sent_checksum = %checksum.sent,
                "Unsent changes detected"
            );

            let unsent = match self.ledger.list_unsent(lo, hi, older_than).await {
                Ok(unsent) => unsent,
                Err(e) => {
                    warn!(lo, hi, error = %e, "Failed to list unsent changes");
                    stats.window_failures += 1;
                    continue;
                }
            };

            for record in &unsent {
                self.limiter.acquire().await;
                match self.publisher.publish(record).await {
                    Ok(_) => stats.republished += 1,
                    Err(e) => {
                        warn!(
                            change_number = record.change_number,
                            lo,
                            hi,
                            error = %e,
                            "Republish failed, next pass will retry"
                        );
                        metrics::record_error("change_sync", e.kind());
                        stats.publish_failures += 1;
                    }
                }
            }
        }

        metrics::record_change_sync_pass(
            stats.windows,
            stats.republished,
            stats.publish_failures,
            stats.page_size,
            started.elapsed(),
        );
        info!(
            min,
            max,
            page_size = stats.page_size,
            windows = stats.windows,
            mismatched = stats.mismatched,
            republished = stats.republished,
            failures = stats.publish_failures,
            "Change-sync pass complete"
        );
        Ok(stats)
    }
}
