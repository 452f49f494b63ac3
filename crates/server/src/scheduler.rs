//! In-process recurring trigger for reconciliation passes.

use crate::metrics;
use crate::reconcile::{PassSummary, ReconcileError, Reconciler};
use pantry_metadata::repos::PassState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why a trigger did not run a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A pass started by this scheduler is still running.
    InFlight,
    /// Another instance holds the pass lease.
    LeaseHeld,
}

/// Result of one trigger.
#[derive(Debug)]
pub enum TriggerOutcome {
    Completed(Box<PassSummary>),
    Skipped(SkipReason),
    Failed(ReconcileError),
}

/// Single-flight scheduler around a [`Reconciler`].
///
/// At most one pass runs per scheduler. A trigger that arrives while a pass
/// is running returns `Skipped(InFlight)` immediately instead of queueing.
pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    in_flight: Mutex<()>,
    interval: Duration,
    run_on_startup: bool,
}

impl Scheduler {
    /// Create a scheduler using the reconciler's interval settings.
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        let config = reconciler.config();
        Self {
            interval: config.interval(),
            run_on_startup: config.run_on_startup,
            reconciler,
            in_flight: Mutex::new(()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a pass started by this scheduler is running.
    pub fn is_running(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Run one pass unless one is already in flight.
    ///
    /// The pass runs on its own task so a panic inside it is contained; the
    /// pass record is then marked failed so the lease is released.
    pub async fn trigger(&self, cancel: &CancellationToken) -> TriggerOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            metrics::PASSES_SKIPPED.inc();
            tracing::info!("Previous reconciliation pass still running, skipping trigger");
            return TriggerOutcome::Skipped(SkipReason::InFlight);
        };

        let pass_id = Uuid::new_v4();
        let reconciler = self.reconciler.clone();
        let token = cancel.clone();
        let handle =
            tokio::spawn(async move { reconciler.run_pass_with_id(pass_id, &token).await });

        match handle.await {
            Ok(Ok(summary)) => TriggerOutcome::Completed(Box::new(summary)),
            Ok(Err(ReconcileError::PassInProgress)) => {
                metrics::PASSES_SKIPPED.inc();
                TriggerOutcome::Skipped(SkipReason::LeaseHeld)
            }
            Ok(Err(e)) => TriggerOutcome::Failed(e),
            Err(join_err) => {
                // At most one pass runs per process.
                metrics::PASS_ACTIVE.set(0);
                metrics::PASSES_FAILED.inc();
                tracing::error!(
                    pass_id = %pass_id,
                    panic = ?join_err,
                    "Reconciliation task panicked, marking pass as failed"
                );

                if let Err(e) = self
                    .reconciler
                    .metadata()
                    .update_pass_state(
                        pass_id,
                        PassState::Failed,
                        time::OffsetDateTime::now_utc(),
                        None,
                    )
                    .await
                {
                    tracing::warn!(
                        pass_id = %pass_id,
                        error = %e,
                        "Failed to mark panicked pass as failed"
                    );
                }
                TriggerOutcome::Failed(ReconcileError::Panicked(join_err.to_string()))
            }
        }
    }

    /// Trigger passes on the configured interval until `cancel` fires.
    ///
    /// Ticks missed while a pass runs are dropped. Returns once any in-flight
    /// pass has finished.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let start = if self.run_on_startup {
            Instant::now()
        } else {
            Instant::now() + self.interval
        };
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            run_on_startup = self.run_on_startup,
            "Reconciliation scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.trigger(&cancel).await {
                TriggerOutcome::Completed(summary) => {
                    tracing::debug!(
                        pass_id = %summary.pass_id,
                        groups_failed = summary.stats.groups_failed,
                        "Scheduled reconciliation pass completed"
                    );
                }
                TriggerOutcome::Skipped(reason) => {
                    tracing::debug!(reason = ?reason, "Scheduled reconciliation pass skipped");
                }
                TriggerOutcome::Failed(e) => {
                    tracing::warn!(error = %e, "Scheduled reconciliation pass failed, will retry next interval");
                }
            }
        }

        tracing::info!("Reconciliation scheduler stopped");
    }
}
