//! Error sink for failures that must not stop the process.
//!
//! Reconciliation never propagates a per-group failure. Each one is handed to
//! an [`ErrorReporter`] so operators can alert on it. The default sink writes
//! structured `tracing` events; [`SentryReporter`] also forwards them to
//! Sentry when `telemetry.sentry_dsn` is set.

use crate::reconcile::GroupFailure;

/// Destination for non-fatal failures.
pub trait ErrorReporter: Send + Sync {
    /// A group could not be removed during a pass.
    fn report_group_failure(&self, failure: &GroupFailure);

    /// A pass-level or startup error.
    fn report_error(&self, context: &'static str, error: &(dyn std::error::Error + 'static));
}

/// Reporter that emits `tracing` error events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report_group_failure(&self, failure: &GroupFailure) {
        tracing::error!(
            pass_id = %failure.pass_id,
            group_id = %failure.group_id,
            kind = failure.kind.as_str(),
            failed_attempts = failure.failed_attempts,
            failed_keys = ?failure.failed_keys(),
            error = %failure.message,
            "Expired group could not be removed"
        );
    }

    fn report_error(&self, context: &'static str, error: &(dyn std::error::Error + 'static)) {
        tracing::error!(context, error = %error, "Reported error");
    }
}

/// Reporter that logs like [`LogReporter`] and captures a Sentry event.
///
/// Events go to the current hub, so `sentry::init` must have run. Without a
/// bound client they are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct SentryReporter;

impl ErrorReporter for SentryReporter {
    fn report_group_failure(&self, failure: &GroupFailure) {
        LogReporter.report_group_failure(failure);
        sentry::with_scope(
            |scope| {
                scope.set_tag("pass_id", failure.pass_id);
                scope.set_tag("group_id", failure.group_id);
                scope.set_tag("kind", failure.kind.as_str());
                scope.set_extra("failed_attempts", failure.failed_attempts.into());
                scope.set_extra("failed_keys", serde_json::json!(failure.failed_keys()));
            },
            || {
                sentry::capture_message(
                    &format!("Expired group could not be removed: {}", failure.message),
                    sentry::Level::Error,
                )
            },
        );
    }

    fn report_error(&self, context: &'static str, error: &(dyn std::error::Error + 'static)) {
        LogReporter.report_error(context, error);
        sentry::with_scope(
            |scope| scope.set_tag("context", context),
            || sentry::capture_error(error),
        );
    }
}

/// Reporter that drops everything. Used when `telemetry.report_errors` is off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ErrorReporter for NoopReporter {
    fn report_group_failure(&self, _failure: &GroupFailure) {}

    fn report_error(&self, _context: &'static str, _error: &(dyn std::error::Error + 'static)) {}
}
