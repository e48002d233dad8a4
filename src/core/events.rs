//! Outbound notification interfaces consumed by external front ends
//!
//! The core depends on these narrow traits but never implements presentation
//! behavior itself; any concrete UI, CLI, or logger satisfies them. All
//! callbacks are fire-and-forget from the actors' point of view and are not
//! part of the core's correctness.

use tracing::info;

use super::detector::DeadlockReport;

/// Sink for per-actor log lines and view-refresh triggers.
pub trait EventSink: Send + Sync {
    /// Receives one human-readable line per lifecycle event,
    /// e.g. `"P3: acquired resource Printer"`.
    fn log_line(&self, line: String);

    /// Signals that observable state changed and views should re-read it.
    fn refresh(&self) {}
}

/// Sink for the monitor's detection results, invoked once per cycle.
pub trait ReportSink: Send + Sync {
    fn deadlock_report(&self, report: &DeadlockReport);
}

/// Discards everything. Useful for tests and headless embedding.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn log_line(&self, _line: String) {}
}

impl ReportSink for NullEventSink {
    fn deadlock_report(&self, _report: &DeadlockReport) {}
}

/// Forwards log lines and reports to `tracing`, the default for headless runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn log_line(&self, line: String) {
        info!(target: "deadlock_sim::events", "{line}");
    }
}

impl ReportSink for TracingEventSink {
    fn deadlock_report(&self, report: &DeadlockReport) {
        if report.is_deadlocked() {
            info!(
                target: "deadlock_sim::events",
                deadlocked = ?report.deadlocked,
                "deadlock detected"
            );
        } else {
            info!(target: "deadlock_sim::events", "system is in a safe state");
        }
    }
}
