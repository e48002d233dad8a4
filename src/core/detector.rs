//! Deadlock detection - Periodic Banker's-style safety analysis
//!
//! The monitor samples a consistent per-process view of held and awaited
//! resources plus each pool's free count, reduces the resulting matrices, and
//! reports the identifiers of every process it could not mark finishable.
//! Sampling different processes at slightly different instants is the
//! accepted correctness standard for a periodic detector; what is never
//! allowed is a torn read of a single process's own state.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::events::{EventSink, ReportSink};
use super::process::ProcessId;
use super::registry::{Registry, StopToken};
use super::resource::ResourceId;

/// Result of one detection cycle.
#[derive(Debug, Clone, Serialize)]
pub struct DeadlockReport {
    pub detected_at: DateTime<Utc>,
    /// Identifiers of processes that are part of (or blocked behind) a
    /// deadlock cycle, sorted ascending. Empty when the system is safe.
    pub deadlocked: Vec<ProcessId>,
}

impl DeadlockReport {
    fn new(mut deadlocked: Vec<ProcessId>) -> Self {
        deadlocked.sort_unstable();
        Self {
            detected_at: Utc::now(),
            deadlocked,
        }
    }

    fn safe() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_deadlocked(&self) -> bool {
        !self.deadlocked.is_empty()
    }

    pub fn is_safe(&self) -> bool {
        self.deadlocked.is_empty()
    }
}

/// Periodic task analyzing the global allocation state.
pub struct DeadlockDetector {
    registry: Arc<Registry>,
    events: Arc<dyn EventSink>,
    reports: Arc<dyn ReportSink>,
}

impl DeadlockDetector {
    pub fn new(
        registry: Arc<Registry>,
        events: Arc<dyn EventSink>,
        reports: Arc<dyn ReportSink>,
    ) -> Self {
        Self {
            registry,
            events,
            reports,
        }
    }

    /// Runs one detection cycle: snapshot, matrix construction, reduction,
    /// classification. Emits log lines of the computed vectors and invokes
    /// the report sink exactly once. Never raises a user-visible error.
    pub fn detect_once(&self) -> DeadlockReport {
        let resources = self.registry.resources_sorted();

        // Snapshot every active process; one lock acquisition per process so
        // no actor is observed mid-transition.
        let mut rows: Vec<(ProcessId, HashMap<ResourceId, u32>, Option<ResourceId>)> = Vec::new();
        for process in self.registry.processes() {
            let (status, allocated, awaiting) = process.snapshot();
            if status.is_active() {
                rows.push((process.id(), allocated, awaiting));
            }
        }

        if rows.is_empty() {
            // Trivially safe; no matrix work performed.
            self.events
                .log_line("monitor: no active processes to check".to_string());
            let report = DeadlockReport::safe();
            self.reports.deadlock_report(&report);
            return report;
        }

        // Stable column indices: resource ids ascending.
        let index: HashMap<ResourceId, usize> = resources
            .iter()
            .enumerate()
            .map(|(j, r)| (r.id(), j))
            .collect();
        let available: Vec<u32> = resources.iter().map(|r| r.free_instances()).collect();

        let mut allocation = vec![vec![0u32; resources.len()]; rows.len()];
        let mut request = vec![vec![0u32; resources.len()]; rows.len()];
        for (i, (_, allocated, awaiting)) in rows.iter().enumerate() {
            for (resource_id, count) in allocated {
                if let Some(&j) = index.get(resource_id) {
                    allocation[i][j] = *count;
                }
            }
            // A blocked process awaits exactly one instance of one resource;
            // a blocked process without one contributes an all-zero row.
            if let Some(resource_id) = awaiting {
                if let Some(&j) = index.get(resource_id) {
                    request[i][j] = 1;
                }
            }
        }

        self.events
            .log_line(format!("monitor: available = {available:?}"));
        self.events
            .log_line(format!("monitor: allocation = {allocation:?}"));
        self.events
            .log_line(format!("monitor: request = {request:?}"));
        debug!(?available, "running safety reduction");

        let finish = safety_reduction(&available, &allocation, &request);
        let deadlocked: Vec<ProcessId> = rows
            .iter()
            .zip(&finish)
            .filter(|(_, finished)| !**finished)
            .map(|((id, _, _), _)| *id)
            .collect();

        let report = DeadlockReport::new(deadlocked);
        if report.is_deadlocked() {
            warn!(deadlocked = ?report.deadlocked, "deadlock detected");
            self.events.log_line(format!(
                "monitor: DEADLOCK detected, processes {:?}",
                report.deadlocked
            ));
        } else {
            self.events
                .log_line("monitor: no deadlock, system is in a safe state".to_string());
        }
        self.reports.deadlock_report(&report);
        report
    }

    /// Spawns the periodic monitor thread, one cycle every `period` until the
    /// stop token fires.
    pub(crate) fn spawn(
        self: Arc<Self>,
        period: Duration,
        stop: StopToken,
    ) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("deadlock-monitor".to_string())
            .spawn(move || {
                debug!(?period, "monitor started");
                while stop.sleep(period) {
                    self.detect_once();
                }
                debug!("monitor stopped");
            })
    }
}

/// Greedy Banker's-style reduction.
///
/// Starting from `work = available`, repeatedly finishes any process whose
/// request fits into `work` element-wise, returning its allocation to `work`,
/// until a full scan makes no progress. The final finish vector is
/// order-independent: it reflects reachability of a safe reduction, not a
/// particular schedule.
fn safety_reduction(available: &[u32], allocation: &[Vec<u32>], request: &[Vec<u32>]) -> Vec<bool> {
    let mut work = available.to_vec();
    let mut finish = vec![false; allocation.len()];
    loop {
        let mut progressed = false;
        for i in 0..allocation.len() {
            if finish[i] {
                continue;
            }
            let fits = request[i]
                .iter()
                .zip(work.iter())
                .all(|(requested, free)| requested <= free);
            if fits {
                for (w, held) in work.iter_mut().zip(allocation[i].iter()) {
                    *w += *held;
                }
                finish[i] = true;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    finish
}
