//! Process actors - Independently scheduled workers competing for resources
//!
//! Each process repeatedly selects a small random set of resource types,
//! acquires them one at a time (potentially blocking), holds them for a
//! simulated use period, then releases everything. The sequential
//! multi-resource acquisition is what creates hold-and-wait conditions and
//! hence the possibility of deadlock; it is intentional, not incidental.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::events::EventSink;
use super::registry::{Registry, StartGate, StopToken};
use super::resource::ResourceId;

/// Unique identifier of a process (positive, operator-assigned).
pub type ProcessId = u32;

/// Status of a process actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    /// Executing its run loop (thinking, using resources, or pre-start)
    Running,
    /// Blocked inside a resource acquisition
    Blocked,
    /// Finished; holds nothing and awaits nothing
    Terminated,
}

impl ProcessStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Blocked)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Blocked => "Blocked",
            Self::Terminated => "Terminated",
        }
    }
}

/// Configuration for creating a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Unique positive identifier, assigned by the operator
    pub id: ProcessId,
    /// Delay between successive resource requests
    pub think_interval: Duration,
    /// Time spent holding a complete task's resources
    pub use_duration: Duration,
    /// Seed for the task-selection RNG; entropy-seeded when absent
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

impl ProcessConfig {
    pub fn new(id: ProcessId, think_interval: Duration, use_duration: Duration) -> Self {
        Self {
            id,
            think_interval,
            use_duration,
            rng_seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}

/// Read-only snapshot of a process, for external observers.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub id: ProcessId,
    pub status: ProcessStatus,
    /// Resource id -> instance count currently held
    pub allocated: HashMap<ResourceId, u32>,
    /// Resource awaited while blocked, if any
    pub awaiting: Option<ResourceId>,
    pub created_at: DateTime<Utc>,
}

/// Mutable actor state, written only by the owning worker thread.
///
/// Kept behind a single mutex so readers (the monitor, external observers)
/// always see a causally consistent view: `awaiting` is never observed set
/// without `status == Blocked`.
struct ProcessState {
    status: ProcessStatus,
    allocated: HashMap<ResourceId, u32>,
    awaiting: Option<ResourceId>,
}

/// A simulated process competing for resources.
pub struct Process {
    id: ProcessId,
    think_interval: Duration,
    use_duration: Duration,
    created_at: DateTime<Utc>,
    state: Mutex<ProcessState>,
}

impl Process {
    pub fn new(config: &ProcessConfig) -> Self {
        Self {
            id: config.id,
            think_interval: config.think_interval,
            use_duration: config.use_duration,
            created_at: Utc::now(),
            state: Mutex::new(ProcessState {
                status: ProcessStatus::Running,
                allocated: HashMap::new(),
                awaiting: None,
            }),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn think_interval(&self) -> Duration {
        self.think_interval
    }

    pub fn use_duration(&self) -> Duration {
        self.use_duration
    }

    pub fn status(&self) -> ProcessStatus {
        self.lock_state().status
    }

    /// Resource id -> held instance count. Entries are removed when they
    /// reach zero, so every stored count is positive.
    pub fn allocated(&self) -> HashMap<ResourceId, u32> {
        self.lock_state().allocated.clone()
    }

    pub fn awaiting(&self) -> Option<ResourceId> {
        self.lock_state().awaiting
    }

    /// Snapshot for external observers.
    pub fn info(&self) -> ProcessInfo {
        let state = self.lock_state();
        ProcessInfo {
            id: self.id,
            status: state.status,
            allocated: state.allocated.clone(),
            awaiting: state.awaiting,
            created_at: self.created_at,
        }
    }

    /// Consistent read of everything the detector needs, under one lock
    /// acquisition so no torn per-process state can be observed.
    pub(crate) fn snapshot(&self) -> (ProcessStatus, HashMap<ResourceId, u32>, Option<ResourceId>) {
        let state = self.lock_state();
        (state.status, state.allocated.clone(), state.awaiting)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Entering a blocking acquire for `resource`.
    pub(crate) fn mark_waiting(&self, resource: ResourceId) {
        let mut state = self.lock_state();
        state.status = ProcessStatus::Blocked;
        state.awaiting = Some(resource);
    }

    /// The awaited acquire was granted.
    pub(crate) fn mark_granted(&self, resource: ResourceId) {
        let mut state = self.lock_state();
        *state.allocated.entry(resource).or_insert(0) += 1;
        state.awaiting = None;
        state.status = ProcessStatus::Running;
    }

    /// Drops the bookkeeping for `resource` after its instances went back to
    /// the pool. The pool is credited first so a sampled snapshot can only
    /// over-count availability, never under-count it.
    pub(crate) fn clear_allocation(&self, resource: ResourceId) {
        self.lock_state().allocated.remove(&resource);
    }

    pub(crate) fn mark_terminated(&self) {
        let mut state = self.lock_state();
        state.status = ProcessStatus::Terminated;
        state.awaiting = None;
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("status", &state.status)
            .field("allocated", &state.allocated)
            .field("awaiting", &state.awaiting)
            .finish()
    }
}

/// Chooses the resource types a process will request for its next task.
///
/// Injectable so tests can force specific interleavings (for example a
/// classic two-process circular wait) without relying on timing races.
pub trait TaskSource: Send {
    /// Picks the resources for the next task from `resources` (the configured
    /// ids, sorted ascending). Acquisition follows the returned order. An
    /// empty task means none can be formed this cycle; the process waits one
    /// think interval and retries.
    fn next_task(&mut self, resources: &[ResourceId]) -> Vec<ResourceId>;
}

/// Default source: 2-3 distinct resource types chosen at random.
///
/// With fewer than two configured types no task is formed, so a single-type
/// system can never produce a hold-and-wait condition.
pub struct RandomTaskSource {
    rng: StdRng,
}

impl RandomTaskSource {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomTaskSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSource for RandomTaskSource {
    fn next_task(&mut self, resources: &[ResourceId]) -> Vec<ResourceId> {
        if resources.len() < 2 {
            return Vec::new();
        }
        let wanted = self.rng.gen_range(2..=3).min(resources.len());
        resources
            .choose_multiple(&mut self.rng, wanted)
            .copied()
            .collect()
    }
}

/// Replays a fixed task list, then idles. Used to script exact acquisition
/// orders in tests and demos.
pub struct ScriptedTaskSource {
    tasks: VecDeque<Vec<ResourceId>>,
}

impl ScriptedTaskSource {
    pub fn new(tasks: impl IntoIterator<Item = Vec<ResourceId>>) -> Self {
        Self {
            tasks: tasks.into_iter().collect(),
        }
    }
}

impl TaskSource for ScriptedTaskSource {
    fn next_task(&mut self, _resources: &[ResourceId]) -> Vec<ResourceId> {
        self.tasks.pop_front().unwrap_or_default()
    }
}

/// Everything a worker thread needs, injected at spawn time.
pub(crate) struct WorkerContext {
    pub process: Arc<Process>,
    pub registry: Arc<Registry>,
    pub gate: Arc<StartGate>,
    pub stop: StopToken,
    pub events: Arc<dyn EventSink>,
}

/// Spawns the named worker thread running the process's lifecycle.
pub(crate) fn spawn_worker(
    ctx: WorkerContext,
    tasks: Box<dyn TaskSource>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("process-{}", ctx.process.id()))
        .spawn(move || worker_main(ctx, tasks))
}

fn worker_main(ctx: WorkerContext, mut tasks: Box<dyn TaskSource>) {
    let id = ctx.process.id();
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| run_cycles(&ctx, tasks.as_mut())));
    if outcome.is_err() {
        error!(process = id, "worker panicked, terminating this actor only");
        ctx.events
            .log_line(format!("P{id}: internal fault, terminating"));
    }
    // Release-on-exit is unconditional: it runs after a cooperative stop,
    // after cancellation mid-acquisition, and after an internal fault alike.
    release_all(&ctx);
    ctx.process.mark_terminated();
    ctx.events.log_line(format!("P{id}: terminated"));
    ctx.events.refresh();
    debug!(process = id, "worker exited");
}

fn run_cycles(ctx: &WorkerContext, tasks: &mut dyn TaskSource) {
    let id = ctx.process.id();

    ctx.events
        .log_line(format!("P{id}: waiting for simulation start"));
    if ctx.gate.wait(&ctx.stop).is_err() {
        return;
    }
    ctx.events.log_line(format!("P{id}: started"));
    ctx.events.refresh();

    while !ctx.stop.is_stopped() {
        let resource_ids = ctx.registry.resource_ids();
        let task = tasks.next_task(&resource_ids);
        if task.is_empty() {
            // Fewer than two resource types configured (or an exhausted
            // script): no task can be formed this cycle.
            if !ctx.stop.sleep(ctx.process.think_interval()) {
                return;
            }
            continue;
        }

        ctx.events
            .log_line(format!("P{id}: new task, wants resources {task:?}"));
        if !acquire_task(ctx, &task) {
            return;
        }

        ctx.events
            .log_line(format!("P{id}: holding all task resources, using them"));
        ctx.events.refresh();
        if !ctx.stop.sleep(ctx.process.use_duration()) {
            return;
        }

        release_all(ctx);
        ctx.events
            .log_line(format!("P{id}: released all resources"));
        ctx.events.refresh();

        if !ctx.stop.sleep(ctx.process.think_interval()) {
            return;
        }
    }
}

/// Acquires every resource of `task` in order, blocking as needed, with one
/// think interval between successive acquisitions (none after the last).
/// Returns `false` if the worker was stopped along the way.
fn acquire_task(ctx: &WorkerContext, task: &[ResourceId]) -> bool {
    let id = ctx.process.id();
    for (i, &resource_id) in task.iter().enumerate() {
        let Some(resource) = ctx.registry.resource(resource_id) else {
            // The resource set changed under us; skip the stale id.
            warn!(process = id, resource = resource_id, "task names an unknown resource");
            continue;
        };

        ctx.process.mark_waiting(resource_id);
        ctx.events
            .log_line(format!("P{id}: requesting resource {}", resource.name()));
        ctx.events.refresh();

        if resource.acquire(&ctx.stop).is_err() {
            return false;
        }
        ctx.process.mark_granted(resource_id);
        ctx.events
            .log_line(format!("P{id}: acquired resource {}", resource.name()));
        ctx.events.refresh();

        if i + 1 < task.len() && !ctx.stop.sleep(ctx.process.think_interval()) {
            return false;
        }
    }
    true
}

/// Returns every held instance to its pool. The pool is credited before the
/// process's own bookkeeping is cleared (see [`Process::clear_allocation`]).
fn release_all(ctx: &WorkerContext) {
    for (resource_id, count) in ctx.process.allocated() {
        if let Some(resource) = ctx.registry.resource(resource_id) {
            for _ in 0..count {
                resource.release();
            }
        }
        ctx.process.clear_allocation(resource_id);
    }
}
