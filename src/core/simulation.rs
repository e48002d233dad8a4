//! Simulation facade - Operator-facing lifecycle commands and queries
//!
//! Owns the shared registry, the start gate, the worker threads, and the
//! monitor. All configuration errors are rejected synchronously here with
//! the simulation state unchanged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info};

use super::detector::{DeadlockDetector, DeadlockReport};
use super::events::{EventSink, ReportSink, TracingEventSink};
use super::process::{
    spawn_worker, Process, ProcessConfig, ProcessId, ProcessInfo, RandomTaskSource, TaskSource,
    WorkerContext,
};
use super::registry::{Registry, StartGate, StopToken};
use super::resource::{Resource, ResourceConfig, ResourceInfo};
use crate::error::{Result, SimulationError};

/// Maximum number of simultaneously registered processes.
pub const MAX_PROCESSES: usize = 10;

/// Maximum number of configured resource types.
pub const MAX_RESOURCE_TYPES: usize = 10;

/// A spawned actor thread and its stop signal.
struct Worker {
    stop: StopToken,
    handle: JoinHandle<()>,
}

/// Central simulation state.
///
/// Registries are mutated only through this facade, never by processes or
/// the monitor themselves.
pub struct Simulation {
    registry: Arc<Registry>,
    /// Replaced with a fresh closed gate between runs.
    gate: RwLock<Arc<StartGate>>,
    events: Arc<dyn EventSink>,
    reports: Arc<dyn ReportSink>,
    workers: Mutex<HashMap<ProcessId, Worker>>,
    monitor: Mutex<Option<Worker>>,
}

impl Simulation {
    pub fn new(events: Arc<dyn EventSink>, reports: Arc<dyn ReportSink>) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            gate: RwLock::new(Arc::new(StartGate::new())),
            events,
            reports,
            workers: Mutex::new(HashMap::new()),
            monitor: Mutex::new(None),
        }
    }

    /// Simulation with both sinks forwarding to `tracing`.
    pub fn headless() -> Self {
        Self::new(Arc::new(TracingEventSink), Arc::new(TracingEventSink))
    }

    /// Replaces the resource set. Only allowed before or between simulation
    /// runs; identities and capacities are immutable while one is active.
    pub fn configure_resources(&self, configs: Vec<ResourceConfig>) -> Result<()> {
        if self.is_running() {
            return Err(SimulationError::SimulationActive);
        }
        if configs.len() > MAX_RESOURCE_TYPES {
            return Err(SimulationError::TooManyResources(MAX_RESOURCE_TYPES));
        }
        let mut table = HashMap::with_capacity(configs.len());
        for config in configs {
            if config.id == 0 {
                return Err(SimulationError::InvalidResourceId);
            }
            if config.total_instances == 0 {
                return Err(SimulationError::InvalidCapacity);
            }
            let id = config.id;
            if table.insert(id, Arc::new(Resource::new(config))).is_some() {
                return Err(SimulationError::DuplicateResource(id));
            }
        }
        let count = table.len();
        self.registry.replace_resources(table);
        info!(resource_types = count, "resource set configured");
        self.events
            .log_line(format!("operator: configured {count} resource types"));
        self.events.refresh();
        Ok(())
    }

    /// Creates a process with the default randomized task selection and
    /// starts its worker thread. The worker parks on the start gate until
    /// [`Simulation::start`] releases it.
    pub fn add_process(&self, config: ProcessConfig) -> Result<ProcessId> {
        let tasks: Box<dyn TaskSource> = match config.rng_seed {
            Some(seed) => Box::new(RandomTaskSource::seeded(seed)),
            None => Box::new(RandomTaskSource::new()),
        };
        self.add_process_with_tasks(config, tasks)
    }

    /// Like [`Simulation::add_process`] but with a caller-supplied task
    /// source, so exact acquisition orders can be scripted.
    pub fn add_process_with_tasks(
        &self,
        config: ProcessConfig,
        tasks: Box<dyn TaskSource>,
    ) -> Result<ProcessId> {
        if config.id == 0 {
            return Err(SimulationError::InvalidProcessId);
        }
        if config.think_interval.is_zero() || config.use_duration.is_zero() {
            return Err(SimulationError::InvalidTiming);
        }

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.len() >= MAX_PROCESSES {
            return Err(SimulationError::TooManyProcesses(MAX_PROCESSES));
        }
        if workers.contains_key(&config.id) || self.registry.contains_process(config.id) {
            return Err(SimulationError::DuplicateProcess(config.id));
        }

        let process = Arc::new(Process::new(&config));
        let stop = StopToken::new();
        let ctx = WorkerContext {
            process: Arc::clone(&process),
            registry: Arc::clone(&self.registry),
            gate: self.current_gate(),
            stop: stop.clone(),
            events: Arc::clone(&self.events),
        };
        let handle = spawn_worker(ctx, tasks)?;

        self.registry.insert_process(process);
        workers.insert(config.id, Worker { stop, handle });
        info!(process = config.id, "process added");
        self.events.log_line(format!(
            "operator: process P{} added (think {:?}, use {:?})",
            config.id, config.think_interval, config.use_duration
        ));
        self.events.refresh();
        Ok(config.id)
    }

    /// Releases the start gate and starts the monitor with period `delta_t`.
    pub fn start(&self, delta_t: Duration) -> Result<()> {
        if delta_t.is_zero() {
            return Err(SimulationError::InvalidTiming);
        }
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.is_some() {
            return Err(SimulationError::SimulationActive);
        }

        self.current_gate().open();
        let stop = StopToken::new();
        let detector = Arc::new(DeadlockDetector::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.events),
            Arc::clone(&self.reports),
        ));
        let handle = detector.spawn(delta_t, stop.clone())?;
        *monitor = Some(Worker { stop, handle });

        info!(period = ?delta_t, "simulation started");
        self.events.log_line(format!(
            "operator: simulation started, checking for deadlock every {delta_t:?}"
        ));
        self.events.refresh();
        Ok(())
    }

    /// Stops one process and removes it. Returns only after the worker ran
    /// its release-on-exit path and terminated.
    pub fn remove_process(&self, id: ProcessId) -> Result<()> {
        let worker = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or(SimulationError::ProcessNotFound(id))?;

        worker.stop.stop();
        // Wake it out of whatever wait it is parked in.
        self.current_gate().wake_waiters();
        self.registry.interrupt_all_waiters();
        if worker.handle.join().is_err() {
            error!(process = id, "worker thread panicked during shutdown");
        }

        self.registry.remove_process(id);
        info!(process = id, "process removed");
        self.events.log_line(format!("operator: process P{id} removed"));
        self.events.refresh();
        Ok(())
    }

    /// Stops the monitor, signals every process to terminate, and waits for
    /// all of them. The process table is cleared and the start gate re-armed
    /// so the operator can reconfigure and run again.
    pub fn stop(&self) {
        // Take the monitor out under the lock, join it after: queries like
        // is_running() must not block behind a join that can outlast a
        // detection cycle.
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            monitor.stop.stop();
            let _ = monitor.handle.join();
        }

        let workers: Vec<(ProcessId, Worker)> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, worker) in &workers {
            worker.stop.stop();
        }
        self.current_gate().wake_waiters();
        self.registry.interrupt_all_waiters();
        for (id, worker) in workers {
            if worker.handle.join().is_err() {
                error!(process = id, "worker thread panicked during shutdown");
            }
        }

        self.registry.clear_processes();
        *self.gate.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(StartGate::new());
        info!("simulation stopped");
        self.events
            .log_line("operator: simulation stopped".to_string());
        self.events.refresh();
    }

    /// Runs a single detection cycle on demand, outside the monitor cadence.
    pub fn run_detection(&self) -> DeadlockReport {
        DeadlockDetector::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.events),
            Arc::clone(&self.reports),
        )
        .detect_once()
    }

    pub fn is_running(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Snapshot of every registered process, sorted by id.
    pub fn processes(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self
            .registry
            .processes()
            .iter()
            .map(|p| p.info())
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn process(&self, id: ProcessId) -> Option<ProcessInfo> {
        self.registry.process(id).map(|p| p.info())
    }

    /// Snapshot of every configured resource, sorted by id.
    pub fn resources(&self) -> Vec<ResourceInfo> {
        self.registry
            .resources_sorted()
            .iter()
            .map(|r| r.info())
            .collect()
    }

    pub fn process_count(&self) -> usize {
        self.registry.process_count()
    }

    pub fn resource_count(&self) -> usize {
        self.registry.resource_count()
    }

    fn current_gate(&self) -> Arc<StartGate> {
        Arc::clone(&self.gate.read().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::NullEventSink;

    fn sim() -> Simulation {
        Simulation::new(Arc::new(NullEventSink), Arc::new(NullEventSink))
    }

    fn process_config(id: ProcessId) -> ProcessConfig {
        ProcessConfig::new(id, Duration::from_millis(50), Duration::from_millis(50))
    }

    #[test]
    fn rejects_invalid_resource_configs() {
        let sim = sim();
        assert!(matches!(
            sim.configure_resources(vec![ResourceConfig::new(0, "bad", 1)]),
            Err(SimulationError::InvalidResourceId)
        ));
        assert!(matches!(
            sim.configure_resources(vec![ResourceConfig::new(1, "bad", 0)]),
            Err(SimulationError::InvalidCapacity)
        ));
        assert!(matches!(
            sim.configure_resources(vec![
                ResourceConfig::new(1, "a", 1),
                ResourceConfig::new(1, "b", 1),
            ]),
            Err(SimulationError::DuplicateResource(1))
        ));
        let too_many: Vec<ResourceConfig> = (1..=(MAX_RESOURCE_TYPES as u32 + 1))
            .map(|id| ResourceConfig::new(id, format!("r{id}"), 1))
            .collect();
        assert!(matches!(
            sim.configure_resources(too_many),
            Err(SimulationError::TooManyResources(_))
        ));
        // A failed command left the state unchanged.
        assert_eq!(sim.resource_count(), 0);
    }

    #[test]
    fn rejects_invalid_process_configs() {
        let sim = sim();
        assert!(matches!(
            sim.add_process(process_config(0)),
            Err(SimulationError::InvalidProcessId)
        ));
        assert!(matches!(
            sim.add_process(ProcessConfig::new(
                1,
                Duration::ZERO,
                Duration::from_millis(10)
            )),
            Err(SimulationError::InvalidTiming)
        ));

        sim.add_process(process_config(1)).unwrap();
        assert!(matches!(
            sim.add_process(process_config(1)),
            Err(SimulationError::DuplicateProcess(1))
        ));
        assert_eq!(sim.process_count(), 1);
        sim.stop();
    }

    #[test]
    fn enforces_process_limit() {
        let sim = sim();
        for id in 1..=(MAX_PROCESSES as u32) {
            sim.add_process(process_config(id)).unwrap();
        }
        assert!(matches!(
            sim.add_process(process_config(99)),
            Err(SimulationError::TooManyProcesses(_))
        ));
        sim.stop();
    }

    #[test]
    fn rejects_reconfiguration_and_restart_while_active() {
        let sim = sim();
        sim.configure_resources(vec![ResourceConfig::new(1, "r1", 1)])
            .unwrap();
        sim.start(Duration::from_millis(100)).unwrap();
        assert!(matches!(
            sim.configure_resources(vec![ResourceConfig::new(2, "r2", 1)]),
            Err(SimulationError::SimulationActive)
        ));
        assert!(matches!(
            sim.start(Duration::from_millis(100)),
            Err(SimulationError::SimulationActive)
        ));
        assert!(matches!(
            sim.start(Duration::ZERO),
            Err(SimulationError::InvalidTiming)
        ));
        sim.stop();
        assert!(!sim.is_running());
        // Between runs reconfiguration is allowed again.
        sim.configure_resources(vec![ResourceConfig::new(2, "r2", 1)])
            .unwrap();
    }

    #[test]
    fn remove_unknown_process_is_an_error() {
        let sim = sim();
        assert!(matches!(
            sim.remove_process(42),
            Err(SimulationError::ProcessNotFound(42))
        ));
    }

    /// Report sink that parks the monitor thread inside a detection cycle
    /// until the test releases it.
    #[derive(Default)]
    struct StallingSink {
        entered: Mutex<bool>,
        entered_cv: std::sync::Condvar,
        released: Mutex<bool>,
        released_cv: std::sync::Condvar,
    }

    impl StallingSink {
        fn wait_entered(&self) {
            let mut entered = self.entered.lock().unwrap();
            while !*entered {
                entered = self.entered_cv.wait(entered).unwrap();
            }
        }

        fn release(&self) {
            *self.released.lock().unwrap() = true;
            self.released_cv.notify_all();
        }
    }

    impl ReportSink for StallingSink {
        fn deadlock_report(&self, _report: &DeadlockReport) {
            *self.entered.lock().unwrap() = true;
            self.entered_cv.notify_all();
            let mut released = self.released.lock().unwrap();
            while !*released {
                released = self.released_cv.wait(released).unwrap();
            }
        }
    }

    #[test]
    fn queries_are_not_blocked_while_stop_joins_the_monitor() {
        let sink = Arc::new(StallingSink::default());
        let sim = Arc::new(Simulation::new(Arc::new(NullEventSink), sink.clone()));
        sim.start(Duration::from_millis(10)).unwrap();
        sink.wait_entered();

        // stop() now waits for a monitor thread that is parked in the sink.
        let stopper = {
            let sim = Arc::clone(&sim);
            std::thread::spawn(move || sim.stop())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!stopper.is_finished());

        let query = {
            let sim = Arc::clone(&sim);
            std::thread::spawn(move || sim.is_running())
        };
        std::thread::sleep(Duration::from_millis(100));
        assert!(query.is_finished(), "query blocked behind stop()");
        assert!(!query.join().unwrap());

        sink.release();
        stopper.join().unwrap();
        assert!(!sim.is_running());
    }

    #[test]
    fn stop_terminates_everything_and_rearms_the_gate() {
        let sim = sim();
        sim.configure_resources(vec![
            ResourceConfig::new(1, "r1", 1),
            ResourceConfig::new(2, "r2", 1),
        ])
        .unwrap();
        sim.add_process(process_config(1)).unwrap();
        sim.add_process(process_config(2)).unwrap();
        sim.start(Duration::from_millis(50)).unwrap();
        std::thread::sleep(Duration::from_millis(150));

        sim.stop();
        assert!(!sim.is_running());
        assert_eq!(sim.process_count(), 0);
        // All instances returned to their pools.
        for resource in sim.resources() {
            assert_eq!(resource.free_instances, resource.total_instances);
        }
        // The next run starts gated again.
        sim.add_process(process_config(3)).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(sim.process(3).unwrap().allocated.is_empty());
        sim.stop();
    }
}
