//! Shared registries and coordination primitives
//!
//! The resource and process tables are shared by reference among every actor
//! and the monitor; they are mutated only by the operator-facing layer.
//! Iteration is copy-on-iterate so a structural change can never corrupt an
//! in-flight detector snapshot or a process's resource lookup.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use super::process::{Process, ProcessId};
use super::resource::{Resource, ResourceId};

/// Marker returned when a blocking wait was interrupted by a stop signal.
///
/// Cancellation is expected control flow, not a fault: the caller is
/// responsible for running its release-on-exit path and terminating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

struct StopInner {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Cooperative stop signal shared between an actor and its controller.
///
/// Fires exactly once; all timed waits built on it return early when it does.
#[derive(Clone)]
pub struct StopToken {
    inner: Arc<StopInner>,
}

impl StopToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopInner {
                stopped: Mutex::new(false),
                wake: Condvar::new(),
            }),
        }
    }

    /// Signals the actor to stop and wakes any sleep in progress.
    pub fn stop(&self) {
        let mut stopped = self
            .inner
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *stopped = true;
        drop(stopped);
        self.inner.wake.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self
            .inner
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for `duration`, returning `false` if the token fired first.
    ///
    /// This is a cancellable timed wait, not a busy loop.
    pub fn sleep(&self, duration: Duration) -> bool {
        let start = Instant::now();
        let mut stopped = self
            .inner
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            let elapsed = start.elapsed();
            if elapsed >= duration {
                return true;
            }
            let (guard, _) = self
                .inner
                .wake
                .wait_timeout(stopped, duration - elapsed)
                .unwrap_or_else(PoisonError::into_inner);
            stopped = guard;
        }
        false
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One-time barrier releasing every process actor simultaneously when the
/// simulation begins. Workers spawned after the gate opened pass through
/// immediately.
pub struct StartGate {
    opened: Mutex<bool>,
    release: Condvar,
}

impl StartGate {
    pub fn new() -> Self {
        Self {
            opened: Mutex::new(false),
            release: Condvar::new(),
        }
    }

    /// Opens the gate and releases every waiting actor.
    pub fn open(&self) {
        let mut opened = self.opened.lock().unwrap_or_else(PoisonError::into_inner);
        *opened = true;
        drop(opened);
        self.release.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *self.opened.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the gate opens, or until `stop` fires.
    pub fn wait(&self, stop: &StopToken) -> Result<(), Cancelled> {
        let mut opened = self.opened.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *opened {
                return Ok(());
            }
            if stop.is_stopped() {
                return Err(Cancelled);
            }
            opened = self
                .release
                .wait(opened)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wakes every gate waiter so it can observe its stop token.
    pub fn wake_waiters(&self) {
        drop(self.opened.lock().unwrap_or_else(PoisonError::into_inner));
        self.release.notify_all();
    }
}

impl Default for StartGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared resource and process tables, injected into every actor and the
/// monitor at construction time.
#[derive(Default)]
pub struct Registry {
    resources: RwLock<HashMap<ResourceId, Arc<Resource>>>,
    processes: RwLock<HashMap<ProcessId, Arc<Process>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole resource table (only between simulation runs).
    pub fn replace_resources(&self, resources: HashMap<ResourceId, Arc<Resource>>) {
        *self
            .resources
            .write()
            .unwrap_or_else(PoisonError::into_inner) = resources;
    }

    pub fn resource(&self, id: ResourceId) -> Option<Arc<Resource>> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Snapshot of all resources, sorted by id ascending.
    pub fn resources_sorted(&self) -> Vec<Arc<Resource>> {
        let mut resources: Vec<Arc<Resource>> = self
            .resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        resources.sort_by_key(|r| r.id());
        resources
    }

    /// Configured resource ids, sorted ascending.
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self
            .resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn resource_count(&self) -> usize {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn insert_process(&self, process: Arc<Process>) {
        self.processes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(process.id(), process);
    }

    pub fn remove_process(&self, id: ProcessId) -> Option<Arc<Process>> {
        self.processes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn process(&self, id: ProcessId) -> Option<Arc<Process>> {
        self.processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn contains_process(&self, id: ProcessId) -> bool {
        self.processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Snapshot of all registered processes.
    pub fn processes(&self) -> Vec<Arc<Process>> {
        self.processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn process_count(&self) -> usize {
        self.processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn clear_processes(&self) {
        self.processes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Wakes every blocked waiter across all resources. Called after a stop
    /// signal so a cancelled actor leaves its blocking acquire promptly.
    pub fn interrupt_all_waiters(&self) {
        for resource in self.resources_sorted() {
            resource.interrupt_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn stop_token_interrupts_sleep() {
        let token = StopToken::new();
        let t2 = token.clone();
        let sleeper = thread::spawn(move || t2.sleep(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(50));
        token.stop();
        assert!(!sleeper.join().unwrap());
        assert!(token.is_stopped());
    }

    #[test]
    fn sleep_completes_when_not_stopped() {
        let token = StopToken::new();
        assert!(token.sleep(Duration::from_millis(10)));
    }

    #[test]
    fn gate_releases_all_waiters_at_once() {
        let gate = Arc::new(StartGate::new());
        let stop = StopToken::new();
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            let stop = stop.clone();
            waiters.push(thread::spawn(move || gate.wait(&stop)));
        }
        thread::sleep(Duration::from_millis(50));
        assert!(waiters.iter().all(|w| !w.is_finished()));
        gate.open();
        for w in waiters {
            assert!(w.join().unwrap().is_ok());
        }
        // Late arrivals pass straight through.
        assert!(gate.wait(&stop).is_ok());
    }

    #[test]
    fn gate_wait_is_cancellable() {
        let gate = Arc::new(StartGate::new());
        let stop = StopToken::new();
        let gate2 = Arc::clone(&gate);
        let stop2 = stop.clone();
        let waiter = thread::spawn(move || gate2.wait(&stop2));
        thread::sleep(Duration::from_millis(50));
        stop.stop();
        gate.wake_waiters();
        assert_eq!(waiter.join().unwrap(), Err(Cancelled));
    }
}
