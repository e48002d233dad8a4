//! Resource pools - Typed, multi-instance resources that processes compete for

use std::sync::{Condvar, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::registry::{Cancelled, StopToken};

/// Unique identifier of a resource type (positive, operator-assigned).
pub type ResourceId = u32;

/// Configuration for one resource type, supplied before a simulation starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Unique positive identifier
    pub id: ResourceId,
    /// Display name for the resource
    pub name: String,
    /// Fixed number of interchangeable instances (must be positive)
    pub total_instances: u32,
}

impl ResourceConfig {
    pub fn new(id: ResourceId, name: impl Into<String>, total_instances: u32) -> Self {
        Self {
            id,
            name: name.into(),
            total_instances,
        }
    }
}

/// Read-only snapshot of a resource, for external observers.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceInfo {
    pub id: ResourceId,
    pub name: String,
    pub total_instances: u32,
    pub free_instances: u32,
}

/// A pool of N interchangeable instances with blocking acquisition.
///
/// The free-instance counter is the only piece of state mutated by multiple
/// concurrent processes; it is guarded by a single mutex/condvar pair per
/// resource (a counting-semaphore equivalent), so acquire/release pairs on
/// unrelated resources interleave without any global lock.
pub struct Resource {
    id: ResourceId,
    name: String,
    total_instances: u32,
    free: Mutex<u32>,
    granted: Condvar,
}

impl Resource {
    pub fn new(config: ResourceConfig) -> Self {
        Self {
            id: config.id,
            name: config.name,
            total_instances: config.total_instances,
            free: Mutex::new(config.total_instances),
            granted: Condvar::new(),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixed capacity, immutable for the lifetime of the pool.
    pub fn total_instances(&self) -> u32 {
        self.total_instances
    }

    /// Consistent, non-blocking read of the free-instance counter.
    pub fn free_instances(&self) -> u32 {
        *self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks the caller until an instance is available, then takes it.
    ///
    /// Returns `Err(Cancelled)` if the stop token fires first; nothing is
    /// acquired in that case. A cancelled waiter that raced with a grant
    /// passes the wakeup on so the permit is never lost.
    pub fn acquire(&self, stop: &StopToken) -> Result<(), Cancelled> {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if stop.is_stopped() {
                if *free > 0 {
                    self.granted.notify_one();
                }
                return Err(Cancelled);
            }
            if *free > 0 {
                *free -= 1;
                trace!(resource = self.id, free = *free, "instance acquired");
                return Ok(());
            }
            free = self
                .granted
                .wait(free)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking acquire. Returns `false` without modifying state when no
    /// instance is free.
    pub fn try_acquire(&self) -> bool {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if *free > 0 {
            *free -= 1;
            true
        } else {
            false
        }
    }

    /// Returns one instance to the pool and wakes at most one blocked waiter.
    ///
    /// Callers own release symmetry: only instances previously acquired may
    /// be returned. The counter must never exceed capacity.
    pub fn release(&self) {
        {
            let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
            *free += 1;
            debug_assert!(
                *free <= self.total_instances,
                "released more instances than resource {} holds",
                self.id
            );
            trace!(resource = self.id, free = *free, "instance released");
        }
        self.granted.notify_one();
    }

    /// Wakes every blocked acquirer so it can observe its stop token.
    ///
    /// Waiters whose token has not fired simply go back to waiting.
    pub fn interrupt_waiters(&self) {
        // Take the lock so a waiter between its token check and its wait
        // cannot miss the notification.
        drop(self.free.lock().unwrap_or_else(PoisonError::into_inner));
        self.granted.notify_all();
    }

    /// Snapshot for external observers.
    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            total_instances: self.total_instances,
            free_instances: self.free_instances(),
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("free", &self.free_instances())
            .field("total", &self.total_instances)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn pool(total: u32) -> Resource {
        Resource::new(ResourceConfig::new(1, "disk", total))
    }

    #[test]
    fn try_acquire_stops_at_zero() {
        let r = pool(2);
        assert!(r.try_acquire());
        assert!(r.try_acquire());
        assert!(!r.try_acquire());
        assert_eq!(r.free_instances(), 0);
        r.release();
        assert_eq!(r.free_instances(), 1);
    }

    #[test]
    fn acquire_blocks_until_release() {
        let r = Arc::new(pool(1));
        let stop = StopToken::new();
        r.acquire(&stop).unwrap();

        let r2 = Arc::clone(&r);
        let stop2 = stop.clone();
        let waiter = thread::spawn(move || r2.acquire(&stop2));

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        r.release();
        waiter.join().unwrap().unwrap();
        assert_eq!(r.free_instances(), 0);
    }

    #[test]
    fn stop_token_interrupts_blocked_acquire() {
        let r = Arc::new(pool(1));
        let stop = StopToken::new();
        r.acquire(&stop).unwrap();

        let r2 = Arc::clone(&r);
        let stop2 = stop.clone();
        let waiter = thread::spawn(move || r2.acquire(&stop2));

        thread::sleep(Duration::from_millis(50));
        stop.stop();
        r.interrupt_waiters();
        assert!(waiter.join().unwrap().is_err());
        // The aborted acquire consumed nothing.
        assert_eq!(r.free_instances(), 0);
    }

    #[test]
    fn counter_stays_in_bounds_under_contention() {
        let r = Arc::new(pool(3));
        let stop = StopToken::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let r = Arc::clone(&r);
            let stop = stop.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    r.acquire(&stop).unwrap();
                    let free = r.free_instances();
                    assert!(free <= r.total_instances());
                    r.release();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Every acquire was paired with a release.
        assert_eq!(r.free_instances(), 3);
    }
}
