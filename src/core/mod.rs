//! Core module - Resource pools, process actors, and deadlock detection

mod detector;
pub mod events;
mod process;
mod registry;
mod resource;
mod simulation;

pub use detector::{DeadlockDetector, DeadlockReport};
pub use events::{EventSink, NullEventSink, ReportSink, TracingEventSink};
pub use process::{
    Process, ProcessConfig, ProcessId, ProcessInfo, ProcessStatus, RandomTaskSource,
    ScriptedTaskSource, TaskSource,
};
pub use registry::{Cancelled, Registry, StartGate, StopToken};
pub use resource::{Resource, ResourceConfig, ResourceId, ResourceInfo};
pub use simulation::{Simulation, MAX_PROCESSES, MAX_RESOURCE_TYPES};
