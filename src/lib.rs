//! deadlock-sim - Multi-resource allocation simulator with deadlock detection
//!
//! Simulates an operating environment in which independent process actors
//! compete for a fixed pool of typed, multi-instance resources while a
//! periodic monitor analyzes the global allocation state with a
//! Banker's-style safety reduction and reports deadlocked process ids.
//!
//! The crate is the headless core only: front ends consume it through the
//! read-only queries on [`Simulation`] and the [`EventSink`]/[`ReportSink`]
//! callbacks; they never participate in the core's invariants.

pub mod core;
mod error;

pub use crate::core::{
    Cancelled, DeadlockDetector, DeadlockReport, EventSink, NullEventSink, Process, ProcessConfig,
    ProcessId, ProcessInfo, ProcessStatus, RandomTaskSource, Registry, ReportSink, Resource,
    ResourceConfig, ResourceId, ResourceInfo, ScriptedTaskSource, Simulation, StartGate, StopToken,
    TaskSource, TracingEventSink, MAX_PROCESSES, MAX_RESOURCE_TYPES,
};
pub use crate::error::{Result, SimulationError};
