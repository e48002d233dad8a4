//! Error types for operator-facing commands

use thiserror::Error;

use crate::core::{ProcessId, ResourceId};

/// Errors rejected synchronously at the command boundary.
///
/// None of these leave the simulation in a partially-applied state: a failed
/// command changes nothing.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("duplicate resource id {0}")]
    DuplicateResource(ResourceId),

    #[error("duplicate process id {0}")]
    DuplicateProcess(ProcessId),

    #[error("resource id must be positive")]
    InvalidResourceId,

    #[error("process id must be positive")]
    InvalidProcessId,

    #[error("resource capacity must be positive")]
    InvalidCapacity,

    #[error("timing parameters must be positive")]
    InvalidTiming,

    #[error("resource type limit of {0} reached")]
    TooManyResources(usize),

    #[error("process limit of {0} reached")]
    TooManyProcesses(usize),

    #[error("process {0} not found")]
    ProcessNotFound(ProcessId),

    #[error("operation not allowed while a simulation is active")]
    SimulationActive,

    #[error("failed to spawn actor thread")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SimulationError>;
