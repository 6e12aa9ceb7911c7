//! Error taxonomy of the coordinator.

use kernel::KernelError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::hotstart::HotStartError;

/// Everything that can stop a simulation.
///
/// `Config`, `GridTooLarge`, `MissingFeature` and `HotStart` are returned by
/// [`crate::Simulation::initialize`] before any worker runs. `ExecutionAborted`
/// and `DtZero` end a running simulation; finalization still happens.
#[derive(Debug, Error)]
pub enum SimError {
    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The world grid would need more cells than a hash can address.
    #[error("grid needs {cells} cells, at most {max} are supported")]
    GridTooLarge {
        /// Cells the grid would need.
        cells: u64,
        /// Largest supported cell count.
        max: u64,
    },

    /// The problem asks for something this build cannot do.
    #[error("unsupported feature: {0}")]
    MissingFeature(String),

    /// Checkpoint files could not be resolved or read.
    #[error("hot start failed: {0}")]
    HotStart(#[from] HotStartError),

    /// A worker failed, or a command was issued after one did.
    #[error("execution aborted")]
    ExecutionAborted,

    /// Time did not advance from zero.
    #[error("time step {dt} did not advance time from zero")]
    DtZero {
        /// Step size in effect.
        dt: f32,
    },

    /// Host-side kernel data structure error.
    #[error(transparent)]
    Kernel(KernelError),

    /// A worker thread could not be started.
    #[error("failed to spawn worker {device}: {source}")]
    Spawn {
        /// Device index within the node.
        device: usize,
        /// Underlying error.
        source: std::io::Error,
    },

    /// An operation needs a different lifecycle state.
    #[error("simulation is {0}")]
    InvalidState(&'static str),

    /// Output error from a writer.
    #[error("writer {writer} failed: {source}")]
    Writer {
        /// Writer name.
        writer: String,
        /// Underlying error.
        source: std::io::Error,
    },
}

impl From<KernelError> for SimError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::GridTooLarge { cells, max } => SimError::GridTooLarge { cells, max },
            other => SimError::Kernel(other),
        }
    }
}

impl From<kernel::BufferError> for SimError {
    fn from(err: kernel::BufferError) -> Self {
        SimError::Kernel(KernelError::Buffer(err))
    }
}
