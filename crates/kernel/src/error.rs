//! Error types for device-side operations.

use thiserror::Error;

use crate::buffers::BufferKind;
use crate::command::CommandType;

/// Errors raised by the buffer registry.
#[derive(Debug, Error, PartialEq)]
pub enum BufferError {
    /// The buffer was never registered with `add`.
    #[error("buffer {0:?} is not registered")]
    Missing(BufferKind),

    /// The buffer was registered but `allocate` has not run yet.
    #[error("buffer {0:?} has no storage allocated")]
    Unallocated(BufferKind),

    /// The operation needs both READ and WRITE versions.
    #[error("buffer {0:?} is not double-buffered")]
    SingleVersioned(BufferKind),

    /// Typed access with the wrong element type.
    #[error("buffer {kind:?} holds {found} elements, requested {requested}")]
    TypeMismatch {
        /// Buffer being accessed.
        kind: BufferKind,
        /// Element type actually stored.
        found: &'static str,
        /// Element type requested by the caller.
        requested: &'static str,
    },

    /// A range of elements does not fit in the allocated capacity.
    #[error("range {start}..{end} of buffer {kind:?} exceeds capacity {capacity}")]
    OutOfBounds {
        /// Buffer being accessed.
        kind: BufferKind,
        /// First element of the range.
        start: usize,
        /// One past the last element of the range.
        end: usize,
        /// Allocated element count.
        capacity: usize,
    },
}

/// Errors raised by a device while executing a command.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Buffer registry failure.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// The device would need more slots than it allocated.
    #[error("device {device} needs {requested} particle slots but only {capacity} are allocated")]
    CapacityExceeded {
        /// Local device index.
        device: usize,
        /// Slots needed.
        requested: usize,
        /// Slots allocated.
        capacity: usize,
    },

    /// The device does not implement the command.
    #[error("command {0:?} is not supported by this device")]
    Unsupported(CommandType),

    /// The grid would have more cells than a cell hash can address.
    #[error("grid has {cells} cells, more than the supported {max}")]
    GridTooLarge {
        /// Requested cell count.
        cells: u64,
        /// Maximum cell count.
        max: u64,
    },

    /// Host partition and device state disagree.
    #[error("device {device}: partition holds {host} particles, device has {device_count}")]
    PartitionMismatch {
        /// Local device index.
        device: usize,
        /// Particles assigned by the host.
        host: usize,
        /// Particles held by the device.
        device_count: usize,
    },

    /// Any other device failure.
    #[error("device {device} failed: {reason}")]
    Failed {
        /// Local device index.
        device: usize,
        /// Human readable reason.
        reason: String,
    },
}
