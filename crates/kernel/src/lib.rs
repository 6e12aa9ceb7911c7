//! Device-side half of the particle simulation coordinator.
//!
//! This crate defines everything a compute device needs to take part in a
//! lock-step simulation driven by the `orchestrator` crate.
//!
//! # Modules
//! - [`buffers`] -- field registry with per-field double buffering and swaps.
//! - [`command`] -- opcodes and arguments broadcast to every device.
//! - [`grid`] -- uniform world grid, cell hashing and the per-cell particle index.
//! - [`devmap`] -- cell ownership, device topology, cell classes and segments.
//! - [`halo`] -- packets of edge particles exchanged between devices.
//! - [`device`] -- the [`DeviceKernel`] trait and its parameters.
//! - [`cpu`] -- [`CpuDevice`], the reference weakly-compressible SPH device.
//! - [`sph`] -- smoothing kernel, equation of state and time step control.
//! - [`particle`] -- per-particle type information.

#![warn(missing_docs)]

pub mod buffers;
pub mod command;
pub mod cpu;
pub mod device;
pub mod devmap;
pub mod error;
pub mod grid;
pub mod halo;
pub mod particle;
pub mod sph;

pub use buffers::{BufferData, BufferKind, BufferList, BufferSet, Element, ElementKind, Side};
pub use command::{Command, CommandType, INTEGRATOR_STEP_1, INTEGRATOR_STEP_2};
pub use cpu::CpuDevice;
pub use device::{
    BodyMotion, DeviceContext, DeviceFactory, DeviceKernel, DeviceReport, DeviceSetup, OpenBoundary,
    OpenBoundaryKind, PhysicsParams, StepParams,
};
pub use devmap::{CellType, DeviceMap, GlobalDeviceId, SegmentTable, Topology, INACTIVE_HASH};
pub use error::{BufferError, KernelError};
pub use grid::{CellIndex, Grid, MAX_CELLS};
pub use halo::HaloPacket;
pub use particle::{ParticleInfo, ParticleType};
