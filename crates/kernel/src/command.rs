//! Commands broadcast by the coordinator to every device worker.

use crate::buffers::{BufferSet, Side};

/// Operation a device performs between two barrier rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    /// Do nothing.
    Idle,
    /// Leave the simulation loop.
    Quit,
    /// Copy the assigned host partition into device storage.
    Upload,
    /// Copy device particles back into the host partition.
    Dump,
    /// Compute the particle hash (cell and cell type).
    CalcHash,
    /// Sort particle indices by hash.
    Sort,
    /// Reorder every field following the sort.
    Reorder,
    /// Report particle counts and the particle-created flag.
    DownloadNewNumParts,
    /// Align the device particle counter with the current layout.
    UploadNewNumParts,
    /// Exchange READ and WRITE of the named fields.
    SwapBuffers,
    /// Publish the per-cell occupancy of owned cells.
    DumpCells,
    /// Publish the segment table.
    UpdateSegments,
    /// Drop halo particles.
    Crop,
    /// Import fresh halo copies from peer devices.
    AppendExternal,
    /// Refresh halo copies of the named fields.
    UpdateExternal,
    /// Build neighbour lists.
    BuildNeibs,
    /// Compute forces for every internal particle.
    ForcesSync,
    /// Compute forces of edge particles, defer the inner ones.
    ForcesEnqueue,
    /// Complete deferred force computation.
    ForcesComplete,
    /// Time integration sub-step.
    Euler,
    /// Run a filter, selected by the scalar argument.
    Filter,
    /// Load the current gravity vector.
    UploadGravity,
    /// Partial sums of forces and torques acting on rigid bodies.
    ReduceBodiesForces,
    /// Load rigid body positions and velocities.
    UploadObjectsMotion,
    /// Density summation pre-pass.
    ComputeDensity,
    /// Emit particles at inlets.
    ImposeOpenBoundary,
    /// Disable particles that crossed an outlet.
    DisableOutgoingParts,
    /// Load the scalar argument (the simulation time).
    UploadScalar,
}

impl CommandType {
    /// Commands executed in two phases around a device-to-device exchange.
    pub fn is_halo(self) -> bool {
        matches!(self, CommandType::AppendExternal | CommandType::UpdateExternal)
    }
}

/// First integration sub-step.
pub const INTEGRATOR_STEP_1: u8 = 1;
/// Second integration sub-step.
pub const INTEGRATOR_STEP_2: u8 = 2;

/// A command together with its arguments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    /// Operation.
    pub kind: CommandType,
    /// Fields the operation applies to.
    pub buffers: BufferSet,
    /// Version of the fields, when the operation needs one.
    pub side: Option<Side>,
    /// Integrator sub-step, zero outside integration.
    pub step: u8,
    /// Scalar argument.
    pub arg: f32,
    /// Restrict the operation to internal particles.
    pub only_internal: bool,
}

impl Command {
    /// The idle command.
    pub const IDLE: Command = Command::new(CommandType::Idle);

    /// Command without arguments.
    pub const fn new(kind: CommandType) -> Self {
        Self {
            kind,
            buffers: BufferSet::EMPTY,
            side: None,
            step: 0,
            arg: 0.0,
            only_internal: false,
        }
    }

    /// Set the fields.
    pub fn buffers(mut self, buffers: impl Into<BufferSet>) -> Self {
        self.buffers = buffers.into();
        self
    }

    /// Set the field version.
    pub fn side(mut self, side: Side) -> Self {
        self.side = Some(side);
        self
    }

    /// Set the integrator sub-step.
    pub fn step(mut self, step: u8) -> Self {
        self.step = step;
        self
    }

    /// Set the scalar argument.
    pub fn arg(mut self, arg: f32) -> Self {
        self.arg = arg;
        self
    }

    /// Restrict to internal particles.
    pub fn only_internal(mut self, only_internal: bool) -> Self {
        self.only_internal = only_internal;
        self
    }

    /// Field version, READ when unspecified.
    pub fn side_or_read(&self) -> Side {
        self.side.unwrap_or(Side::Read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferKind;

    #[test]
    fn builder_sets_arguments() {
        let cmd = Command::new(CommandType::UpdateExternal)
            .buffers(BufferKind::Vel | BufferKind::Pos)
            .side(Side::Write)
            .step(INTEGRATOR_STEP_2)
            .only_internal(true);
        assert!(cmd.buffers.contains(BufferKind::Vel));
        assert_eq!(cmd.side_or_read(), Side::Write);
        assert_eq!(cmd.step, 2);
        assert!(cmd.only_internal);
        assert!(cmd.kind.is_halo());
    }

    #[test]
    fn defaults_read_side() {
        assert_eq!(Command::new(CommandType::Dump).side_or_read(), Side::Read);
        assert!(!CommandType::Euler.is_halo());
    }
}
