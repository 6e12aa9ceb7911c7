//! Per-device compute interface.
//!
//! A worker thread owns one [`DeviceKernel`] and feeds it every command the
//! coordinator broadcasts. The kernel owns the device-resident particle data;
//! the host side is only reachable through the [`DeviceContext`] handed to
//! each call, and results flow back through the [`DeviceReport`].

use std::ops::Range;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::buffers::{BufferList, BufferSet};
use crate::command::Command;
use crate::devmap::{DeviceMap, SegmentTable};
use crate::error::KernelError;
use crate::grid::Grid;
use crate::halo::HaloPacket;
use crate::sph::PairConstants;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Whether an open boundary adds or removes particles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenBoundaryKind {
    /// Emits fluid particles with an imposed velocity.
    Inlet,
    /// Disables particles entering it.
    Outlet,
}

/// Box-shaped open boundary. Coordinates are relative to the world origin.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenBoundary {
    /// Inlet or outlet.
    pub kind: OpenBoundaryKind,
    /// Lower corner.
    pub min: [f64; 3],
    /// Upper corner.
    pub max: [f64; 3],
    /// Imposed velocity (inlets).
    pub velocity: [f32; 3],
    /// Time over which the inlet velocity ramps up from zero.
    pub ramp_time: f32,
}

impl OpenBoundary {
    /// True if `pos` lies inside the box.
    pub fn contains(&self, pos: [f64; 3]) -> bool {
        (0..3).all(|a| pos[a] >= self.min[a] && pos[a] <= self.max[a])
    }

    /// Axis of the dominant velocity component.
    pub fn flow_axis(&self) -> usize {
        let v = self.velocity;
        let mut axis = 0;
        for a in 1..3 {
            if v[a].abs() > v[axis].abs() {
                axis = a;
            }
        }
        axis
    }

    /// Inlet velocity at time `t`.
    pub fn velocity_at(&self, t: f32) -> [f32; 3] {
        let ramp = if self.ramp_time > 0.0 {
            (t / self.ramp_time).clamp(0.0, 1.0)
        } else {
            1.0
        };
        [self.velocity[0] * ramp, self.velocity[1] * ramp, self.velocity[2] * ramp]
    }
}

/// Physical constants shared by every device.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicsParams {
    /// Smoothing length h; the kernel support is 2h.
    pub smoothing_length: f32,
    /// Initial inter-particle distance.
    pub particle_spacing: f32,
    /// Rest density of the fluid.
    pub rest_density: f32,
    /// Numerical speed of sound.
    pub speed_of_sound: f32,
    /// Tait exponent.
    pub gamma: f32,
    /// CFL number for the adaptive time step.
    pub cfl: f32,
    /// Artificial viscosity coefficient.
    pub viscosity: f32,
    /// Upper bound of the adaptive time step.
    pub max_dt: f32,
    /// Inlets and outlets.
    pub open_boundaries: Vec<OpenBoundary>,
    /// First id handed out to particles created at inlets.
    pub first_created_id: u32,
}

impl Default for PhysicsParams {
    fn default() -> Self {
        Self {
            smoothing_length: 0.013,
            particle_spacing: 0.01,
            rest_density: 1000.0,
            speed_of_sound: 20.0,
            gamma: 7.0,
            cfl: 0.3,
            viscosity: 0.1,
            max_dt: 1.0e-3,
            open_boundaries: Vec::new(),
            first_created_id: 0,
        }
    }
}

impl PhysicsParams {
    /// Kernel support radius.
    pub fn support_radius(&self) -> f32 {
        2.0 * self.smoothing_length
    }

    /// Constants of the pair interaction.
    pub fn pair_constants(&self) -> PairConstants {
        PairConstants {
            h: self.smoothing_length,
            speed_of_sound: self.speed_of_sound,
            alpha: self.viscosity,
        }
    }

    /// Mass of a particle filling a cube of side `particle_spacing`.
    pub fn particle_mass(&self) -> f32 {
        self.rest_density * self.particle_spacing.powi(3)
    }
}

/// Rigid motion of one body. Coordinates are relative to the world origin.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BodyMotion {
    /// Center of gravity.
    pub cg: [f64; 3],
    /// Linear velocity.
    pub velocity: [f64; 3],
    /// Angular velocity.
    pub omega: [f64; 3],
}

impl BodyMotion {
    /// Velocity of the body point at `pos`: v + omega x (pos - cg).
    pub fn point_velocity(&self, pos: [f64; 3]) -> [f64; 3] {
        let r = [pos[0] - self.cg[0], pos[1] - self.cg[1], pos[2] - self.cg[2]];
        let w = self.omega;
        [
            self.velocity[0] + w[1] * r[2] - w[2] * r[1],
            self.velocity[1] + w[2] * r[0] - w[0] * r[2],
            self.velocity[2] + w[0] * r[1] - w[1] * r[0],
        ]
    }
}

/// Host state that changes every step, read by the upload commands.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepParams {
    /// Simulation time.
    pub t: f64,
    /// Current time step.
    pub dt: f32,
    /// Gravity vector.
    pub gravity: [f32; 3],
    /// Rigid body motions, indexed by body.
    pub bodies: Vec<BodyMotion>,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Values a device hands back to the host after a command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceReport {
    /// Particles owned by the device.
    pub internal_particles: usize,
    /// Particles stored on the device, halo copies included.
    pub total_particles: usize,
    /// Set when an inlet created particles since the last download.
    pub particles_created: bool,
    /// Set once an inlet ran out of particle slots; never cleared.
    pub capacity_exceeded: bool,
    /// Time step proposed by the last force computation.
    pub dt: f32,
    /// Largest neighbour count seen by the last list build.
    pub max_neibs: usize,
    /// Pair interactions counted by the last list build.
    pub num_interactions: usize,
    /// Peak particle speed seen by the last integration step.
    pub max_speed: f32,
    /// Segment table of the last rebuild.
    pub segments: SegmentTable,
    /// Partial force on each rigid body.
    pub body_forces: Vec<[f64; 3]>,
    /// Partial torque on each rigid body, about its center of gravity.
    pub body_torques: Vec<[f64; 3]>,
    /// Occupied owned cells with their particle count.
    pub cells: Vec<(u32, u32)>,
}

// ---------------------------------------------------------------------------
// Interface
// ---------------------------------------------------------------------------

/// Everything a command may read from the host, plus the report to fill.
pub struct DeviceContext<'a> {
    /// Device index within the node.
    pub device: usize,
    /// Global device number.
    pub device_number: usize,
    /// Devices across the cluster.
    pub total_devices: usize,
    /// Per-step host state.
    pub step: &'a StepParams,
    /// Host particle buffers.
    pub host: &'a RwLock<BufferList>,
    /// This device's range of the host buffers.
    pub partition: Range<usize>,
    /// Results of the command.
    pub report: &'a mut DeviceReport,
}

/// Construction parameters of one device.
#[derive(Debug, Clone)]
pub struct DeviceSetup {
    /// Device index within the node.
    pub device: usize,
    /// Global device number.
    pub device_number: usize,
    /// Devices across the cluster.
    pub total_devices: usize,
    /// Particle slots to allocate.
    pub capacity: usize,
    /// Fields to register.
    pub buffers: BufferSet,
    /// Neighbour slots per particle.
    pub max_neibs: usize,
    /// World grid.
    pub grid: Arc<Grid>,
    /// Cell ownership.
    pub device_map: Arc<DeviceMap>,
    /// Physical constants.
    pub physics: Arc<PhysicsParams>,
}

/// Device-side executor of broadcast commands.
///
/// Every command is deterministic given its inputs and reports failure
/// instead of leaving shared state half-written.
pub trait DeviceKernel: Send {
    /// Execute a non-halo command.
    fn execute(&mut self, command: &Command, ctx: &mut DeviceContext<'_>) -> Result<(), KernelError>;

    /// First phase of a halo command: the edge particles peers need.
    fn export_halo(&self, command: &Command, ctx: &DeviceContext<'_>) -> Result<HaloPacket, KernelError>;

    /// Second phase of a halo command: merge the packets of every device.
    /// The device's own packet is included and must be skipped.
    fn import_halo(
        &mut self,
        command: &Command,
        packets: &[Arc<HaloPacket>],
        ctx: &mut DeviceContext<'_>,
    ) -> Result<(), KernelError>;

    /// Particles stored on the device, halo copies included.
    fn particle_count(&self) -> usize;

    /// Particles owned by the device.
    fn internal_particle_count(&self) -> usize;

    /// Largest neighbour count seen by the last list build.
    fn max_neighbors_observed(&self) -> usize;
}

/// Builds the kernel of one device inside its worker thread.
pub type DeviceFactory = Arc<dyn Fn(&DeviceSetup) -> Result<Box<dyn DeviceKernel>, KernelError> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inlet_velocity_ramps() {
        let inlet = OpenBoundary {
            kind: OpenBoundaryKind::Inlet,
            min: [0.0; 3],
            max: [0.1, 1.0, 1.0],
            velocity: [2.0, 0.0, 0.5],
            ramp_time: 1.0,
        };
        assert_eq!(inlet.flow_axis(), 0);
        assert_eq!(inlet.velocity_at(0.5), [1.0, 0.0, 0.25]);
        assert_eq!(inlet.velocity_at(3.0), [2.0, 0.0, 0.5]);
        assert!(inlet.contains([0.05, 0.5, 0.5]));
        assert!(!inlet.contains([0.2, 0.5, 0.5]));
    }

    #[test]
    fn rotating_body_point_velocity() {
        let body = BodyMotion {
            cg: [1.0, 0.0, 0.0],
            velocity: [0.0, 0.0, 1.0],
            omega: [0.0, 0.0, 2.0],
        };
        // r = (1, 0, 0), omega x r = (0, 2, 0)
        assert_eq!(body.point_velocity([2.0, 0.0, 0.0]), [0.0, 2.0, 1.0]);
    }

    #[test]
    fn mass_from_spacing() {
        let physics = PhysicsParams {
            particle_spacing: 0.1,
            ..PhysicsParams::default()
        };
        assert!((physics.particle_mass() - 1.0).abs() < 1.0e-4);
        assert_eq!(physics.support_radius(), 2.0 * physics.smoothing_length);
    }
}
