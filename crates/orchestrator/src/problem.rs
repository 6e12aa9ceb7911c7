//! The physical problem: initial particles, constants and run-time hooks.

use kernel::{
    BufferKind, BufferList, BufferSet, DeviceMap, Grid, OpenBoundary, OpenBoundaryKind, ParticleInfo,
    PhysicsParams, Side,
};
use tracing::{info, warn};

use crate::bodies::RigidBody;
use crate::config::{FilterKind, OpenBoundaryType, SimulationConfig};
use crate::decomposition::split_by_slices;
use crate::error::SimError;

/// Numerical settings of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SimParams {
    /// Initial time step.
    pub dt: f32,
    /// Take dt from the devices after every iteration.
    pub adaptive_dt: bool,
    /// Iterations between neighbour list rebuilds.
    pub build_neibs_freq: u64,
    /// Neighbour slots per particle.
    pub max_neibs: usize,
    /// Iteration cap.
    pub max_iterations: Option<u64>,
    /// End time.
    pub tend: Option<f64>,
    /// Filters and their period in iterations.
    pub filters: Vec<(FilterKind, u64)>,
    /// Ask the problem for gravity every iteration.
    pub variable_gravity: bool,
    /// Density summation before each force pass.
    pub density_pre_pass: bool,
    /// Overlap forces with the halo update.
    pub striping: bool,
    /// Fields beyond position, velocity, info and hash.
    pub extra_buffers: BufferSet,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            dt: 1.0e-4,
            adaptive_dt: true,
            build_neibs_freq: 10,
            max_neibs: 128,
            max_iterations: None,
            tend: None,
            filters: Vec::new(),
            variable_gravity: false,
            density_pre_pass: false,
            striping: false,
            extra_buffers: BufferSet::EMPTY,
        }
    }
}

/// A problem definition driven by [`crate::Simulation`].
///
/// Positions handed to the host buffers are relative to
/// [`Problem::world_origin`].
pub trait Problem: Send {
    /// Name used in logs and output files.
    fn name(&self) -> &str;

    /// Lower corner of the world.
    fn world_origin(&self) -> [f64; 3];

    /// Extent of the world.
    fn world_size(&self) -> [f64; 3];

    /// Physical constants.
    fn physics(&self) -> PhysicsParams;

    /// Numerical settings.
    fn sim_params(&self) -> &SimParams;

    /// Gravity at startup.
    fn gravity(&self) -> [f32; 3];

    /// Generate the initial particles; returns how many there are.
    fn fill_parts(&mut self) -> usize;

    /// Particle slots to allocate for `count` initial particles.
    fn max_parts(&self, count: usize) -> usize {
        count
    }

    /// Write the initial particles into the host buffers: absolute
    /// positions with the mass in w, velocities and infos. Local positions
    /// and hashes are derived from them afterwards.
    fn copy_to_array(&self, host: &mut BufferList) -> Result<(), SimError>;

    /// Rigid bodies, indexed like the object id of their particles.
    fn bodies(&self) -> Vec<RigidBody> {
        Vec::new()
    }

    /// Cell ownership for `total_devices` devices, given the particles per
    /// slice along each axis.
    fn fill_device_map(&self, grid: &Grid, slice_counts: &[Vec<u64>; 3], total_devices: usize) -> DeviceMap {
        split_by_slices(grid, slice_counts, total_devices)
    }

    /// Gravity at time `t`, asked every iteration when gravity varies.
    fn variable_gravity(&mut self, _t: f64) -> [f32; 3] {
        self.gravity()
    }

    /// Last chance to change the reduced body forces and torques before the
    /// bodies move from `t0` to `t1`.
    fn bodies_forces_callback(
        &mut self,
        _t0: f64,
        _t1: f64,
        _step: u8,
        _forces: &mut [[f64; 3]],
        _torques: &mut [[f64; 3]],
    ) {
    }

    /// Called after the bodies completed a full step.
    fn post_timestep_callback(&mut self, _t: f64) {}

    /// Stop at time `t`.
    fn finished(&self, _t: f64) -> bool {
        false
    }

    /// Force a write at time `t`.
    fn need_write(&self, _t: f64) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Box problem
// ---------------------------------------------------------------------------

/// Lattice points that fit in `extent`, forgiving round-off.
fn count_along(extent: f64, dp: f64) -> usize {
    (extent / dp + 1.0e-4).floor().max(0.0) as usize
}

#[derive(Debug, Clone)]
struct Seed {
    pos: [f64; 3],
    vel: [f32; 3],
    mass: f32,
    info: ParticleInfo,
}

/// Problem built from a [`SimulationConfig`]: lattice blocks of fluid and
/// boundary particles, rigid boxes, inlets and outlets.
#[derive(Debug, Clone)]
pub struct BoxProblem {
    config: SimulationConfig,
    params: SimParams,
    seeds: Vec<Seed>,
}

impl BoxProblem {
    /// Problem described by `config`.
    pub fn new(config: SimulationConfig) -> Self {
        let params = SimParams {
            dt: config.dt,
            adaptive_dt: config.adaptive_dt,
            build_neibs_freq: config.build_neibs_freq,
            max_neibs: config.max_neibs,
            max_iterations: config.max_iterations,
            tend: config.max_time,
            filters: config.filters.iter().map(|f| (f.kind, f.frequency)).collect(),
            variable_gravity: !config.variable_gravity.is_empty(),
            density_pre_pass: config.density_pre_pass,
            striping: config.striping,
            extra_buffers: BufferSet::EMPTY,
        };
        Self {
            config,
            params,
            seeds: Vec::new(),
        }
    }

    /// The configuration this problem was built from.
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    fn lattice(&self, min: [f64; 3], max: [f64; 3]) -> Vec<[f64; 3]> {
        let dp = self.config.particle_spacing as f64;
        let n: Vec<usize> = (0..3).map(|a| count_along(max[a] - min[a], dp)).collect();
        let mut points = Vec::with_capacity(n[0] * n[1] * n[2]);
        for k in 0..n[2] {
            for j in 0..n[1] {
                for i in 0..n[0] {
                    points.push([
                        min[0] + (i as f64 + 0.5) * dp,
                        min[1] + (j as f64 + 0.5) * dp,
                        min[2] + (k as f64 + 0.5) * dp,
                    ]);
                }
            }
        }
        points
    }

    fn inside_world(&self, p: [f64; 3]) -> bool {
        let d = &self.config.domain;
        (0..3).all(|a| p[a] >= d.min[a] && p[a] < d.max[a])
    }

    /// Particles entering through the inlets over the whole run.
    fn inlet_income(&self) -> usize {
        let dp = self.config.particle_spacing as f64;
        let duration = self.params.tend.or_else(|| {
            self.params
                .max_iterations
                .map(|n| n as f64 * self.config.max_dt as f64)
        });
        self.config
            .open_boundaries
            .iter()
            .filter(|b| b.kind == OpenBoundaryType::Inlet)
            .map(|b| {
                let v = b.velocity;
                let axis = (1..3).fold(0, |m, a| if v[a].abs() > v[m].abs() { a } else { m });
                let speed = v[axis].abs() as f64;
                let layer: usize = (0..3)
                    .filter(|&a| a != axis)
                    .map(|a| count_along(b.max[a] - b.min[a], dp).max(1))
                    .product();
                let layers = match duration {
                    Some(t) => (speed * t / dp).ceil() as usize + 1,
                    None => 0,
                };
                layer * layers
            })
            .sum()
    }
}

impl Problem for BoxProblem {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn world_origin(&self) -> [f64; 3] {
        self.config.domain.min
    }

    fn world_size(&self) -> [f64; 3] {
        let d = &self.config.domain;
        [d.max[0] - d.min[0], d.max[1] - d.min[1], d.max[2] - d.min[2]]
    }

    fn physics(&self) -> PhysicsParams {
        let c = &self.config;
        let origin = c.domain.min;
        let relative = |p: [f64; 3]| [p[0] - origin[0], p[1] - origin[1], p[2] - origin[2]];
        PhysicsParams {
            smoothing_length: c.smoothing_length(),
            particle_spacing: c.particle_spacing,
            rest_density: c.rest_density,
            speed_of_sound: c.speed_of_sound,
            gamma: c.gamma,
            cfl: c.cfl_number,
            viscosity: c.viscosity,
            max_dt: c.max_dt,
            open_boundaries: c
                .open_boundaries
                .iter()
                .map(|b| OpenBoundary {
                    kind: match b.kind {
                        OpenBoundaryType::Inlet => OpenBoundaryKind::Inlet,
                        OpenBoundaryType::Outlet => OpenBoundaryKind::Outlet,
                    },
                    min: relative(b.min),
                    max: relative(b.max),
                    velocity: b.velocity,
                    ramp_time: b.ramp_time,
                })
                .collect(),
            first_created_id: self.seeds.len() as u32,
        }
    }

    fn sim_params(&self) -> &SimParams {
        &self.params
    }

    fn gravity(&self) -> [f32; 3] {
        self.config.gravity_at(0.0)
    }

    fn fill_parts(&mut self) -> usize {
        let dp = self.config.particle_spacing;
        let fluid_mass = self.config.rest_density * dp * dp * dp;
        let mut seeds = Vec::new();
        let mut skipped = 0usize;

        let mut push = |seeds: &mut Vec<Seed>, pos: [f64; 3], vel: [f32; 3], mass: f32, make: &dyn Fn(u32) -> ParticleInfo| {
            if self.inside_world(pos) {
                let id = seeds.len() as u32;
                seeds.push(Seed {
                    pos,
                    vel,
                    mass,
                    info: make(id),
                });
            } else {
                skipped += 1;
            }
        };

        for block in &self.config.fluid_blocks {
            for p in self.lattice(block.min, block.max) {
                push(&mut seeds, p, [0.0; 3], fluid_mass, &ParticleInfo::fluid);
            }
        }
        for block in &self.config.boundary_blocks {
            for p in self.lattice(block.min, block.max) {
                push(&mut seeds, p, [0.0; 3], fluid_mass, &ParticleInfo::boundary);
            }
        }
        for (b, body) in self.config.bodies.iter().enumerate() {
            let mass = (body.density * (dp as f64).powi(3)) as f32;
            let vel = [body.velocity[0] as f32, body.velocity[1] as f32, body.velocity[2] as f32];
            let object = b as u16;
            for p in self.lattice(body.min, body.max) {
                push(&mut seeds, p, vel, mass, &move |id| ParticleInfo::object(object, id));
            }
        }

        if skipped > 0 {
            warn!("{} particles outside the world were not created", skipped);
        }
        info!("problem {}: {} particles", self.config.name, seeds.len());
        self.seeds = seeds;
        self.seeds.len()
    }

    fn max_parts(&self, count: usize) -> usize {
        match self.config.max_particles {
            Some(max) => max.max(count),
            None => {
                let income = self.inlet_income();
                let has_inlets = self
                    .config
                    .open_boundaries
                    .iter()
                    .any(|b| b.kind == OpenBoundaryType::Inlet);
                if has_inlets && income == 0 {
                    // no end in sight: double the room
                    count * 2
                } else {
                    count + income
                }
            }
        }
    }

    fn copy_to_array(&self, host: &mut BufferList) -> Result<(), SimError> {
        let rest_density = self.config.rest_density;
        let n = self.seeds.len();
        {
            let pos = &mut host.get_mut::<[f64; 4]>(BufferKind::PosGlobal, Side::Read)?[..n];
            for (p, seed) in pos.iter_mut().zip(&self.seeds) {
                *p = [seed.pos[0], seed.pos[1], seed.pos[2], seed.mass as f64];
            }
        }
        {
            let vel = &mut host.get_mut::<[f32; 4]>(BufferKind::Vel, Side::Read)?[..n];
            for (v, seed) in vel.iter_mut().zip(&self.seeds) {
                *v = [seed.vel[0], seed.vel[1], seed.vel[2], rest_density];
            }
        }
        {
            let info = &mut host.get_mut::<ParticleInfo>(BufferKind::Info, Side::Read)?[..n];
            for (i, seed) in info.iter_mut().zip(&self.seeds) {
                *i = seed.info;
            }
        }
        Ok(())
    }

    fn bodies(&self) -> Vec<RigidBody> {
        let origin = self.config.domain.min;
        self.config
            .bodies
            .iter()
            .enumerate()
            .map(|(b, body)| {
                let mass: f64 = self
                    .seeds
                    .iter()
                    .filter(|s| s.info.is_object() && s.info.object as usize == b)
                    .map(|s| s.mass as f64)
                    .sum();
                let min = [body.min[0] - origin[0], body.min[1] - origin[1], body.min[2] - origin[2]];
                let max = [body.max[0] - origin[0], body.max[1] - origin[1], body.max[2] - origin[2]];
                RigidBody::solid_box(min, max, mass.max(f64::MIN_POSITIVE))
                    .with_velocity(body.velocity)
                    .with_fixed_motion(body.fixed_motion)
            })
            .collect()
    }

    fn variable_gravity(&mut self, t: f64) -> [f32; 3] {
        self.config.gravity_at(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Block, BodyConfig, DomainBounds, OpenBoundaryConfig};

    fn config() -> SimulationConfig {
        let mut config = SimulationConfig::new(
            "box",
            DomainBounds {
                min: [-1.0, 0.0, 0.0],
                max: [1.0, 1.0, 1.0],
            },
            0.1,
        );
        config.fluid_blocks.push(Block {
            min: [-1.0, 0.0, 0.0],
            max: [0.0, 0.5, 0.2],
        });
        config
    }

    #[test]
    fn lattice_fills_blocks() {
        let mut problem = BoxProblem::new(config());
        // 10 x 5 x 2
        assert_eq!(problem.fill_parts(), 100);
        assert_eq!(problem.max_parts(100), 100);
        assert_eq!(problem.physics().first_created_id, 100);
    }

    #[test]
    fn initial_positions_are_absolute() {
        let mut problem = BoxProblem::new(config());
        let n = problem.fill_parts();
        let mut host = BufferList::host();
        host.add_set(BufferSet::DUMP | BufferSet::HOST_ONLY);
        host.allocate(n, 1);
        problem.copy_to_array(&mut host).unwrap();

        let pos = host.get::<[f64; 4]>(BufferKind::PosGlobal, Side::Read).unwrap();
        assert!((pos[0][0] + 0.95).abs() < 1.0e-12);
        assert!((pos[0][3] - 1.0).abs() < 1.0e-4);
        let info = host.get::<ParticleInfo>(BufferKind::Info, Side::Read).unwrap();
        assert!(info.iter().all(|i| i.is_fluid()));
        assert_eq!(info[n - 1].id, n as u32 - 1);
    }

    #[test]
    fn bodies_get_object_particles() {
        let mut c = config();
        c.bodies.push(BodyConfig {
            min: [0.5, 0.5, 0.5],
            max: [0.7, 0.7, 0.7],
            density: 500.0,
            velocity: [0.0; 3],
            fixed_motion: false,
        });
        let mut problem = BoxProblem::new(c);
        assert_eq!(problem.fill_parts(), 108);
        let bodies = problem.bodies();
        assert_eq!(bodies.len(), 1);
        // 8 particles of 500 * 0.001
        assert!((bodies[0].mass() - 4.0).abs() < 1.0e-4);
        let cg = bodies[0].motion().cg;
        assert!((cg[0] - 1.6).abs() < 1.0e-9);
    }

    #[test]
    fn inlets_reserve_room() {
        let mut c = config();
        c.max_time = Some(1.0);
        c.open_boundaries.push(OpenBoundaryConfig {
            kind: OpenBoundaryType::Inlet,
            min: [-1.0, 0.0, 0.0],
            max: [-0.9, 0.5, 0.2],
            velocity: [1.0, 0.0, 0.0],
            ramp_time: 0.0,
        });
        let mut problem = BoxProblem::new(c);
        let n = problem.fill_parts();
        // 5 x 2 per layer, 11 layers
        assert_eq!(problem.max_parts(n), n + 110);
        let physics = problem.physics();
        assert_eq!(physics.open_boundaries[0].min, [0.0, 0.0, 0.0]);
    }
}
