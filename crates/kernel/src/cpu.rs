//! Reference CPU device.
//!
//! [`CpuDevice`] keeps its particles in a device-side [`BufferList`] laid out
//! as `[inner | inner-edge | outer-edge | created]`: owned particles first,
//! halo copies imported from peers after them, and particles emitted by
//! inlets since the last rebuild at the end. Every rebuild recomputes hashes,
//! sorts and reorders, so the owned part is always grouped by segment and by
//! cell. Stale halo copies are dropped by the rebuild; owned particles that
//! crossed into foreign cells are set aside by `Crop` and handed over with
//! the next `AppendExternal`.
//!
//! Positions are single precision and relative to the center of the cell
//! recorded in the particle hash. Integration lets them drift past the cell
//! bounds; `CalcHash` moves each particle to its new cell and re-localizes it.

use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::buffers::{BufferData, BufferKind, BufferList, BufferSet, Side};
use crate::command::{Command, CommandType, INTEGRATOR_STEP_1, INTEGRATOR_STEP_2};
use crate::device::{
    BodyMotion, DeviceContext, DeviceFactory, DeviceKernel, DeviceSetup, OpenBoundaryKind, PhysicsParams,
};
use crate::devmap::{hash_cell, hash_cell_type, make_hash, CellType, SegmentTable, INACTIVE_HASH};
use crate::error::KernelError;
use crate::grid::{CellIndex, Grid};
use crate::halo::HaloPacket;
use crate::particle::{ParticleInfo, ParticleType, FLAG_CREATED, FLAG_OUTGOING};
use crate::sph::{self, PairSample};

/// End marker of a neighbour list shorter than `max_neibs`.
pub const NEIBS_END: u32 = u32::MAX;

/// Filter selected by a `Filter` command argument of zero.
pub const FILTER_SHEPARD: f32 = 0.0;

/// Fields every CPU device registers on top of the requested ones.
pub const REQUIRED_BUFFERS: BufferSet = BufferSet::of(&[
    BufferKind::Pos,
    BufferKind::Vel,
    BufferKind::Info,
    BufferKind::Hash,
    BufferKind::Forces,
    BufferKind::NeibsList,
]);

/// Halo particles imported from one peer: where they live locally and which
/// entries of the peer's packet they are.
#[derive(Debug, Clone)]
struct ExternalBlock {
    source: usize,
    dst_start: usize,
    picks: Vec<u32>,
}

/// Owned particles that left for foreign cells, waiting for the next append.
#[derive(Debug, Clone, Default)]
struct Emigrants {
    hashes: Vec<u64>,
    fields: Vec<(BufferKind, BufferData)>,
}

/// Weakly-compressible SPH device running on the calling thread.
pub struct CpuDevice {
    device: usize,
    device_number: usize,
    total_devices: usize,
    grid: Arc<Grid>,
    physics: Arc<PhysicsParams>,
    cell_types: Vec<CellType>,
    buffers: BufferList,
    /// Particles stored, halo and created ones included.
    count: usize,
    /// Particles owned.
    internal: usize,
    /// Slot of the next particle created on the device.
    next_free: usize,
    segments: SegmentTable,
    cells: CellIndex,
    sort_order: Vec<usize>,
    externals: Vec<ExternalBlock>,
    emigrants: Option<Emigrants>,
    gravity: [f32; 3],
    bodies: Vec<BodyMotion>,
    time: f32,
    max_neibs_observed: usize,
    particles_created: bool,
    capacity_exceeded: bool,
    pending: Option<(f32, f32)>,
    inlet_progress: Vec<f32>,
    created: u32,
}

impl CpuDevice {
    /// Allocate the device for `setup.capacity` particles.
    pub fn new(setup: &DeviceSetup) -> Result<Self, KernelError> {
        if setup.device_map.len() != setup.grid.num_cells() {
            return Err(KernelError::Failed {
                device: setup.device,
                reason: format!(
                    "device map covers {} cells, grid has {}",
                    setup.device_map.len(),
                    setup.grid.num_cells()
                ),
            });
        }

        let mut buffers = BufferList::new();
        buffers.add_set((setup.buffers | REQUIRED_BUFFERS).difference(BufferSet::HOST_ONLY));
        let bytes = buffers.allocate(setup.capacity, setup.max_neibs);
        let cell_types = setup.device_map.cell_types(&setup.grid, setup.device_number);
        debug!(
            device = setup.device,
            number = setup.device_number,
            capacity = setup.capacity,
            bytes,
            "allocated CPU device"
        );

        Ok(Self {
            device: setup.device,
            device_number: setup.device_number,
            total_devices: setup.total_devices.max(1),
            grid: Arc::clone(&setup.grid),
            physics: Arc::clone(&setup.physics),
            cell_types,
            buffers,
            count: 0,
            internal: 0,
            next_free: 0,
            segments: SegmentTable::empty(),
            cells: CellIndex::new(setup.grid.num_cells()),
            sort_order: Vec::new(),
            externals: Vec::new(),
            emigrants: None,
            gravity: [0.0; 3],
            bodies: Vec::new(),
            time: 0.0,
            max_neibs_observed: 0,
            particles_created: false,
            capacity_exceeded: false,
            pending: None,
            inlet_progress: vec![0.0; setup.physics.open_boundaries.len()],
            created: 0,
        })
    }

    /// Factory building a `CpuDevice` per worker.
    pub fn factory() -> DeviceFactory {
        Arc::new(|setup: &DeviceSetup| -> Result<Box<dyn DeviceKernel>, KernelError> {
            Ok(Box::new(CpuDevice::new(setup)?))
        })
    }

    /// Device-side buffers.
    pub fn buffers(&self) -> &BufferList {
        &self.buffers
    }

    /// Segment table of the last rebuild.
    pub fn segments(&self) -> SegmentTable {
        self.segments
    }

    fn failed(&self, reason: impl Into<String>) -> KernelError {
        KernelError::Failed {
            device: self.device,
            reason: reason.into(),
        }
    }

    fn check_capacity(&self, requested: usize) -> Result<(), KernelError> {
        if requested > self.buffers.capacity() {
            return Err(KernelError::CapacityExceeded {
                device: self.device,
                requested,
                capacity: self.buffers.capacity(),
            });
        }
        Ok(())
    }

    fn neibs_stride(&self) -> usize {
        BufferKind::NeibsList.elements_per_particle(self.buffers.max_neibs())
    }

    fn segment_range(&self, cell_type: CellType) -> Range<usize> {
        self.segments
            .range(cell_type, self.internal as u32)
            .unwrap_or(0..0)
    }

    /// Slots of the halo copies imported by the last append.
    fn halo_range(&self) -> Range<usize> {
        let end = self
            .externals
            .iter()
            .map(|block| block.dst_start + block.picks.len())
            .max()
            .unwrap_or(self.internal);
        self.internal..end.max(self.internal)
    }

    /// Position of particle `i` relative to the world origin.
    fn position(&self, hashes: &[u64], pos: &[[f32; 4]], i: usize) -> [f64; 3] {
        self.grid.position_in(hash_cell(hashes[i]), pos[i])
    }

    fn rebuild_cells(&mut self) -> Result<(), KernelError> {
        let hashes = &self.buffers.get::<u64>(BufferKind::Hash, Side::Read)?[..self.count];
        self.cells.rebuild(hashes.iter().map(|&h| hash_cell(h)));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Host transfers
    // -----------------------------------------------------------------------

    fn upload(&mut self, ctx: &mut DeviceContext<'_>) -> Result<(), KernelError> {
        let n = ctx.partition.len();
        self.check_capacity(n)?;
        {
            let host = ctx.host.read();
            let set = self.buffers.registered().intersection(host.registered());
            for side in [Side::Read, Side::Write] {
                self.buffers
                    .copy_from(set, side, 0, &host, Side::Read, ctx.partition.start, n)?;
            }
        }
        self.count = n;
        self.internal = n;
        self.next_free = n;
        self.externals.clear();
        self.segments = SegmentTable::empty();
        ctx.report.internal_particles = n;
        ctx.report.total_particles = n;
        debug!(device = self.device, particles = n, "uploaded partition");
        Ok(())
    }

    fn dump(&self, command: &Command, ctx: &mut DeviceContext<'_>) -> Result<(), KernelError> {
        if ctx.partition.len() != self.internal {
            return Err(KernelError::PartitionMismatch {
                device: self.device,
                host: ctx.partition.len(),
                device_count: self.internal,
            });
        }
        let set = if command.buffers.is_empty() {
            self.buffers.registered()
        } else {
            command.buffers.intersection(self.buffers.registered())
        };
        let mut host = ctx.host.write();
        host.copy_from(
            set,
            Side::Read,
            ctx.partition.start,
            &self.buffers,
            command.side_or_read(),
            0,
            self.internal,
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rebuild
    // -----------------------------------------------------------------------

    fn calc_hash(&mut self) -> Result<(), KernelError> {
        let n = self.count;
        let halo = self.halo_range();
        let num_cells = self.grid.num_cells();
        let mut hashes = Vec::with_capacity(n);
        let mut moved = Vec::new();
        let mut lost = Vec::new();
        {
            let pos = self.buffers.get::<[f32; 4]>(BufferKind::Pos, Side::Read)?;
            let info = self.buffers.get::<ParticleInfo>(BufferKind::Info, Side::Read)?;
            let old = self.buffers.get::<u64>(BufferKind::Hash, Side::Read)?;
            for i in 0..n {
                // halo copies are imported afresh after the rebuild
                if !info[i].is_active() || halo.contains(&i) {
                    hashes.push(INACTIVE_HASH);
                    continue;
                }
                let from = hash_cell(old[i]);
                let p = if (from as usize) < num_cells {
                    self.grid.position_in(from, pos[i])
                } else {
                    [f64::NAN; 3]
                };
                if !self.grid.contains(p) {
                    hashes.push(INACTIVE_HASH);
                    lost.push(i);
                    continue;
                }
                let (cell, local) = self.grid.localize(p);
                if cell != from {
                    moved.push((i, local));
                }
                hashes.push(make_hash(self.cell_types[cell as usize], cell));
            }
        }
        self.buffers.get_mut::<u64>(BufferKind::Hash, Side::Read)?[..n].copy_from_slice(&hashes);
        if !moved.is_empty() {
            let pos = self.buffers.get_mut::<[f32; 4]>(BufferKind::Pos, Side::Read)?;
            for &(i, local) in &moved {
                pos[i][..3].copy_from_slice(&local);
            }
        }

        if !lost.is_empty() {
            let info = self.buffers.get_mut::<ParticleInfo>(BufferKind::Info, Side::Read)?;
            for &i in &lost {
                info[i].deactivate();
            }
            debug!(device = self.device, lost = lost.len(), "particles left the world");
        }
        Ok(())
    }

    fn sort(&mut self) -> Result<(), KernelError> {
        let hashes = &self.buffers.get::<u64>(BufferKind::Hash, Side::Read)?[..self.count];
        let mut order: Vec<usize> = (0..self.count).collect();
        order.sort_by_key(|&i| hashes[i]);
        self.sort_order = order;
        Ok(())
    }

    fn reorder(&mut self) -> Result<(), KernelError> {
        if self.sort_order.len() != self.count {
            return Err(self.failed("reorder issued without a matching sort"));
        }
        let order = std::mem::take(&mut self.sort_order);
        for kind in self.buffers.registered().iter() {
            if kind == BufferKind::NeibsList {
                continue;
            }
            self.buffers.reorder(kind, &order)?;
        }

        let hashes = &self.buffers.get::<u64>(BufferKind::Hash, Side::Read)?[..self.count];
        let active = hashes.iter().take_while(|&&h| h != INACTIVE_HASH).count();
        let internal = hashes
            .iter()
            .take_while(|&&h| hash_cell_type(h).map_or(false, CellType::is_internal))
            .count();
        self.segments = SegmentTable::from_sorted_hashes(&hashes[..active]);
        self.cells.rebuild(hashes[..active].iter().map(|&h| hash_cell(h)));

        trace!(
            device = self.device,
            before = self.count,
            active,
            internal,
            "reordered particles"
        );
        self.count = active;
        self.internal = internal;
        self.next_free = active;
        self.externals.clear();
        Ok(())
    }

    fn dump_cells(&self, ctx: &mut DeviceContext<'_>) {
        let mut cells: Vec<(u32, u32)> = self
            .cells
            .occupied()
            .filter(|(cell, _)| self.cell_types[*cell as usize].is_internal())
            .collect();
        cells.sort_unstable();
        ctx.report.cells = cells;
    }

    fn crop(&mut self) -> Result<(), KernelError> {
        self.emigrants = None;
        if self.externals.is_empty() && self.count > self.internal {
            let range = self.internal..self.count;
            let mut emigrants = Emigrants {
                hashes: self.buffers.get::<u64>(BufferKind::Hash, Side::Read)?[range.clone()].to_vec(),
                fields: Vec::new(),
            };
            for kind in self.buffers.registered().iter() {
                if kind == BufferKind::NeibsList || kind == BufferKind::Hash {
                    continue;
                }
                emigrants
                    .fields
                    .push((kind, self.buffers.extract(kind, Side::Read, range.clone())?));
            }
            trace!(device = self.device, emigrants = range.len(), "particles left for foreign cells");
            self.emigrants = Some(emigrants);
        }
        self.count = self.internal;
        self.externals.clear();
        self.segments.set(CellType::OuterEdge, None);
        self.segments.set(CellType::Outer, None);
        self.rebuild_cells()
    }

    fn build_neibs(&mut self, command: &Command, ctx: &mut DeviceContext<'_>) -> Result<(), KernelError> {
        let n = if command.only_internal {
            self.internal
        } else {
            self.count
        };
        let stride = self.neibs_stride();
        let radius = self.physics.support_radius();
        let pos = self.buffers.get::<[f32; 4]>(BufferKind::Pos, Side::Read)?[..self.count].to_vec();
        let hashes = self.buffers.get::<u64>(BufferKind::Hash, Side::Read)?[..self.count].to_vec();
        let neibs = self.buffers.get_mut::<u32>(BufferKind::NeibsList, Side::Read)?;

        let mut observed = 0;
        let mut interactions = 0;
        for i in 0..n {
            let slots = &mut neibs[i * stride..(i + 1) * stride];
            let cell = hash_cell(hashes[i]);
            let mut k = 0;
            self.cells.for_each_neighbor(&self.grid, cell, i, &pos, radius, |j, _, _| {
                if k < stride {
                    slots[k] = j as u32;
                }
                k += 1;
            });
            if k < stride {
                slots[k] = NEIBS_END;
            }
            observed = observed.max(k);
            interactions += k.min(stride);
        }

        self.max_neibs_observed = observed;
        ctx.report.max_neibs = observed;
        ctx.report.num_interactions = interactions;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Physics
    // -----------------------------------------------------------------------

    fn pressure(&self, density: f32) -> f32 {
        let p = &self.physics;
        sph::tait_pressure(density, p.rest_density, p.speed_of_sound, p.gamma)
    }

    /// Forces of the particles in `range`; returns peak fluid speed and
    /// acceleration.
    fn forces(&mut self, range: Range<usize>) -> Result<(f32, f32), KernelError> {
        let stride = self.neibs_stride();
        let support = self.physics.support_radius();
        let constants = self.physics.pair_constants();
        let mut out = Vec::with_capacity(range.len());
        let mut max_speed = 0.0f32;
        let mut max_accel = 0.0f32;
        {
            let pos = self.buffers.get::<[f32; 4]>(BufferKind::Pos, Side::Read)?;
            let vel = self.buffers.get::<[f32; 4]>(BufferKind::Vel, Side::Read)?;
            let info = self.buffers.get::<ParticleInfo>(BufferKind::Info, Side::Read)?;
            let hashes = self.buffers.get::<u64>(BufferKind::Hash, Side::Read)?;
            let neibs = self.buffers.get::<u32>(BufferKind::NeibsList, Side::Read)?;

            for i in range.clone() {
                if !info[i].is_active() {
                    out.push([0.0; 4]);
                    continue;
                }
                let si = PairSample {
                    vel: vel[i],
                    mass: pos[i][3],
                    pressure: self.pressure(vel[i][3]),
                };
                let mut acc = [0.0f32; 3];
                let mut drho = 0.0f32;
                for &j in neibs[i * stride..(i + 1) * stride]
                    .iter()
                    .take_while(|&&j| j != NEIBS_END)
                {
                    let j = j as usize;
                    if !info[j].is_active() {
                        continue;
                    }
                    let d = self
                        .grid
                        .displacement(hash_cell(hashes[i]), pos[i], hash_cell(hashes[j]), pos[j]);
                    let r = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
                    if r >= support {
                        continue;
                    }
                    let sj = PairSample {
                        vel: vel[j],
                        mass: pos[j][3],
                        pressure: self.pressure(vel[j][3]),
                    };
                    let (a, dr) = sph::pair_terms(&si, &sj, d, r, &constants);
                    acc[0] += a[0];
                    acc[1] += a[1];
                    acc[2] += a[2];
                    drho += dr;
                }

                match info[i].particle_type() {
                    ParticleType::Fluid => {
                        for a in 0..3 {
                            acc[a] += self.gravity[a];
                        }
                        max_speed = max_speed.max(norm3(vel[i]));
                        max_accel = max_accel.max(norm3([acc[0], acc[1], acc[2], 0.0]));
                    }
                    // hydrodynamic force only, reduced per body
                    ParticleType::Object => {}
                    ParticleType::Boundary => acc = [0.0; 3],
                }
                out.push([acc[0], acc[1], acc[2], drho]);
            }
        }
        self.buffers.get_mut::<[f32; 4]>(BufferKind::Forces, Side::Read)?[range].copy_from_slice(&out);
        Ok((max_speed, max_accel))
    }

    fn timestep(&self, max_speed: f32, max_accel: f32) -> f32 {
        let p = &self.physics;
        sph::compute_timestep(
            max_speed,
            max_accel,
            p.smoothing_length,
            p.speed_of_sound,
            p.cfl,
            p.max_dt,
        )
    }

    fn euler(&mut self, command: &Command, ctx: &mut DeviceContext<'_>) -> Result<(), KernelError> {
        let dt = ctx.step.dt;
        let factor = match command.step {
            INTEGRATOR_STEP_1 => 0.5 * dt,
            INTEGRATOR_STEP_2 => dt,
            other => return Err(self.failed(format!("invalid integrator step {other}"))),
        };
        let n = if command.only_internal {
            self.internal
        } else {
            self.count
        };

        let mut new_pos = Vec::with_capacity(n);
        let mut new_vel = Vec::with_capacity(n);
        let mut max_speed = 0.0f32;
        {
            let pos = self.buffers.get::<[f32; 4]>(BufferKind::Pos, Side::Read)?;
            let vel = self.buffers.get::<[f32; 4]>(BufferKind::Vel, Side::Read)?;
            let info = self.buffers.get::<ParticleInfo>(BufferKind::Info, Side::Read)?;
            let hashes = self.buffers.get::<u64>(BufferKind::Hash, Side::Read)?;
            let forces = self.buffers.get::<[f32; 4]>(BufferKind::Forces, Side::Read)?;
            let half_vel = if command.step == INTEGRATOR_STEP_2 {
                Some(self.buffers.get::<[f32; 4]>(BufferKind::Vel, Side::Write)?)
            } else {
                None
            };

            for i in 0..n {
                let (p, v, f) = (pos[i], vel[i], forces[i]);
                let mut np = p;
                let mut nv = v;
                if info[i].is_active() {
                    nv[3] = v[3] + factor * f[3];
                    match info[i].particle_type() {
                        ParticleType::Fluid => {
                            let drift = half_vel.map_or(v, |hv| hv[i]);
                            for a in 0..3 {
                                nv[a] = v[a] + factor * f[a];
                                np[a] = p[a] + factor * drift[a];
                            }
                            max_speed = max_speed.max(norm3(nv));
                        }
                        ParticleType::Object => {
                            if let Some(body) = self.bodies.get(info[i].object as usize) {
                                let bv = body.point_velocity(self.position(hashes, pos, i));
                                for a in 0..3 {
                                    nv[a] = bv[a] as f32;
                                    np[a] = p[a] + factor * nv[a];
                                }
                            }
                        }
                        ParticleType::Boundary => {}
                    }
                }
                new_pos.push(np);
                new_vel.push(nv);
            }
        }
        self.buffers.get_mut::<[f32; 4]>(BufferKind::Pos, Side::Write)?[..n].copy_from_slice(&new_pos);
        self.buffers.get_mut::<[f32; 4]>(BufferKind::Vel, Side::Write)?[..n].copy_from_slice(&new_vel);
        ctx.report.max_speed = max_speed;
        Ok(())
    }

    /// Density of every owned fluid particle from its neighbours, returned
    /// together with a copy of the READ velocities.
    ///
    /// `shepard` normalizes by the kernel-weighted volume.
    fn smoothed_density(&self, shepard: bool) -> Result<Vec<[f32; 4]>, KernelError> {
        let stride = self.neibs_stride();
        let h = self.physics.smoothing_length;
        let pos = self.buffers.get::<[f32; 4]>(BufferKind::Pos, Side::Read)?;
        let vel = self.buffers.get::<[f32; 4]>(BufferKind::Vel, Side::Read)?;
        let info = self.buffers.get::<ParticleInfo>(BufferKind::Info, Side::Read)?;
        let hashes = self.buffers.get::<u64>(BufferKind::Hash, Side::Read)?;
        let neibs = self.buffers.get::<u32>(BufferKind::NeibsList, Side::Read)?;

        let mut out = vel[..self.count].to_vec();
        for i in 0..self.internal {
            if !info[i].is_active() || !info[i].is_fluid() {
                continue;
            }
            let w0 = sph::wendland_c2(0.0, h);
            let mut mass_sum = pos[i][3] * w0;
            let mut volume_sum = pos[i][3] / vel[i][3].max(1.0e-6) * w0;
            for &j in neibs[i * stride..(i + 1) * stride]
                .iter()
                .take_while(|&&j| j != NEIBS_END)
            {
                let j = j as usize;
                if !info[j].is_active() {
                    continue;
                }
                let d = self
                    .grid
                    .displacement(hash_cell(hashes[i]), pos[i], hash_cell(hashes[j]), pos[j]);
                let w = sph::wendland_c2((d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt(), h);
                mass_sum += pos[j][3] * w;
                volume_sum += pos[j][3] / vel[j][3].max(1.0e-6) * w;
            }
            out[i][3] = if shepard {
                if volume_sum > 0.0 {
                    mass_sum / volume_sum
                } else {
                    vel[i][3]
                }
            } else {
                mass_sum
            };
        }
        Ok(out)
    }

    fn filter(&mut self, command: &Command) -> Result<(), KernelError> {
        if command.arg != FILTER_SHEPARD {
            return Err(KernelError::Unsupported(CommandType::Filter));
        }
        let out = self.smoothed_density(true)?;
        let n = out.len();
        self.buffers.get_mut::<[f32; 4]>(BufferKind::Vel, Side::Write)?[..n].copy_from_slice(&out);
        Ok(())
    }

    fn compute_density(&mut self, command: &Command) -> Result<(), KernelError> {
        let out = self.smoothed_density(false)?;
        let n = out.len();
        self.buffers.get_mut::<[f32; 4]>(BufferKind::Vel, command.side_or_read())?[..n]
            .copy_from_slice(&out);
        Ok(())
    }

    fn reduce_bodies_forces(&self, ctx: &mut DeviceContext<'_>) -> Result<(), KernelError> {
        let bodies = self.bodies.len();
        let mut forces = vec![[0.0f64; 3]; bodies];
        let mut torques = vec![[0.0f64; 3]; bodies];
        let pos = self.buffers.get::<[f32; 4]>(BufferKind::Pos, Side::Read)?;
        let info = self.buffers.get::<ParticleInfo>(BufferKind::Info, Side::Read)?;
        let hashes = self.buffers.get::<u64>(BufferKind::Hash, Side::Read)?;
        let acc = self.buffers.get::<[f32; 4]>(BufferKind::Forces, Side::Read)?;

        for i in 0..self.internal {
            if !info[i].is_active() || !info[i].is_object() {
                continue;
            }
            let b = info[i].object as usize;
            let Some(body) = self.bodies.get(b) else {
                continue;
            };
            let m = pos[i][3] as f64;
            let f = [acc[i][0] as f64 * m, acc[i][1] as f64 * m, acc[i][2] as f64 * m];
            let p = self.position(hashes, pos, i);
            let r = [p[0] - body.cg[0], p[1] - body.cg[1], p[2] - body.cg[2]];
            for a in 0..3 {
                forces[b][a] += f[a];
            }
            torques[b][0] += r[1] * f[2] - r[2] * f[1];
            torques[b][1] += r[2] * f[0] - r[0] * f[2];
            torques[b][2] += r[0] * f[1] - r[1] * f[0];
        }
        ctx.report.body_forces = forces;
        ctx.report.body_torques = torques;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Open boundaries
    // -----------------------------------------------------------------------

    fn create_particle(&mut self, pos: [f32; 4], vel: [f32; 4], info: ParticleInfo, hash: u64) -> Result<(), KernelError> {
        if self.next_free != self.count {
            return Err(self.failed(format!(
                "particle counter at {} but {} particles are stored",
                self.next_free, self.count
            )));
        }
        self.check_capacity(self.count + 1)?;
        let i = self.count;
        for side in [Side::Read, Side::Write] {
            self.buffers.get_mut::<[f32; 4]>(BufferKind::Pos, side)?[i] = pos;
            self.buffers.get_mut::<[f32; 4]>(BufferKind::Vel, side)?[i] = vel;
            self.buffers.get_mut::<ParticleInfo>(BufferKind::Info, side)?[i] = info;
        }
        self.buffers.get_mut::<u64>(BufferKind::Hash, Side::Read)?[i] = hash;
        self.buffers.get_mut::<[f32; 4]>(BufferKind::Forces, Side::Read)?[i] = [0.0; 4];
        self.count += 1;
        self.next_free += 1;
        Ok(())
    }

    fn impose_open_boundary(&mut self, command: &Command, ctx: &mut DeviceContext<'_>) -> Result<(), KernelError> {
        let physics = Arc::clone(&self.physics);
        let dp = physics.particle_spacing;
        let mass = physics.particle_mass();

        for (b, inlet) in physics.open_boundaries.iter().enumerate() {
            if inlet.kind != OpenBoundaryKind::Inlet {
                continue;
            }
            let v = inlet.velocity_at(self.time);

            // impose the inlet velocity on owned fluid inside the box
            {
                let inside: Vec<bool> = {
                    let pos = self.buffers.get::<[f32; 4]>(BufferKind::Pos, Side::Write)?;
                    let hashes = self.buffers.get::<u64>(BufferKind::Hash, Side::Read)?;
                    let info = self.buffers.get::<ParticleInfo>(BufferKind::Info, Side::Read)?;
                    (0..self.internal)
                        .map(|i| {
                            info[i].is_active() && info[i].is_fluid() && inlet.contains(self.position(hashes, pos, i))
                        })
                        .collect()
                };
                let vel = self.buffers.get_mut::<[f32; 4]>(BufferKind::Vel, Side::Write)?;
                for i in (0..inside.len()).filter(|&i| inside[i]) {
                    vel[i][0] = v[0];
                    vel[i][1] = v[1];
                    vel[i][2] = v[2];
                }
            }

            if command.step != INTEGRATOR_STEP_2 {
                continue;
            }
            let axis = inlet.flow_axis();
            let speed = v[axis].abs();
            self.inlet_progress[b] += speed * ctx.step.dt;
            'emit: while self.inlet_progress[b] >= dp {
                self.inlet_progress[b] -= dp;
                let offset = self.inlet_progress[b] as f64;
                let face = if v[axis] >= 0.0 {
                    inlet.min[axis] + offset
                } else {
                    inlet.max[axis] - offset
                };
                let (a1, a2) = ((axis + 1) % 3, (axis + 2) % 3);
                let n1 = (((inlet.max[a1] - inlet.min[a1]) / dp as f64).floor() as usize).max(1);
                let n2 = (((inlet.max[a2] - inlet.min[a2]) / dp as f64).floor() as usize).max(1);
                for k1 in 0..n1 {
                    for k2 in 0..n2 {
                        let mut p = [0.0f64; 3];
                        p[axis] = face;
                        p[a1] = inlet.min[a1] + (k1 as f64 + 0.5) * dp as f64;
                        p[a2] = inlet.min[a2] + (k2 as f64 + 0.5) * dp as f64;
                        if !self.grid.contains(p) {
                            continue;
                        }
                        let (cell, local) = self.grid.localize(p);
                        let cell_type = self.cell_types[cell as usize];
                        if !cell_type.is_internal() {
                            continue;
                        }
                        // the host stops the run, the device only stops emitting
                        if self.count >= self.buffers.capacity() {
                            if !self.capacity_exceeded {
                                warn!(
                                    device = self.device,
                                    capacity = self.buffers.capacity(),
                                    "inlet {} out of particle slots",
                                    b
                                );
                            }
                            self.capacity_exceeded = true;
                            break 'emit;
                        }
                        let id = physics.first_created_id
                            + self.device_number as u32
                            + self.created * self.total_devices as u32;
                        let mut info = ParticleInfo::fluid(id);
                        info.flags |= FLAG_CREATED;
                        self.create_particle(
                            [local[0], local[1], local[2], mass],
                            [v[0], v[1], v[2], physics.rest_density],
                            info,
                            make_hash(cell_type, cell),
                        )?;
                        self.created += 1;
                        self.particles_created = true;
                    }
                }
            }
        }
        Ok(())
    }

    fn disable_outgoing_parts(&mut self) -> Result<(), KernelError> {
        let physics = Arc::clone(&self.physics);
        let outlets: Vec<_> = physics
            .open_boundaries
            .iter()
            .filter(|b| b.kind == OpenBoundaryKind::Outlet)
            .collect();
        if outlets.is_empty() {
            return Ok(());
        }

        let mut outgoing = Vec::new();
        {
            let pos = self.buffers.get::<[f32; 4]>(BufferKind::Pos, Side::Write)?;
            let hashes = self.buffers.get::<u64>(BufferKind::Hash, Side::Read)?;
            let info = self.buffers.get::<ParticleInfo>(BufferKind::Info, Side::Read)?;
            for i in 0..self.count {
                if !info[i].is_active() || !info[i].is_fluid() {
                    continue;
                }
                let p = self.position(hashes, pos, i);
                if outlets.iter().any(|o| o.contains(p)) {
                    outgoing.push(i);
                }
            }
        }
        if outgoing.is_empty() {
            return Ok(());
        }

        let info = self.buffers.get_mut::<ParticleInfo>(BufferKind::Info, Side::Read)?;
        for &i in &outgoing {
            info[i].deactivate();
            info[i].flags |= FLAG_OUTGOING;
        }
        let vel = self.buffers.get_mut::<[f32; 4]>(BufferKind::Vel, Side::Write)?;
        for &i in &outgoing {
            vel[i][0] = 0.0;
            vel[i][1] = 0.0;
            vel[i][2] = 0.0;
        }
        debug!(device = self.device, disabled = outgoing.len(), "particles left through outlets");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Halo
    // -----------------------------------------------------------------------

    fn append_external(&mut self, command: &Command, packets: &[Arc<HaloPacket>]) -> Result<(), KernelError> {
        if self.count != self.internal {
            return Err(self.failed("halo append without a preceding crop"));
        }
        let side = command.side_or_read();
        let stride_neibs = self.buffers.max_neibs();
        let mut dst = self.internal;
        self.externals.clear();
        self.emigrants = None;

        // adopt the particles that crossed into our cells
        for packet in packets {
            if packet.source == self.device_number || packet.migrant_hashes.is_empty() {
                continue;
            }
            let picks: Vec<u32> = packet
                .migrant_hashes
                .iter()
                .enumerate()
                .filter(|&(_, &h)| {
                    let cell = hash_cell(h) as usize;
                    cell < self.cell_types.len() && self.cell_types[cell].is_internal()
                })
                .map(|(k, _)| k as u32)
                .collect();
            if picks.is_empty() {
                continue;
            }
            self.check_capacity(dst + picks.len())?;
            for (kind, data) in &packet.migrants {
                if !self.buffers.contains(*kind) {
                    continue;
                }
                let subset = data.select(&picks, kind.elements_per_particle(stride_neibs));
                self.buffers.write_particles(*kind, Side::Read, dst, &subset)?;
            }
            let hashes = self.buffers.get_mut::<u64>(BufferKind::Hash, Side::Read)?;
            for (k, &p) in picks.iter().enumerate() {
                let cell = hash_cell(packet.migrant_hashes[p as usize]);
                hashes[dst + k] = make_hash(self.cell_types[cell as usize], cell);
            }
            dst += picks.len();
        }
        if dst > self.internal {
            if self.segments.start(CellType::InnerEdge).is_none() {
                self.segments.set(CellType::InnerEdge, Some(self.internal as u32));
            }
            debug!(device = self.device, adopted = dst - self.internal, "adopted particles from peers");
            self.internal = dst;
            self.count = dst;
        }

        for packet in packets {
            if packet.source == self.device_number {
                continue;
            }
            let picks: Vec<u32> = packet
                .hashes
                .iter()
                .enumerate()
                .filter(|&(_, &h)| {
                    let cell = hash_cell(h) as usize;
                    cell < self.cell_types.len() && self.cell_types[cell] == CellType::OuterEdge
                })
                .map(|(k, _)| k as u32)
                .collect();
            if picks.is_empty() {
                continue;
            }
            let len = picks.len();
            self.check_capacity(dst + len)?;

            for (kind, data) in &packet.fields {
                if !self.buffers.contains(*kind) {
                    continue;
                }
                let subset = data.select(&picks, kind.elements_per_particle(stride_neibs));
                self.buffers.write_particles(*kind, side, dst, &subset)?;
            }
            let hashes = self.buffers.get_mut::<u64>(BufferKind::Hash, Side::Read)?;
            for (k, &p) in picks.iter().enumerate() {
                let cell = hash_cell(packet.hashes[p as usize]);
                hashes[dst + k] = make_hash(CellType::OuterEdge, cell);
            }

            self.externals.push(ExternalBlock {
                source: packet.source,
                dst_start: dst,
                picks,
            });
            dst += len;
        }

        let imported = dst - self.internal;
        self.count = dst;
        self.segments
            .set(CellType::OuterEdge, (imported > 0).then_some(self.internal as u32));
        self.segments.set(CellType::Outer, None);
        self.rebuild_cells()?;
        trace!(device = self.device, imported, "appended halo");
        Ok(())
    }

    fn update_external(&mut self, command: &Command, packets: &[Arc<HaloPacket>]) -> Result<(), KernelError> {
        let side = command.side_or_read();
        let max_neibs = self.buffers.max_neibs();
        for block in &self.externals {
            let packet = packets
                .iter()
                .find(|p| p.source == block.source)
                .ok_or_else(|| self.failed(format!("no halo packet from device {}", block.source)))?;
            if let Some(&last) = block.picks.iter().max() {
                if last as usize >= packet.len() {
                    return Err(self.failed(format!(
                        "halo packet from device {} shrank to {} particles",
                        block.source,
                        packet.len()
                    )));
                }
            }
            for (kind, data) in &packet.fields {
                if !self.buffers.contains(*kind) {
                    continue;
                }
                let subset = data.select(&block.picks, kind.elements_per_particle(max_neibs));
                self.buffers.write_particles(*kind, side, block.dst_start, &subset)?;
            }
        }
        Ok(())
    }
}

fn norm3(v: [f32; 4]) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

impl DeviceKernel for CpuDevice {
    fn execute(&mut self, command: &Command, ctx: &mut DeviceContext<'_>) -> Result<(), KernelError> {
        match command.kind {
            CommandType::Idle | CommandType::Quit => Ok(()),
            CommandType::Upload => self.upload(ctx),
            CommandType::Dump => self.dump(command, ctx),
            CommandType::CalcHash => self.calc_hash(),
            CommandType::Sort => self.sort(),
            CommandType::Reorder => self.reorder(),
            CommandType::DownloadNewNumParts => {
                ctx.report.internal_particles = self.internal;
                ctx.report.total_particles = self.count;
                ctx.report.particles_created = self.particles_created;
                ctx.report.capacity_exceeded = self.capacity_exceeded;
                self.particles_created = false;
                Ok(())
            }
            CommandType::UploadNewNumParts => {
                self.next_free = self.count;
                Ok(())
            }
            CommandType::SwapBuffers => {
                self.buffers.swap(command.buffers);
                Ok(())
            }
            CommandType::DumpCells => {
                self.dump_cells(ctx);
                Ok(())
            }
            CommandType::UpdateSegments => {
                ctx.report.segments = self.segments;
                Ok(())
            }
            CommandType::Crop => self.crop(),
            CommandType::BuildNeibs => self.build_neibs(command, ctx),
            CommandType::ForcesSync => {
                let (speed, accel) = self.forces(0..self.internal)?;
                ctx.report.dt = self.timestep(speed, accel);
                Ok(())
            }
            CommandType::ForcesEnqueue => {
                let edge = self.segment_range(CellType::InnerEdge);
                self.pending = Some(self.forces(edge)?);
                Ok(())
            }
            CommandType::ForcesComplete => {
                let inner = self.segment_range(CellType::Inner);
                let (speed, accel) = self.forces(inner)?;
                let (edge_speed, edge_accel) = self.pending.take().unwrap_or((0.0, 0.0));
                ctx.report.dt = self.timestep(speed.max(edge_speed), accel.max(edge_accel));
                Ok(())
            }
            CommandType::Euler => self.euler(command, ctx),
            CommandType::Filter => self.filter(command),
            CommandType::UploadGravity => {
                self.gravity = ctx.step.gravity;
                Ok(())
            }
            CommandType::ReduceBodiesForces => self.reduce_bodies_forces(ctx),
            CommandType::UploadObjectsMotion => {
                self.bodies = ctx.step.bodies.clone();
                Ok(())
            }
            CommandType::ComputeDensity => self.compute_density(command),
            CommandType::ImposeOpenBoundary => self.impose_open_boundary(command, ctx),
            CommandType::DisableOutgoingParts => self.disable_outgoing_parts(),
            CommandType::UploadScalar => {
                self.time = command.arg;
                Ok(())
            }
            CommandType::AppendExternal | CommandType::UpdateExternal => {
                Err(KernelError::Unsupported(command.kind))
            }
        }
    }

    fn export_halo(&self, command: &Command, _ctx: &DeviceContext<'_>) -> Result<HaloPacket, KernelError> {
        let mut packet = HaloPacket::new(self.device_number);
        if command.kind == CommandType::AppendExternal {
            if let Some(emigrants) = &self.emigrants {
                packet.migrant_hashes = emigrants.hashes.clone();
                packet.migrants = emigrants.fields.clone();
            }
        }
        let range = self.segment_range(CellType::InnerEdge);
        if range.is_empty() {
            return Ok(packet);
        }
        packet.hashes = self.buffers.get::<u64>(BufferKind::Hash, Side::Read)?[range.clone()].to_vec();
        let side = command.side_or_read();
        for kind in command.buffers.iter() {
            if !self.buffers.contains(kind) {
                continue;
            }
            packet.fields.push((kind, self.buffers.extract(kind, side, range.clone())?));
        }
        Ok(packet)
    }

    fn import_halo(
        &mut self,
        command: &Command,
        packets: &[Arc<HaloPacket>],
        _ctx: &mut DeviceContext<'_>,
    ) -> Result<(), KernelError> {
        match command.kind {
            CommandType::AppendExternal => self.append_external(command, packets),
            CommandType::UpdateExternal => self.update_external(command, packets),
            other => Err(KernelError::Unsupported(other)),
        }
    }

    fn particle_count(&self) -> usize {
        self.count
    }

    fn internal_particle_count(&self) -> usize {
        self.internal
    }

    fn max_neighbors_observed(&self) -> usize {
        self.max_neibs_observed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceReport, OpenBoundary, StepParams};
    use crate::devmap::DeviceMap;
    use parking_lot::RwLock;

    struct Harness {
        host: RwLock<BufferList>,
        step: StepParams,
    }

    impl Harness {
        /// Host buffers holding `particles`, placed in the cells of `grid`.
        fn new(grid: &Grid, particles: &[([f64; 3], ParticleInfo)]) -> Self {
            let mut host = BufferList::host();
            host.add_set(BufferSet::DUMP);
            host.allocate(particles.len().max(1), 1);
            for (k, (p, _)) in particles.iter().enumerate() {
                let (cell, local) = grid.localize(*p);
                host.get_mut::<[f32; 4]>(BufferKind::Pos, Side::Read).unwrap()[k] = [local[0], local[1], local[2], 1.0];
                host.get_mut::<u64>(BufferKind::Hash, Side::Read).unwrap()[k] = make_hash(CellType::Inner, cell);
            }
            {
                let vel = host.get_mut::<[f32; 4]>(BufferKind::Vel, Side::Read).unwrap();
                for v in vel.iter_mut() {
                    *v = [0.0, 0.0, 0.0, 1000.0];
                }
            }
            let info = host.get_mut::<ParticleInfo>(BufferKind::Info, Side::Read).unwrap();
            for (k, (_, i)) in particles.iter().enumerate() {
                info[k] = *i;
            }
            Self {
                host: RwLock::new(host),
                step: StepParams::default(),
            }
        }

        fn run(
            &self,
            device: &mut CpuDevice,
            command: Command,
            partition: Range<usize>,
        ) -> Result<DeviceReport, KernelError> {
            let mut report = DeviceReport::default();
            let mut ctx = DeviceContext {
                device: device.device,
                device_number: device.device_number,
                total_devices: device.total_devices,
                step: &self.step,
                host: &self.host,
                partition,
                report: &mut report,
            };
            device.execute(&command, &mut ctx)?;
            Ok(report)
        }

        fn export(&self, device: &CpuDevice, command: Command) -> Arc<HaloPacket> {
            let mut report = DeviceReport::default();
            let ctx = DeviceContext {
                device: device.device,
                device_number: device.device_number,
                total_devices: device.total_devices,
                step: &self.step,
                host: &self.host,
                partition: 0..0,
                report: &mut report,
            };
            Arc::new(device.export_halo(&command, &ctx).unwrap())
        }

        fn import(&self, device: &mut CpuDevice, command: Command, packets: &[Arc<HaloPacket>]) -> Result<(), KernelError> {
            let mut report = DeviceReport::default();
            let mut ctx = DeviceContext {
                device: device.device,
                device_number: device.device_number,
                total_devices: device.total_devices,
                step: &self.step,
                host: &self.host,
                partition: 0..0,
                report: &mut report,
            };
            device.import_halo(&command, packets, &mut ctx)
        }

        /// Hash, sort, reorder and swap, as a neighbour-list rebuild does.
        fn rebuild(&self, device: &mut CpuDevice) -> DeviceReport {
            for kind in [CommandType::CalcHash, CommandType::Sort, CommandType::Reorder] {
                self.run(device, Command::new(kind), 0..0).unwrap();
            }
            let report = self
                .run(device, Command::new(CommandType::DownloadNewNumParts), 0..0)
                .unwrap();
            let multi = device.buffers().multi_buffered();
            self.run(device, Command::new(CommandType::SwapBuffers).buffers(multi), 0..0)
                .unwrap();
            report
        }
    }

    /// Position of slot `i` of `dev` relative to the world origin.
    fn world_pos(dev: &CpuDevice, side: Side, i: usize) -> [f64; 3] {
        let pos = dev.buffers().get::<[f32; 4]>(BufferKind::Pos, side).unwrap();
        let hashes = dev.buffers().get::<u64>(BufferKind::Hash, Side::Read).unwrap();
        dev.grid.position_in(hash_cell(hashes[i]), pos[i])
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1.0e-6
    }

    fn physics(h: f32) -> PhysicsParams {
        PhysicsParams {
            smoothing_length: h,
            ..PhysicsParams::default()
        }
    }

    fn device(
        grid: Grid,
        map: DeviceMap,
        number: usize,
        total: usize,
        physics: PhysicsParams,
        capacity: usize,
    ) -> CpuDevice {
        let setup = DeviceSetup {
            device: number,
            device_number: number,
            total_devices: total,
            capacity,
            buffers: BufferSet::DUMP,
            max_neibs: 16,
            grid: Arc::new(grid),
            device_map: Arc::new(map),
            physics: Arc::new(physics),
        };
        CpuDevice::new(&setup).unwrap()
    }

    fn cube() -> Grid {
        Grid::new([0.0; 3], [1.0; 3], 0.25).unwrap()
    }

    #[test]
    fn mismatched_device_map_is_rejected() {
        let setup = DeviceSetup {
            device: 0,
            device_number: 0,
            total_devices: 1,
            capacity: 4,
            buffers: BufferSet::EMPTY,
            max_neibs: 4,
            grid: Arc::new(cube()),
            device_map: Arc::new(DeviceMap::new(3)),
            physics: Arc::new(PhysicsParams::default()),
        };
        assert!(matches!(CpuDevice::new(&setup), Err(KernelError::Failed { .. })));
    }

    #[test]
    fn rebuild_sorts_by_cell_and_drops_lost_particles() {
        let harness = Harness::new(&cube(), &[
            ([0.9, 0.1, 0.1], ParticleInfo::fluid(0)),
            ([0.1, 0.1, 0.1], ParticleInfo::fluid(1)),
            ([2.0, 0.1, 0.1], ParticleInfo::fluid(2)),
            ([0.1, 0.6, 0.1], ParticleInfo::fluid(3)),
        ]);
        let grid = cube();
        let map = DeviceMap::new(grid.num_cells());
        let mut dev = device(grid, map, 0, 1, physics(0.1), 8);

        let report = harness.run(&mut dev, Command::new(CommandType::Upload), 0..4).unwrap();
        assert_eq!(report.internal_particles, 4);

        let report = harness.rebuild(&mut dev);
        assert_eq!(report.internal_particles, 3);
        assert_eq!(report.total_particles, 3);

        let info = dev.buffers().get::<ParticleInfo>(BufferKind::Info, Side::Read).unwrap();
        let ids: Vec<u32> = info[..3].iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 0, 3]);
        assert_eq!(dev.segments().start(CellType::Inner), Some(0));
        assert_eq!(dev.segments().start(CellType::InnerEdge), None);

        // the host partition must shrink before a dump
        let err = harness.run(&mut dev, Command::new(CommandType::Dump), 0..4).unwrap_err();
        assert!(matches!(err, KernelError::PartitionMismatch { host: 4, device_count: 3, .. }));

        harness.run(&mut dev, Command::new(CommandType::Dump), 0..3).unwrap();
        let host = harness.host.read();
        let info = host.get::<ParticleInfo>(BufferKind::Info, Side::Read).unwrap();
        assert_eq!(info[0].id, 1);
        assert_eq!(info[2].id, 3);
    }

    #[test]
    fn dump_cells_lists_owned_cells() {
        let harness = Harness::new(&cube(), &[
            ([0.1, 0.1, 0.1], ParticleInfo::fluid(0)),
            ([0.15, 0.1, 0.1], ParticleInfo::fluid(1)),
            ([0.9, 0.9, 0.9], ParticleInfo::boundary(2)),
        ]);
        let grid = cube();
        let map = DeviceMap::new(grid.num_cells());
        let mut dev = device(grid, map, 0, 1, physics(0.1), 4);
        harness.run(&mut dev, Command::new(CommandType::Upload), 0..3).unwrap();
        harness.rebuild(&mut dev);

        let report = harness.run(&mut dev, Command::new(CommandType::DumpCells), 0..0).unwrap();
        assert_eq!(report.cells, vec![(0, 2), (63, 1)]);
    }

    #[test]
    fn euler_moves_fluid_and_keeps_walls() {
        let mut harness = Harness::new(&cube(), &[
            ([0.1, 0.1, 0.1], ParticleInfo::boundary(0)),
            ([0.5, 0.5, 0.5], ParticleInfo::fluid(1)),
        ]);
        harness.step.gravity = [0.0, 0.0, -10.0];
        harness.step.dt = 0.01;
        let grid = cube();
        let map = DeviceMap::new(grid.num_cells());
        let mut dev = device(grid, map, 0, 1, physics(0.1), 4);

        harness.run(&mut dev, Command::new(CommandType::Upload), 0..2).unwrap();
        harness.rebuild(&mut dev);
        let report = harness
            .run(&mut dev, Command::new(CommandType::BuildNeibs).only_internal(true), 0..0)
            .unwrap();
        assert_eq!(report.num_interactions, 0);
        harness.run(&mut dev, Command::new(CommandType::UploadGravity), 0..0).unwrap();

        let report = harness.run(&mut dev, Command::new(CommandType::ForcesSync), 0..0).unwrap();
        assert_eq!(report.dt, 1.0e-3);

        let report = harness
            .run(
                &mut dev,
                Command::new(CommandType::Euler).step(INTEGRATOR_STEP_1).only_internal(true),
                0..0,
            )
            .unwrap();
        assert!((report.max_speed - 0.05).abs() < 1.0e-6);

        let info = dev.buffers().get::<ParticleInfo>(BufferKind::Info, Side::Read).unwrap();
        let vel = dev.buffers().get::<[f32; 4]>(BufferKind::Vel, Side::Write).unwrap();
        for i in 0..2 {
            let p = world_pos(&dev, Side::Write, i);
            match info[i].particle_type() {
                ParticleType::Fluid => {
                    assert!((vel[i][2] + 0.05).abs() < 1.0e-6);
                    assert!(close(p[2], 0.5));
                }
                _ => {
                    assert_eq!(vel[i][2], 0.0);
                    assert!(p.iter().all(|&x| close(x, 0.1)));
                }
            }
        }
    }

    #[test]
    fn unknown_filter_is_unsupported() {
        let harness = Harness::new(&cube(), &[([0.5, 0.5, 0.5], ParticleInfo::fluid(0))]);
        let grid = cube();
        let map = DeviceMap::new(grid.num_cells());
        let mut dev = device(grid, map, 0, 1, physics(0.1), 2);
        let err = harness
            .run(&mut dev, Command::new(CommandType::Filter).arg(1.0), 0..0)
            .unwrap_err();
        assert!(matches!(err, KernelError::Unsupported(CommandType::Filter)));
    }

    #[test]
    fn inlet_creates_particles_with_strided_ids() {
        let mut harness = Harness::new(&cube(), &[]);
        harness.step.dt = 0.15;
        let grid = cube();
        let map = DeviceMap::from_owners(vec![1; grid.num_cells()]);
        let physics = PhysicsParams {
            particle_spacing: 0.1,
            first_created_id: 100,
            open_boundaries: vec![OpenBoundary {
                kind: OpenBoundaryKind::Inlet,
                min: [0.0, 0.0, 0.0],
                max: [0.2, 0.25, 0.25],
                velocity: [1.0, 0.0, 0.0],
                ramp_time: 0.0,
            }],
            ..physics(0.1)
        };
        let mut dev = device(grid, map, 1, 2, physics, 16);

        // step 1 only imposes the velocity
        harness
            .run(&mut dev, Command::new(CommandType::ImposeOpenBoundary).step(INTEGRATOR_STEP_1), 0..0)
            .unwrap();
        assert_eq!(dev.particle_count(), 0);

        harness
            .run(&mut dev, Command::new(CommandType::ImposeOpenBoundary).step(INTEGRATOR_STEP_2), 0..0)
            .unwrap();
        let report = harness
            .run(&mut dev, Command::new(CommandType::DownloadNewNumParts), 0..0)
            .unwrap();
        assert!(report.particles_created);
        assert_eq!(report.total_particles, 4);

        let info = dev.buffers().get::<ParticleInfo>(BufferKind::Info, Side::Read).unwrap();
        let ids: Vec<u32> = info[..4].iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![101, 103, 105, 107]);
        assert!(info[..4].iter().all(|i| i.is_fluid() && i.has_flag(FLAG_CREATED)));

        // the flag is cleared by the download
        let report = harness
            .run(&mut dev, Command::new(CommandType::DownloadNewNumParts), 0..0)
            .unwrap();
        assert!(!report.particles_created);
    }

    #[test]
    fn full_inlet_stops_emitting_without_failing() {
        let mut harness = Harness::new(&cube(), &[]);
        harness.step.dt = 0.15;
        let grid = cube();
        let map = DeviceMap::new(grid.num_cells());
        let physics = PhysicsParams {
            particle_spacing: 0.1,
            open_boundaries: vec![OpenBoundary {
                kind: OpenBoundaryKind::Inlet,
                min: [0.0, 0.0, 0.0],
                max: [0.2, 0.25, 0.25],
                velocity: [1.0, 0.0, 0.0],
                ramp_time: 0.0,
            }],
            ..physics(0.1)
        };
        // one layer is four particles
        let mut dev = device(grid, map, 0, 1, physics, 3);

        harness
            .run(&mut dev, Command::new(CommandType::ImposeOpenBoundary).step(INTEGRATOR_STEP_2), 0..0)
            .unwrap();
        let report = harness
            .run(&mut dev, Command::new(CommandType::DownloadNewNumParts), 0..0)
            .unwrap();
        assert!(report.capacity_exceeded);
        assert!(report.particles_created);
        assert_eq!(report.total_particles, 3);

        // the condition sticks until the host stops the run
        harness
            .run(&mut dev, Command::new(CommandType::ImposeOpenBoundary).step(INTEGRATOR_STEP_2), 0..0)
            .unwrap();
        let report = harness
            .run(&mut dev, Command::new(CommandType::DownloadNewNumParts), 0..0)
            .unwrap();
        assert!(report.capacity_exceeded);
        assert_eq!(report.total_particles, 3);
    }

    #[test]
    fn outlet_disables_fluid() {
        let harness = Harness::new(&cube(), &[
            ([0.95, 0.5, 0.5], ParticleInfo::fluid(0)),
            ([0.5, 0.5, 0.5], ParticleInfo::fluid(1)),
        ]);
        let grid = cube();
        let map = DeviceMap::new(grid.num_cells());
        let physics = PhysicsParams {
            open_boundaries: vec![OpenBoundary {
                kind: OpenBoundaryKind::Outlet,
                min: [0.9, 0.0, 0.0],
                max: [1.0, 1.0, 1.0],
                velocity: [0.0; 3],
                ramp_time: 0.0,
            }],
            ..physics(0.1)
        };
        let mut dev = device(grid, map, 0, 1, physics, 4);
        harness.run(&mut dev, Command::new(CommandType::Upload), 0..2).unwrap();
        harness
            .run(&mut dev, Command::new(CommandType::DisableOutgoingParts), 0..0)
            .unwrap();

        let info = dev.buffers().get::<ParticleInfo>(BufferKind::Info, Side::Read).unwrap();
        assert!(!info[0].is_active());
        assert!(info[0].has_flag(FLAG_OUTGOING));
        assert!(info[1].is_active());

        let report = harness.rebuild(&mut dev);
        assert_eq!(report.internal_particles, 1);
    }

    /// Four cells along x.
    fn strip() -> Grid {
        Grid::new([0.0; 3], [1.0, 0.25, 0.25], 0.25).unwrap()
    }

    fn two_devices(harness: &Harness) -> (CpuDevice, CpuDevice) {
        // four cells along x: 0, 1 on device 0 and 2, 3 on device 1
        let grid = strip();
        let map = DeviceMap::from_owners(vec![0, 0, 1, 1]);
        let mut a = device(grid.clone(), map.clone(), 0, 2, physics(0.125), 8);
        let mut b = device(grid, map, 1, 2, physics(0.125), 8);
        harness.run(&mut a, Command::new(CommandType::Upload), 0..2).unwrap();
        harness.run(&mut b, Command::new(CommandType::Upload), 2..4).unwrap();
        for dev in [&mut a, &mut b] {
            harness.rebuild(dev);
            harness.run(dev, Command::new(CommandType::Crop), 0..0).unwrap();
        }
        (a, b)
    }

    #[test]
    fn halo_append_imports_peer_edge_particles() {
        let harness = Harness::new(&strip(), &[
            ([0.1, 0.1, 0.1], ParticleInfo::fluid(0)),
            ([0.4, 0.1, 0.1], ParticleInfo::fluid(1)),
            ([0.6, 0.1, 0.1], ParticleInfo::fluid(2)),
            ([0.9, 0.1, 0.1], ParticleInfo::fluid(3)),
        ]);
        let (mut a, mut b) = two_devices(&harness);
        assert_eq!(a.segments().start(CellType::InnerEdge), Some(1));

        let append = Command::new(CommandType::AppendExternal).buffers(BufferSet::IMPORT);
        let packets = vec![harness.export(&a, append), harness.export(&b, append)];
        assert_eq!(packets[0].len(), 1);
        harness.import(&mut a, append, &packets).unwrap();
        harness.import(&mut b, append, &packets).unwrap();

        assert_eq!(a.particle_count(), 3);
        assert_eq!(a.internal_particle_count(), 2);
        assert_eq!(a.segments().start(CellType::OuterEdge), Some(2));
        // halo copies keep the cell of their owner
        assert!(close(world_pos(&a, Side::Read, 2)[0], 0.6));
        assert!(close(world_pos(&b, Side::Read, 2)[0], 0.4));

        // only the edge particle sees across the boundary
        let report = harness
            .run(&mut a, Command::new(CommandType::BuildNeibs).only_internal(true), 0..0)
            .unwrap();
        assert_eq!(report.num_interactions, 1);

        // a second append without crop is refused
        assert!(harness.import(&mut a, append, &packets).is_err());
    }

    #[test]
    fn particles_crossing_into_a_peer_are_adopted() {
        let harness = Harness::new(&strip(), &[
            ([0.1, 0.1, 0.1], ParticleInfo::fluid(0)),
            ([0.4, 0.1, 0.1], ParticleInfo::fluid(1)),
            ([0.6, 0.1, 0.1], ParticleInfo::fluid(2)),
            ([0.9, 0.1, 0.1], ParticleInfo::fluid(3)),
        ]);
        let (mut a, mut b) = two_devices(&harness);

        // id 1 drifts into cell 2, owned by device 1
        a.buffers.get_mut::<[f32; 4]>(BufferKind::Pos, Side::Read).unwrap()[1][0] += 0.2;
        for dev in [&mut a, &mut b] {
            harness.rebuild(dev);
            harness.run(dev, Command::new(CommandType::Crop), 0..0).unwrap();
        }
        assert_eq!(a.internal_particle_count(), 1);

        let append = Command::new(CommandType::AppendExternal).buffers(BufferSet::IMPORT);
        let packets = vec![harness.export(&a, append), harness.export(&b, append)];
        assert_eq!(packets[0].migrant_hashes.len(), 1);
        harness.import(&mut a, append, &packets).unwrap();
        harness.import(&mut b, append, &packets).unwrap();

        assert_eq!(b.internal_particle_count(), 3);
        let info = b.buffers().get::<ParticleInfo>(BufferKind::Info, Side::Read).unwrap();
        assert_eq!(info[2].id, 1);
        assert!(info[2].is_active());

        // the next rebuild sorts the newcomer among the owned particles
        let report = harness.rebuild(&mut b);
        assert_eq!(report.internal_particles, 3);
        assert_eq!(report.total_particles, 3);
    }

    #[test]
    fn halo_update_refreshes_copies() {
        let harness = Harness::new(&strip(), &[
            ([0.1, 0.1, 0.1], ParticleInfo::fluid(0)),
            ([0.4, 0.1, 0.1], ParticleInfo::fluid(1)),
            ([0.6, 0.1, 0.1], ParticleInfo::fluid(2)),
            ([0.9, 0.1, 0.1], ParticleInfo::fluid(3)),
        ]);
        let (mut a, mut b) = two_devices(&harness);
        let append = Command::new(CommandType::AppendExternal).buffers(BufferSet::IMPORT);
        let packets = vec![harness.export(&a, append), harness.export(&b, append)];
        harness.import(&mut a, append, &packets).unwrap();

        // inner cell 3 sorts before the edge cell 2
        b.buffers.get_mut::<[f32; 4]>(BufferKind::Vel, Side::Read).unwrap()[1][0] = 3.0;
        let update = Command::new(CommandType::UpdateExternal).buffers(BufferKind::Vel);
        let packets = vec![harness.export(&a, update), harness.export(&b, update)];
        harness.import(&mut a, update, &packets).unwrap();

        let vel = a.buffers().get::<[f32; 4]>(BufferKind::Vel, Side::Read).unwrap();
        assert_eq!(vel[2][0], 3.0);
        assert_eq!(vel[0][0], 0.0);
    }
}
