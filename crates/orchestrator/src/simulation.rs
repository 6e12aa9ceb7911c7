//! The coordinator of one node.
//!
//! [`Simulation`] owns the problem, the writers and the worker threads. It
//! drives the workers in lock-step through [`GlobalData`]: a command is
//! posted, every party meets at the synchronizer, the workers execute it and
//! everybody meets again before the coordinator looks at the reports.
//!
//! One iteration rebuilds the neighbour lists when due, runs the due
//! filters, refreshes gravity when it varies, then takes the two integration
//! sub-steps. Time, step size and output are handled once both sub-steps are
//! done. Any failure clears `keep_going`; from then on no command is posted
//! and the workers are only walked through finalization.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use kernel::{
    BodyMotion, BufferKind, BufferList, BufferSet, Command, CommandType, DeviceFactory, DeviceMap, DeviceSetup, Grid,
    ParticleInfo, Side, Topology, INTEGRATOR_STEP_1, INTEGRATOR_STEP_2,
};
use tracing::{debug, error, info, trace, warn};

use crate::bodies::RigidBody;
use crate::config::RunOptions;
use crate::counter::IppsCounter;
use crate::decomposition::{
    globalize_particles, localize_particles, print_distribution, slice_counts, sort_particles_by_device, Partition,
    SortReport,
};
use crate::error::SimError;
use crate::global::GlobalData;
use crate::hotstart::{resolve_hot_files, HotFile};
use crate::network::{NetworkManager, ReductionOp};
use crate::problem::{Problem, SimParams};
use crate::roll_call::RollCall;
use crate::worker;
use crate::writer::{WriteContext, Writer, WriterSet};

/// Lifecycle of a [`Simulation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimState {
    /// Nothing allocated yet.
    Uninitialized,
    /// Particles on the host, workers created and waiting for the upload.
    Initializing,
    /// Workers copying their partition.
    Uploading,
    /// Inside the step loop.
    Simulating,
    /// Walking the workers through their last barriers.
    Finalizing,
    /// Workers joined.
    Terminated,
}

impl SimState {
    fn as_str(self) -> &'static str {
        match self {
            SimState::Uninitialized => "uninitialized",
            SimState::Initializing => "initializing",
            SimState::Uploading => "uploading",
            SimState::Simulating => "simulating",
            SimState::Finalizing => "finalizing",
            SimState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests other threads may send to a running simulation.
///
/// Both are honoured at the end of the current iteration.
#[derive(Debug, Default)]
pub struct RunControl {
    quit: AtomicBool,
    save: AtomicBool,
}

impl RunControl {
    /// Stop after the current iteration, with a final write.
    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    /// Run every writer after the current iteration.
    pub fn request_save(&self) {
        self.save.store(true, Ordering::SeqCst);
    }

    fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    fn take_save(&self) -> bool {
        self.save.swap(false, Ordering::SeqCst)
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Completed iterations.
    pub iterations: u64,
    /// Final simulation time.
    pub t: f64,
    /// Last time step.
    pub dt: f32,
    /// Particles across every node at the end.
    pub particles: usize,
    /// Wall time spent in the step loop, in seconds.
    pub elapsed: f64,
    /// Average throughput of this node.
    pub mipps: f64,
    /// Highest fluid speed seen.
    pub peak_speed: f32,
}

/// Coordinator of the devices of one node.
pub struct Simulation {
    problem: Box<dyn Problem>,
    params: SimParams,
    options: RunOptions,
    factory: DeviceFactory,
    network: Arc<dyn NetworkManager>,
    devices_per_node: usize,
    writers: WriterSet,
    info_file: Option<PathBuf>,
    control: Arc<RunControl>,

    state: SimState,
    gdata: Option<Arc<GlobalData>>,
    workers: Vec<JoinHandle<()>>,
    sort_report: Option<SortReport>,
    roll_call: RollCall,
    bodies: Vec<RigidBody>,
    double_buffered: BufferSet,

    iterations: u64,
    t: f64,
    dt: f32,
    gravity: [f32; 3],
    allocated: usize,
    tot_particles: usize,
    num_open_boundaries: u32,
    particles_created: bool,
    quit_request: bool,
    last_max_neibs: usize,
    last_interactions: u64,
    segment_faults: u64,
    peak_speed: f32,
    total_counter: IppsCounter,
    interval_counter: IppsCounter,
    multi_node_counter: IppsCounter,
    last_status: String,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("problem", &self.problem.name())
            .field("state", &self.state)
            .field("iterations", &self.iterations)
            .field("t", &self.t)
            .field("dt", &self.dt)
            .field("particles", &self.tot_particles)
            .field("writers", &self.writers)
            .finish_non_exhaustive()
    }
}

impl Simulation {
    /// Coordinator for `problem` on the node described by `network`, with
    /// `devices_per_node` devices built by `factory`.
    pub fn new(
        problem: Box<dyn Problem>,
        options: RunOptions,
        factory: DeviceFactory,
        network: Arc<dyn NetworkManager>,
        devices_per_node: usize,
    ) -> Self {
        let mut params = problem.sim_params().clone();
        if options.max_iterations.is_some() {
            params.max_iterations = options.max_iterations;
        }
        if options.max_time.is_some() {
            params.tend = options.max_time;
        }
        params.striping |= options.striping;
        let dt = params.dt;

        Self {
            problem,
            params,
            options,
            factory,
            network,
            devices_per_node: devices_per_node.max(1),
            writers: WriterSet::new(),
            info_file: None,
            control: Arc::new(RunControl::default()),
            state: SimState::Uninitialized,
            gdata: None,
            workers: Vec::new(),
            sort_report: None,
            roll_call: RollCall::new(0),
            bodies: Vec::new(),
            double_buffered: BufferKind::ALL.iter().copied().filter(|k| k.is_double_buffered()).collect(),
            iterations: 0,
            t: 0.0,
            dt,
            gravity: [0.0; 3],
            allocated: 0,
            tot_particles: 0,
            num_open_boundaries: 0,
            particles_created: false,
            quit_request: false,
            last_max_neibs: 0,
            last_interactions: 0,
            segment_faults: 0,
            peak_speed: 0.0,
            total_counter: IppsCounter::new(),
            interval_counter: IppsCounter::new(),
            multi_node_counter: IppsCounter::new(),
            last_status: String::new(),
        }
    }

    /// Add `writer`, due every `frequency` seconds of simulated time.
    pub fn add_writer(&mut self, writer: Box<dyn Writer>, frequency: f64) {
        self.writers.add(writer, frequency);
    }

    /// File overwritten at every iteration with the current time.
    pub fn set_info_file(&mut self, path: impl Into<PathBuf>) {
        self.info_file = Some(path.into());
    }

    /// Handle for quit and save requests from other threads.
    pub fn control(&self) -> Arc<RunControl> {
        Arc::clone(&self.control)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SimState {
        self.state
    }

    /// Completed iterations.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Simulation time.
    pub fn time(&self) -> f64 {
        self.t
    }

    /// Current time step.
    pub fn dt(&self) -> f32 {
        self.dt
    }

    /// Particles across every node.
    pub fn total_particles(&self) -> usize {
        self.tot_particles
    }

    /// Particle slots allocated on the host and on every device.
    pub fn allocated_particles(&self) -> usize {
        self.allocated
    }

    /// Host ranges of the local devices.
    pub fn partition(&self) -> Option<Partition> {
        self.gdata.as_ref().map(|g| g.partition.read().clone())
    }

    /// State shared with the workers, once initialized.
    pub fn global(&self) -> Option<&Arc<GlobalData>> {
        self.gdata.as_ref()
    }

    /// Outcome of the startup sort by device, on multi-device runs.
    pub fn sort_report(&self) -> Option<&SortReport> {
        self.sort_report.as_ref()
    }

    /// Rigid bodies of the problem.
    pub fn bodies(&self) -> &[RigidBody] {
        &self.bodies
    }

    /// Highest fluid speed seen so far.
    pub fn peak_speed(&self) -> f32 {
        self.peak_speed
    }

    /// Largest neighbour count of the last list build.
    pub fn last_max_neibs(&self) -> usize {
        self.last_max_neibs
    }

    /// Last status line printed.
    pub fn last_status(&self) -> &str {
        &self.last_status
    }

    /// Segment tables found out of order, or disagreeing with the occupied
    /// cells, across every rebuild so far.
    pub fn segment_faults(&self) -> u64 {
        self.segment_faults
    }

    fn shared(&self) -> Result<Arc<GlobalData>, SimError> {
        self.gdata
            .as_ref()
            .map(Arc::clone)
            .ok_or(SimError::InvalidState(self.state.as_str()))
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    /// Build the grid and the particles, split them among the devices and
    /// start one worker per device.
    ///
    /// Returns once every worker created its kernel.
    pub fn initialize(&mut self) -> Result<(), SimError> {
        if self.state != SimState::Uninitialized {
            return Err(SimError::InvalidState(self.state.as_str()));
        }
        self.state = SimState::Initializing;
        match self.setup() {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("initialization failed: {}", e);
                self.network.abort();
                self.state = SimState::Terminated;
                Err(e)
            }
        }
    }

    fn setup(&mut self) -> Result<(), SimError> {
        let rank = self.network.rank();
        let topology = Topology::new(self.network.nodes(), self.devices_per_node);
        info!(
            "initializing {} on node {} of {} with {} devices per node",
            self.problem.name(),
            rank,
            topology.nodes(),
            topology.devices_per_node()
        );

        let mut physics = self.problem.physics();
        let grid = Grid::new(
            self.problem.world_origin(),
            self.problem.world_size(),
            physics.support_radius() as f64,
        )?;
        let dims = grid.dims();
        info!(
            "grid of {}x{}x{} = {} cells, cell size {:?}",
            dims[0],
            dims[1],
            dims[2],
            grid.num_cells(),
            grid.cell_size()
        );

        let mut count = self.problem.fill_parts();
        let hot_files = match &self.options.resume {
            Some(path) => resolve_hot_files(path)?
                .iter()
                .map(|file| HotFile::open(file))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        if !hot_files.is_empty() {
            count = hot_files.iter().map(HotFile::particle_count).sum();
        }

        self.allocated = self.problem.max_parts(count).max(count);
        if self.allocated > u32::MAX as usize {
            return Err(SimError::MissingFeature(format!(
                "{} particle slots, ids are 32 bits",
                self.allocated
            )));
        }

        let mut host = BufferList::host();
        host.add_set(BufferSet::DUMP | BufferSet::HOST_ONLY | self.params.extra_buffers);
        for file in &hot_files {
            host.add_set(file.fields());
        }
        let bytes = host.allocate(self.allocated, 1);
        info!(
            "{} particles, {} slots allocated on the host ({} bytes)",
            count, self.allocated, bytes
        );

        let mut restored: Option<Vec<BodyMotion>> = None;
        if hot_files.is_empty() {
            self.problem.copy_to_array(&mut host)?;
        } else {
            let first = *hot_files[0].header();
            self.iterations = first.iterations;
            self.t = first.t;
            if first.dt > 0.0 {
                self.dt = first.dt;
            }
            if first.num_open_boundaries as usize != physics.open_boundaries.len() {
                warn!(
                    "checkpoint has {} open boundaries, the problem {}",
                    first.num_open_boundaries,
                    physics.open_boundaries.len()
                );
            }
            let mut offset = 0;
            for file in hot_files {
                let n = file.particle_count();
                let bodies = file.load(&mut host, offset)?;
                restored.get_or_insert(bodies);
                offset += n;
            }
            info!(
                "resuming at iteration {}, t={}, dt={}",
                self.iterations, self.t, self.dt
            );
        }

        let outside = localize_particles(&mut host, count, &grid)?;
        if outside > 0 {
            warn!("{} particles lie outside the world", outside);
        }

        let max_id = host.get::<ParticleInfo>(BufferKind::Info, Side::Read)?[..count]
            .iter()
            .map(|info| info.id)
            .max();
        if let Some(max_id) = max_id {
            physics.first_created_id = physics.first_created_id.max(max_id.saturating_add(1));
        }

        self.tot_particles = count;
        self.num_open_boundaries = physics.open_boundaries.len() as u32;
        self.gravity = self.problem.gravity();
        self.roll_call = RollCall::new(physics.first_created_id as usize);
        self.bodies = self.problem.bodies();
        if let Some(motions) = restored {
            if !self.bodies.is_empty() {
                warn!("resuming with rigid bodies: only their motion is restored");
            }
            for (body, motion) in self.bodies.iter_mut().zip(motions) {
                body.set_motion(motion);
            }
        }

        let total_devices = topology.total_devices();
        let (device_map, partition) = if total_devices > 1 {
            let slices = slice_counts(&host, count, &grid)?;
            let map = self.problem.fill_device_map(&grid, &slices, total_devices);
            let (partition, report) = sort_particles_by_device(&mut host, count, &map, &topology, rank)?;
            print_distribution(&partition, &map, &topology, rank);
            self.sort_report = Some(report);
            (map, partition)
        } else {
            (DeviceMap::new(grid.num_cells()), Partition::single(count))
        };
        if self.params.striping && total_devices == 1 {
            info!("striping has no effect with a single device");
        }

        let buffers = host.registered().difference(BufferSet::HOST_ONLY);
        let grid = Arc::new(grid);
        let device_map = Arc::new(device_map);
        let physics = Arc::new(physics);
        let halo = self.network.halo_exchange(total_devices);
        let gdata = Arc::new(GlobalData::new(
            topology,
            rank,
            Arc::clone(&grid),
            Arc::clone(&device_map),
            Arc::clone(&physics),
            halo,
            host,
            partition,
        ));
        self.publish_step(&gdata);
        self.gdata = Some(Arc::clone(&gdata));

        for device in 0..gdata.devices() {
            let setup = DeviceSetup {
                device,
                device_number: gdata.device_number(device),
                total_devices,
                capacity: self.allocated,
                buffers,
                max_neibs: self.params.max_neibs,
                grid: Arc::clone(&grid),
                device_map: Arc::clone(&device_map),
                physics: Arc::clone(&physics),
            };
            match worker::spawn(Arc::clone(&gdata), device, Arc::clone(&self.factory), setup) {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    self.abort_workers(&gdata);
                    return Err(e);
                }
            }
        }

        gdata.sync.barrier(); // end of initialization
        if !gdata.keep_going() {
            self.abort_workers(&gdata);
            return Err(SimError::ExecutionAborted);
        }
        info!("{} workers ready", gdata.devices());
        Ok(())
    }

    /// Release and join workers that will never see a command.
    fn abort_workers(&mut self, gdata: &GlobalData) {
        gdata.stop();
        gdata.force_unlock();
        self.join_workers();
    }

    fn join_workers(&mut self) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("a worker thread panicked");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Upload, run the step loop until done, then finalize.
    ///
    /// Initializes first if needed. The workers are always joined, whatever
    /// the outcome.
    pub fn run(&mut self) -> Result<RunSummary, SimError> {
        if self.state == SimState::Uninitialized {
            self.initialize()?;
        }
        if self.state != SimState::Initializing {
            return Err(SimError::InvalidState(self.state.as_str()));
        }
        let gdata = self.shared()?;

        self.state = SimState::Uploading;
        let first_write = self.initial_write(&gdata);
        gdata.sync.barrier(); // start of upload
        gdata.sync.barrier(); // end of upload

        self.state = SimState::Simulating;
        let outcome = match first_write {
            Err(e) => Err(e),
            Ok(()) if !gdata.keep_going() => Err(SimError::ExecutionAborted),
            Ok(()) => self.simulate(&gdata),
        };
        if let Err(e) = &outcome {
            error!(
                "simulation stopped at iteration {}, t={}: {}",
                self.iterations, self.t, e
            );
            gdata.stop();
            gdata.force_unlock();
            self.network.abort();
        }
        self.finalize(&gdata);
        outcome.map(|()| self.summary())
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            iterations: self.iterations,
            t: self.t,
            dt: self.dt,
            particles: self.tot_particles,
            elapsed: self.total_counter.elapsed_seconds(),
            mipps: self.total_counter.mipps(),
            peak_speed: self.peak_speed,
        }
    }

    /// Snapshot of the initial state, straight from the host arrays.
    fn initial_write(&mut self, gdata: &GlobalData) -> Result<(), SimError> {
        if self.writers.is_empty() {
            return Ok(());
        }
        let due = self.writers.need_write(self.t);
        if self.options.nosave {
            self.writers.fake_mark_written(&due, self.t);
            return Ok(());
        }
        self.write_snapshot(gdata, &due, false)
    }

    fn simulate(&mut self, gdata: &Arc<GlobalData>) -> Result<(), SimError> {
        self.publish_step(gdata);
        self.do_command(Command::new(CommandType::UploadGravity))?;
        if !self.bodies.is_empty() {
            self.do_command(Command::new(CommandType::UploadObjectsMotion))?;
        }

        self.total_counter.start();
        self.interval_counter.start();
        self.multi_node_counter.start();
        info!(
            "entering the main loop at t={} with dt={}, {} particles",
            self.t, self.dt, self.tot_particles
        );
        self.print_status();

        while gdata.keep_going() {
            if self.network.aborted() {
                return Err(SimError::ExecutionAborted);
            }
            self.iterate(gdata)?;
        }
        self.write_info_file();

        info!(
            "left the main loop after {} iterations, t={}, {:.3}s elapsed",
            self.iterations,
            self.t,
            self.total_counter.elapsed_seconds()
        );
        info!(
            "peak particle speed {} m/s, a speed of sound of at least {} m/s keeps the flow weakly compressible",
            self.peak_speed,
            10.0 * self.peak_speed
        );
        Ok(())
    }

    /// Post `command` to every worker and wait until all of them ran it.
    ///
    /// Refused once `keep_going` is cleared; fails if any worker failed.
    pub fn do_command(&self, command: Command) -> Result<(), SimError> {
        let gdata = self.shared()?;
        if !gdata.keep_going() {
            return Err(SimError::ExecutionAborted);
        }
        trace!("command {:?}", command.kind);
        *gdata.command.write() = command;
        gdata.sync.barrier(); // command posted
        gdata.sync.barrier(); // command done
        if !gdata.keep_going() {
            return Err(SimError::ExecutionAborted);
        }
        Ok(())
    }

    fn finalize(&mut self, gdata: &GlobalData) {
        self.state = SimState::Finalizing;
        *gdata.command.write() = Command::new(CommandType::Quit);
        gdata.sync.barrier(); // command posted
        gdata.sync.barrier(); // start of finalization
        gdata.sync.barrier(); // end of finalization
        self.join_workers();
        self.state = SimState::Terminated;
        info!("{} finalized", self.problem.name());
    }

    // -----------------------------------------------------------------------
    // Iteration
    // -----------------------------------------------------------------------

    fn iterate(&mut self, gdata: &Arc<GlobalData>) -> Result<(), SimError> {
        self.write_info_file();

        let rebuild_freq = self.params.build_neibs_freq.max(1);
        if self.iterations % rebuild_freq == 0 || self.particles_created {
            self.build_neib_list(gdata)?;
        }

        if self.iterations > 0 {
            for &(kind, frequency) in &self.params.filters {
                if frequency == 0 || self.iterations % frequency != 0 {
                    continue;
                }
                self.do_command(Command::new(CommandType::Filter).arg(kind.arg()).only_internal(true))?;
                if gdata.multi_device() {
                    self.do_command(
                        Command::new(CommandType::UpdateExternal)
                            .buffers(BufferKind::Vel)
                            .side(Side::Write),
                    )?;
                }
                self.do_command(Command::new(CommandType::SwapBuffers).buffers(BufferKind::Vel))?;
            }
        }

        if self.params.variable_gravity {
            self.gravity = self.problem.variable_gravity(self.t);
            self.publish_step(gdata);
            self.do_command(Command::new(CommandType::UploadGravity))?;
        }

        self.integration_step(gdata, INTEGRATOR_STEP_1)?;
        self.integration_step(gdata, INTEGRATOR_STEP_2)?;
        self.end_of_iteration(gdata)
    }

    fn integration_step(&mut self, gdata: &Arc<GlobalData>, step: u8) -> Result<(), SimError> {
        let multi = gdata.multi_device();
        let striping = self.params.striping && multi;

        if self.params.density_pre_pass {
            self.do_command(
                Command::new(CommandType::ComputeDensity)
                    .step(step)
                    .side(Side::Read)
                    .only_internal(true),
            )?;
            if multi {
                self.do_command(
                    Command::new(CommandType::UpdateExternal)
                        .buffers(BufferKind::Vel)
                        .side(Side::Read),
                )?;
            }
        }

        let forces = if striping {
            CommandType::ForcesEnqueue
        } else {
            CommandType::ForcesSync
        };
        self.do_command(Command::new(forces).step(step).only_internal(true))?;
        if multi {
            self.do_command(
                Command::new(CommandType::UpdateExternal)
                    .buffers(BufferSet::POST_FORCES_UPDATE)
                    .side(Side::Write),
            )?;
        }
        if striping {
            self.do_command(Command::new(CommandType::ForcesComplete).step(step))?;
        }

        // the corrector integrates from the state at the start of the step
        if step == INTEGRATOR_STEP_2 {
            self.do_command(Command::new(CommandType::SwapBuffers).buffers(BufferSet::POST_COMPUTE_SWAP))?;
        }

        self.move_bodies(gdata, step)?;
        self.do_command(Command::new(CommandType::Euler).step(step).only_internal(false))?;

        if self.num_open_boundaries > 0 {
            let advance = if step == INTEGRATOR_STEP_1 {
                self.dt as f64 / 2.0
            } else {
                self.dt as f64
            };
            self.do_command(Command::new(CommandType::UploadScalar).arg((self.t + advance) as f32))?;
            self.do_command(Command::new(CommandType::ImposeOpenBoundary).step(step))?;
            if step == INTEGRATOR_STEP_2 {
                self.do_command(Command::new(CommandType::DisableOutgoingParts))?;
                self.do_command(Command::new(CommandType::DownloadNewNumParts))?;
                let created = (0..gdata.devices()).any(|d| gdata.report(d).particles_created);
                self.particles_created = self.network.bool_or_reduction(created);
                if self.particles_created {
                    debug!("particles created at iteration {}", self.iterations);
                }
                let full = (0..gdata.devices()).any(|d| gdata.report(d).capacity_exceeded);
                if self.network.bool_or_reduction(full) && !self.quit_request {
                    error!(
                        "iteration {}: inlets need more than the {} particle slots allocated, stopping",
                        self.iterations, self.allocated
                    );
                    self.quit_request = true;
                }
            }
        }

        self.do_command(Command::new(CommandType::SwapBuffers).buffers(BufferSet::POST_COMPUTE_SWAP))
    }

    fn end_of_iteration(&mut self, gdata: &Arc<GlobalData>) -> Result<(), SimError> {
        self.iterations += 1;
        let process = gdata.partition.read().process_particles() as u64;
        self.total_counter.inc_iters_times_parts(process);
        self.interval_counter.inc_iters_times_parts(process);
        self.multi_node_counter.inc_iters_times_parts(self.tot_particles as u64);

        let previous_t = self.t;
        self.t += self.dt as f64;
        if self.t == 0.0 {
            return Err(SimError::DtZero { dt: self.dt });
        }

        let mut peak = [(0..gdata.devices())
            .map(|d| gdata.report(d).max_speed)
            .fold(0.0f32, f32::max)];
        self.network.float_reduction(&mut peak, ReductionOp::Max);
        self.peak_speed = self.peak_speed.max(peak[0]);

        if self.params.adaptive_dt {
            let mut dt = [(0..gdata.devices())
                .map(|d| gdata.report(d).dt)
                .fold(f32::INFINITY, f32::min)];
            self.network.float_reduction(&mut dt, ReductionOp::Min);
            self.dt = dt[0];
        }

        if dt_is_degenerate(self.dt) {
            error!(
                "time step {} under machine epsilon at iteration {}, t={}",
                self.dt, self.iterations, self.t
            );
            self.quit_request = true;
        }
        if self.t == previous_t {
            error!(
                "time does not advance at iteration {}: t={}, dt={}",
                self.iterations, self.t, self.dt
            );
            self.quit_request = true;
        }
        if self.control.quit_requested() {
            info!("quit requested at iteration {}", self.iterations);
            self.quit_request = true;
        }
        self.publish_step(gdata);

        let done = self.problem.finished(self.t)
            || self.params.tend.map_or(false, |tend| self.t >= tend)
            || self.params.max_iterations.map_or(false, |max| self.iterations >= max)
            || self.quit_request;
        let done = self.network.bool_or_reduction(done);

        let due = self.writers.need_write(self.t);
        let force = self.problem.need_write(self.t) || done || self.control.take_save();
        if !self.writers.is_empty() && (force || !due.is_empty()) {
            if self.options.nosave && !force {
                self.writers.fake_mark_written(&due, self.t);
            } else {
                self.save_particles(gdata, &due, force)?;
                if force || self.writers.max_frequency(&due) > 0.0 {
                    self.print_status();
                    self.interval_counter.restart();
                }
            }
        } else if done {
            self.print_status();
        }

        trace!(
            "iteration {} done: t={}, dt={}, peak speed {}",
            self.iterations,
            self.t,
            self.dt,
            peak[0]
        );
        if done {
            info!("stopping at iteration {}, t={}", self.iterations, self.t);
            gdata.stop();
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Neighbour lists and particle bookkeeping
    // -----------------------------------------------------------------------

    fn build_neib_list(&mut self, gdata: &Arc<GlobalData>) -> Result<(), SimError> {
        self.do_command(Command::new(CommandType::CalcHash))?;
        self.do_command(Command::new(CommandType::Sort))?;
        self.do_command(Command::new(CommandType::Reorder))?;
        self.do_command(Command::new(CommandType::DownloadNewNumParts))?;
        self.do_command(Command::new(CommandType::SwapBuffers).buffers(self.double_buffered))?;

        if gdata.multi_device() {
            self.do_command(Command::new(CommandType::Crop))?;
            self.do_command(
                Command::new(CommandType::AppendExternal)
                    .buffers(BufferSet::IMPORT)
                    .side(Side::Read),
            )?;
            // particles that crossed to a peer changed owner during the append
            self.do_command(Command::new(CommandType::DownloadNewNumParts))?;
            self.do_command(Command::new(CommandType::DumpCells))?;
            self.do_command(Command::new(CommandType::UpdateSegments))?;
            self.check_segments(gdata);
        }

        self.update_array_indices(gdata)?;
        if gdata.multi_device() && self.num_open_boundaries > 0 {
            self.do_command(Command::new(CommandType::UploadNewNumParts))?;
        }

        self.do_command(Command::new(CommandType::BuildNeibs).only_internal(true))?;
        let mut peak = [(0..gdata.devices())
            .map(|d| gdata.report(d).max_neibs as u64)
            .max()
            .unwrap_or(0)];
        let mut interactions = [(0..gdata.devices())
            .map(|d| gdata.report(d).num_interactions as u64)
            .sum::<u64>()];
        self.network.int_reduction(&mut peak, ReductionOp::Max);
        self.network.int_reduction(&mut interactions, ReductionOp::Sum);
        self.last_max_neibs = peak[0] as usize;
        self.last_interactions = interactions[0];

        if self.last_max_neibs > self.params.max_neibs {
            warn!(
                "iteration {}: {} neighbours for some particle, only {} are kept",
                self.iterations, self.last_max_neibs, self.params.max_neibs
            );
        }
        debug!(
            "neighbour lists rebuilt at iteration {}: max {} neighbours, {} interactions",
            self.iterations, self.last_max_neibs, self.last_interactions
        );
        Ok(())
    }

    /// Mirror the segment tables and check them against the cell occupancy.
    fn check_segments(&mut self, gdata: &GlobalData) {
        let mut mirror = gdata.segments.lock();
        for (d, slot) in mirror.iter_mut().enumerate() {
            let report = gdata.report(d);
            let owned: usize = report.cells.iter().map(|&(_, n)| n as usize).sum();
            if owned != report.internal_particles {
                warn!(
                    "device {}: {} particles in owned cells but {} owned",
                    d, owned, report.internal_particles
                );
                self.segment_faults += 1;
            }
            if !report.segments.is_monotonic(report.total_particles as u32) {
                warn!(
                    "device {}: segment table out of order: {:?}",
                    d,
                    report.segments.starts()
                );
                self.segment_faults += 1;
            }
            *slot = report.segments;
        }
    }

    /// New partition from the counts the devices reported.
    fn update_array_indices(&mut self, gdata: &Arc<GlobalData>) -> Result<(), SimError> {
        let counts: Vec<usize> = (0..gdata.devices())
            .map(|d| gdata.report(d).internal_particles)
            .collect();
        let process: usize = counts.iter().sum();
        let node_counts: Vec<usize> = self
            .network
            .all_gather_u32(process.min(u32::MAX as usize) as u32)
            .into_iter()
            .map(|c| c as usize)
            .collect();
        let partition = Partition::new(counts, node_counts, gdata.rank);
        let total = partition.total();
        *gdata.partition.write() = partition;

        if process > self.allocated {
            error!(
                "iteration {}: {} particles on this node, only {} slots",
                self.iterations, process, self.allocated
            );
            self.quit_request = true;
            self.tot_particles = total;
            return Ok(());
        }

        if total != self.tot_particles {
            if self.num_open_boundaries > 0 {
                debug!(
                    "iteration {}: {} particles, {} before",
                    self.iterations, total, self.tot_particles
                );
            } else if total > self.tot_particles || !self.options.no_leak_warning {
                warn!(
                    "iteration {}: the number of particles changed from {} to {}",
                    self.iterations, self.tot_particles, total
                );
                if !gdata.multi_node() {
                    self.roll_call(gdata)?;
                }
            }
            self.tot_particles = total;
        }
        Ok(())
    }

    /// Dump the particle infos and look for duplicated or missing ids.
    fn roll_call(&mut self, gdata: &GlobalData) -> Result<(), SimError> {
        self.do_command(Command::new(CommandType::Dump).buffers(BufferKind::Info).side(Side::Read))?;
        let host = gdata.host.read();
        let range = gdata.partition.read().node_range();
        let infos = host.get::<ParticleInfo>(BufferKind::Info, Side::Read)?;
        let end = range.end.min(infos.len());
        let expected = gdata.physics.first_created_id as usize;
        let report = self
            .roll_call
            .check(&infos[range.start.min(end)..end], expected, self.iterations);
        if !report.is_clean() {
            warn!(
                "roll call at iteration {}: {} doubles, {} missing, {} out of range",
                self.iterations,
                report.doubles.len(),
                report.missing.len(),
                report.out_of_range.len()
            );
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rigid bodies
    // -----------------------------------------------------------------------

    fn move_bodies(&mut self, gdata: &Arc<GlobalData>, step: u8) -> Result<(), SimError> {
        if self.bodies.is_empty() {
            return Ok(());
        }
        self.do_command(Command::new(CommandType::ReduceBodiesForces))?;

        let n = self.bodies.len();
        // forces then torques, flattened for the reduction
        let mut totals = vec![0.0f64; 6 * n];
        for d in 0..gdata.devices() {
            let report = gdata.report(d);
            for (b, force) in report.body_forces.iter().enumerate().take(n) {
                for a in 0..3 {
                    totals[3 * b + a] += force[a];
                }
            }
            for (b, torque) in report.body_torques.iter().enumerate().take(n) {
                for a in 0..3 {
                    totals[3 * (n + b) + a] += torque[a];
                }
            }
        }
        self.network.double_reduction(&mut totals, ReductionOp::Sum);

        let mut forces: Vec<[f64; 3]> = totals[..3 * n]
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect();
        let mut torques: Vec<[f64; 3]> = totals[3 * n..]
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect();

        let dt = self.dt as f64;
        let t1 = if step == INTEGRATOR_STEP_1 {
            self.t + dt / 2.0
        } else {
            self.t + dt
        };
        self.problem
            .bodies_forces_callback(self.t, t1, step, &mut forces, &mut torques);
        for (body, (force, torque)) in self.bodies.iter_mut().zip(forces.iter().zip(&torques)) {
            body.timestep(step, dt, *force, *torque, self.gravity);
        }
        if step == INTEGRATOR_STEP_2 {
            self.problem.post_timestep_callback(t1);
        }

        self.publish_step(gdata);
        self.do_command(Command::new(CommandType::UploadObjectsMotion))
    }

    /// Copy time, step, gravity and body motions where the workers read them.
    fn publish_step(&self, gdata: &GlobalData) {
        let mut step = gdata.step.write();
        step.t = self.t;
        step.dt = self.dt;
        step.gravity = self.gravity;
        step.bodies = self.bodies.iter().map(RigidBody::motion).collect();
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    /// Download the particles and run the due writers.
    fn save_particles(&mut self, gdata: &GlobalData, due: &[usize], force: bool) -> Result<(), SimError> {
        let fields = gdata.host.read().registered();
        self.do_command(Command::new(CommandType::Dump).buffers(fields).side(Side::Read))?;
        self.write_snapshot(gdata, due, force)
    }

    fn write_snapshot(&mut self, gdata: &GlobalData, due: &[usize], force: bool) -> Result<(), SimError> {
        let range = gdata.partition.read().node_range();
        globalize_particles(&mut gdata.host.write(), range.clone(), &gdata.grid)?;
        let host = gdata.host.read();
        let bodies: Vec<BodyMotion> = self.bodies.iter().map(RigidBody::motion).collect();
        let ctx = WriteContext {
            t: self.t,
            iterations: self.iterations,
            dt: self.dt,
            host: &host,
            range,
            bodies: &bodies,
            num_open_boundaries: self.num_open_boundaries,
            rank: gdata.rank,
            nodes: gdata.topology.nodes(),
        };
        self.writers.write(due, force, &ctx)
    }

    fn status_line(&self) -> String {
        let mut line = format!(
            "Simulation time t={:e}s, iteration={}, dt={:e}s, {} parts ({:.2} MIPPS, cum. {:.2} MIPPS), maxneibs {}",
            self.t,
            self.iterations,
            self.dt,
            self.tot_particles,
            self.interval_counter.mipps(),
            self.total_counter.mipps(),
            self.last_max_neibs
        );
        if self.network.nodes() > 1 {
            line.push_str(&format!(", {:.2} MIPPS across nodes", self.multi_node_counter.mipps()));
        }
        line
    }

    fn print_status(&mut self) {
        let line = self.status_line();
        info!("{}", line);
        self.last_status = line;
    }

    /// Status of the current iteration, to the log at debug level and over
    /// the info file when there is one.
    fn write_info_file(&mut self) {
        let line = self.status_line();
        debug!("{}", line);
        let Some(path) = &self.info_file else {
            return;
        };
        if let Err(e) = fs::write(path, format!("{}\n", line)) {
            warn!("cannot write info file {}: {}", path.display(), e);
            self.info_file = None;
        }
    }
}

/// A step size the run cannot go on with: below machine epsilon, or NaN.
fn dt_is_degenerate(dt: f32) -> bool {
    dt.is_nan() || dt < f32::EPSILON
}

impl Drop for Simulation {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        if let Some(gdata) = self.gdata.take() {
            debug!("dropping a simulation with live workers");
            self.abort_workers(&gdata);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_step_sizes() {
        assert!(dt_is_degenerate(0.0));
        assert!(dt_is_degenerate(-1.0e-3));
        assert!(dt_is_degenerate(f32::EPSILON / 2.0));
        assert!(dt_is_degenerate(f32::NAN));
        assert!(!dt_is_degenerate(f32::EPSILON));
        assert!(!dt_is_degenerate(1.0e-4));
        assert!(!dt_is_degenerate(f32::INFINITY));
    }
}
