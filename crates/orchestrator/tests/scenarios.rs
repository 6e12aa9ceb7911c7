//! End-to-end scenarios of the coordinator.
//!
//! The decomposition scenario runs the reference CPU devices; the failure
//! scenarios replace them with scripted devices that log the commands they
//! receive and misbehave on cue.

use std::sync::{Arc, Mutex};

use kernel::devmap::hash_cell;
use kernel::{
    BufferKind, BufferList, Command, CommandType, CpuDevice, DeviceContext, DeviceFactory, DeviceKernel,
    DeviceSetup, HaloPacket, KernelError, ParticleInfo, PhysicsParams, Side,
};
use orchestrator::{Problem, RunOptions, SimError, SimParams, SimState, Simulation, SingleNode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Fluid particles at fixed positions in a 2 x 1 x 1 world.
struct SlabProblem {
    params: SimParams,
    positions: Vec<[f64; 3]>,
}

impl SlabProblem {
    fn new(positions: Vec<[f64; 3]>, params: SimParams) -> Self {
        Self { params, positions }
    }
}

impl Problem for SlabProblem {
    fn name(&self) -> &str {
        "slab"
    }

    fn world_origin(&self) -> [f64; 3] {
        [0.0; 3]
    }

    fn world_size(&self) -> [f64; 3] {
        [2.0, 1.0, 1.0]
    }

    fn physics(&self) -> PhysicsParams {
        // support radius 0.125: a 16 x 8 x 8 grid
        PhysicsParams {
            smoothing_length: 0.0625,
            particle_spacing: 0.05,
            ..PhysicsParams::default()
        }
    }

    fn sim_params(&self) -> &SimParams {
        &self.params
    }

    fn gravity(&self) -> [f32; 3] {
        [0.0; 3]
    }

    fn fill_parts(&mut self) -> usize {
        self.positions.len()
    }

    fn copy_to_array(&self, host: &mut BufferList) -> Result<(), SimError> {
        let n = self.positions.len();
        for (p, src) in host.get_mut::<[f64; 4]>(BufferKind::PosGlobal, Side::Read)?[..n]
            .iter_mut()
            .zip(&self.positions)
        {
            *p = [src[0], src[1], src[2], 0.1];
        }
        for v in &mut host.get_mut::<[f32; 4]>(BufferKind::Vel, Side::Read)?[..n] {
            *v = [0.0, 0.0, 0.0, 1000.0];
        }
        for (i, info) in host.get_mut::<ParticleInfo>(BufferKind::Info, Side::Read)?[..n]
            .iter_mut()
            .enumerate()
        {
            *info = ParticleInfo::fluid(i as u32);
        }
        Ok(())
    }
}

/// 500 particles left of x = 1 and 500 right of it, interleaved.
fn two_slabs() -> Vec<[f64; 3]> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..1000)
        .map(|i| {
            let x = rng.gen_range(0.05..0.95) + if i % 2 == 0 { 0.0 } else { 1.0 };
            [x, rng.gen_range(0.05..0.95), rng.gen_range(0.05..0.95)]
        })
        .collect()
}

#[derive(Clone)]
struct Script {
    log: Arc<Mutex<Vec<CommandType>>>,
    fail_on: Option<CommandType>,
    dt: f32,
}

/// Device that keeps no particles and answers from a script.
struct ScriptedDevice {
    device: usize,
    count: usize,
    script: Script,
}

impl DeviceKernel for ScriptedDevice {
    fn execute(&mut self, command: &Command, ctx: &mut DeviceContext<'_>) -> Result<(), KernelError> {
        if self.device == 0 {
            self.script.log.lock().unwrap().push(command.kind);
        }
        if self.script.fail_on == Some(command.kind) {
            return Err(KernelError::Failed {
                device: self.device,
                reason: format!("scripted failure on {:?}", command.kind),
            });
        }
        match command.kind {
            CommandType::Upload => self.count = ctx.partition.len(),
            CommandType::DownloadNewNumParts => {
                ctx.report.internal_particles = self.count;
                ctx.report.total_particles = self.count;
            }
            CommandType::ForcesSync | CommandType::ForcesComplete => ctx.report.dt = self.script.dt,
            _ => {}
        }
        Ok(())
    }

    fn export_halo(&self, _command: &Command, ctx: &DeviceContext<'_>) -> Result<HaloPacket, KernelError> {
        Ok(HaloPacket::new(ctx.device_number))
    }

    fn import_halo(
        &mut self,
        _command: &Command,
        _packets: &[Arc<HaloPacket>],
        _ctx: &mut DeviceContext<'_>,
    ) -> Result<(), KernelError> {
        Ok(())
    }

    fn particle_count(&self) -> usize {
        self.count
    }

    fn internal_particle_count(&self) -> usize {
        self.count
    }

    fn max_neighbors_observed(&self) -> usize {
        0
    }
}

fn scripted(script: &Script) -> DeviceFactory {
    let script = script.clone();
    Arc::new(move |setup: &DeviceSetup| -> Result<Box<dyn DeviceKernel>, KernelError> {
        Ok(Box::new(ScriptedDevice {
            device: setup.device,
            count: 0,
            script: script.clone(),
        }))
    })
}

fn scripted_run(script: &Script, params: SimParams) -> (Simulation, Result<orchestrator::RunSummary, SimError>) {
    let positions = two_slabs().into_iter().take(100).collect();
    let problem = SlabProblem::new(positions, params);
    let mut sim = Simulation::new(
        Box::new(problem),
        RunOptions::default(),
        scripted(script),
        Arc::new(SingleNode),
        1,
    );
    let outcome = sim.run();
    (sim, outcome)
}

fn count(log: &[CommandType], kind: CommandType) -> usize {
    log.iter().filter(|&&k| k == kind).count()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn two_device_split_follows_the_device_map() {
    let problem = SlabProblem::new(two_slabs(), SimParams::default());
    let mut sim = Simulation::new(
        Box::new(problem),
        RunOptions::default(),
        CpuDevice::factory(),
        Arc::new(SingleNode),
        2,
    );
    sim.initialize().expect("initialization");
    assert_eq!(sim.state(), SimState::Initializing);

    let partition = sim.partition().expect("partition");
    assert_eq!(partition.range(0), 0..500);
    assert_eq!(partition.range(1), 500..1000);
    assert!(sim.sort_report().expect("sort report").is_ok());

    let gdata = sim.global().expect("shared state");
    let host = gdata.host.read();
    let pos = host.get::<[f64; 4]>(BufferKind::PosGlobal, Side::Read).unwrap();
    let hashes = host.get::<u64>(BufferKind::Hash, Side::Read).unwrap();
    for device in 0..2 {
        for i in partition.range(device) {
            let p = [pos[i][0], pos[i][1], pos[i][2]];
            assert_eq!(hash_cell(hashes[i]), gdata.grid.cell_of(p));
            assert_eq!(
                gdata.device_map.owner(gdata.grid.cell_of(p)),
                device,
                "particle {} at {:?} sits in the range of device {}",
                i,
                p,
                device
            );
        }
    }

    let mut ids: Vec<u32> = host.get::<ParticleInfo>(BufferKind::Info, Side::Read).unwrap()[..1000]
        .iter()
        .map(|info| info.id)
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..1000).collect::<Vec<_>>(), "sorting lost or duplicated particles");
}

#[test]
fn zero_step_size_stops_dispatch() {
    let script = Script {
        log: Arc::new(Mutex::new(Vec::new())),
        fail_on: None,
        dt: 0.0,
    };
    let params = SimParams {
        dt: 1.0e-3,
        adaptive_dt: true,
        max_iterations: Some(100),
        ..SimParams::default()
    };
    let (sim, outcome) = scripted_run(&script, params);

    let summary = outcome.expect("a degenerate step size ends the run gracefully");
    assert_eq!(summary.iterations, 1);
    assert_eq!(sim.dt(), 0.0);
    assert_eq!(sim.state(), SimState::Terminated);

    let log = script.log.lock().unwrap();
    assert_eq!(count(&log, CommandType::Euler), 2);
    assert_eq!(count(&log, CommandType::BuildNeibs), 1);
    assert_eq!(count(&log, CommandType::Dump), 0);
    // the iteration ends with the final swap, nothing follows
    assert_eq!(log.last(), Some(&CommandType::SwapBuffers));
}

#[test]
fn failed_neighbor_list_aborts_before_integration() {
    let script = Script {
        log: Arc::new(Mutex::new(Vec::new())),
        fail_on: Some(CommandType::BuildNeibs),
        dt: 1.0e-3,
    };
    let params = SimParams {
        max_iterations: Some(10),
        ..SimParams::default()
    };
    let (sim, outcome) = scripted_run(&script, params);

    assert!(matches!(outcome, Err(SimError::ExecutionAborted)), "got {:?}", outcome);
    assert_eq!(sim.iterations(), 0);
    assert_eq!(sim.state(), SimState::Terminated);

    let log = script.log.lock().unwrap();
    assert_eq!(log.last(), Some(&CommandType::BuildNeibs));
    assert_eq!(count(&log, CommandType::Euler), 0);
    assert_eq!(count(&log, CommandType::ForcesSync), 0);
}

#[test]
fn failed_kernel_creation_is_reported_before_upload() {
    let factory: DeviceFactory = Arc::new(|setup: &DeviceSetup| -> Result<Box<dyn DeviceKernel>, KernelError> {
        Err(KernelError::Failed {
            device: setup.device,
            reason: "no such device".to_string(),
        })
    });
    let problem = SlabProblem::new(two_slabs(), SimParams::default());
    let mut sim = Simulation::new(Box::new(problem), RunOptions::default(), factory, Arc::new(SingleNode), 2);

    assert!(matches!(sim.initialize(), Err(SimError::ExecutionAborted)));
    assert_eq!(sim.state(), SimState::Terminated);
    assert!(sim.run().is_err());
}
