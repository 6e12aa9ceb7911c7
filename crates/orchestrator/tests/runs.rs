//! Full runs of the box problem on the reference CPU devices.

use std::fs;
use std::path::PathBuf;

use kernel::devmap::hash_cell;
use kernel::{BufferKind, ParticleInfo, Side};
use orchestrator::config::{Block, DomainBounds, OpenBoundaryConfig, OpenBoundaryType, SimulationConfig};
use orchestrator::hotstart::HotFile;
use orchestrator::{create_simulation, run_local_cluster, RunOptions, SimState};

/// A block of water in a closed box, 10 x 8 x 5 fluid particles.
fn tank(devices: usize, iterations: u64) -> SimulationConfig {
    let mut config = SimulationConfig::new(
        "tank",
        DomainBounds {
            min: [0.0, 0.0, 0.0],
            max: [0.2, 0.1, 0.1],
        },
        0.01,
    );
    config.fluid_blocks.push(Block {
        min: [0.05, 0.01, 0.01],
        max: [0.15, 0.09, 0.06],
    });
    config.build_neibs_freq = 1;
    config.max_iterations = Some(iterations);
    config.devices_per_node = devices;
    config
}

fn ids_of(sim: &orchestrator::Simulation) -> Vec<u32> {
    let gdata = sim.global().expect("shared state");
    let host = gdata.host.read();
    let range = gdata.partition.read().node_range();
    let mut ids: Vec<u32> = host.get::<ParticleInfo>(BufferKind::Info, Side::Read).unwrap()[range]
        .iter()
        .map(|info| info.id)
        .collect();
    ids.sort_unstable();
    ids
}

#[test]
fn single_device_run_reaches_the_iteration_cap() {
    let mut sim = create_simulation(tank(1, 3), RunOptions::default()).expect("setup");
    sim.initialize().expect("initialization");
    let initial = sim.total_particles();
    assert_eq!(initial, 400);

    let summary = sim.run().expect("run");
    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.particles, initial);
    assert!(summary.t > 0.0);
    assert!(summary.dt > 0.0);
    assert_eq!(sim.state(), SimState::Terminated);
    assert!(sim.last_status().starts_with("Simulation time t="));
}

#[test]
fn two_device_run_keeps_every_particle() {
    let mut sim = create_simulation(tank(2, 4), RunOptions::default()).expect("setup");
    let summary = sim.run().expect("run");

    assert_eq!(summary.iterations, 4);
    assert_eq!(summary.particles, 400);
    let partition = sim.partition().expect("partition");
    assert_eq!(partition.counts().len(), 2);
    assert_eq!(partition.counts().iter().sum::<usize>(), 400);
    assert!(partition.counts().iter().all(|&c| c > 0), "{:?}", partition.counts());
}

#[test]
fn inlet_running_out_of_slots_ends_the_run_gracefully() {
    let mut config = tank(1, 100);
    config.adaptive_dt = false;
    config.dt = 1.0e-3;
    config.max_particles = Some(410);
    config.open_boundaries.push(OpenBoundaryConfig {
        kind: OpenBoundaryType::Inlet,
        min: [0.0, 0.0, 0.0],
        max: [0.03, 0.1, 0.1],
        velocity: [5.0, 0.0, 0.0],
        ramp_time: 0.0,
    });

    let mut sim = create_simulation(config, RunOptions::default()).expect("setup");
    let summary = sim.run().expect("a full inlet stops the run, it does not abort it");

    assert_eq!(sim.state(), SimState::Terminated);
    assert!(summary.iterations < 100, "stopped after {} iterations", summary.iterations);
    assert_eq!(sim.allocated_particles(), 410);
    assert!(sim.total_particles() <= 410);
}

#[test]
fn info_file_carries_the_status_line() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut config = tank(1, 3);
    config.output.info_file = Some("status.txt".to_string());
    let options = RunOptions {
        output_dir: Some(dir.path().to_path_buf()),
        ..RunOptions::default()
    };

    let mut sim = create_simulation(config, options).expect("setup");
    let summary = sim.run().expect("run");

    let status = fs::read_to_string(dir.path().join("status.txt")).expect("info file");
    assert_eq!(status.lines().count(), 1, "{:?}", status);
    assert!(status.starts_with("Simulation time t="), "{:?}", status);
    assert!(status.contains(&format!("iteration={},", summary.iterations)), "{:?}", status);
    assert!(status.contains("400 parts"), "{:?}", status);
    assert!(status.contains("MIPPS"), "{:?}", status);
    assert!(status.contains("maxneibs"), "{:?}", status);
}

#[test]
fn particles_migrate_between_devices_without_loss() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut config = tank(2, 200);
    // the block slides along the split axis, two centimetres in 200 steps
    config.gravity = [100.0, 0.0, 0.0];
    config.adaptive_dt = false;
    config.dt = 1.0e-4;
    // a write at the start and the forced one at the end
    config.output.hot_start_frequency = Some(1.0);
    let options = RunOptions {
        output_dir: Some(dir.path().to_path_buf()),
        ..RunOptions::default()
    };

    let mut sim = create_simulation(config, options).expect("setup");
    sim.initialize().expect("initialization");
    let before = sim.partition().expect("partition").counts().to_vec();
    let summary = sim.run().expect("run");

    assert_eq!(summary.iterations, 200);
    assert_eq!(summary.particles, 400);
    assert_eq!(sim.segment_faults(), 0);
    assert_eq!(ids_of(&sim), (0..400).collect::<Vec<_>>());

    let partition = sim.partition().expect("partition");
    let after = partition.counts().to_vec();
    assert_eq!(after.iter().sum::<usize>(), 400);
    assert!(after[0] < before[0] && after[1] > before[1], "{:?} -> {:?}", before, after);

    // every particle sits in a cell of the device holding it
    let gdata = sim.global().expect("shared state");
    let host = gdata.host.read();
    let hashes = host.get::<u64>(BufferKind::Hash, Side::Read).unwrap();
    for device in 0..2 {
        for i in partition.range(device) {
            assert_eq!(gdata.device_map.owner(hash_cell(hashes[i])), device, "slot {}", i);
        }
    }
}

#[test]
fn iteration_cap_from_the_command_line_wins() {
    let options = RunOptions {
        max_iterations: Some(2),
        ..RunOptions::default()
    };
    let mut sim = create_simulation(tank(1, 50), options).expect("setup");
    assert_eq!(sim.run().expect("run").iterations, 2);
}

#[test]
fn local_cluster_nodes_agree() {
    let summaries = run_local_cluster(tank(1, 3), RunOptions::default(), 2).expect("cluster run");

    assert_eq!(summaries.len(), 2);
    for summary in &summaries {
        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.particles, 400);
    }
    assert_eq!(summaries[0].t, summaries[1].t);
    assert_eq!(summaries[0].dt, summaries[1].dt);
}

#[test]
fn checkpoint_resumes_where_the_run_stopped() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut config = tank(1, 2);
    config.output.hot_start_frequency = Some(0.0);
    config.output.info_file = Some("status.txt".to_string());
    let options = RunOptions {
        output_dir: Some(dir.path().to_path_buf()),
        ..RunOptions::default()
    };

    let mut first = create_simulation(config.clone(), options.clone()).expect("setup");
    let summary = first.run().expect("first run");
    assert!(dir.path().join("status.txt").is_file());

    let mut checkpoints: Vec<PathBuf> = fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "bin"))
        .collect();
    checkpoints.sort();
    // initial state, one per iteration
    assert_eq!(checkpoints.len(), 3, "{:?}", checkpoints);
    let last = checkpoints.pop().unwrap();

    config.max_iterations = Some(4);
    config.output.info_file = None;
    let resume = RunOptions {
        resume: Some(last.clone()),
        ..options
    };
    let mut second = create_simulation(config, resume).expect("setup");
    second.initialize().expect("resume");

    assert_eq!(second.iterations(), summary.iterations);
    assert_eq!(second.time(), summary.t);
    assert_eq!(second.dt(), summary.dt);
    assert_eq!(second.total_particles(), summary.particles);
    assert_eq!(ids_of(&second), ids_of(&first));

    {
        let a = first.global().unwrap().host.read();
        let b = second.global().unwrap().host.read();
        let pa = &a.get::<[f64; 4]>(BufferKind::PosGlobal, Side::Read).unwrap()[..400];
        let pb = &b.get::<[f64; 4]>(BufferKind::PosGlobal, Side::Read).unwrap()[..400];
        assert_eq!(pa, pb);
    }

    let resumed = second.run().expect("second run");
    assert_eq!(resumed.iterations, 4);
    assert_eq!(resumed.particles, summary.particles);

    // the resumed run extends the series and leaves the first one alone
    let mut series: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.unwrap().file_name().into_string().ok())
        .filter(|name| name.ends_with(".bin"))
        .collect();
    series.sort();
    assert_eq!(
        series,
        (0..6).map(|i| format!("hot_{:05}.bin", i)).collect::<Vec<_>>()
    );
    let header = *HotFile::open(&last).expect("first series").header();
    assert_eq!(header.iterations, summary.iterations);
    let header = *HotFile::open(&dir.path().join("hot_00005.bin")).expect("second series").header();
    assert_eq!(header.iterations, 4);
}

/// x of every particle in a text snapshot.
fn snapshot_x(path: &std::path::Path) -> Vec<(u32, f64)> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(2)
        .map(|line| {
            let fields: Vec<&str> = line.split(',').collect();
            (fields[0].parse().unwrap(), fields[3].parse().unwrap())
        })
        .collect()
}

#[test]
fn snapshots_of_a_distant_world_keep_absolute_positions() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut config = tank(2, 2);
    let offset = 1.0e4;
    config.domain.min[0] += offset;
    config.domain.max[0] += offset;
    config.fluid_blocks[0].min[0] += offset;
    config.fluid_blocks[0].max[0] += offset;
    config.output.text_frequency = Some(0.0);
    let options = RunOptions {
        output_dir: Some(dir.path().to_path_buf()),
        ..RunOptions::default()
    };

    let mut sim = create_simulation(config, options).expect("setup");
    let summary = sim.run().expect("run");
    assert_eq!(summary.iterations, 2);

    let mut before = snapshot_x(&dir.path().join("tank_00000.csv"));
    let mut after = snapshot_x(&dir.path().join("tank_00002.csv"));
    assert_eq!(before.len(), 400);
    assert_eq!(after.len(), 400);
    before.sort_by_key(|&(id, _)| id);
    after.sort_by_key(|&(id, _)| id);
    for (&(id, x0), &(_, x1)) in before.iter().zip(&after) {
        assert!(x0 > offset + 0.04 && x0 < offset + 0.16, "particle {} starts at {}", id, x0);
        assert!((x1 - x0).abs() < 1.0e-3, "particle {} jumped from {} to {}", id, x0, x1);
    }
}
