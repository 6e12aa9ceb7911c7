//! Orchestration Layer
//!
//! This crate coordinates a particle simulation spread over several compute
//! devices, and over several nodes, each running one coordinator:
//! - Configuration loading and validation
//! - Problem setup and the split of the particles among devices
//! - Worker threads driven in lock-step through a command loop
//! - Cross-node reductions of time step, forces and particle counts
//! - Periodic output, hot-start checkpoints and resume
//!
//! # Modules
//! - [`config`] -- JSON configuration and command-line overrides.
//! - [`problem`] -- the [`Problem`] trait and the box-shaped [`BoxProblem`].
//! - [`simulation`] -- the coordinator, [`Simulation`].
//! - [`worker`] -- device worker threads.
//! - [`global`] -- state shared by the coordinator and its workers.
//! - [`sync`] -- reusable barriers.
//! - [`network`] -- collectives between nodes.
//! - [`decomposition`] -- partitions, device maps and the sort by device.
//! - [`bodies`] -- rigid body integration.
//! - [`writer`] -- output writers and their schedules.
//! - [`hotstart`] -- checkpoint files.
//! - [`roll_call`] -- duplicated and missing particle ids.
//! - [`counter`] -- throughput counters.
//! - [`error`] -- the [`SimError`] taxonomy.

#![warn(missing_docs)]

pub mod bodies;
pub mod config;
pub mod counter;
pub mod decomposition;
pub mod error;
pub mod global;
pub mod hotstart;
pub mod network;
pub mod problem;
pub mod roll_call;
pub mod simulation;
pub mod sync;
pub mod worker;
pub mod writer;

pub use config::{ConfigError, RunOptions, SimulationConfig};
pub use decomposition::Partition;
pub use error::SimError;
pub use network::{LocalCluster, NetworkManager, ReductionOp, SingleNode};
pub use problem::{BoxProblem, Problem, SimParams};
pub use simulation::{RunControl, RunSummary, SimState, Simulation};
pub use writer::{HotStartWriter, TextWriter, WriteContext, Writer};

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use kernel::{BufferSet, CpuDevice};

/// Create a simulation of the box problem described by `config`, on a
/// single node with the reference CPU devices.
///
/// Writers are registered from the output section of the configuration;
/// `options` may redirect them to another directory.
///
/// # Example
/// ```no_run
/// use orchestrator::{create_simulation, RunOptions, SimulationConfig};
///
/// let config = SimulationConfig::load("config/dam_break.json")?;
/// let mut sim = create_simulation(config, RunOptions::default())?;
/// let summary = sim.run()?;
/// println!("{} iterations", summary.iterations);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn create_simulation(config: SimulationConfig, options: RunOptions) -> Result<Simulation, SimError> {
    build_node(config, options, Arc::new(SingleNode))
}

/// Run `nodes` coordinators as threads of this process, one per node, and
/// return their summaries in rank order.
pub fn run_local_cluster(
    config: SimulationConfig,
    options: RunOptions,
    nodes: usize,
) -> Result<Vec<RunSummary>, SimError> {
    config.validate()?;
    tracing::info!("Starting a local cluster of {} nodes", nodes.max(1));

    let handles: Vec<_> = LocalCluster::new(nodes)
        .into_iter()
        .map(|node| {
            let config = config.clone();
            let options = options.clone();
            let rank = node.rank();
            let spawned = thread::Builder::new()
                .name(format!("node-{}", rank))
                .spawn(move || build_node(config, options, Arc::new(node))?.run());
            (rank, spawned)
        })
        .collect();

    let mut summaries = Vec::with_capacity(handles.len());
    let mut failure = None;
    for (rank, spawned) in handles {
        let outcome = match spawned {
            Ok(handle) => handle.join().unwrap_or_else(|_| {
                tracing::error!("Node {} panicked", rank);
                Err(SimError::ExecutionAborted)
            }),
            Err(source) => Err(SimError::Spawn { device: rank, source }),
        };
        match outcome {
            Ok(summary) => summaries.push(summary),
            Err(e) => {
                tracing::error!("Node {} failed: {}", rank, e);
                failure.get_or_insert(e);
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(summaries),
    }
}

fn build_node(
    config: SimulationConfig,
    mut options: RunOptions,
    network: Arc<dyn NetworkManager>,
) -> Result<Simulation, SimError> {
    config.validate()?;
    tracing::info!("Configuration loaded: {}", config.name);
    options.no_leak_warning |= config.no_leak_warning;

    let output = config.output.clone();
    let dir = options
        .output_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&output.directory));
    let devices = config.devices_per_node;
    let name = config.name.clone();

    let problem = BoxProblem::new(config);
    let mut sim = Simulation::new(Box::new(problem), options, CpuDevice::factory(), network, devices);
    if let Some(frequency) = output.text_frequency {
        sim.add_writer(Box::new(TextWriter::new(&dir, &name)), frequency);
    }
    if let Some(frequency) = output.hot_start_frequency {
        sim.add_writer(Box::new(HotStartWriter::new(&dir, BufferSet::CHECKPOINT)), frequency);
    }
    if let Some(info) = &output.info_file {
        sim.set_info_file(dir.join(info));
    }
    Ok(sim)
}
