//! Command line launcher
//!
//! Loads a JSON configuration, applies the command line overrides and runs
//! the simulation, either on this node alone or as a cluster of in-process
//! nodes.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use orchestrator::{create_simulation, run_local_cluster, RunOptions, RunSummary, SimError, SimulationConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "launcher", version, about = "Run a particle simulation from a configuration file")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Resume from a checkpoint; any file of a multi-node set selects the set
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Stop after this many iterations
    #[arg(long)]
    maxiter: Option<u64>,

    /// Stop at this simulated time
    #[arg(long)]
    tend: Option<f64>,

    /// Devices per node, overrides the configuration
    #[arg(long)]
    devices: Option<usize>,

    /// Run this many nodes as threads of this process
    #[arg(long, default_value_t = 1)]
    nodes: usize,

    /// Only write when forced: at the end, or when the problem asks
    #[arg(long)]
    nosave: bool,

    /// Overlap the force computation with the halo exchange
    #[arg(long)]
    striping: bool,

    /// Do not warn when particles are lost
    #[arg(long)]
    no_leak_warning: bool,

    /// Output directory, overrides the configuration
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "launcher=info,orchestrator=info,kernel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(summaries) => {
            for (rank, s) in summaries.iter().enumerate() {
                tracing::info!(
                    "Node {}: {} iterations, t={}s, dt={}s, {} particles, {:.2} MIPPS, peak speed {} m/s",
                    rank,
                    s.iterations,
                    s.t,
                    s.dt,
                    s.particles,
                    s.mipps,
                    s.peak_speed
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Simulation failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<Vec<RunSummary>, SimError> {
    tracing::info!("Loading configuration from {}", cli.config.display());
    let mut config = SimulationConfig::load(&cli.config)?;
    if let Some(devices) = cli.devices {
        config.devices_per_node = devices;
    }

    let options = RunOptions {
        resume: cli.resume,
        max_iterations: cli.maxiter,
        max_time: cli.tend,
        nosave: cli.nosave,
        striping: cli.striping,
        no_leak_warning: cli.no_leak_warning,
        output_dir: cli.output,
    };

    if cli.nodes > 1 {
        return run_local_cluster(config, options, cli.nodes);
    }
    let mut sim = create_simulation(config, options)?;
    Ok(vec![sim.run()?])
}
