//! Configuration parsing and validation for particle simulations

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File being read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// The file is not valid JSON for a configuration
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value is out of range
    #[error("{0}")]
    Invalid(String),
}

/// Main simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Human-readable simulation name
    pub name: String,
    /// Simulation domain bounds
    pub domain: DomainBounds,
    /// Initial inter-particle distance (meters)
    pub particle_spacing: f32,
    /// Smoothing length as a multiple of the particle spacing
    #[serde(default = "default_smoothing_factor")]
    pub smoothing_factor: f32,
    /// Blocks filled with fluid particles
    #[serde(default)]
    pub fluid_blocks: Vec<Block>,
    /// Blocks filled with fixed boundary particles
    #[serde(default)]
    pub boundary_blocks: Vec<Block>,
    /// Gravity vector (m/s^2)
    #[serde(default = "default_gravity")]
    pub gravity: [f32; 3],
    /// Piecewise-constant gravity schedule, overrides `gravity` once its first key is reached
    #[serde(default)]
    pub variable_gravity: Vec<GravityKey>,
    /// Fluid rest density (kg/m^3)
    #[serde(default = "default_rest_density")]
    pub rest_density: f32,
    /// WCSPH speed of sound parameter
    #[serde(default = "default_speed_of_sound")]
    pub speed_of_sound: f32,
    /// Tait equation of state exponent
    #[serde(default = "default_gamma")]
    pub gamma: f32,
    /// Artificial viscosity coefficient
    #[serde(default = "default_viscosity")]
    pub viscosity: f32,
    /// CFL condition for adaptive timestep
    #[serde(default = "default_cfl")]
    pub cfl_number: f32,
    /// Initial time step (seconds)
    #[serde(default = "default_dt")]
    pub dt: f32,
    /// Upper bound of the adaptive time step (seconds)
    #[serde(default = "default_max_dt")]
    pub max_dt: f32,
    /// Recompute dt from the forces after every iteration
    #[serde(default = "default_true")]
    pub adaptive_dt: bool,
    /// Iterations between neighbour list rebuilds
    #[serde(default = "default_build_neibs_freq")]
    pub build_neibs_freq: u64,
    /// Neighbour slots per particle
    #[serde(default = "default_max_neibs")]
    pub max_neibs: usize,
    /// Recompute density by summation before each force pass
    #[serde(default)]
    pub density_pre_pass: bool,
    /// Stop after this many iterations
    pub max_iterations: Option<u64>,
    /// Stop after this much simulated time (seconds)
    pub max_time: Option<f64>,
    /// Devices driven by each node
    #[serde(default = "default_devices")]
    pub devices_per_node: usize,
    /// Overlap force computation with the halo update
    #[serde(default)]
    pub striping: bool,
    /// Density filters and their period in iterations
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    /// Inlets and outlets
    #[serde(default)]
    pub open_boundaries: Vec<OpenBoundaryConfig>,
    /// Rigid bodies made of object particles
    #[serde(default)]
    pub bodies: Vec<BodyConfig>,
    /// Particle slots to allocate; derived from the problem when absent
    pub max_particles: Option<usize>,
    /// Output settings
    #[serde(default)]
    pub output: OutputConfig,
    /// Only warn about a shrinking particle count when asked to
    #[serde(default)]
    pub no_leak_warning: bool,
}

/// Domain bounding box
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainBounds {
    /// Minimum corner [x, y, z]
    pub min: [f64; 3],
    /// Maximum corner [x, y, z]
    pub max: [f64; 3],
}

/// Axis-aligned block filled with a particle lattice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    /// Minimum corner [x, y, z]
    pub min: [f64; 3],
    /// Maximum corner [x, y, z]
    pub max: [f64; 3],
}

/// Gravity in effect from time `t` on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GravityKey {
    /// Start time (seconds)
    pub t: f64,
    /// Gravity vector (m/s^2)
    pub gravity: [f32; 3],
}

/// Density filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterKind {
    /// Shepard-normalized density
    Shepard,
}

impl FilterKind {
    /// Scalar argument of the `Filter` command
    pub fn arg(self) -> f32 {
        match self {
            FilterKind::Shepard => kernel::cpu::FILTER_SHEPARD,
        }
    }
}

/// Filter applied every `frequency` iterations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Filter type
    pub kind: FilterKind,
    /// Period in iterations
    pub frequency: u64,
}

/// Open boundary type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenBoundaryType {
    /// Emits fluid
    Inlet,
    /// Absorbs fluid
    Outlet,
}

/// Box-shaped inlet or outlet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenBoundaryConfig {
    /// Inlet or outlet
    pub kind: OpenBoundaryType,
    /// Minimum corner [x, y, z]
    pub min: [f64; 3],
    /// Maximum corner [x, y, z]
    pub max: [f64; 3],
    /// Imposed velocity [vx, vy, vz] (m/s)
    #[serde(default)]
    pub velocity: [f32; 3],
    /// Time over which the inlet velocity ramps up (seconds)
    #[serde(default)]
    pub ramp_time: f32,
}

/// Rigid body filling a block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyConfig {
    /// Minimum corner [x, y, z]
    pub min: [f64; 3],
    /// Maximum corner [x, y, z]
    pub max: [f64; 3],
    /// Body density (kg/m^3)
    pub density: f64,
    /// Initial velocity [vx, vy, vz] (m/s)
    #[serde(default)]
    pub velocity: [f64; 3],
    /// Move with constant velocity, ignoring forces
    #[serde(default)]
    pub fixed_motion: bool,
}

/// Writers and their periods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output directory
    #[serde(default = "default_output_dir")]
    pub directory: String,
    /// Seconds of simulated time between text snapshots
    pub text_frequency: Option<f64>,
    /// Seconds of simulated time between checkpoints
    pub hot_start_frequency: Option<f64>,
    /// File overwritten with the latest status line
    pub info_file: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            text_frequency: None,
            hot_start_frequency: None,
            info_file: None,
        }
    }
}

// Default values
fn default_smoothing_factor() -> f32 {
    1.3
}

fn default_gravity() -> [f32; 3] {
    [0.0, 0.0, -9.81]
}

fn default_rest_density() -> f32 {
    1000.0
}

fn default_speed_of_sound() -> f32 {
    20.0
}

fn default_gamma() -> f32 {
    7.0
}

fn default_viscosity() -> f32 {
    0.1
}

fn default_cfl() -> f32 {
    0.3
}

fn default_dt() -> f32 {
    1.0e-4
}

fn default_max_dt() -> f32 {
    1.0e-3
}

fn default_true() -> bool {
    true
}

fn default_build_neibs_freq() -> u64 {
    10
}

fn default_max_neibs() -> usize {
    128
}

fn default_devices() -> usize {
    1
}

fn default_output_dir() -> String {
    "output".to_string()
}

impl SimulationConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: SimulationConfig = serde_json::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Configuration with every optional setting at its default
    pub fn new(name: &str, domain: DomainBounds, particle_spacing: f32) -> Self {
        Self {
            name: name.to_string(),
            domain,
            particle_spacing,
            smoothing_factor: default_smoothing_factor(),
            fluid_blocks: Vec::new(),
            boundary_blocks: Vec::new(),
            gravity: default_gravity(),
            variable_gravity: Vec::new(),
            rest_density: default_rest_density(),
            speed_of_sound: default_speed_of_sound(),
            gamma: default_gamma(),
            viscosity: default_viscosity(),
            cfl_number: default_cfl(),
            dt: default_dt(),
            max_dt: default_max_dt(),
            adaptive_dt: true,
            build_neibs_freq: default_build_neibs_freq(),
            max_neibs: default_max_neibs(),
            density_pre_pass: false,
            max_iterations: None,
            max_time: None,
            devices_per_node: default_devices(),
            striping: false,
            filters: Vec::new(),
            open_boundaries: Vec::new(),
            bodies: Vec::new(),
            max_particles: None,
            output: OutputConfig::default(),
            no_leak_warning: false,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        // Check domain bounds
        for axis in 0..3 {
            if self.domain.min[axis] >= self.domain.max[axis] {
                return Err(ConfigError::Invalid(format!(
                    "Domain min must be less than max along axis {}",
                    axis
                )));
            }
        }

        // Check particle spacing
        if self.particle_spacing <= 0.0 {
            return invalid("Particle spacing must be positive");
        }
        if self.smoothing_factor <= 0.0 {
            return invalid("Smoothing factor must be positive");
        }

        // Check fluid properties
        if self.rest_density <= 0.0 {
            return invalid("Rest density must be positive");
        }
        if self.speed_of_sound <= 0.0 {
            return invalid("Speed of sound must be positive");
        }
        if self.viscosity < 0.0 {
            return invalid("Viscosity must be non-negative");
        }

        // Check time stepping
        if self.cfl_number <= 0.0 || self.cfl_number > 1.0 {
            return invalid("CFL number must be in range (0, 1]");
        }
        if self.dt <= 0.0 {
            return invalid("Initial dt must be positive");
        }
        if self.max_dt < self.dt {
            return invalid("max_dt must not be smaller than dt");
        }
        if self.build_neibs_freq == 0 {
            return invalid("build_neibs_freq must be at least 1");
        }
        if self.max_neibs == 0 {
            return invalid("max_neibs must be at least 1");
        }

        if let Some(max_iterations) = self.max_iterations {
            if max_iterations == 0 {
                return invalid("max_iterations must be at least 1");
            }
        }
        if let Some(max_time) = self.max_time {
            if max_time <= 0.0 {
                return invalid("max_time must be positive");
            }
        }

        if self.devices_per_node == 0 {
            return invalid("devices_per_node must be at least 1");
        }
        if self.filters.iter().any(|f| f.frequency == 0) {
            return invalid("Filter frequency must be at least 1");
        }

        // Blocks must be non-empty boxes
        let blocks = self
            .fluid_blocks
            .iter()
            .chain(&self.boundary_blocks)
            .map(|b| (b.min, b.max))
            .chain(self.open_boundaries.iter().map(|b| (b.min, b.max)))
            .chain(self.bodies.iter().map(|b| (b.min, b.max)));
        for (min, max) in blocks {
            if (0..3).any(|a| min[a] > max[a]) {
                return invalid("Block min must not exceed max");
            }
        }
        if self.bodies.iter().any(|b| b.density <= 0.0) {
            return invalid("Body density must be positive");
        }

        Ok(())
    }

    /// Smoothing length from particle spacing
    pub fn smoothing_length(&self) -> f32 {
        self.smoothing_factor * self.particle_spacing
    }

    /// Gravity in effect at time `t`
    pub fn gravity_at(&self, t: f64) -> [f32; 3] {
        self.variable_gravity
            .iter()
            .filter(|key| key.t <= t)
            .last()
            .map_or(self.gravity, |key| key.gravity)
    }
}

/// Options given on the command line that override or extend the file
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Checkpoint to resume from
    pub resume: Option<PathBuf>,
    /// Iteration cap, overrides the configuration
    pub max_iterations: Option<u64>,
    /// End time, overrides the configuration
    pub max_time: Option<f64>,
    /// Skip every write that is not forced
    pub nosave: bool,
    /// Force striping on
    pub striping: bool,
    /// Only warn about a shrinking particle count when asked to
    pub no_leak_warning: bool,
    /// Output directory, overrides the configuration
    pub output_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box() -> DomainBounds {
        DomainBounds {
            min: [0.0, 0.0, 0.0],
            max: [1.0, 1.0, 1.0],
        }
    }

    #[test]
    fn test_smoothing_length() {
        let config = SimulationConfig::new("test", unit_box(), 0.01);
        assert!((config.smoothing_length() - 0.013).abs() < 1e-6);
    }

    #[test]
    fn test_validation_domain_bounds() {
        let mut config = SimulationConfig::new(
            "test",
            DomainBounds {
                min: [1.0, 0.0, 0.0],
                max: [0.0, 1.0, 1.0],
            },
            0.01,
        );
        assert!(config.validate().is_err());

        config.domain = unit_box();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_particle_spacing() {
        let mut config = SimulationConfig::new("test", unit_box(), -0.01);
        assert!(config.validate().is_err());

        config.particle_spacing = 0.01;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_frequencies() {
        let mut config = SimulationConfig::new("test", unit_box(), 0.01);
        config.build_neibs_freq = 0;
        assert!(config.validate().is_err());

        config.build_neibs_freq = 10;
        config.filters.push(FilterConfig {
            kind: FilterKind::Shepard,
            frequency: 0,
        });
        assert!(config.validate().is_err());

        config.filters[0].frequency = 20;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_with_defaults() {
        let json = r#"{
            "name": "dam",
            "domain": { "min": [0, 0, 0], "max": [1, 0.5, 0.5] },
            "particle_spacing": 0.02,
            "fluid_blocks": [ { "min": [0, 0, 0], "max": [0.3, 0.5, 0.3] } ],
            "max_iterations": 100,
            "max_time": null,
            "max_particles": null,
            "filters": [ { "kind": "Shepard", "frequency": 20 } ]
        }"#;
        let config: SimulationConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.devices_per_node, 1);
        assert_eq!(config.build_neibs_freq, 10);
        assert!(config.adaptive_dt);
        assert_eq!(config.filters[0].kind, FilterKind::Shepard);
        assert_eq!(config.output.directory, "output");
    }

    #[test]
    fn test_gravity_schedule() {
        let mut config = SimulationConfig::new("test", unit_box(), 0.01);
        config.variable_gravity = vec![
            GravityKey {
                t: 0.5,
                gravity: [0.0, 0.0, -1.0],
            },
            GravityKey {
                t: 1.0,
                gravity: [1.0, 0.0, 0.0],
            },
        ];
        assert_eq!(config.gravity_at(0.0), default_gravity());
        assert_eq!(config.gravity_at(0.7), [0.0, 0.0, -1.0]);
        assert_eq!(config.gravity_at(2.0), [1.0, 0.0, 0.0]);
    }
}
