//! Checkpoint files for resuming a run.
//!
//! Layout of one file, all little-endian native records:
//!
//! ```text
//! HotHeader                      56 bytes
//! FieldEntry x num_fields        24 bytes each
//! field payloads                 in table order, particle_count records each
//! BodyRecord x num_bodies        80 bytes each
//! ```
//!
//! A multi-node run writes one file per rank, named
//! `hot_n<rank>.<ranks>_<index>.bin`; a single-node run writes
//! `hot_<index>.bin`.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use kernel::{BodyMotion, BufferError, BufferKind, BufferList, BufferSet, ParticleInfo, Side};
use thiserror::Error;
use tracing::{debug, info};

/// First bytes of every checkpoint.
pub const HOT_MAGIC: [u8; 8] = *b"PSIMHOT\0";

/// Format version written by this build.
pub const HOT_VERSION: u32 = 1;

/// Errors reading or writing checkpoints.
#[derive(Debug, Error)]
pub enum HotStartError {
    /// The name does not follow the checkpoint naming scheme.
    #[error("malformed checkpoint file name: {0}")]
    MalformedName(String),

    /// A file of the checkpoint set does not exist.
    #[error("checkpoint file {0} not found")]
    NotFound(PathBuf),

    /// Reading or writing failed.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// File being accessed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file does not start with the checkpoint magic.
    #[error("{0} is not a checkpoint file")]
    BadMagic(PathBuf),

    /// Written by an incompatible build.
    #[error("checkpoint version {found} is not supported (expected {expected})")]
    UnsupportedVersion {
        /// Version in the file.
        found: u32,
        /// Version this build reads.
        expected: u32,
    },

    /// The field table names an unknown field.
    #[error("unknown field {0} in checkpoint")]
    UnknownField(u32),

    /// A field's record size differs from this build's.
    #[error("field {kind:?} has {found} bytes per particle in the checkpoint, expected {expected}")]
    FieldLayout {
        /// Field.
        kind: BufferKind,
        /// Bytes per particle in the file.
        found: usize,
        /// Bytes per particle expected.
        expected: usize,
    },

    /// The host registry cannot hold the data.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Fixed-size file header.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct HotHeader {
    /// [`HOT_MAGIC`].
    pub magic: [u8; 8],
    /// [`HOT_VERSION`].
    pub version: u32,
    /// Entries in the field table.
    pub num_fields: u32,
    /// Particles stored.
    pub particle_count: u64,
    /// Completed iterations.
    pub iterations: u64,
    /// Simulation time.
    pub t: f64,
    /// Time step in effect.
    pub dt: f32,
    /// Open boundaries of the problem.
    pub num_open_boundaries: u32,
    /// Body records after the payloads.
    pub num_bodies: u32,
    /// Zero.
    pub reserved: u32,
}

/// One entry of the field table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FieldEntry {
    /// Field index, see [`BufferKind::from_index`].
    pub kind: u32,
    /// Bytes per element.
    pub element_size: u32,
    /// Elements per particle.
    pub elements_per_particle: u32,
    /// Zero.
    pub reserved: u32,
    /// Payload bytes.
    pub bytes: u64,
}

/// Motion of one rigid body.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BodyRecord {
    /// Body index.
    pub index: u32,
    /// Zero.
    pub reserved: u32,
    /// Center of gravity.
    pub cg: [f64; 3],
    /// Linear velocity.
    pub velocity: [f64; 3],
    /// Angular velocity.
    pub omega: [f64; 3],
}

fn io_error(path: &Path) -> impl Fn(std::io::Error) -> HotStartError + '_ {
    move |source| HotStartError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// File name of checkpoint `index` written by `rank` of a `nodes`-node run.
pub fn hot_file_name(rank: usize, nodes: usize, index: u64) -> String {
    if nodes > 1 {
        format!("hot_n{}.{}_{:05}.bin", rank, nodes, index)
    } else {
        format!("hot_{:05}.bin", index)
    }
}

/// First checkpoint index `rank` of a `nodes`-node run can write into `dir`
/// without replacing one of its files: one past the highest index found.
pub fn next_hot_index(dir: &Path, rank: usize, nodes: usize) -> std::io::Result<u64> {
    let prefix = match nodes {
        n if n > 1 => format!("hot_n{}.{}_", rank, n),
        _ => "hot_".to_string(),
    };
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut next = 0;
    for entry in entries {
        let name = entry?.file_name();
        let index = name
            .to_str()
            .and_then(|n| n.strip_prefix(prefix.as_str()))
            .and_then(|n| n.strip_suffix(".bin"))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(index) = index {
            next = next.max(index + 1);
        }
    }
    Ok(next)
}

/// Every file of the checkpoint set `path` belongs to, in rank order.
///
/// `hot_nX.Y_Z.bin` expands to `hot_n0.Y_Z.bin` .. `hot_n<Y-1>.Y_Z.bin` in
/// the same directory; any other name is a single-file checkpoint.
pub fn resolve_hot_files(path: &Path) -> Result<Vec<PathBuf>, HotStartError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| HotStartError::MalformedName(path.display().to_string()))?;

    let files = match name.strip_prefix("hot_n") {
        Some(rest) => {
            let malformed = || HotStartError::MalformedName(name.to_string());
            let (rank, rest) = rest.split_once('.').ok_or_else(malformed)?;
            let (ranks, suffix) = rest.split_once('_').ok_or_else(malformed)?;
            let rank: usize = rank.parse().map_err(|_| malformed())?;
            let ranks: usize = ranks.parse().map_err(|_| malformed())?;
            if ranks == 0 || rank >= ranks || suffix.is_empty() {
                return Err(malformed());
            }
            let dir = path.parent().unwrap_or_else(|| Path::new(""));
            (0..ranks)
                .map(|i| dir.join(format!("hot_n{}.{}_{}", i, ranks, suffix)))
                .collect()
        }
        None => vec![path.to_path_buf()],
    };

    for file in &files {
        if !file.is_file() {
            return Err(HotStartError::NotFound(file.clone()));
        }
    }
    Ok(files)
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// What goes into one checkpoint file.
#[derive(Debug)]
pub struct Checkpoint<'a> {
    /// Host particle data.
    pub host: &'a BufferList,
    /// Particles of this node.
    pub range: Range<usize>,
    /// Fields to store; unregistered ones and the neighbour list are skipped.
    pub fields: BufferSet,
    /// Completed iterations.
    pub iterations: u64,
    /// Simulation time.
    pub t: f64,
    /// Time step.
    pub dt: f32,
    /// Open boundaries of the problem.
    pub num_open_boundaries: u32,
    /// Rigid body motions.
    pub bodies: &'a [BodyMotion],
}

/// Write the active particles of `checkpoint.range`. Returns the number of
/// particles written.
pub fn write_hot_file(path: &Path, checkpoint: &Checkpoint<'_>) -> Result<usize, HotStartError> {
    let host = checkpoint.host;
    let range = checkpoint.range.clone();
    let infos = host.get::<ParticleInfo>(BufferKind::Info, Side::Read)?;
    if range.end > infos.len() {
        return Err(BufferError::OutOfBounds {
            kind: BufferKind::Info,
            start: range.start,
            end: range.end,
            capacity: infos.len(),
        }
        .into());
    }
    let picks: Vec<u32> = range
        .clone()
        .filter(|&i| infos[i].is_active())
        .map(|i| i as u32)
        .collect();

    let mut fields = checkpoint.fields.intersection(host.registered());
    fields.remove(BufferKind::NeibsList);

    let mut table = Vec::with_capacity(fields.len());
    let mut payloads = Vec::with_capacity(fields.len());
    for kind in fields.iter() {
        let stride = kind.elements_per_particle(host.max_neibs());
        let data = host.data(kind, Side::Read)?.select(&picks, stride);
        let element_size = kind.element().size();
        table.push(FieldEntry {
            kind: kind as u32,
            element_size: element_size as u32,
            elements_per_particle: stride as u32,
            reserved: 0,
            bytes: data.as_bytes().len() as u64,
        });
        payloads.push(data);
    }

    let header = HotHeader {
        magic: HOT_MAGIC,
        version: HOT_VERSION,
        num_fields: table.len() as u32,
        particle_count: picks.len() as u64,
        iterations: checkpoint.iterations,
        t: checkpoint.t,
        dt: checkpoint.dt,
        num_open_boundaries: checkpoint.num_open_boundaries,
        num_bodies: checkpoint.bodies.len() as u32,
        reserved: 0,
    };

    let file = File::create(path).map_err(io_error(path))?;
    let mut out = BufWriter::new(file);
    out.write_all(bytemuck::bytes_of(&header)).map_err(io_error(path))?;
    out.write_all(bytemuck::cast_slice(&table)).map_err(io_error(path))?;
    for data in &payloads {
        out.write_all(data.as_bytes()).map_err(io_error(path))?;
    }
    for (index, body) in checkpoint.bodies.iter().enumerate() {
        let record = BodyRecord {
            index: index as u32,
            reserved: 0,
            cg: body.cg,
            velocity: body.velocity,
            omega: body.omega,
        };
        out.write_all(bytemuck::bytes_of(&record)).map_err(io_error(path))?;
    }
    out.flush().map_err(io_error(path))?;

    debug!("wrote {} particles to {}", picks.len(), path.display());
    Ok(picks.len())
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// An open checkpoint file, header and field table already read.
#[derive(Debug)]
pub struct HotFile {
    path: PathBuf,
    header: HotHeader,
    fields: Vec<(BufferKind, FieldEntry)>,
    reader: BufReader<File>,
}

impl HotFile {
    /// Open `path` and read its header and field table.
    pub fn open(path: &Path) -> Result<Self, HotStartError> {
        let file = File::open(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                HotStartError::NotFound(path.to_path_buf())
            } else {
                HotStartError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        let mut reader = BufReader::new(file);

        let mut header = HotHeader::zeroed();
        reader
            .read_exact(bytemuck::bytes_of_mut(&mut header))
            .map_err(|_| HotStartError::BadMagic(path.to_path_buf()))?;
        if header.magic != HOT_MAGIC {
            return Err(HotStartError::BadMagic(path.to_path_buf()));
        }
        if header.version != HOT_VERSION {
            return Err(HotStartError::UnsupportedVersion {
                found: header.version,
                expected: HOT_VERSION,
            });
        }

        let mut fields = Vec::with_capacity(header.num_fields as usize);
        for _ in 0..header.num_fields {
            let mut entry = FieldEntry::zeroed();
            reader
                .read_exact(bytemuck::bytes_of_mut(&mut entry))
                .map_err(io_error(path))?;
            let kind = BufferKind::from_index(entry.kind).ok_or(HotStartError::UnknownField(entry.kind))?;
            fields.push((kind, entry));
        }

        info!(
            "checkpoint {}: {} particles, iteration {}, t={}, dt={}",
            path.display(),
            header.particle_count,
            header.iterations,
            header.t,
            header.dt
        );
        Ok(Self {
            path: path.to_path_buf(),
            header,
            fields,
            reader,
        })
    }

    /// The file header.
    pub fn header(&self) -> &HotHeader {
        &self.header
    }

    /// Particles stored.
    pub fn particle_count(&self) -> usize {
        self.header.particle_count as usize
    }

    /// Fields stored.
    pub fn fields(&self) -> BufferSet {
        self.fields.iter().map(|(kind, _)| *kind).collect()
    }

    /// Read every field into `host` starting at particle `offset`, then the
    /// body records.
    pub fn load(mut self, host: &mut BufferList, offset: usize) -> Result<Vec<BodyMotion>, HotStartError> {
        let count = self.particle_count();
        let max_neibs = host.max_neibs();
        for (kind, entry) in &self.fields {
            let kind = *kind;
            let expected = kind.element().size() * kind.elements_per_particle(max_neibs);
            let found = entry.element_size as usize * entry.elements_per_particle as usize;
            if found != expected || entry.bytes as usize != found * count {
                return Err(HotStartError::FieldLayout { kind, found, expected });
            }
            let capacity = host.capacity();
            let bytes = host.data_mut(kind, Side::Read)?.as_bytes_mut();
            if offset + count > capacity {
                return Err(BufferError::OutOfBounds {
                    kind,
                    start: offset,
                    end: offset + count,
                    capacity,
                }
                .into());
            }
            let window = &mut bytes[offset * expected..(offset + count) * expected];
            self.reader.read_exact(window).map_err(io_error(&self.path))?;
        }

        let mut bodies = Vec::with_capacity(self.header.num_bodies as usize);
        for _ in 0..self.header.num_bodies {
            let mut record = BodyRecord::zeroed();
            self.reader
                .read_exact(bytemuck::bytes_of_mut(&mut record))
                .map_err(io_error(&self.path))?;
            bodies.push(BodyMotion {
                cg: record.cg,
                velocity: record.velocity,
                omega: record.omega,
            });
        }
        Ok(bodies)
    }
}
