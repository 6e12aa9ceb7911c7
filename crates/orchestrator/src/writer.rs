//! Output writers and their scheduling.
//!
//! A writer is due when it never wrote or when at least its period of
//! simulated time elapsed since its last write. A negative period disables
//! it; a zero period makes it write at every check. When writing is skipped
//! (`nosave`), due writers are still marked as written so that their
//! schedule keeps advancing.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use kernel::{BodyMotion, BufferKind, BufferList, BufferSet, ParticleInfo, Side};
use tracing::debug;

use crate::error::SimError;
use crate::hotstart::{hot_file_name, next_hot_index, write_hot_file, Checkpoint, HotStartError};

/// Everything a writer may look at.
#[derive(Debug)]
pub struct WriteContext<'a> {
    /// Simulation time.
    pub t: f64,
    /// Completed iterations.
    pub iterations: u64,
    /// Current time step.
    pub dt: f32,
    /// Host particle data, freshly dumped.
    pub host: &'a BufferList,
    /// Particles of this node.
    pub range: Range<usize>,
    /// Rigid body motions.
    pub bodies: &'a [BodyMotion],
    /// Open boundaries of the problem.
    pub num_open_boundaries: u32,
    /// This node.
    pub rank: usize,
    /// Nodes of the run.
    pub nodes: usize,
}

/// A sink for particle snapshots.
pub trait Writer: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Write snapshot number `index`.
    fn write(&mut self, index: u64, ctx: &WriteContext<'_>) -> std::io::Result<()>;
}

struct Entry {
    writer: Box<dyn Writer>,
    frequency: f64,
    last_write: Option<f64>,
    written: u64,
}

impl Entry {
    fn need_write(&self, t: f64) -> bool {
        if self.frequency < 0.0 {
            return false;
        }
        match self.last_write {
            None => true,
            Some(last) => t - last >= self.frequency,
        }
    }

    fn mark_written(&mut self, t: f64) {
        self.last_write = Some(t);
    }
}

/// The writers of a run with their schedules.
#[derive(Default)]
pub struct WriterSet {
    entries: Vec<Entry>,
}

impl std::fmt::Debug for WriterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (e.writer.name(), e.frequency)))
            .finish()
    }
}

impl WriterSet {
    /// No writers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `writer`, due every `frequency` seconds of simulated time.
    pub fn add(&mut self, writer: Box<dyn Writer>, frequency: f64) {
        self.entries.push(Entry {
            writer,
            frequency,
            last_write: None,
            written: 0,
        });
    }

    /// Number of writers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no writers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writers due at time `t`.
    pub fn need_write(&self, t: f64) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.need_write(t))
            .map(|(i, _)| i)
            .collect()
    }

    /// Mark `due` as written at `t` without writing.
    pub fn fake_mark_written(&mut self, due: &[usize], t: f64) {
        for &i in due {
            if let Some(entry) = self.entries.get_mut(i) {
                entry.mark_written(t);
            }
        }
    }

    /// Largest period among `due`, zero if none.
    pub fn max_frequency(&self, due: &[usize]) -> f64 {
        due.iter()
            .filter_map(|&i| self.entries.get(i))
            .map(|e| e.frequency)
            .fold(0.0, f64::max)
    }

    /// Write with `due`, or with every enabled writer when `force` is set.
    pub fn write(&mut self, due: &[usize], force: bool, ctx: &WriteContext<'_>) -> Result<(), SimError> {
        for (i, entry) in self.entries.iter_mut().enumerate() {
            let selected = if force {
                entry.frequency >= 0.0
            } else {
                due.contains(&i)
            };
            if !selected {
                continue;
            }
            entry
                .writer
                .write(entry.written, ctx)
                .map_err(|source| SimError::Writer {
                    writer: entry.writer.name().to_string(),
                    source,
                })?;
            entry.written += 1;
            entry.mark_written(ctx.t);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Text snapshots
// ---------------------------------------------------------------------------

/// Writes one CSV file per snapshot with the active particles.
#[derive(Debug)]
pub struct TextWriter {
    dir: PathBuf,
    prefix: String,
}

impl TextWriter {
    /// Writer of `<dir>/<prefix>_<index>.csv`.
    pub fn new(dir: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.to_string(),
        }
    }

    fn file_name(&self, index: u64, ctx: &WriteContext<'_>) -> PathBuf {
        if ctx.nodes > 1 {
            self.dir
                .join(format!("{}_n{}_{:05}.csv", self.prefix, ctx.rank, index))
        } else {
            self.dir.join(format!("{}_{:05}.csv", self.prefix, index))
        }
    }
}

impl Writer for TextWriter {
    fn name(&self) -> &str {
        "text"
    }

    fn write(&mut self, index: u64, ctx: &WriteContext<'_>) -> std::io::Result<()> {
        let to_io = |e: kernel::BufferError| std::io::Error::new(std::io::ErrorKind::InvalidData, e);
        let pos = ctx.host.get::<[f64; 4]>(BufferKind::PosGlobal, Side::Read).map_err(to_io)?;
        let vel = ctx.host.get::<[f32; 4]>(BufferKind::Vel, Side::Read).map_err(to_io)?;
        let info = ctx.host.get::<ParticleInfo>(BufferKind::Info, Side::Read).map_err(to_io)?;

        fs::create_dir_all(&self.dir)?;
        let path = self.file_name(index, ctx);
        let mut out = BufWriter::new(File::create(&path)?);
        writeln!(out, "# t={} iteration={}", ctx.t, ctx.iterations)?;
        writeln!(out, "id,type,object,x,y,z,vx,vy,vz,density")?;
        let mut written = 0usize;
        for i in ctx.range.clone() {
            let (p, v, inf) = (pos[i], vel[i], info[i]);
            if !inf.is_active() {
                continue;
            }
            writeln!(
                out,
                "{},{},{},{},{},{},{},{},{},{}",
                inf.id,
                inf.ptype,
                inf.object,
                p[0],
                p[1],
                p[2],
                v[0],
                v[1],
                v[2],
                v[3]
            )?;
            written += 1;
        }
        out.flush()?;
        debug!("text snapshot {}: {} particles", path.display(), written);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Writes hot-start checkpoints.
///
/// Numbering starts past the checkpoints already in the directory, so a
/// resumed run extends the series instead of replacing its first files.
#[derive(Debug)]
pub struct HotStartWriter {
    dir: PathBuf,
    fields: BufferSet,
    /// Index of the first file, past the checkpoints already in `dir`.
    first_index: Option<u64>,
    last_file: Option<PathBuf>,
}

impl HotStartWriter {
    /// Writer of the host fields `fields` into `dir`.
    pub fn new(dir: impl Into<PathBuf>, fields: BufferSet) -> Self {
        Self {
            dir: dir.into(),
            fields,
            first_index: None,
            last_file: None,
        }
    }

    /// Path of the last checkpoint written.
    pub fn last_file(&self) -> Option<&Path> {
        self.last_file.as_deref()
    }
}

impl Writer for HotStartWriter {
    fn name(&self) -> &str {
        "hotstart"
    }

    fn write(&mut self, index: u64, ctx: &WriteContext<'_>) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let first = match self.first_index {
            Some(first) => first,
            None => {
                let first = next_hot_index(&self.dir, ctx.rank, ctx.nodes)?;
                if first > 0 {
                    debug!("checkpoints in {} continue from index {}", self.dir.display(), first);
                }
                *self.first_index.insert(first)
            }
        };
        let path = self.dir.join(hot_file_name(ctx.rank, ctx.nodes, first + index));
        let checkpoint = Checkpoint {
            host: ctx.host,
            range: ctx.range.clone(),
            fields: self.fields,
            iterations: ctx.iterations,
            t: ctx.t,
            dt: ctx.dt,
            num_open_boundaries: ctx.num_open_boundaries,
            bodies: ctx.bodies,
        };
        write_hot_file(&path, &checkpoint).map_err(|e| match e {
            HotStartError::Io { source, .. } => source,
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        })?;
        self.last_file = Some(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        log: Arc<Mutex<Vec<(u64, f64)>>>,
    }

    impl Writer for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn write(&mut self, index: u64, ctx: &WriteContext<'_>) -> std::io::Result<()> {
            self.log.lock().unwrap().push((index, ctx.t));
            Ok(())
        }
    }

    fn ctx(host: &BufferList, t: f64) -> WriteContext<'_> {
        WriteContext {
            t,
            iterations: 0,
            dt: 0.1,
            host,
            range: 0..0,
            bodies: &[],
            num_open_boundaries: 0,
            rank: 0,
            nodes: 1,
        }
    }

    #[test]
    fn schedule_follows_frequency() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = WriterSet::new();
        set.add(Box::new(Recorder { log: Arc::clone(&log) }), 0.5);
        set.add(Box::new(Recorder { log: Arc::clone(&log) }), -1.0);
        let host = BufferList::host();

        assert_eq!(set.need_write(0.0), vec![0]);
        set.write(&[0], false, &ctx(&host, 0.0)).unwrap();
        assert!(set.need_write(0.3).is_empty());
        assert_eq!(set.need_write(0.5), vec![0]);
        assert_eq!(set.max_frequency(&[0]), 0.5);

        // nosave: schedule advances, nothing written
        set.fake_mark_written(&[0], 0.5);
        assert!(set.need_write(0.7).is_empty());

        // forced writes skip disabled writers
        set.write(&[], true, &ctx(&host, 0.7)).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![(0, 0.0), (1, 0.7)]);
    }

    #[test]
    fn checkpoints_extend_an_existing_series() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("hot_00002.bin");
        fs::write(&old, b"earlier run").unwrap();

        let mut host = BufferList::host();
        host.add_set(BufferSet::DUMP | BufferSet::HOST_ONLY);
        host.allocate(1, 1);
        let mut writer = HotStartWriter::new(dir.path(), BufferSet::CHECKPOINT);
        writer.write(0, &ctx(&host, 0.0)).unwrap();
        assert!(writer.last_file().unwrap().ends_with("hot_00003.bin"));
        writer.write(1, &ctx(&host, 0.1)).unwrap();
        assert!(writer.last_file().unwrap().ends_with("hot_00004.bin"));

        assert_eq!(fs::read(&old).unwrap(), b"earlier run");
        assert!(!dir.path().join("hot_00000.bin").exists());
    }
}
