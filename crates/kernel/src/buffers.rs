//! Particle field registry with READ/WRITE double buffering.
//!
//! Every particle field is identified by a [`BufferKind`]. A [`BufferList`]
//! owns one fixed-capacity boxed slice per registered field (two for
//! double-buffered fields). Commands name the fields they touch with a
//! [`BufferSet`], and [`BufferList::swap`] exchanges the READ and WRITE roles
//! of exactly those fields without moving any data.

use std::collections::BTreeMap;
use std::ops::{BitOr, BitOrAssign, Range};

use bytemuck::Pod;

use crate::error::BufferError;
use crate::particle::ParticleInfo;

// ---------------------------------------------------------------------------
// Field identifiers
// ---------------------------------------------------------------------------

/// Logical particle field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum BufferKind {
    /// Absolute double-precision position, w = mass. Host only, rebuilt
    /// from `Pos` and `Hash` before every write.
    PosGlobal = 0,
    /// Single-precision position relative to the center of the cell in the
    /// particle hash, w = mass.
    Pos,
    /// Velocity, w = density.
    Vel,
    /// Particle type, flags and id.
    Info,
    /// Particle hash: cell type in the high word, cell index in the low word.
    Hash,
    /// Acceleration, w = density rate.
    Forces,
    /// Neighbour indices, `max_neibs` slots per particle.
    NeibsList,
    /// Turbulent kinetic energy.
    Tke,
    /// Turbulent dissipation.
    Epsilon,
    /// Turbulent viscosity.
    TurbVisc,
    /// Specific internal energy.
    InternalEnergy,
    /// Particle volume.
    Volume,
    /// Smoothed number density.
    Sigma,
    /// Boundary element normals and surface.
    BoundElements,
    /// Boundary element vertex ids.
    Vertices,
    /// Renormalization gradient.
    GradGamma,
    /// Eulerian velocity.
    EulerVel,
    /// Surface normals.
    Normals,
    /// Vorticity.
    Vorticity,
    /// Scratch field for debugging kernels.
    Private,
}

/// Storage type of one element of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// `f32`
    F32,
    /// `[f32; 4]`
    Float4,
    /// `[f64; 4]`
    Double4,
    /// `u32`
    U32,
    /// `[u32; 4]`
    Uint4,
    /// `u64`
    U64,
    /// [`ParticleInfo`]
    Info,
}

impl ElementKind {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            ElementKind::F32 | ElementKind::U32 => 4,
            ElementKind::Float4 | ElementKind::Uint4 => 16,
            ElementKind::Double4 => 32,
            ElementKind::U64 => 8,
            ElementKind::Info => std::mem::size_of::<ParticleInfo>(),
        }
    }

    /// Readable element type name.
    pub fn name(self) -> &'static str {
        match self {
            ElementKind::F32 => "f32",
            ElementKind::Float4 => "[f32; 4]",
            ElementKind::Double4 => "[f64; 4]",
            ElementKind::U32 => "u32",
            ElementKind::Uint4 => "[u32; 4]",
            ElementKind::U64 => "u64",
            ElementKind::Info => "ParticleInfo",
        }
    }
}

impl BufferKind {
    /// Every field, in declaration order.
    pub const ALL: [BufferKind; 20] = [
        BufferKind::PosGlobal,
        BufferKind::Pos,
        BufferKind::Vel,
        BufferKind::Info,
        BufferKind::Hash,
        BufferKind::Forces,
        BufferKind::NeibsList,
        BufferKind::Tke,
        BufferKind::Epsilon,
        BufferKind::TurbVisc,
        BufferKind::InternalEnergy,
        BufferKind::Volume,
        BufferKind::Sigma,
        BufferKind::BoundElements,
        BufferKind::Vertices,
        BufferKind::GradGamma,
        BufferKind::EulerVel,
        BufferKind::Normals,
        BufferKind::Vorticity,
        BufferKind::Private,
    ];

    /// Bit of this field in a [`BufferSet`].
    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Field with the given declaration index.
    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    /// Element type stored for this field.
    pub fn element(self) -> ElementKind {
        match self {
            BufferKind::PosGlobal => ElementKind::Double4,
            BufferKind::Pos
            | BufferKind::Vel
            | BufferKind::Forces
            | BufferKind::Volume
            | BufferKind::BoundElements
            | BufferKind::GradGamma
            | BufferKind::EulerVel
            | BufferKind::Normals
            | BufferKind::Vorticity => ElementKind::Float4,
            BufferKind::Info => ElementKind::Info,
            BufferKind::Hash => ElementKind::U64,
            BufferKind::NeibsList => ElementKind::U32,
            BufferKind::Vertices => ElementKind::Uint4,
            BufferKind::Tke
            | BufferKind::Epsilon
            | BufferKind::TurbVisc
            | BufferKind::InternalEnergy
            | BufferKind::Sigma
            | BufferKind::Private => ElementKind::F32,
        }
    }

    /// Whether device-side storage keeps READ and WRITE versions.
    pub fn is_double_buffered(self) -> bool {
        matches!(
            self,
            BufferKind::Pos
                | BufferKind::Vel
                | BufferKind::Info
                | BufferKind::Tke
                | BufferKind::Epsilon
                | BufferKind::InternalEnergy
                | BufferKind::Volume
                | BufferKind::BoundElements
                | BufferKind::GradGamma
                | BufferKind::EulerVel
        )
    }

    /// Number of elements stored per particle.
    pub fn elements_per_particle(self, max_neibs: usize) -> usize {
        match self {
            BufferKind::NeibsList => max_neibs.max(1),
            _ => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Field sets
// ---------------------------------------------------------------------------

/// Set of fields, used wherever a command applies to several buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferSet(u32);

impl BufferSet {
    /// No field.
    pub const EMPTY: BufferSet = BufferSet(0);

    /// Fields copied into peer devices when appending halo particles.
    pub const IMPORT: BufferSet = BufferSet::of(&[
        BufferKind::Pos,
        BufferKind::Vel,
        BufferKind::Info,
    ]);

    /// Fields refreshed on halo particles after a force computation.
    pub const POST_FORCES_UPDATE: BufferSet = BufferSet::of(&[BufferKind::Forces]);

    /// Fields integrated by `Euler` and swapped after each sub-step.
    pub const POST_COMPUTE_SWAP: BufferSet = BufferSet::of(&[
        BufferKind::Pos,
        BufferKind::Vel,
        BufferKind::Tke,
        BufferKind::Epsilon,
        BufferKind::InternalEnergy,
        BufferKind::Volume,
        BufferKind::EulerVel,
    ]);

    /// Fields downloaded for every write.
    pub const DUMP: BufferSet = BufferSet::of(&[
        BufferKind::Pos,
        BufferKind::Vel,
        BufferKind::Info,
        BufferKind::Hash,
    ]);

    /// Fields stored in checkpoints. Local positions and hashes are derived
    /// from the global positions on resume.
    pub const CHECKPOINT: BufferSet = BufferSet::of(&[
        BufferKind::PosGlobal,
        BufferKind::Vel,
        BufferKind::Info,
    ]);

    /// Fields that only exist on the host.
    pub const HOST_ONLY: BufferSet = BufferSet::of(&[BufferKind::PosGlobal]);

    /// Build a set from a list of fields.
    pub const fn of(kinds: &[BufferKind]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < kinds.len() {
            bits |= kinds[i].bit();
            i += 1;
        }
        BufferSet(bits)
    }

    /// Raw bit mask.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// True if `kind` is in the set.
    pub fn contains(self, kind: BufferKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Add a field.
    pub fn insert(&mut self, kind: BufferKind) {
        self.0 |= kind.bit();
    }

    /// Remove a field.
    pub fn remove(&mut self, kind: BufferKind) {
        self.0 &= !kind.bit();
    }

    /// Fields present in both sets.
    pub fn intersection(self, other: BufferSet) -> BufferSet {
        BufferSet(self.0 & other.0)
    }

    /// Fields of `self` missing from `other`.
    pub fn difference(self, other: BufferSet) -> BufferSet {
        BufferSet(self.0 & !other.0)
    }

    /// True if the set has no field.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of fields.
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Fields in declaration order.
    pub fn iter(self) -> impl Iterator<Item = BufferKind> {
        BufferKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl From<BufferKind> for BufferSet {
    fn from(kind: BufferKind) -> Self {
        BufferSet(kind.bit())
    }
}

impl FromIterator<BufferKind> for BufferSet {
    fn from_iter<I: IntoIterator<Item = BufferKind>>(iter: I) -> Self {
        let mut set = BufferSet::EMPTY;
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

impl BitOr for BufferKind {
    type Output = BufferSet;
    fn bitor(self, rhs: BufferKind) -> BufferSet {
        BufferSet(self.bit() | rhs.bit())
    }
}

impl BitOr<BufferKind> for BufferSet {
    type Output = BufferSet;
    fn bitor(self, rhs: BufferKind) -> BufferSet {
        BufferSet(self.0 | rhs.bit())
    }
}

impl BitOr for BufferSet {
    type Output = BufferSet;
    fn bitor(self, rhs: BufferSet) -> BufferSet {
        BufferSet(self.0 | rhs.0)
    }
}

impl BitOrAssign<BufferKind> for BufferSet {
    fn bitor_assign(&mut self, rhs: BufferKind) {
        self.insert(rhs);
    }
}

impl BitOrAssign for BufferSet {
    fn bitor_assign(&mut self, rhs: BufferSet) {
        self.0 |= rhs.0;
    }
}

/// Which version of a double-buffered field to access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The current state, read by kernels.
    Read,
    /// The next state, written by kernels.
    Write,
}

// ---------------------------------------------------------------------------
// Typed storage
// ---------------------------------------------------------------------------

/// Type-erased storage of one buffer version.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferData {
    /// `f32` elements.
    F32(Box<[f32]>),
    /// `[f32; 4]` elements.
    Float4(Box<[[f32; 4]]>),
    /// `[f64; 4]` elements.
    Double4(Box<[[f64; 4]]>),
    /// `u32` elements.
    U32(Box<[u32]>),
    /// `[u32; 4]` elements.
    Uint4(Box<[[u32; 4]]>),
    /// `u64` elements.
    U64(Box<[u64]>),
    /// Particle info records.
    Info(Box<[ParticleInfo]>),
}

macro_rules! dispatch {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            BufferData::F32($v) => $body,
            BufferData::Float4($v) => $body,
            BufferData::Double4($v) => $body,
            BufferData::U32($v) => $body,
            BufferData::Uint4($v) => $body,
            BufferData::U64($v) => $body,
            BufferData::Info($v) => $body,
        }
    };
}

impl BufferData {
    /// Zero-filled storage of `len` elements.
    pub fn zeroed(kind: ElementKind, len: usize) -> Self {
        match kind {
            ElementKind::F32 => BufferData::F32(vec![0.0; len].into_boxed_slice()),
            ElementKind::Float4 => BufferData::Float4(vec![[0.0; 4]; len].into_boxed_slice()),
            ElementKind::Double4 => BufferData::Double4(vec![[0.0; 4]; len].into_boxed_slice()),
            ElementKind::U32 => BufferData::U32(vec![0; len].into_boxed_slice()),
            ElementKind::Uint4 => BufferData::Uint4(vec![[0; 4]; len].into_boxed_slice()),
            ElementKind::U64 => BufferData::U64(vec![0; len].into_boxed_slice()),
            ElementKind::Info => {
                BufferData::Info(vec![ParticleInfo::default(); len].into_boxed_slice())
            }
        }
    }

    /// Element type of the storage.
    pub fn element_kind(&self) -> ElementKind {
        match self {
            BufferData::F32(_) => ElementKind::F32,
            BufferData::Float4(_) => ElementKind::Float4,
            BufferData::Double4(_) => ElementKind::Double4,
            BufferData::U32(_) => ElementKind::U32,
            BufferData::Uint4(_) => ElementKind::Uint4,
            BufferData::U64(_) => ElementKind::U64,
            BufferData::Info(_) => ElementKind::Info,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        dispatch!(self, v => v.len())
    }

    /// True if the storage holds no element.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw bytes of the storage.
    pub fn as_bytes(&self) -> &[u8] {
        dispatch!(self, v => bytemuck::cast_slice(&v[..]))
    }

    /// Mutable raw bytes of the storage.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        dispatch!(self, v => bytemuck::cast_slice_mut(&mut v[..]))
    }

    /// Swap the `stride` elements of particle `i` with those of particle `j`.
    pub fn swap_elements(&mut self, i: usize, j: usize, stride: usize) {
        dispatch!(self, v => {
            for k in 0..stride {
                v.swap(i * stride + k, j * stride + k);
            }
        })
    }

    /// Copy of the elements of particles `range`.
    pub fn extract(&self, range: Range<usize>, stride: usize) -> BufferData {
        let elements = range.start * stride..range.end * stride;
        match self {
            BufferData::F32(v) => BufferData::F32(v[elements].into()),
            BufferData::Float4(v) => BufferData::Float4(v[elements].into()),
            BufferData::Double4(v) => BufferData::Double4(v[elements].into()),
            BufferData::U32(v) => BufferData::U32(v[elements].into()),
            BufferData::Uint4(v) => BufferData::Uint4(v[elements].into()),
            BufferData::U64(v) => BufferData::U64(v[elements].into()),
            BufferData::Info(v) => BufferData::Info(v[elements].into()),
        }
    }

    /// Copy of the elements of the particles listed in `picks`, in order.
    pub fn select(&self, picks: &[u32], stride: usize) -> BufferData {
        fn pick<T: Copy>(v: &[T], picks: &[u32], stride: usize) -> Box<[T]> {
            picks
                .iter()
                .flat_map(|&p| v[p as usize * stride..(p as usize + 1) * stride].iter().copied())
                .collect()
        }
        match self {
            BufferData::F32(v) => BufferData::F32(pick(&v[..], picks, stride)),
            BufferData::Float4(v) => BufferData::Float4(pick(&v[..], picks, stride)),
            BufferData::Double4(v) => BufferData::Double4(pick(&v[..], picks, stride)),
            BufferData::U32(v) => BufferData::U32(pick(&v[..], picks, stride)),
            BufferData::Uint4(v) => BufferData::Uint4(pick(&v[..], picks, stride)),
            BufferData::U64(v) => BufferData::U64(pick(&v[..], picks, stride)),
            BufferData::Info(v) => BufferData::Info(pick(&v[..], picks, stride)),
        }
    }

    /// Copy `count` particles from `src[src_start..]` into `self[dst_start..]`.
    ///
    /// Returns `false` when the element types differ.
    fn copy_particles(
        &mut self,
        dst_start: usize,
        src: &BufferData,
        src_start: usize,
        count: usize,
        stride: usize,
    ) -> bool {
        if self.element_kind() != src.element_kind() {
            return false;
        }
        let es = self.element_kind().size() * stride;
        let dst = &mut self.as_bytes_mut()[dst_start * es..(dst_start + count) * es];
        dst.copy_from_slice(&src.as_bytes()[src_start * es..(src_start + count) * es]);
        true
    }

    /// Gather particles: `self[k] = src[order[k]]` for every `k`.
    ///
    /// Returns `false` when the element types differ.
    fn gather(&mut self, src: &BufferData, order: &[usize], stride: usize) -> bool {
        if self.element_kind() != src.element_kind() {
            return false;
        }
        let es = self.element_kind().size() * stride;
        let src_bytes = src.as_bytes();
        let dst_bytes = self.as_bytes_mut();
        for (k, &from) in order.iter().enumerate() {
            dst_bytes[k * es..(k + 1) * es].copy_from_slice(&src_bytes[from * es..(from + 1) * es]);
        }
        true
    }
}

/// Element types that can be viewed as typed slices of a [`BufferData`].
pub trait Element: Pod + Send + Sync + 'static {
    /// Matching storage type.
    const KIND: ElementKind;
    /// Typed view, `None` on type mismatch.
    fn view(data: &BufferData) -> Option<&[Self]>;
    /// Mutable typed view, `None` on type mismatch.
    fn view_mut(data: &mut BufferData) -> Option<&mut [Self]>;
}

macro_rules! element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const KIND: ElementKind = ElementKind::$variant;
            fn view(data: &BufferData) -> Option<&[Self]> {
                match data {
                    BufferData::$variant(v) => Some(&v[..]),
                    _ => None,
                }
            }
            fn view_mut(data: &mut BufferData) -> Option<&mut [Self]> {
                match data {
                    BufferData::$variant(v) => Some(&mut v[..]),
                    _ => None,
                }
            }
        }
    };
}

element!(f32, F32);
element!([f32; 4], Float4);
element!([f64; 4], Double4);
element!(u32, U32);
element!([u32; 4], Uint4);
element!(u64, U64);
element!(ParticleInfo, Info);

// ---------------------------------------------------------------------------
// Buffer and BufferList
// ---------------------------------------------------------------------------

/// One field: one or two versions plus the index of the READ version.
#[derive(Debug, Clone)]
struct Buffer {
    versions: Vec<BufferData>,
    read: usize,
}

impl Buffer {
    fn version(&self, side: Side) -> &BufferData {
        let index = match side {
            Side::Read => self.read,
            Side::Write => (self.read + 1) % self.versions.len(),
        };
        &self.versions[index]
    }

    fn version_mut(&mut self, side: Side) -> &mut BufferData {
        let index = match side {
            Side::Read => self.read,
            Side::Write => (self.read + 1) % self.versions.len(),
        };
        &mut self.versions[index]
    }
}

/// Registry of particle fields.
///
/// Single-versioned fields answer both [`Side::Read`] and [`Side::Write`] with
/// their only version. Storage is allocated once by [`BufferList::allocate`]
/// and never resized.
#[derive(Debug, Clone)]
pub struct BufferList {
    registered: BTreeMap<BufferKind, Option<Buffer>>,
    capacity: usize,
    max_neibs: usize,
    double_buffering: bool,
}

impl Default for BufferList {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferList {
    /// Device-side registry: double-buffered fields get two versions.
    pub fn new() -> Self {
        Self {
            registered: BTreeMap::new(),
            capacity: 0,
            max_neibs: 0,
            double_buffering: true,
        }
    }

    /// Host-side registry: every field has a single version.
    pub fn host() -> Self {
        Self {
            double_buffering: false,
            ..Self::new()
        }
    }

    /// Register a field. Registering twice is a no-op; registering after
    /// allocation allocates the new field immediately.
    pub fn add(&mut self, kind: BufferKind) -> &mut Self {
        if !self.registered.contains_key(&kind) {
            let buffer = (self.capacity > 0).then(|| self.make_buffer(kind));
            self.registered.insert(kind, buffer);
        }
        self
    }

    /// Register every field of `set`.
    pub fn add_set(&mut self, set: BufferSet) -> &mut Self {
        for kind in set.iter() {
            self.add(kind);
        }
        self
    }

    /// True if `kind` is registered.
    pub fn contains(&self, kind: BufferKind) -> bool {
        self.registered.contains_key(&kind)
    }

    /// All registered fields.
    pub fn registered(&self) -> BufferSet {
        self.registered.keys().copied().collect()
    }

    /// Registered fields that keep two versions.
    pub fn multi_buffered(&self) -> BufferSet {
        self.registered
            .keys()
            .copied()
            .filter(|k| self.is_double_buffered(*k))
            .collect()
    }

    /// True if `kind` is registered with READ and WRITE versions.
    pub fn is_double_buffered(&self, kind: BufferKind) -> bool {
        self.double_buffering && kind.is_double_buffered() && self.contains(kind)
    }

    /// Particle capacity, zero before allocation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Neighbour slots per particle in `NeibsList`.
    pub fn max_neibs(&self) -> usize {
        self.max_neibs
    }

    fn make_buffer(&self, kind: BufferKind) -> Buffer {
        let len = self.capacity * kind.elements_per_particle(self.max_neibs);
        let count = if self.double_buffering && kind.is_double_buffered() {
            2
        } else {
            1
        };
        Buffer {
            versions: (0..count)
                .map(|_| BufferData::zeroed(kind.element(), len))
                .collect(),
            read: 0,
        }
    }

    /// Allocate every registered field for `capacity` particles and return
    /// the number of bytes allocated.
    pub fn allocate(&mut self, capacity: usize, max_neibs: usize) -> usize {
        self.capacity = capacity;
        self.max_neibs = max_neibs;
        let kinds: Vec<BufferKind> = self.registered.keys().copied().collect();
        let mut bytes = 0;
        for kind in kinds {
            let buffer = self.make_buffer(kind);
            bytes += buffer.versions.iter().map(|v| v.as_bytes().len()).sum::<usize>();
            self.registered.insert(kind, Some(buffer));
        }
        bytes
    }

    /// Exchange READ and WRITE for the double-buffered fields in `set`.
    /// Single-versioned and unregistered fields are left untouched.
    pub fn swap(&mut self, set: BufferSet) {
        for kind in set.iter() {
            if let Some(Some(buffer)) = self.registered.get_mut(&kind) {
                if buffer.versions.len() == 2 {
                    buffer.read ^= 1;
                }
            }
        }
    }

    /// Index of the version currently playing READ.
    pub fn read_index(&self, kind: BufferKind) -> Option<usize> {
        match self.registered.get(&kind) {
            Some(Some(buffer)) => Some(buffer.read),
            _ => None,
        }
    }

    /// Swap particles `i` and `j` in every version of every field.
    pub fn swap_particles(&mut self, i: usize, j: usize) {
        let max_neibs = self.max_neibs;
        for (kind, buffer) in self.registered.iter_mut() {
            if let Some(buffer) = buffer {
                let stride = kind.elements_per_particle(max_neibs);
                for version in buffer.versions.iter_mut() {
                    version.swap_elements(i, j, stride);
                }
            }
        }
    }

    fn buffer(&self, kind: BufferKind) -> Result<&Buffer, BufferError> {
        match self.registered.get(&kind) {
            Some(Some(buffer)) => Ok(buffer),
            Some(None) => Err(BufferError::Unallocated(kind)),
            None => Err(BufferError::Missing(kind)),
        }
    }

    fn buffer_mut(&mut self, kind: BufferKind) -> Result<&mut Buffer, BufferError> {
        match self.registered.get_mut(&kind) {
            Some(Some(buffer)) => Ok(buffer),
            Some(None) => Err(BufferError::Unallocated(kind)),
            None => Err(BufferError::Missing(kind)),
        }
    }

    /// Untyped access to one version.
    pub fn data(&self, kind: BufferKind, side: Side) -> Result<&BufferData, BufferError> {
        Ok(self.buffer(kind)?.version(side))
    }

    /// Untyped mutable access to one version.
    pub fn data_mut(&mut self, kind: BufferKind, side: Side) -> Result<&mut BufferData, BufferError> {
        Ok(self.buffer_mut(kind)?.version_mut(side))
    }

    /// Typed access to one version.
    pub fn get<T: Element>(&self, kind: BufferKind, side: Side) -> Result<&[T], BufferError> {
        let data = self.data(kind, side)?;
        T::view(data).ok_or(BufferError::TypeMismatch {
            kind,
            found: data.element_kind().name(),
            requested: T::KIND.name(),
        })
    }

    /// Typed mutable access to one version.
    pub fn get_mut<T: Element>(&mut self, kind: BufferKind, side: Side) -> Result<&mut [T], BufferError> {
        let data = self.data_mut(kind, side)?;
        let found = data.element_kind().name();
        T::view_mut(data).ok_or(BufferError::TypeMismatch {
            kind,
            found,
            requested: T::KIND.name(),
        })
    }

    /// READ and WRITE versions of a double-buffered field at once.
    pub fn split_mut<T: Element>(&mut self, kind: BufferKind) -> Result<(&[T], &mut [T]), BufferError> {
        let buffer = self.buffer_mut(kind)?;
        if buffer.versions.len() != 2 {
            return Err(BufferError::SingleVersioned(kind));
        }
        let read_first = buffer.read == 0;
        let (first, second) = buffer.versions.split_at_mut(1);
        let (read, write) = if read_first {
            (&first[0], &mut second[0])
        } else {
            (&second[0], &mut first[0])
        };
        let found = read.element_kind().name();
        let mismatch = BufferError::TypeMismatch {
            kind,
            found,
            requested: T::KIND.name(),
        };
        match (T::view(read), T::view_mut(write)) {
            (Some(r), Some(w)) => Ok((r, w)),
            _ => Err(mismatch),
        }
    }

    fn check_range(&self, kind: BufferKind, start: usize, count: usize) -> Result<(), BufferError> {
        if start + count > self.capacity {
            return Err(BufferError::OutOfBounds {
                kind,
                start,
                end: start + count,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Copy `count` particles of the fields in `set` from `src` into `self`.
    ///
    /// Fields in `set` missing from either registry are skipped.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_from(
        &mut self,
        set: BufferSet,
        dst_side: Side,
        dst_start: usize,
        src: &BufferList,
        src_side: Side,
        src_start: usize,
        count: usize,
    ) -> Result<(), BufferError> {
        for kind in set.iter() {
            if !self.contains(kind) || !src.contains(kind) {
                continue;
            }
            if kind == BufferKind::NeibsList && self.max_neibs != src.max_neibs {
                continue;
            }
            self.check_range(kind, dst_start, count)?;
            src.check_range(kind, src_start, count)?;
            let stride = kind.elements_per_particle(self.max_neibs);
            let from = src.data(kind, src_side)?;
            let to = self.data_mut(kind, dst_side)?;
            if !to.copy_particles(dst_start, from, src_start, count, stride) {
                return Err(BufferError::TypeMismatch {
                    kind,
                    found: from.element_kind().name(),
                    requested: to.element_kind().name(),
                });
            }
        }
        Ok(())
    }

    /// Write `data` (whole particles) into `kind` starting at particle `dst_start`.
    pub fn write_particles(
        &mut self,
        kind: BufferKind,
        side: Side,
        dst_start: usize,
        data: &BufferData,
    ) -> Result<(), BufferError> {
        let stride = kind.elements_per_particle(self.max_neibs);
        let count = data.len() / stride;
        self.check_range(kind, dst_start, count)?;
        let to = self.data_mut(kind, side)?;
        if !to.copy_particles(dst_start, data, 0, count, stride) {
            return Err(BufferError::TypeMismatch {
                kind,
                found: data.element_kind().name(),
                requested: to.element_kind().name(),
            });
        }
        Ok(())
    }

    /// Copy of particles `range` of one field.
    pub fn extract(&self, kind: BufferKind, side: Side, range: Range<usize>) -> Result<BufferData, BufferError> {
        self.check_range(kind, range.start, range.len())?;
        let stride = kind.elements_per_particle(self.max_neibs);
        Ok(self.data(kind, side)?.extract(range, stride))
    }

    /// Reorder one field: WRITE[k] = READ[order[k]] for double-buffered
    /// fields, in place through a scratch copy otherwise.
    pub fn reorder(&mut self, kind: BufferKind, order: &[usize]) -> Result<(), BufferError> {
        self.check_range(kind, 0, order.len())?;
        let stride = kind.elements_per_particle(self.max_neibs);
        let buffer = self.buffer_mut(kind)?;
        let ok = if buffer.versions.len() == 2 {
            let read = buffer.read;
            let (first, second) = buffer.versions.split_at_mut(1);
            let (src, dst) = if read == 0 {
                (&first[0], &mut second[0])
            } else {
                (&second[0], &mut first[0])
            };
            dst.gather(src, order, stride)
        } else {
            let scratch = buffer.versions[0].clone();
            buffer.versions[0].gather(&scratch, order, stride)
        };
        debug_assert!(ok, "versions of one buffer share their element type");
        Ok(())
    }
}
