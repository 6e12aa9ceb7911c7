//! Cell ownership: device topology, device map, particle hash and segments.
//!
//! Every grid cell is owned by exactly one device, identified by its global
//! device number (devices of node 0 first, then node 1, ...). Relative to a
//! given device each cell falls in one of four classes, and the particle hash
//! stores that class in its high word so that sorting by hash groups a
//! device's particles by segment: inner, inner-edge, outer-edge, outer.

use std::ops::Range;

use crate::grid::{Grid, INVALID_CELL};

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Position of a device in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalDeviceId {
    /// Node (rank) index.
    pub node: usize,
    /// Device index within the node.
    pub device: usize,
}

/// Number of nodes and devices per node. Every node drives the same number
/// of devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    nodes: usize,
    devices_per_node: usize,
}

impl Topology {
    /// Topology with `nodes` nodes of `devices_per_node` devices each.
    pub fn new(nodes: usize, devices_per_node: usize) -> Self {
        Self {
            nodes: nodes.max(1),
            devices_per_node: devices_per_node.max(1),
        }
    }

    /// One node, one device.
    pub fn single() -> Self {
        Self::new(1, 1)
    }

    /// Number of nodes.
    pub fn nodes(&self) -> usize {
        self.nodes
    }

    /// Devices driven by every node.
    pub fn devices_per_node(&self) -> usize {
        self.devices_per_node
    }

    /// Devices across the whole cluster.
    pub fn total_devices(&self) -> usize {
        self.nodes * self.devices_per_node
    }

    /// Global device number of `id`.
    pub fn global_device_number(&self, id: GlobalDeviceId) -> usize {
        id.node * self.devices_per_node + id.device
    }

    /// Inverse of [`Topology::global_device_number`].
    pub fn device_id(&self, number: usize) -> GlobalDeviceId {
        GlobalDeviceId {
            node: number / self.devices_per_node,
            device: number % self.devices_per_node,
        }
    }

    /// Global device numbers owned by `node`.
    pub fn devices_of_node(&self, node: usize) -> Range<usize> {
        node * self.devices_per_node..(node + 1) * self.devices_per_node
    }
}

// ---------------------------------------------------------------------------
// Cell classes and particle hash
// ---------------------------------------------------------------------------

/// Class of a cell relative to one device. The discriminant is the sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum CellType {
    /// Owned cell whose neighbours are all owned by the same device.
    Inner = 0,
    /// Owned cell with at least one foreign neighbour.
    InnerEdge = 1,
    /// Foreign cell adjacent to an owned cell.
    OuterEdge = 2,
    /// Foreign cell not adjacent to any owned cell.
    Outer = 3,
}

impl CellType {
    /// All classes in segment order.
    pub const ALL: [CellType; 4] = [
        CellType::Inner,
        CellType::InnerEdge,
        CellType::OuterEdge,
        CellType::Outer,
    ];

    /// Class with the given discriminant.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// True for the classes of particles the device owns.
    pub fn is_internal(self) -> bool {
        matches!(self, CellType::Inner | CellType::InnerEdge)
    }
}

/// Hash of disabled particles; sorts after every active particle.
pub const INACTIVE_HASH: u64 = u64::MAX;

/// Particle hash: class in the high word, cell index in the low word.
#[inline]
pub fn make_hash(cell_type: CellType, cell: u32) -> u64 {
    ((cell_type as u64) << 32) | cell as u64
}

/// Cell index of a hash, `INVALID_CELL` for inactive particles.
#[inline]
pub fn hash_cell(hash: u64) -> u32 {
    if hash == INACTIVE_HASH {
        INVALID_CELL
    } else {
        hash as u32
    }
}

/// Cell class of a hash, `None` for inactive particles.
#[inline]
pub fn hash_cell_type(hash: u64) -> Option<CellType> {
    if hash == INACTIVE_HASH {
        None
    } else {
        CellType::from_raw((hash >> 32) as u32)
    }
}

// ---------------------------------------------------------------------------
// Device map
// ---------------------------------------------------------------------------

/// Owning global device number of every grid cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMap {
    owners: Vec<u16>,
}

impl DeviceMap {
    /// Map with every cell owned by device 0.
    pub fn new(num_cells: usize) -> Self {
        Self {
            owners: vec![0; num_cells],
        }
    }

    /// Map from an explicit owner per cell.
    pub fn from_owners(owners: Vec<u16>) -> Self {
        Self { owners }
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// True if the map covers no cell.
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Owner of `cell`.
    #[inline]
    pub fn owner(&self, cell: u32) -> usize {
        self.owners[cell as usize] as usize
    }

    /// Assign `cell` to `device`.
    pub fn set(&mut self, cell: u32, device: usize) {
        self.owners[cell as usize] = device as u16;
    }

    /// Owner of `cell` as a `(node, device)` pair.
    pub fn device_id(&self, cell: u32, topology: &Topology) -> GlobalDeviceId {
        topology.device_id(self.owner(cell))
    }

    /// Number of cells owned by each of `total_devices` devices.
    pub fn cells_per_device(&self, total_devices: usize) -> Vec<usize> {
        let mut counts = vec![0; total_devices];
        for &owner in &self.owners {
            if let Some(c) = counts.get_mut(owner as usize) {
                *c += 1;
            }
        }
        counts
    }

    /// Split the grid in slabs along `axis`, one contiguous run of slices per
    /// device.
    ///
    /// With `slice_counts` (particles per slice) slices are balanced by
    /// particle count: slice `s` goes to the device whose share contains the
    /// midpoint of the slice's particles. Without counts, or with no
    /// particles at all, slices are split evenly.
    pub fn fill_by_slices(
        &mut self,
        grid: &Grid,
        total_devices: usize,
        axis: usize,
        slice_counts: Option<&[u64]>,
    ) {
        let slices = grid.dims()[axis] as usize;
        let devices = total_devices.max(1);
        let total: u64 = slice_counts.map(|c| c.iter().sum()).unwrap_or(0);

        let mut slice_owner = vec![0usize; slices];
        match slice_counts {
            Some(counts) if total > 0 && counts.len() == slices => {
                let mut cumulative = 0u64;
                for (s, &count) in counts.iter().enumerate() {
                    let midpoint = cumulative as f64 + count as f64 / 2.0;
                    let owner = (midpoint * devices as f64 / total as f64).floor() as usize;
                    slice_owner[s] = owner.min(devices - 1);
                    cumulative += count;
                }
            }
            _ => {
                for (s, owner) in slice_owner.iter_mut().enumerate() {
                    *owner = (s * devices / slices).min(devices - 1);
                }
            }
        }

        for cell in 0..grid.num_cells() as u32 {
            let coords = grid.cell_coords(cell);
            self.set(cell, slice_owner[coords[axis] as usize]);
        }
    }

    /// Class of `cell` relative to `device`.
    pub fn classify(&self, grid: &Grid, cell: u32, device: usize) -> CellType {
        let own = self.owner(cell) == device;
        let mut foreign_neighbor = false;
        let mut own_neighbor = false;
        grid.for_each_neighbor_cell(cell, |n| {
            if self.owner(n) == device {
                own_neighbor = true;
            } else {
                foreign_neighbor = true;
            }
        });
        match (own, foreign_neighbor, own_neighbor) {
            (true, false, _) => CellType::Inner,
            (true, true, _) => CellType::InnerEdge,
            (false, _, true) => CellType::OuterEdge,
            (false, _, false) => CellType::Outer,
        }
    }

    /// Class of every cell relative to `device`.
    pub fn cell_types(&self, grid: &Grid, device: usize) -> Vec<CellType> {
        (0..grid.num_cells() as u32)
            .map(|cell| self.classify(grid, cell, device))
            .collect()
    }
}

/// Axis along which the world is longest.
pub fn longest_axis(grid: &Grid) -> usize {
    let size = grid.size();
    let mut axis = 0;
    for a in 1..3 {
        if size[a] > size[axis] {
            axis = a;
        }
    }
    axis
}

// ---------------------------------------------------------------------------
// Segment table
// ---------------------------------------------------------------------------

/// Start offset of each segment in a device's hash-sorted particle array.
/// Empty segments have no start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentTable {
    starts: [Option<u32>; 4],
}

impl SegmentTable {
    /// Table with every segment empty.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Table from raw starts in segment order.
    pub fn from_starts(starts: [Option<u32>; 4]) -> Self {
        Self { starts }
    }

    /// Build from hash-sorted hashes: each segment starts at its first hash.
    pub fn from_sorted_hashes(hashes: &[u64]) -> Self {
        let mut table = Self::empty();
        for (i, &hash) in hashes.iter().enumerate() {
            if let Some(cell_type) = hash_cell_type(hash) {
                let slot = &mut table.starts[cell_type as usize];
                if slot.is_none() {
                    *slot = Some(i as u32);
                }
            }
        }
        table
    }

    /// Start of one segment.
    pub fn start(&self, cell_type: CellType) -> Option<u32> {
        self.starts[cell_type as usize]
    }

    /// Set or clear the start of one segment.
    pub fn set(&mut self, cell_type: CellType, start: Option<u32>) {
        self.starts[cell_type as usize] = start;
    }

    /// All starts in segment order.
    pub fn starts(&self) -> [Option<u32>; 4] {
        self.starts
    }

    /// True if every segment is empty.
    pub fn is_empty(&self) -> bool {
        self.starts.iter().all(Option::is_none)
    }

    /// Present starts are non-decreasing and none exceeds `len`.
    pub fn is_monotonic(&self, len: u32) -> bool {
        let mut last = 0;
        for start in self.starts.iter().flatten() {
            if *start < last || *start > len {
                return false;
            }
            last = *start;
        }
        true
    }

    /// Particle range of one segment in an array of `len` particles.
    pub fn range(&self, cell_type: CellType, len: u32) -> Option<Range<usize>> {
        let start = self.start(cell_type)?;
        let end = self.starts[cell_type as usize + 1..]
            .iter()
            .flatten()
            .next()
            .copied()
            .unwrap_or(len);
        Some(start as usize..end as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_grid(cells: u32) -> Grid {
        Grid::new([0.0; 3], [cells as f64, 1.0, 1.0], 1.0).unwrap()
    }

    #[test]
    fn topology_numbering() {
        let topo = Topology::new(2, 3);
        assert_eq!(topo.total_devices(), 6);
        let id = GlobalDeviceId { node: 1, device: 2 };
        assert_eq!(topo.global_device_number(id), 5);
        assert_eq!(topo.device_id(5), id);
        assert_eq!(topo.devices_of_node(1), 3..6);
    }

    #[test]
    fn hash_orders_by_class_then_cell() {
        let a = make_hash(CellType::Inner, 900);
        let b = make_hash(CellType::InnerEdge, 3);
        assert!(a < b);
        assert!(b < INACTIVE_HASH);
        assert_eq!(hash_cell(b), 3);
        assert_eq!(hash_cell_type(b), Some(CellType::InnerEdge));
        assert_eq!(hash_cell(INACTIVE_HASH), INVALID_CELL);
        assert_eq!(hash_cell_type(INACTIVE_HASH), None);
    }

    #[test]
    fn even_slices_without_counts() {
        let grid = line_grid(10);
        let mut map = DeviceMap::new(grid.num_cells());
        map.fill_by_slices(&grid, 2, 0, None);
        assert_eq!(map.cells_per_device(2), vec![5, 5]);
        assert_eq!(map.owner(4), 0);
        assert_eq!(map.owner(5), 1);
    }

    #[test]
    fn balanced_slices_follow_particle_counts() {
        let grid = line_grid(4);
        let mut map = DeviceMap::new(grid.num_cells());
        // most particles in the first slice
        map.fill_by_slices(&grid, 2, 0, Some(&[90, 4, 3, 3]));
        assert_eq!(map.owner(0), 0);
        assert_eq!(map.owner(1), 1);
        assert_eq!(map.owner(3), 1);
    }

    #[test]
    fn classification_around_the_cut() {
        let grid = line_grid(6);
        let mut map = DeviceMap::new(grid.num_cells());
        map.fill_by_slices(&grid, 2, 0, None);
        let types = map.cell_types(&grid, 0);
        assert_eq!(
            types,
            vec![
                CellType::Inner,
                CellType::Inner,
                CellType::InnerEdge,
                CellType::OuterEdge,
                CellType::Outer,
                CellType::Outer,
            ]
        );
        assert_eq!(map.classify(&grid, 3, 1), CellType::InnerEdge);
        assert_eq!(map.classify(&grid, 2, 1), CellType::OuterEdge);
    }

    #[test]
    fn segments_from_sorted_hashes() {
        let hashes = [
            make_hash(CellType::Inner, 0),
            make_hash(CellType::Inner, 1),
            make_hash(CellType::OuterEdge, 3),
            INACTIVE_HASH,
        ];
        let table = SegmentTable::from_sorted_hashes(&hashes);
        assert_eq!(table.starts(), [Some(0), None, Some(2), None]);
        assert!(table.is_monotonic(4));
        assert_eq!(table.range(CellType::Inner, 3), Some(0..2));
        assert_eq!(table.range(CellType::OuterEdge, 3), Some(2..3));
        assert_eq!(table.range(CellType::InnerEdge, 3), None);
    }

    #[test]
    fn non_monotonic_segments_are_detected() {
        let table = SegmentTable::from_starts([Some(4), Some(2), None, None]);
        assert!(!table.is_monotonic(10));
        let table = SegmentTable::from_starts([Some(0), None, Some(12), None]);
        assert!(!table.is_monotonic(10));
        assert!(SegmentTable::empty().is_monotonic(0));
    }
}
