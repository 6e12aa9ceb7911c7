//! Domain decomposition on the host.
//!
//! At startup the host holds every particle. Each particle is assigned to
//! the device owning its cell, and the host arrays are compacted in place so
//! that every device's particles form one contiguous range, devices of node 0
//! first. During the run the devices migrate particles themselves; the host
//! only reconciles the per-device counts into a new [`Partition`].

use std::ops::Range;

use kernel::devmap::{hash_cell, longest_axis, make_hash};
use kernel::{BufferError, BufferKind, BufferList, CellType, DeviceMap, Grid, Side, Topology, INACTIVE_HASH};
use tracing::{debug, error, info};

// ---------------------------------------------------------------------------
// Partition
// ---------------------------------------------------------------------------

/// Contiguous range of the particle array owned by each local device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Partition {
    starts: Vec<usize>,
    counts: Vec<usize>,
    node_counts: Vec<usize>,
    rank: usize,
}

impl Partition {
    /// Partition from the particle count of every local device and of every
    /// node. Device ranges of node `rank` start after all earlier nodes.
    pub fn new(counts: Vec<usize>, node_counts: Vec<usize>, rank: usize) -> Self {
        let mut start: usize = node_counts.iter().take(rank).sum();
        let starts = counts
            .iter()
            .map(|&c| {
                let s = start;
                start += c;
                s
            })
            .collect();
        Self {
            starts,
            counts,
            node_counts,
            rank,
        }
    }

    /// One node, one device, `count` particles.
    pub fn single(count: usize) -> Self {
        Self::new(vec![count], vec![count], 0)
    }

    /// Particle range of local device `device`.
    pub fn range(&self, device: usize) -> Range<usize> {
        match (self.starts.get(device), self.counts.get(device)) {
            (Some(&s), Some(&c)) => s..s + c,
            _ => 0..0,
        }
    }

    /// Particles per local device.
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// First particle of each local device.
    pub fn starts(&self) -> &[usize] {
        &self.starts
    }

    /// Particles per node.
    pub fn node_counts(&self) -> &[usize] {
        &self.node_counts
    }

    /// Particles of this node.
    pub fn process_particles(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Range of the particle array owned by this node.
    pub fn node_range(&self) -> Range<usize> {
        let start: usize = self.node_counts.iter().take(self.rank).sum();
        start..start + self.process_particles()
    }

    /// Particles across every node.
    pub fn total(&self) -> usize {
        self.node_counts.iter().sum()
    }
}

// ---------------------------------------------------------------------------
// Counting
// ---------------------------------------------------------------------------

/// Particles per global device, per node and per local device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCounts {
    /// Indexed by global device number.
    pub per_global_device: Vec<usize>,
    /// Indexed by node.
    pub per_node: Vec<usize>,
    /// Devices of the counting node.
    pub per_local_device: Vec<usize>,
}

/// Tabulate `keys` (global device numbers) for node `rank`.
pub fn count_by_device(keys: &[usize], topology: &Topology, rank: usize) -> DeviceCounts {
    let mut per_global_device = vec![0; topology.total_devices()];
    for &key in keys {
        if let Some(c) = per_global_device.get_mut(key) {
            *c += 1;
        }
    }
    let per_node = (0..topology.nodes())
        .map(|node| per_global_device[topology.devices_of_node(node)].iter().sum())
        .collect();
    let per_local_device = per_global_device[topology.devices_of_node(rank)].to_vec();
    DeviceCounts {
        per_global_device,
        per_node,
        per_local_device,
    }
}

/// Derive the cell hash and the cell-local position of the first `count`
/// host particles from their global positions. Particles outside the world
/// get the inactive hash; their number is returned.
pub fn localize_particles(host: &mut BufferList, count: usize, grid: &Grid) -> Result<usize, BufferError> {
    let origin = grid.origin();
    let mut local = Vec::with_capacity(count);
    let mut hashes = Vec::with_capacity(count);
    for g in &host.get::<[f64; 4]>(BufferKind::PosGlobal, Side::Read)?[..count] {
        let rel = [g[0] - origin[0], g[1] - origin[1], g[2] - origin[2]];
        let (cell, p) = grid.localize(rel);
        local.push([p[0], p[1], p[2], g[3] as f32]);
        hashes.push(if grid.contains(rel) {
            make_hash(CellType::Inner, cell)
        } else {
            INACTIVE_HASH
        });
    }
    let outside = hashes.iter().filter(|&&h| h == INACTIVE_HASH).count();
    host.get_mut::<[f32; 4]>(BufferKind::Pos, Side::Read)?[..count].copy_from_slice(&local);
    host.get_mut::<u64>(BufferKind::Hash, Side::Read)?[..count].copy_from_slice(&hashes);
    Ok(outside)
}

/// Rebuild the global positions of the host particles in `range` from their
/// cell and local position. Particles without a valid cell keep theirs.
pub fn globalize_particles(host: &mut BufferList, range: Range<usize>, grid: &Grid) -> Result<(), BufferError> {
    let origin = grid.origin();
    let global: Vec<Option<[f64; 4]>> = {
        let pos = &host.get::<[f32; 4]>(BufferKind::Pos, Side::Read)?[range.clone()];
        let hashes = &host.get::<u64>(BufferKind::Hash, Side::Read)?[range.clone()];
        pos.iter()
            .zip(hashes)
            .map(|(p, &hash)| {
                let cell = hash_cell(hash);
                ((cell as usize) < grid.num_cells()).then(|| {
                    let r = grid.position_in(cell, *p);
                    [origin[0] + r[0], origin[1] + r[1], origin[2] + r[2], p[3] as f64]
                })
            })
            .collect()
    };
    let dst = &mut host.get_mut::<[f64; 4]>(BufferKind::PosGlobal, Side::Read)?[range];
    for (g, new) in dst.iter_mut().zip(global) {
        if let Some(new) = new {
            *g = new;
        }
    }
    Ok(())
}

/// Particles per slice along each axis, from the host hashes.
pub fn slice_counts(host: &BufferList, count: usize, grid: &Grid) -> Result<[Vec<u64>; 3], BufferError> {
    let dims = grid.dims();
    let mut counts = [
        vec![0u64; dims[0] as usize],
        vec![0u64; dims[1] as usize],
        vec![0u64; dims[2] as usize],
    ];
    let hashes = host.get::<u64>(BufferKind::Hash, Side::Read)?;
    for &hash in &hashes[..count.min(hashes.len())] {
        let cell = hash_cell(hash);
        if cell as usize >= grid.num_cells() {
            continue;
        }
        let coords = grid.cell_coords(cell);
        for axis in 0..3 {
            counts[axis][coords[axis] as usize] += 1;
        }
    }
    Ok(counts)
}

/// Device map split in slabs along the longest axis, balanced by particles.
pub fn split_by_slices(grid: &Grid, slice_counts: &[Vec<u64>; 3], total_devices: usize) -> DeviceMap {
    let axis = longest_axis(grid);
    let mut map = DeviceMap::new(grid.num_cells());
    map.fill_by_slices(grid, total_devices, axis, Some(&slice_counts[axis]));
    map
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

/// Reorder `keys` so that equal keys are contiguous and ascending.
///
/// `bucket_sizes[b]` is the number of keys equal to `b`. For each bucket but
/// the last, a left cursor walks the bucket's target range; a misplaced key
/// is swapped with the next key of the bucket found by a right cursor
/// scanning back from the end. `swap` mirrors every swap on the payload.
/// Returns the number of swaps.
pub fn compact_by_key<F>(keys: &mut [usize], bucket_sizes: &[usize], mut swap: F) -> usize
where
    F: FnMut(usize, usize),
{
    let mut swaps = 0;
    let mut left = 0;
    for bucket in 0..bucket_sizes.len().saturating_sub(1) {
        let end = (left + bucket_sizes[bucket]).min(keys.len());
        let mut right = keys.len();
        while left < end {
            if keys[left] != bucket {
                loop {
                    if right <= left + 1 {
                        // sizes do not match the keys
                        return swaps;
                    }
                    right -= 1;
                    if keys[right] == bucket {
                        break;
                    }
                }
                keys.swap(left, right);
                swap(left, right);
                swaps += 1;
            }
            left += 1;
        }
    }
    swaps
}

/// Outcome of the startup sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortReport {
    /// Swaps performed by the compaction.
    pub swaps: usize,
    /// Keys are non-decreasing after the compaction.
    pub monotonic: bool,
    /// Recounted bucket sizes equal the ones the compaction used.
    pub counts_match: bool,
}

impl SortReport {
    /// True if the validation found nothing wrong.
    pub fn is_ok(&self) -> bool {
        self.monotonic && self.counts_match
    }
}

/// Check a compacted key array against the bucket sizes it was sorted with.
pub fn validate_sorted(keys: &[usize], bucket_sizes: &[usize]) -> (bool, bool) {
    let monotonic = keys.windows(2).all(|w| w[0] <= w[1]);
    let mut recount = vec![0; bucket_sizes.len()];
    let mut in_range = true;
    for &key in keys {
        match recount.get_mut(key) {
            Some(c) => *c += 1,
            None => in_range = false,
        }
    }
    (monotonic, in_range && recount == bucket_sizes)
}

/// Key of every host particle: the global device owning its cell.
pub fn device_keys(host: &BufferList, count: usize, device_map: &DeviceMap) -> Result<Vec<usize>, BufferError> {
    let hashes = host.get::<u64>(BufferKind::Hash, Side::Read)?;
    Ok(hashes[..count.min(hashes.len())]
        .iter()
        .map(|&hash| {
            let cell = hash_cell(hash);
            if (cell as usize) < device_map.len() {
                device_map.owner(cell)
            } else {
                0
            }
        })
        .collect())
}

/// Sort the first `count` host particles by owning device and return the
/// partition of node `rank`.
pub fn sort_particles_by_device(
    host: &mut BufferList,
    count: usize,
    device_map: &DeviceMap,
    topology: &Topology,
    rank: usize,
) -> Result<(Partition, SortReport), BufferError> {
    let mut keys = device_keys(host, count, device_map)?;
    let counts = count_by_device(&keys, topology, rank);

    let swaps = compact_by_key(&mut keys, &counts.per_global_device, |i, j| host.swap_particles(i, j));
    let (monotonic, counts_match) = validate_sorted(&keys, &counts.per_global_device);
    let report = SortReport {
        swaps,
        monotonic,
        counts_match,
    };
    if report.is_ok() {
        debug!("sorted {} particles by device with {} swaps", count, swaps);
    } else {
        error!(
            "particle sort by device failed validation (monotonic: {}, counts match: {})",
            monotonic, counts_match
        );
    }

    let partition = Partition::new(counts.per_local_device, counts.per_node, rank);
    Ok((partition, report))
}

/// Log the particle and cell distribution of every local device.
pub fn print_distribution(partition: &Partition, device_map: &DeviceMap, topology: &Topology, rank: usize) {
    let cells = device_map.cells_per_device(topology.total_devices());
    let total = partition.process_particles().max(1);
    for (d, &count) in partition.counts().iter().enumerate() {
        let number = topology.global_device_number(kernel::GlobalDeviceId { node: rank, device: d });
        info!(
            "device {} (global {}): {} particles ({:.1}%) in range {:?}, {} cells",
            d,
            number,
            count,
            100.0 * count as f64 / total as f64,
            partition.range(d),
            cells.get(number).copied().unwrap_or(0)
        );
    }
}
