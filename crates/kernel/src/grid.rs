//! Uniform grid over the world box and per-cell particle ranges.
//!
//! Devices store single-precision positions relative to the center of the
//! particle's cell, so precision does not degrade far from the origin. The
//! cell comes from the particle hash; [`Grid::localize`] and
//! [`Grid::position_in`] convert between the two frames.
//!
//! Cells are linearized with x varying fastest. Cell side is at least the
//! kernel support radius, so the 27 (3x3x3) cells around a particle contain
//! every potential neighbour. Particles are kept sorted by hash, so the
//! particles of one cell are contiguous and a cell is described by a start
//! and an end index, with no per-particle indirection.

use std::ops::Range;

use crate::error::KernelError;

/// Largest number of cells a grid may have. `u32::MAX` is reserved as the
/// cell of inactive particles.
pub const MAX_CELLS: u64 = u32::MAX as u64;

/// Cell index of particles outside the grid or disabled.
pub const INVALID_CELL: u32 = u32::MAX;

/// Axis-aligned uniform grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    origin: [f64; 3],
    size: [f64; 3],
    cell_size: [f64; 3],
    dims: [u32; 3],
}

impl Grid {
    /// Grid covering `origin .. origin + size` with cells no smaller than
    /// `min_cell_side` along any axis.
    pub fn new(origin: [f64; 3], size: [f64; 3], min_cell_side: f64) -> Result<Self, KernelError> {
        let mut dims = [1u32; 3];
        let mut cell_size = [0.0; 3];
        let mut cells: u64 = 1;
        for axis in 0..3 {
            let n = (size[axis] / min_cell_side).floor().max(1.0);
            if n > MAX_CELLS as f64 {
                return Err(KernelError::GridTooLarge {
                    cells: u64::MAX,
                    max: MAX_CELLS,
                });
            }
            dims[axis] = n as u32;
            cell_size[axis] = size[axis] / n;
            cells = cells.saturating_mul(n as u64);
        }
        if cells > MAX_CELLS {
            return Err(KernelError::GridTooLarge {
                cells,
                max: MAX_CELLS,
            });
        }
        Ok(Self {
            origin,
            size,
            cell_size,
            dims,
        })
    }

    /// Lower corner of the world.
    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    /// Extent of the world.
    pub fn size(&self) -> [f64; 3] {
        self.size
    }

    /// Cell extent along each axis.
    pub fn cell_size(&self) -> [f64; 3] {
        self.cell_size
    }

    /// Number of cells along each axis.
    pub fn dims(&self) -> [u32; 3] {
        self.dims
    }

    /// Total number of cells.
    pub fn num_cells(&self) -> usize {
        (self.dims[0] as usize) * (self.dims[1] as usize) * (self.dims[2] as usize)
    }

    /// True if `pos` (relative to the origin) lies inside the world.
    pub fn contains(&self, pos: [f64; 3]) -> bool {
        (0..3).all(|a| pos[a].is_finite() && pos[a] >= 0.0 && pos[a] < self.size[a])
    }

    /// Cell coordinates of a position relative to the origin, clamped to the grid.
    #[inline]
    pub fn cell_coords_of(&self, pos: [f64; 3]) -> [u32; 3] {
        let mut coords = [0u32; 3];
        for axis in 0..3 {
            coords[axis] = (pos[axis] / self.cell_size[axis])
                .floor()
                .max(0.0)
                .min((self.dims[axis] - 1) as f64) as u32;
        }
        coords
    }

    /// Cell index of a position relative to the origin.
    #[inline]
    pub fn cell_of(&self, pos: [f64; 3]) -> u32 {
        self.cell_hash(self.cell_coords_of(pos))
    }

    /// Flat cell index from cell coordinates.
    #[inline]
    pub fn cell_hash(&self, c: [u32; 3]) -> u32 {
        c[0] + c[1] * self.dims[0] + c[2] * self.dims[0] * self.dims[1]
    }

    /// Cell coordinates from a flat cell index.
    #[inline]
    pub fn cell_coords(&self, hash: u32) -> [u32; 3] {
        let plane = self.dims[0] * self.dims[1];
        [hash % self.dims[0], (hash % plane) / self.dims[0], hash / plane]
    }

    /// Center of cell `hash`, relative to the origin.
    pub fn cell_center(&self, hash: u32) -> [f64; 3] {
        let c = self.cell_coords(hash);
        [0usize, 1, 2].map(|a| (c[a] as f64 + 0.5) * self.cell_size[a])
    }

    /// Cell of `pos` (relative to the origin) and the offset of `pos` from
    /// the center of that cell.
    pub fn localize(&self, pos: [f64; 3]) -> (u32, [f32; 3]) {
        let cell = self.cell_of(pos);
        let center = self.cell_center(cell);
        (cell, [0usize, 1, 2].map(|a| (pos[a] - center[a]) as f32))
    }

    /// Position relative to the origin of a particle at `local` from the
    /// center of cell `hash`. The w component is ignored.
    #[inline]
    pub fn position_in(&self, hash: u32, local: [f32; 4]) -> [f64; 3] {
        let center = self.cell_center(hash);
        [0usize, 1, 2].map(|a| center[a] + local[a] as f64)
    }

    /// Vector from the center of cell `to` to the center of cell `from`.
    #[inline]
    pub fn cell_shift(&self, from: u32, to: u32) -> [f64; 3] {
        let (a, b) = (self.cell_coords(from), self.cell_coords(to));
        [0usize, 1, 2].map(|k| (a[k] as f64 - b[k] as f64) * self.cell_size[k])
    }

    /// Displacement from particle `j` to particle `i`, each given by its
    /// cell and its cell-local position.
    #[inline]
    pub fn displacement(&self, cell_i: u32, pi: [f32; 4], cell_j: u32, pj: [f32; 4]) -> [f32; 3] {
        let shift = self.cell_shift(cell_i, cell_j);
        [0usize, 1, 2].map(|a| (shift[a] + (pi[a] - pj[a]) as f64) as f32)
    }

    /// Call `f` for every cell of the 3x3x3 block around `hash`, itself included.
    pub fn for_each_neighbor_cell<F>(&self, hash: u32, mut f: F)
    where
        F: FnMut(u32),
    {
        let [cx, cy, cz] = self.cell_coords(hash);
        for dz in -1i64..=1 {
            let nz = cz as i64 + dz;
            if nz < 0 || nz >= self.dims[2] as i64 {
                continue;
            }
            for dy in -1i64..=1 {
                let ny = cy as i64 + dy;
                if ny < 0 || ny >= self.dims[1] as i64 {
                    continue;
                }
                for dx in -1i64..=1 {
                    let nx = cx as i64 + dx;
                    if nx < 0 || nx >= self.dims[0] as i64 {
                        continue;
                    }
                    f(self.cell_hash([nx as u32, ny as u32, nz as u32]));
                }
            }
        }
    }
}

/// Start/end of the particles of each cell in a hash-sorted particle array.
#[derive(Debug, Clone)]
pub struct CellIndex {
    starts: Vec<u32>,
    ends: Vec<u32>,
    touched: Vec<u32>,
}

const EMPTY_CELL: u32 = u32::MAX;

impl CellIndex {
    /// Empty index for `num_cells` cells.
    pub fn new(num_cells: usize) -> Self {
        Self {
            starts: vec![EMPTY_CELL; num_cells],
            ends: vec![0; num_cells],
            touched: Vec::new(),
        }
    }

    /// Rebuild from the cell of each particle, in array order. Particles of
    /// one cell must be contiguous; `INVALID_CELL` entries are skipped.
    pub fn rebuild<I>(&mut self, cells: I)
    where
        I: IntoIterator<Item = u32>,
    {
        for &cell in &self.touched {
            self.starts[cell as usize] = EMPTY_CELL;
            self.ends[cell as usize] = 0;
        }
        self.touched.clear();

        for (i, cell) in cells.into_iter().enumerate() {
            if cell == INVALID_CELL || cell as usize >= self.starts.len() {
                continue;
            }
            let c = cell as usize;
            if self.starts[c] == EMPTY_CELL {
                self.starts[c] = i as u32;
                self.touched.push(cell);
            }
            self.ends[c] = i as u32 + 1;
        }
    }

    /// Particle range of one cell.
    pub fn range(&self, cell: u32) -> Range<usize> {
        let c = cell as usize;
        match self.starts.get(c) {
            Some(&start) if start != EMPTY_CELL => start as usize..self.ends[c] as usize,
            _ => 0..0,
        }
    }

    /// Occupied cells with their particle count.
    pub fn occupied(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.touched.iter().map(move |&cell| {
            let c = cell as usize;
            (cell, self.ends[c] - self.starts[c])
        })
    }

    /// Iterate over all particles within `radius` of particle `i`, which
    /// sits in `cell`.
    ///
    /// Checks the 27 cells around `cell`. `pos` holds cell-local positions;
    /// `f` receives the neighbour index, the displacement from the neighbour
    /// to `i` and the distance.
    pub fn for_each_neighbor<F>(
        &self,
        grid: &Grid,
        cell: u32,
        i: usize,
        pos: &[[f32; 4]],
        radius: f32,
        mut f: F,
    ) where
        F: FnMut(usize, [f32; 3], f32),
    {
        let p = pos[i];
        let radius_sq = radius * radius;
        grid.for_each_neighbor_cell(cell, |neighbor| {
            let shift = grid.cell_shift(cell, neighbor).map(|s| s as f32);
            for j in self.range(neighbor) {
                if j == i {
                    continue;
                }
                let d = [0usize, 1, 2].map(|a| shift[a] + (p[a] - pos[j][a]));
                let dist_sq = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];
                if dist_sq <= radius_sq {
                    f(j, d, dist_sq.sqrt());
                }
            }
        });
    }
}
