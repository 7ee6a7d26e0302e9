//! # Slab Atlas Addressing
//!
//! A volume of `rx × ry × rz` cells is stored in a 2D texture by laying its
//! z-slices out in rows of [`SLICES_PER_ROW`] tiles:
//!
//! ```text
//! +-------+-------+-----+-------+
//! | z = 0 | z = 1 | ... | z = 7 |
//! +-------+-------+-----+-------+
//! | z = 8 | z = 9 | ... | z = 15|
//! +-------+-------+-----+-------+
//! ```
//!
//! Cell `(x, y, z)` lives at texel `(x + (z % 8)·rx, y + (z / 8)·ry)`. A planar
//! grid is the degenerate case of one tile, where the mapping is the identity.
//! Tiles past the last slice are padding and never hold cell data.

use crate::grid::Dimensionality;

/// Tiles per atlas row for volumes
pub const SLICES_PER_ROW: u32 = 8;

/// Cell resolution of a grid and how it is tiled into a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridLayout {
    resolution: [u32; 3],
    slabs: [u32; 2],
}

impl GridLayout {
    /// A single-tile planar grid
    pub fn flat(width: u32, height: u32) -> Self {
        Self {
            resolution: [width, height, 1],
            slabs: [1, 1],
        }
    }

    /// A volume tiled `SLICES_PER_ROW` slices per atlas row
    pub fn volume(width: u32, height: u32, depth: u32) -> Self {
        Self {
            resolution: [width, height, depth],
            slabs: [SLICES_PER_ROW, depth.div_ceil(SLICES_PER_ROW)],
        }
    }

    /// Picks `flat` or `volume` from the depth
    pub fn for_resolution(width: u32, height: u32, depth: u32) -> Self {
        match Dimensionality::from_depth(depth) {
            Dimensionality::Two => Self::flat(width, height),
            Dimensionality::Three => Self::volume(width, height, depth),
        }
    }

    pub fn resolution(&self) -> [u32; 3] {
        self.resolution
    }

    pub fn slabs(&self) -> [u32; 2] {
        self.slabs
    }

    pub fn dimensionality(&self) -> Dimensionality {
        Dimensionality::from_depth(self.resolution[2])
    }

    /// Tiles per atlas row (1 for planar grids)
    pub fn slices_per_row(&self) -> u32 {
        self.slabs[0]
    }

    /// Texture size in texels
    pub fn texture_extent(&self) -> (u32, u32) {
        (
            self.resolution[0] * self.slabs[0],
            self.resolution[1] * self.slabs[1],
        )
    }

    pub fn cell_count(&self) -> usize {
        self.resolution.iter().map(|&r| r as usize).product()
    }

    pub fn texel_count(&self) -> usize {
        let (w, h) = self.texture_extent();
        w as usize * h as usize
    }

    pub fn contains(&self, x: i64, y: i64, z: i64) -> bool {
        let [rx, ry, rz] = self.resolution;
        (0..rx as i64).contains(&x) && (0..ry as i64).contains(&y) && (0..rz as i64).contains(&z)
    }

    /// Atlas texel holding cell `(x, y, z)`
    pub fn coords_2d(&self, x: u32, y: u32, z: u32) -> (u32, u32) {
        let [rx, ry, _] = self.resolution;
        let per_row = self.slices_per_row();
        (x + (z % per_row) * rx, y + (z / per_row) * ry)
    }

    /// Row-major texel index of cell `(x, y, z)`
    pub fn texel_index(&self, x: u32, y: u32, z: u32) -> usize {
        let (tx, ty) = self.coords_2d(x, y, z);
        let (width, _) = self.texture_extent();
        ty as usize * width as usize + tx as usize
    }

    /// Index of cell `(x, y, z)` in x-fastest cell order
    pub fn cell_index(&self, x: u32, y: u32, z: u32) -> usize {
        let [rx, ry, _] = self.resolution;
        (z as usize * ry as usize + y as usize) * rx as usize + x as usize
    }

    /// Cell stored at an atlas texel, `None` for padding tiles
    pub fn cell_of_texel(&self, tx: u32, ty: u32) -> Option<(u32, u32, u32)> {
        let [rx, ry, rz] = self.resolution;
        let (width, height) = self.texture_extent();
        if tx >= width || ty >= height {
            return None;
        }
        let z = (ty / ry) * self.slices_per_row() + tx / rx;
        if z >= rz {
            return None;
        }
        Some((tx % rx, ty % ry, z))
    }

    /// Visits every cell in x-fastest order
    pub fn cells(&self) -> impl Iterator<Item = (u32, u32, u32)> {
        let [rx, ry, rz] = self.resolution;
        (0..rz).flat_map(move |z| (0..ry).flat_map(move |y| (0..rx).map(move |x| (x, y, z))))
    }

    /// Reorders texels from atlas order into cell order
    pub fn gather<T: Copy>(&self, texels: &[T]) -> Vec<T> {
        self.cells()
            .map(|(x, y, z)| texels[self.texel_index(x, y, z)])
            .collect()
    }

    /// Places cell-ordered values into a zero-padded atlas
    pub fn scatter<T: Copy + Default>(&self, cells: &[T]) -> Vec<T> {
        let mut texels = vec![T::default(); self.texel_count()];
        for ((x, y, z), value) in self.cells().zip(cells.iter()) {
            texels[self.texel_index(x, y, z)] = *value;
        }
        texels
    }
}
