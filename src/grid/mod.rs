//! Grid dimensionality and memory layout
//!
//! Every field is stored as a 2D texture. Volumes are packed into that
//! texture as a tiled atlas of z-slices, see [`atlas`].

pub mod atlas;

pub use atlas::{GridLayout, SLICES_PER_ROW};

/// Number of spatial axes the solver runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimensionality {
    Two,
    Three,
}

impl Dimensionality {
    /// A grid with depth of at most one cell is planar
    pub fn from_depth(depth: u32) -> Self {
        if depth <= 1 {
            Dimensionality::Two
        } else {
            Dimensionality::Three
        }
    }

    pub fn axis_count(self) -> usize {
        match self {
            Dimensionality::Two => 2,
            Dimensionality::Three => 3,
        }
    }
}

impl std::fmt::Display for Dimensionality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dimensionality::Two => write!(f, "2D"),
            Dimensionality::Three => write!(f, "3D"),
        }
    }
}
