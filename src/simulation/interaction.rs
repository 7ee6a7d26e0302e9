//! Interaction queue
//!
//! User interactions arrive between frames and are applied at the start of
//! the next `update`, in the order they were issued, then cleared.

use cgmath::Vector3;

/// A box of ink
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Injector {
    pub position: Vector3<f32>,
    pub color: Vector3<f32>,
    /// Side length in world units
    pub size: f32,
    /// Replace the covered colour instead of adding to it
    pub overwrite: bool,
}

/// A radial push on the velocity field
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Perturber {
    pub position: Vector3<f32>,
    pub velocity: Vector3<f32>,
    /// Falloff radius in world units
    pub size: f32,
}

/// A solid box added to the obstacle mask
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Boundary {
    pub position: Vector3<f32>,
    /// Side length in world units
    pub size: f32,
}

/// Pending interactions, one queue per kind
#[derive(Debug, Clone, Default)]
pub struct InteractionQueue {
    injectors: Vec<Injector>,
    perturbers: Vec<Perturber>,
    boundaries: Vec<Boundary>,
}

impl InteractionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_injector(&mut self, injector: Injector) {
        self.injectors.push(injector);
    }

    pub fn push_perturber(&mut self, perturber: Perturber) {
        self.perturbers.push(perturber);
    }

    pub fn push_boundary(&mut self, boundary: Boundary) {
        self.boundaries.push(boundary);
    }

    /// Takes every queued injector, oldest first
    pub fn drain_injectors(&mut self) -> Vec<Injector> {
        std::mem::take(&mut self.injectors)
    }

    pub fn drain_perturbers(&mut self) -> Vec<Perturber> {
        std::mem::take(&mut self.perturbers)
    }

    pub fn drain_boundaries(&mut self) -> Vec<Boundary> {
        std::mem::take(&mut self.boundaries)
    }

    pub fn pending(&self) -> usize {
        self.injectors.len() + self.perturbers.len() + self.boundaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    pub fn clear(&mut self) {
        self.injectors.clear();
        self.perturbers.clear();
        self.boundaries.clear();
    }
}
