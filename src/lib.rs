//! Stokes fluid solver
//!
//! A real-time Eulerian fluid solver for 2D and 3D grids. The solver runs as
//! a chain of compute kernels over textures, either on the GPU through wgpu or
//! on the CPU reference backend.

pub mod backend;
pub mod error;
pub mod fields;
pub mod grid;
pub mod kernels;
pub mod options;
pub mod prelude;
pub mod simulation;
pub mod wgpu_utils;

pub use backend::{ComputeBackend, CpuBackend, WgpuBackend};
pub use error::{FluidError, FluidResult};
pub use options::FluidOptions;
pub use simulation::Fluid;

/// A solver on the first available GPU adapter, not yet initialized
pub fn headless() -> FluidResult<Fluid<WgpuBackend>> {
    Ok(Fluid::new(WgpuBackend::headless()?))
}
