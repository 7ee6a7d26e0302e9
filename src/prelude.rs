//! # Stokes Prelude
//!
//! Commonly used types in one import.
//!
//! ```rust
//! use stokes::prelude::*;
//!
//! let mut fluid = Fluid::new(CpuBackend::new());
//! fluid
//!     .init(FluidOptions::default_2d()
//!         .with_solver_resolution(Vector3::new(16, 16, 1))
//!         .with_render_resolution(Vector2::new(16, 16))
//!         .with_flags(SolverFlags::FAST))
//!     .unwrap();
//! fluid.update(1.0 / 60.0).unwrap();
//! ```

// Solver and backends
pub use crate::backend::{ComputeBackend, CpuBackend, WgpuBackend};
pub use crate::simulation::{Fluid, FrameStats, PollerHandle, VelocityPoller};

// Configuration
pub use crate::options::{
    FluidOptions, Precision, RenderFlags, SolverFlags, VISCOSITY_AIR, VISCOSITY_OLIVE_OIL,
    VISCOSITY_PITCH, VISCOSITY_WATER,
};

// Fields and errors
pub use crate::error::{ConfigurationError, FluidError, FluidResult};
pub use crate::fields::FieldId;
pub use crate::grid::Dimensionality;

// Common external types
pub use cgmath::{Vector2, Vector3};
