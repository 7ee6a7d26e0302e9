//! # Fluid Options
//!
//! Configuration for a fluid solver instance, plus the quantities derived from
//! it at initialization.
//!
//! ## Features
//!
//! - **Solver flags**: feature bitmask with named quality presets
//! - **Per-dimension defaults**: `FluidOptions::default_2d()` and `default_3d()`
//! - **Builder setters**: `with_*` methods for fluent configuration
//! - **Validation**: rejects configurations that can never run
//!
//! ## Usage
//!
//! ```rust
//! use stokes::options::{FluidOptions, SolverFlags, VISCOSITY_WATER};
//!
//! let options = FluidOptions::default_2d()
//!     .with_viscosity(VISCOSITY_WATER)
//!     .with_flags(SolverFlags::ACCURATE | SolverFlags::DOUBLE_PRECISION)
//!     .with_diffuse_steps(40);
//! assert!(options.validate().is_ok());
//! ```

use std::ops::{BitAnd, BitOr, BitOrAssign};

use cgmath::{Vector2, Vector3};

use crate::error::{FluidError, FluidResult};
use crate::grid::Dimensionality;

/// Kinematic viscosity of air
pub const VISCOSITY_AIR: f32 = 0.000_017_8;
/// Kinematic viscosity of water
pub const VISCOSITY_WATER: f32 = 0.000_9;
/// Kinematic viscosity of olive oil
pub const VISCOSITY_OLIVE_OIL: f32 = 0.081;
/// Kinematic viscosity of pitch
pub const VISCOSITY_PITCH: f32 = 23_000_000.0;

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $value:expr,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            pub const NONE: Self = Self(0);
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)*

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            /// `true` when every bit of `other` is set
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl BitAnd for $name {
            type Output = Self;

            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }
    };
}

flag_set! {
    /// Which solver stages run each substep
    SolverFlags {
        ADVECT_VELOCITY = 1,
        ADVECT_DATA = 2,
        DIFFUSE_VELOCITY = 4,
        DIFFUSE_DATA = 8,
        VORTICITY_CONFINEMENT = 16,
        /// Skip Jacobi cells whose result cannot change
        ZCULL = 32,
        /// 32-bit float fields instead of 16-bit
        DOUBLE_PRECISION = 64,
    }
}

impl SolverFlags {
    pub const PERFECT: Self =
        Self(Self::ADVECT_VELOCITY.0 | Self::ADVECT_DATA.0 | Self::DIFFUSE_VELOCITY.0);
    pub const ACCURATE: Self = Self(Self::PERFECT.0 | Self::ZCULL.0);
    pub const NICE: Self =
        Self(Self::ADVECT_VELOCITY.0 | Self::ADVECT_DATA.0 | Self::VORTICITY_CONFINEMENT.0);
    pub const FAST: Self = Self(Self::NICE.0 | Self::ZCULL.0);
    pub const UGLY: Self = Self(Self::ADVECT_VELOCITY.0 | Self::ADVECT_DATA.0 | Self::ZCULL.0);
}

flag_set! {
    /// Which fields the render dispatch composites into the display
    RenderFlags {
        INK = 1,
        VELOCITY = 2,
        PRESSURE = 4,
        BOUNDARIES = 8,
    }
}

/// Storage precision of every field, fixed at init
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    /// 16-bit floats
    Half,
    /// 32-bit floats
    Full,
}

impl Precision {
    pub fn bytes_per_component(self) -> u64 {
        match self {
            Precision::Half => 2,
            Precision::Full => 4,
        }
    }

    /// Rounds a value the way a field of this precision stores it
    pub fn quantize(self, value: f32) -> f32 {
        match self {
            Precision::Half => half::f16::from_f32(value).to_f32(),
            Precision::Full => value,
        }
    }
}

/// Full configuration of a fluid solver
#[derive(Debug, Clone, PartialEq)]
pub struct FluidOptions {
    /// World-space extent of the domain (z ignored in 2D)
    pub size: Vector3<f32>,
    /// Solver grid cells; `z <= 1` selects a 2D solver
    pub solver_resolution: Vector3<u32>,
    /// Display resolution, and the ink grid in 2D
    pub render_resolution: Vector2<u32>,
    pub viscosity: f32,
    pub flags: SolverFlags,
    pub render_flags: RenderFlags,
    /// Jacobi iterations for diffusion and the pressure solve
    pub diffuse_steps: u32,
    /// Fixed substep length in seconds, 0 = one substep of the frame delta
    pub fixed_time_interval: f32,
    /// Upper bound on substeps per `update`, `None` = unbounded
    pub max_substeps_per_frame: Option<u32>,
}

impl FluidOptions {
    /// Interactive 2D defaults
    pub fn default_2d() -> Self {
        Self {
            size: Vector3::new(1.0, 1.0, 1.0),
            solver_resolution: Vector3::new(200, 200, 1),
            render_resolution: Vector2::new(400, 400),
            viscosity: VISCOSITY_AIR,
            flags: SolverFlags::NICE | SolverFlags::DOUBLE_PRECISION,
            render_flags: RenderFlags::INK | RenderFlags::BOUNDARIES,
            diffuse_steps: 30,
            fixed_time_interval: 0.005,
            max_substeps_per_frame: Some(10),
        }
    }

    /// Interactive 3D defaults
    pub fn default_3d() -> Self {
        Self {
            size: Vector3::new(1.0, 1.0, 1.0),
            solver_resolution: Vector3::new(64, 64, 64),
            render_resolution: Vector2::new(400, 400),
            viscosity: VISCOSITY_AIR,
            flags: SolverFlags::NICE | SolverFlags::DOUBLE_PRECISION,
            render_flags: RenderFlags::INK,
            diffuse_steps: 10,
            fixed_time_interval: 0.02,
            max_substeps_per_frame: None,
        }
    }

    pub fn with_size(mut self, size: Vector3<f32>) -> Self {
        self.size = size;
        self
    }

    pub fn with_solver_resolution(mut self, resolution: Vector3<u32>) -> Self {
        self.solver_resolution = resolution;
        self
    }

    pub fn with_render_resolution(mut self, resolution: Vector2<u32>) -> Self {
        self.render_resolution = resolution;
        self
    }

    pub fn with_viscosity(mut self, viscosity: f32) -> Self {
        self.viscosity = viscosity;
        self
    }

    pub fn with_flags(mut self, flags: SolverFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_render_flags(mut self, flags: RenderFlags) -> Self {
        self.render_flags = flags;
        self
    }

    pub fn with_diffuse_steps(mut self, steps: u32) -> Self {
        self.diffuse_steps = steps;
        self
    }

    pub fn with_fixed_time_interval(mut self, interval: f32) -> Self {
        self.fixed_time_interval = interval;
        self
    }

    pub fn with_max_substeps_per_frame(mut self, cap: Option<u32>) -> Self {
        self.max_substeps_per_frame = cap;
        self
    }

    pub fn dimensionality(&self) -> Dimensionality {
        Dimensionality::from_depth(self.solver_resolution.z)
    }

    pub fn precision(&self) -> Precision {
        if self.flags.contains(SolverFlags::DOUBLE_PRECISION) {
            Precision::Full
        } else {
            Precision::Half
        }
    }

    /// Checks that the options describe a solver that can run
    ///
    /// # Returns
    /// `InvalidOptions` naming the first offending value
    pub fn validate(&self) -> FluidResult<()> {
        let axes = self.dimensionality().axis_count();
        let sizes = [self.size.x, self.size.y, self.size.z];
        let cells = [
            self.solver_resolution.x,
            self.solver_resolution.y,
            self.solver_resolution.z,
        ];

        for axis in 0..axes {
            if !(sizes[axis] > 0.0) || !sizes[axis].is_finite() {
                return Err(FluidError::invalid_options(format!(
                    "size along axis {axis} must be positive, got {}",
                    sizes[axis]
                )));
            }
            if cells[axis] < 2 {
                return Err(FluidError::invalid_options(format!(
                    "solver resolution along axis {axis} must be at least 2, got {}",
                    cells[axis]
                )));
            }
        }

        if self.render_resolution.x == 0 || self.render_resolution.y == 0 {
            return Err(FluidError::invalid_options(format!(
                "render resolution must be non-zero, got {}x{}",
                self.render_resolution.x, self.render_resolution.y
            )));
        }

        let diffuses = self.flags.contains(SolverFlags::DIFFUSE_VELOCITY)
            || self.flags.contains(SolverFlags::DIFFUSE_DATA);
        if diffuses && !(self.viscosity > 0.0) {
            return Err(FluidError::invalid_options(format!(
                "viscosity must be positive when diffusion is enabled, got {}",
                self.viscosity
            )));
        }

        if self.diffuse_steps == 0 {
            return Err(FluidError::invalid_options("diffuse_steps must be at least 1"));
        }

        if self.fixed_time_interval < 0.0 || !self.fixed_time_interval.is_finite() {
            return Err(FluidError::invalid_options(format!(
                "fixed_time_interval must be zero or positive, got {}",
                self.fixed_time_interval
            )));
        }

        if self.max_substeps_per_frame == Some(0) {
            return Err(FluidError::invalid_options(
                "max_substeps_per_frame must be at least 1 when set",
            ));
        }

        Ok(())
    }

    /// `true` when solver cells are not cubes (or squares in 2D)
    pub fn is_anisotropic(&self) -> bool {
        let delta = DerivedQuantities::from_options(self).solver_delta;
        let axes = self.dimensionality().axis_count();
        let spacing = [delta.x, delta.y, delta.z];
        spacing[..axes]
            .iter()
            .any(|d| (d - spacing[0]).abs() > spacing[0] * 1e-4)
    }
}

impl Default for FluidOptions {
    fn default() -> Self {
        Self::default_2d()
    }
}

/// Grid spacings recomputed whenever size or a resolution changes
///
/// Axes a 2D solver does not use carry a spacing of 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedQuantities {
    pub solver_delta: Vector3<f32>,
    pub solver_delta_inv: Vector3<f32>,
    pub render_delta: Vector3<f32>,
    pub render_delta_inv: Vector3<f32>,
    /// Spacing of the ink grid
    pub data_delta: Vector3<f32>,
    pub data_delta_inv: Vector3<f32>,
    /// Solver cells per render cell along each axis
    pub solver_to_render_scale: Vector3<f32>,
}

impl DerivedQuantities {
    pub fn from_options(options: &FluidOptions) -> Self {
        let flat = options.dimensionality() == Dimensionality::Two;
        let solver = Vector3::new(
            options.solver_resolution.x as f32,
            options.solver_resolution.y as f32,
            options.solver_resolution.z.max(1) as f32,
        );
        let render = Vector3::new(
            options.render_resolution.x as f32,
            options.render_resolution.y as f32,
            1.0,
        );

        let spacing = |size: f32, cells: f32| if cells > 0.0 { size / cells } else { 0.0 };
        let inverse = |delta: f32| if delta != 0.0 { 1.0 / delta } else { 0.0 };

        let z_extent = if flat { 1.0 } else { options.size.z };
        let solver_delta = Vector3::new(
            spacing(options.size.x, solver.x),
            spacing(options.size.y, solver.y),
            if flat { 1.0 } else { spacing(z_extent, solver.z) },
        );
        let render_delta = Vector3::new(
            spacing(options.size.x, render.x),
            spacing(options.size.y, render.y),
            1.0,
        );
        let data_delta = if flat { render_delta } else { solver_delta };

        let invert = |v: Vector3<f32>| Vector3::new(inverse(v.x), inverse(v.y), inverse(v.z));

        Self {
            solver_delta,
            solver_delta_inv: invert(solver_delta),
            render_delta,
            render_delta_inv: invert(render_delta),
            data_delta,
            data_delta_inv: invert(data_delta),
            solver_to_render_scale: Vector3::new(
                solver.x / render.x,
                solver.y / render.y,
                1.0,
            ),
        }
    }
}
