//! # Solver Pipeline
//!
//! Stage methods of [`Fluid`], shared by 2D and 3D solvers. Every stage is a
//! sequence of full-grid dispatches; the grid layouts decide how cells are
//! addressed, so nothing here branches on dimensionality except where the
//! two solvers genuinely differ (boundary staging, poll addressing).
//!
//! ## Per update
//!
//! 1. Ink injection, velocity perturbation, boundary placement
//! 2. Offset recomputation
//! 3. Zero or more substeps:
//!    buoyancy → velocity boundary → advect → vorticity → diffuse →
//!    projection → poll → advect data → diffuse data
//!
//! ## Ping-pong
//!
//! [`Fluid::calculate`] writes a scratch field and swaps it with the
//! destination, so no dispatch ever samples the texture it writes.

use cgmath::Vector3;
use log::trace;

use crate::backend::{ComputeBackend, Dispatch};
use crate::error::{FluidError, FluidResult};
use crate::fields::{FieldId, FieldStore};
use crate::grid::{Dimensionality, GridLayout};
use crate::kernels::{Kernel, KernelKind};
use crate::options::{RenderFlags, SolverFlags};
use crate::simulation::fluid::Fluid;

/// Strength of vorticity confinement, in grid units
pub const VORTICITY_EPSILON: f32 = 0.35;

fn xyz(v: Vector3<f32>) -> [f32; 3] {
    [v.x, v.y, v.z]
}

fn flag(on: bool) -> f32 {
    if on {
        1.0
    } else {
        0.0
    }
}

/// Per-axis ratio `to / from` of two grid resolutions
fn resolution_ratio(to: GridLayout, from: GridLayout) -> [f32; 3] {
    let (a, b) = (to.resolution(), from.resolution());
    [
        a[0] as f32 / b[0] as f32,
        a[1] as f32 / b[1] as f32,
        a[2] as f32 / b[2] as f32,
    ]
}

/// Box of side `size` around `position`, in cell units of `layout`
///
/// The centre is clamped so the box stays inside the grid. Axes a planar grid
/// does not use span `[0, 1)`.
fn cell_box(
    position: Vector3<f32>,
    size: f32,
    delta_inv: Vector3<f32>,
    layout: GridLayout,
) -> ([f32; 3], [f32; 3]) {
    let res = layout.resolution();
    let axes = layout.dimensionality().axis_count();
    let position = xyz(position);
    let inv = xyz(delta_inv);

    let mut lo = [0.0, 0.0, 0.0];
    let mut hi = [1.0, 1.0, 1.0];
    for axis in 0..axes {
        let extent = res[axis] as f32;
        let half = size * inv[axis] * 0.5;
        let centre = position[axis] * inv[axis];
        let centre = if 2.0 * half < extent {
            centre.clamp(half, extent - half)
        } else {
            extent * 0.5
        };
        lo[axis] = centre - half;
        hi[axis] = centre + half;
    }
    (lo, hi)
}

impl<B: ComputeBackend> Fluid<B> {
    /// Runs `kind` over the whole `target` grid
    ///
    /// # Arguments
    /// * `kind` - Kernel to bind
    /// * `target` - Field written by the dispatch
    /// * `setup` - Binds the kernel's inputs and parameters
    pub(crate) fn dispatch<F>(&mut self, kind: KernelKind, target: FieldId, setup: F) -> FluidResult<()>
    where
        F: FnOnce(&mut Kernel, &FieldStore) -> FluidResult<()>,
    {
        let kernels = self
            .kernels
            .as_mut()
            .ok_or_else(|| FluidError::resource(target.label(), "kernels are not loaded"))?;
        let kernel = kernels.get_mut(kind);

        kernel.bind()?;
        let result = Self::issue(
            &mut self.backend,
            &mut self.fields,
            self.layouts.solver,
            kernel,
            target,
            setup,
        );
        kernel.unbind();

        self.dispatch_total += 1;
        result
    }

    fn issue<F>(
        backend: &mut B,
        fields: &mut FieldStore,
        source_layout: GridLayout,
        kernel: &mut Kernel,
        target: FieldId,
        setup: F,
    ) -> FluidResult<()>
    where
        F: FnOnce(&mut Kernel, &FieldStore) -> FluidResult<()>,
    {
        setup(kernel, fields)?;

        let target_layout = fields.desc(target)?.layout;
        let handle = fields.bind_target(target)?;
        let inputs = kernel.textures();
        debug_assert!(
            !inputs.contains(&Some(handle)),
            "kernel `{}` samples its own target `{}`",
            kernel.name(),
            target
        );

        trace!("{} -> {}", kernel.name(), target);
        backend.dispatch(&Dispatch {
            kernel: kernel.kind(),
            params: kernel.vectors(),
            inputs,
            target: handle,
            target_layout,
            source_layout,
        })
    }

    /// Dispatches into `scratch`, then swaps it with `destination`
    pub(crate) fn calculate<F>(
        &mut self,
        kind: KernelKind,
        scratch: FieldId,
        destination: FieldId,
        setup: F,
    ) -> FluidResult<()>
    where
        F: FnOnce(&mut Kernel, &FieldStore) -> FluidResult<()>,
    {
        self.dispatch(kind, scratch, setup)?;
        self.fields.swap(destination, scratch)
    }

    pub(crate) fn inject_ink_step(&mut self) -> FluidResult<()> {
        let injectors = self.interactions.drain_injectors();
        let layout = self.layouts.data;
        let delta_inv = self.derived.data_delta_inv;

        for injector in injectors {
            let (lo, hi) = cell_box(injector.position, injector.size, delta_inv, layout);
            let c = injector.color;
            let color = [c.x, c.y, c.z, flag(injector.overwrite)];
            self.calculate(
                KernelKind::SplatInk,
                FieldId::DataScratch,
                FieldId::Data,
                move |kernel, fields| {
                    kernel.set_texture("field", fields.handle(FieldId::Data)?)?;
                    kernel.set_param("rect_min", &lo)?;
                    kernel.set_param("rect_max", &hi)?;
                    kernel.set_param("color", &color)
                },
            )?;
            self.stats.ink_splats += 1;
        }
        Ok(())
    }

    pub(crate) fn perturb_fluid_step(&mut self) -> FluidResult<()> {
        let perturbers = self.interactions.drain_perturbers();
        let axes = self.layouts.solver.dimensionality().axis_count();
        let delta = xyz(self.derived.solver_delta);
        let delta_inv = xyz(self.derived.solver_delta_inv);
        let min_delta = delta[..axes].iter().copied().fold(f32::INFINITY, f32::min);

        for perturber in perturbers {
            let position = xyz(perturber.position);
            let centre = [
                position[0] * delta_inv[0] - 0.5,
                position[1] * delta_inv[1] - 0.5,
                position[2] * delta_inv[2] - 0.5,
            ];
            let velocity = xyz(perturber.velocity);
            let radius = perturber.size / min_delta;
            self.calculate(
                KernelKind::SplatVelocity,
                FieldId::SolverScratch,
                FieldId::Velocity,
                move |kernel, fields| {
                    kernel.set_texture("field", fields.handle(FieldId::Velocity)?)?;
                    kernel.set_param("position", &centre)?;
                    kernel.set_param("velocity", &velocity)?;
                    kernel.set_scalar("radius", radius)
                },
            )?;
            self.stats.perturbations += 1;
        }
        Ok(())
    }

    /// Applies the staged 2D mask and queued obstacle boxes
    pub(crate) fn update_arbitrary_boundary_step(&mut self) -> FluidResult<()> {
        if let Some(texels) = self.staged_boundaries.take() {
            let handle = self.fields.handle(FieldId::BoundaryScratch)?;
            self.backend.write_texels(handle, &texels)?;
            self.fields.swap(FieldId::Boundaries, FieldId::BoundaryScratch)?;
        }

        let boundaries = self.interactions.drain_boundaries();
        let layout = self.layouts.solver;
        let delta_inv = self.derived.solver_delta_inv;
        let scratch = match layout.dimensionality() {
            Dimensionality::Two => FieldId::BoundaryScratch,
            Dimensionality::Three => FieldId::SolverScratch,
        };

        for boundary in boundaries {
            let (lo, hi) = cell_box(boundary.position, boundary.size, delta_inv, layout);
            self.calculate(
                KernelKind::SplatBoundary,
                scratch,
                FieldId::Boundaries,
                move |kernel, fields| {
                    kernel.set_texture("field", fields.handle(FieldId::Boundaries)?)?;
                    kernel.set_param("rect_min", &lo)?;
                    kernel.set_param("rect_max", &hi)
                },
            )?;
            self.stats.boundary_splats += 1;
        }
        Ok(())
    }

    pub(crate) fn update_offset_step(&mut self) -> FluidResult<()> {
        self.calculate(
            KernelKind::Offsets,
            FieldId::SolverScratch,
            FieldId::Offsets,
            |kernel, fields| kernel.set_texture("boundaries", fields.handle(FieldId::Boundaries)?),
        )
    }

    /// One fixed substep of length `dt`
    pub(crate) fn update_step(&mut self, dt: f32) -> FluidResult<()> {
        let flags = self.options.flags;

        self.buoyancy_step(dt)?;
        self.boundary_step(FieldId::Velocity, -1.0)?;
        if flags.contains(SolverFlags::ADVECT_VELOCITY) {
            self.advect_velocity_step(dt)?;
        }
        if flags.contains(SolverFlags::VORTICITY_CONFINEMENT) {
            self.vorticity_step(dt)?;
        }
        if flags.contains(SolverFlags::DIFFUSE_VELOCITY) {
            self.diffuse_velocity_step(dt)?;
        }
        self.project_step()?;
        self.poll_velocity_step()?;
        if flags.contains(SolverFlags::ADVECT_DATA) {
            self.advect_data_step(dt)?;
        }
        if flags.contains(SolverFlags::DIFFUSE_DATA) {
            self.diffuse_data_step(dt)?;
        }
        Ok(())
    }

    fn buoyancy_step(&mut self, dt: f32) -> FluidResult<()> {
        let scale = resolution_ratio(self.layouts.data, self.layouts.solver);
        let densities = xyz(self.densities);
        self.calculate(
            KernelKind::Buoyancy,
            FieldId::SolverScratch,
            FieldId::Velocity,
            move |kernel, fields| {
                kernel.set_texture("velocity", fields.handle(FieldId::Velocity)?)?;
                kernel.set_texture("data", fields.handle(FieldId::Data)?)?;
                kernel.set_param("scale", &scale)?;
                kernel.set_param("densities", &densities)?;
                kernel.set_scalar("timestep", dt)
            },
        )
    }

    /// Solid cells mirror their fluid neighbour times `scale`
    fn boundary_step(&mut self, field: FieldId, scale: f32) -> FluidResult<()> {
        let (kind, scratch) = if field.components() == 1 {
            (KernelKind::BoundaryScalar, FieldId::ScalarScratch)
        } else {
            (KernelKind::BoundaryVector, FieldId::SolverScratch)
        };
        self.calculate(kind, scratch, field, move |kernel, fields| {
            kernel.set_texture("field", fields.handle(field)?)?;
            kernel.set_texture("offsets", fields.handle(FieldId::Offsets)?)?;
            kernel.set_scalar("scale", scale)
        })
    }

    fn advect_velocity_step(&mut self, dt: f32) -> FluidResult<()> {
        let delta = xyz(self.derived.solver_delta);
        self.calculate(
            KernelKind::Advect,
            FieldId::SolverScratch,
            FieldId::Velocity,
            move |kernel, fields| {
                let velocity = fields.handle(FieldId::Velocity)?;
                kernel.set_texture("velocity", velocity)?;
                kernel.set_texture("data", velocity)?;
                kernel.set_texture("boundaries", fields.handle(FieldId::Boundaries)?)?;
                kernel.set_param("delta", &delta)?;
                kernel.set_param("scale", &[1.0, 1.0, 1.0])?;
                kernel.set_scalar("timestep", dt)
            },
        )
    }

    fn vorticity_step(&mut self, dt: f32) -> FluidResult<()> {
        let delta = xyz(self.derived.solver_delta);
        self.calculate(
            KernelKind::Vorticity,
            FieldId::SolverScratch,
            FieldId::Velocity,
            move |kernel, fields| {
                kernel.set_texture("velocity", fields.handle(FieldId::Velocity)?)?;
                kernel.set_param("delta", &delta)?;
                kernel.set_scalar("epsilon", VORTICITY_EPSILON)?;
                kernel.set_scalar("timestep", dt)
            },
        )
    }

    /// Refreshes the occupancy mask for a Jacobi solve of `x` against `b`
    fn zcull_step(&mut self, x: FieldId, b: FieldId) -> FluidResult<()> {
        self.dispatch(KernelKind::ZCull, FieldId::Occupancy, move |kernel, fields| {
            kernel.set_texture("x", fields.handle(x)?)?;
            kernel.set_texture("b", fields.handle(b)?)
        })
    }

    /// One Jacobi iteration `x ← (Σ neighbours(x) + alpha·b) / beta`
    ///
    /// With `neumann`, solid neighbours of a fluid cell read as the cell
    /// itself, which is the zero-gradient wall condition of the pressure solve.
    #[allow(clippy::too_many_arguments)]
    fn jacobi_step(
        &mut self,
        x: FieldId,
        b: FieldId,
        scratch: FieldId,
        alpha: f32,
        beta: f32,
        cull: bool,
        neumann: bool,
    ) -> FluidResult<()> {
        if cull {
            self.zcull_step(x, b)?;
        }
        let kind = if x.components() == 1 {
            KernelKind::JacobiScalar
        } else {
            KernelKind::JacobiVector
        };
        self.calculate(kind, scratch, x, move |kernel, fields| {
            kernel.set_texture("x", fields.handle(x)?)?;
            kernel.set_texture("b", fields.handle(b)?)?;
            if cull {
                kernel.set_texture("occupancy", fields.handle(FieldId::Occupancy)?)?;
            }
            if neumann {
                kernel.set_texture("offsets", fields.handle(FieldId::Offsets)?)?;
            }
            kernel.set_scalar("alpha", alpha)?;
            kernel.set_scalar("beta", beta)?;
            kernel.set_scalar("cull", flag(cull))?;
            kernel.set_scalar("neumann", flag(neumann))
        })
    }

    fn copy_step(&mut self, source: FieldId, target: FieldId) -> FluidResult<()> {
        self.dispatch(KernelKind::Copy, target, move |kernel, fields| {
            kernel.set_texture("source", fields.handle(source)?)
        })
    }

    /// Axis count and `dx·dy[·dz]` of a grid spacing
    fn cell_volume(&self, delta: Vector3<f32>) -> (f32, f32) {
        let dims = self.layouts.solver.dimensionality().axis_count() as f32;
        // Planar spacings carry dz = 1
        (dims, delta.x * delta.y * delta.z)
    }

    fn diffuse_velocity_step(&mut self, dt: f32) -> FluidResult<()> {
        let (dims, volume) = self.cell_volume(self.derived.solver_delta);
        let alpha = volume / (dt * self.options.viscosity);
        let beta = 2.0 * dims + alpha;
        let cull = self.options.flags.contains(SolverFlags::ZCULL);

        self.copy_step(FieldId::Velocity, FieldId::VelocityRhs)?;
        for _ in 0..self.options.diffuse_steps {
            self.jacobi_step(
                FieldId::Velocity,
                FieldId::VelocityRhs,
                FieldId::SolverScratch,
                alpha,
                beta,
                cull,
                false,
            )?;
        }
        Ok(())
    }

    /// Divergence, pressure solve, pressure boundary, gradient subtraction
    ///
    /// Velocity component `axis` of a cell lives on the face it shares with
    /// the cell behind it. Faces touching a solid cell are walls and carry no
    /// flow: divergence reads them as zero and the gradient pass closes them.
    fn project_step(&mut self) -> FluidResult<()> {
        let delta = self.derived.solver_delta;
        let packed = xyz(delta);
        let dims = self.layouts.solver.dimensionality().axis_count() as f32;
        let alpha = -delta.x * delta.y;
        let beta = 2.0 * dims;
        let cull = self.options.flags.contains(SolverFlags::ZCULL);

        self.dispatch(KernelKind::Divergence, FieldId::Divergence, move |kernel, fields| {
            kernel.set_texture("velocity", fields.handle(FieldId::Velocity)?)?;
            kernel.set_texture("offsets", fields.handle(FieldId::Offsets)?)?;
            kernel.set_param("delta", &packed)
        })?;

        for _ in 0..self.options.diffuse_steps {
            self.jacobi_step(
                FieldId::Pressure,
                FieldId::Divergence,
                FieldId::ScalarScratch,
                alpha,
                beta,
                cull,
                true,
            )?;
            self.boundary_step(FieldId::Pressure, 1.0)?;
        }

        self.calculate(
            KernelKind::SubtractGradient,
            FieldId::SolverScratch,
            FieldId::Velocity,
            move |kernel, fields| {
                kernel.set_texture("velocity", fields.handle(FieldId::Velocity)?)?;
                kernel.set_texture("pressure", fields.handle(FieldId::Pressure)?)?;
                kernel.set_texture("offsets", fields.handle(FieldId::Offsets)?)?;
                kernel.set_param("delta", &packed)
            },
        )
    }

    /// Samples velocity for every poller on every 20th substep
    ///
    /// The sample is a blocking single-texel readback.
    fn poll_velocity_step(&mut self) -> FluidResult<()> {
        let due = self.pollers.tick();
        if !due || self.pollers.is_empty() {
            return Ok(());
        }

        let layout = self.layouts.solver;
        let volumetric = layout.dimensionality() == Dimensionality::Three;
        let res = layout.resolution();
        let size = self.options.size;
        let handle = self.fields.handle(FieldId::Velocity)?;
        let to_cell = |p: f32, size: f32, cells: u32| {
            let cell = (p * cells as f32 / size).floor().max(0.0) as u32;
            cell.min(cells - 1)
        };

        for poller in self.pollers.iter_mut() {
            let p = poller.position();
            let x = to_cell(p.x, size.x, res[0]);
            let y = to_cell(p.y, size.y, res[1]);
            let z = if volumetric { to_cell(p.z, size.z, res[2]) } else { 0 };
            let (tx, ty) = layout.coords_2d(x, y, z);

            let v = self.backend.read_texel(handle, tx, ty)?;
            let velocity = if volumetric {
                Vector3::new(v[0], v[1], v[2])
            } else {
                Vector3::new(v[0], v[1], 0.0)
            };
            poller.update_velocity(velocity);
            self.stats.polls += 1;
        }
        Ok(())
    }

    fn advect_data_step(&mut self, dt: f32) -> FluidResult<()> {
        let delta = xyz(self.derived.solver_delta);
        let scale = resolution_ratio(self.layouts.solver, self.layouts.data);
        self.calculate(
            KernelKind::Advect,
            FieldId::DataScratch,
            FieldId::Data,
            move |kernel, fields| {
                kernel.set_texture("velocity", fields.handle(FieldId::Velocity)?)?;
                kernel.set_texture("data", fields.handle(FieldId::Data)?)?;
                kernel.set_texture("boundaries", fields.handle(FieldId::Boundaries)?)?;
                kernel.set_param("delta", &delta)?;
                kernel.set_param("scale", &scale)?;
                kernel.set_scalar("timestep", dt)
            },
        )
    }

    fn diffuse_data_step(&mut self, dt: f32) -> FluidResult<()> {
        let (dims, volume) = self.cell_volume(self.derived.data_delta);
        let alpha = volume / (dt * self.options.viscosity);
        let beta = 2.0 * dims + alpha;

        self.copy_step(FieldId::Data, FieldId::DataRhs)?;
        for _ in 0..self.options.diffuse_steps {
            self.jacobi_step(
                FieldId::Data,
                FieldId::DataRhs,
                FieldId::DataScratch,
                alpha,
                beta,
                false,
                false,
            )?;
        }
        Ok(())
    }

    /// Composites the enabled layers into `Display`
    pub(crate) fn render_step(&mut self) -> FluidResult<()> {
        let render = self.layouts.render;
        let data = resolution_ratio(self.layouts.data, render);
        let solver = resolution_ratio(self.layouts.solver, render);
        let depth = self.layouts.solver.resolution()[2] as f32;
        let opacity = match self.layouts.solver.dimensionality() {
            Dimensionality::Two => 0.0,
            Dimensionality::Three => 4.0 / depth,
        };
        let layers = self.options.render_flags;
        let layers = [
            flag(layers.contains(RenderFlags::INK)),
            flag(layers.contains(RenderFlags::VELOCITY)),
            flag(layers.contains(RenderFlags::PRESSURE)),
            flag(layers.contains(RenderFlags::BOUNDARIES)),
        ];

        self.dispatch(KernelKind::Render, FieldId::Display, move |kernel, fields| {
            kernel.set_texture("data", fields.handle(FieldId::Data)?)?;
            kernel.set_texture("velocity", fields.handle(FieldId::Velocity)?)?;
            kernel.set_texture("pressure", fields.handle(FieldId::Pressure)?)?;
            kernel.set_texture("boundaries", fields.handle(FieldId::Boundaries)?)?;
            kernel.set_param("data_scale", &[data[0], data[1], data[2], opacity])?;
            kernel.set_param("solver_scale", &solver)?;
            kernel.set_param("layers", &layers)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::options::FluidOptions;
    use cgmath::Vector2;
    use std::f32::consts::PI;

    fn fluid_2d(resolution: u32, flags: SolverFlags, diffuse_steps: u32) -> Fluid<CpuBackend> {
        let mut fluid = Fluid::new(CpuBackend::new());
        fluid
            .init(
                FluidOptions::default_2d()
                    .with_solver_resolution(Vector3::new(resolution, resolution, 1))
                    .with_render_resolution(Vector2::new(resolution, resolution))
                    .with_flags(flags | SolverFlags::DOUBLE_PRECISION)
                    .with_diffuse_steps(diffuse_steps)
                    .with_viscosity(0.001)
                    .with_fixed_time_interval(0.0),
            )
            .expect("init succeeds");
        fluid
    }

    /// Smooth bump supported on cells `lo..=hi`
    fn bump(i: u32, lo: u32, hi: u32) -> f32 {
        if i < lo || i > hi {
            return 0.0;
        }
        (PI * (i - lo + 1) as f32 / (hi - lo + 2) as f32).sin()
    }

    /// Forward-difference divergence at cells `1..res-1`
    ///
    /// Projection stores zero on every face touching a solid cell, so the
    /// stored field is differenced as is, wall-adjacent cells included.
    fn max_divergence(fluid: &mut Fluid<CpuBackend>) -> f32 {
        let layout = fluid.layouts().solver;
        let [rx, ry, rz] = layout.resolution();
        let axes = layout.dimensionality().axis_count();
        let delta = fluid.derived().solver_delta;
        let delta = [delta.x, delta.y, delta.z];
        let velocity = fluid.read_field(FieldId::Velocity).unwrap();
        let at = |x: u32, y: u32, z: u32| velocity[layout.cell_index(x, y, z)];

        let (z_lo, z_hi) = if axes == 3 { (1, rz - 1) } else { (0, 1) };
        let mut worst = 0.0f32;
        for z in z_lo..z_hi {
            for y in 1..ry - 1 {
                for x in 1..rx - 1 {
                    let here = at(x, y, z);
                    let mut div = (at(x + 1, y, z)[0] - here[0]) / delta[0]
                        + (at(x, y + 1, z)[1] - here[1]) / delta[1];
                    if axes == 3 {
                        div += (at(x, y, z + 1)[2] - here[2]) / delta[2];
                    }
                    worst = worst.max(div.abs());
                }
            }
        }
        worst
    }

    /// Swirl derived from a streamfunction on cell corners
    ///
    /// Component `x` of cell `(x, y)` sits on its left face and `y` on its
    /// bottom face, so the forward-difference divergence cancels exactly. The
    /// streamfunction vanishes within two corners of the edge, which leaves
    /// every wall face at rest.
    fn stream_swirl(fluid: &mut Fluid<CpuBackend>, amplitude: f32) {
        let layout = fluid.layouts().solver;
        let [rx, ry, _] = layout.resolution();
        let delta = fluid.derived().solver_delta;
        let psi = |i: u32, j: u32| amplitude * bump(i, 2, rx - 3) * bump(j, 2, ry - 3);
        let cells: Vec<[f32; 4]> = layout
            .cells()
            .map(|(x, y, _)| {
                let u = (psi(x, y + 1) - psi(x, y)) / delta.y;
                let v = -(psi(x + 1, y) - psi(x, y)) / delta.x;
                [u, v, 0.0, 0.0]
            })
            .collect();
        fluid.upload_field(FieldId::Velocity, &cells).unwrap();
    }

    /// Divergence a velocity of this size produces against a closed face
    fn wall_scale(fluid: &mut Fluid<CpuBackend>) -> f32 {
        let delta = fluid.derived().solver_delta;
        let peak = fluid
            .read_field(FieldId::Velocity)
            .unwrap()
            .iter()
            .flat_map(|v| v[..3].to_vec())
            .fold(0.0f32, |m, c| m.max(c.abs()));
        peak / delta.x.min(delta.y)
    }

    fn ink_mass(fluid: &mut Fluid<CpuBackend>) -> f64 {
        fluid
            .read_field(FieldId::Data)
            .unwrap()
            .iter()
            .map(|t| (t[0] + t[1] + t[2]) as f64)
            .sum()
    }

    #[test]
    fn test_projection_removes_divergence_2d() {
        let mut fluid = fluid_2d(16, SolverFlags::NONE, 2000);
        let layout = fluid.layouts().solver;
        let cells: Vec<[f32; 4]> = layout
            .cells()
            .map(|(x, y, _)| {
                let s = bump(x, 4, 11) * bump(y, 4, 11);
                [s, -0.5 * s, 0.0, 0.0]
            })
            .collect();
        fluid.upload_field(FieldId::Velocity, &cells).unwrap();
        let initial = max_divergence(&mut fluid);
        assert!(initial > 1.0);

        fluid.update(0.01).unwrap();
        let remaining = max_divergence(&mut fluid);
        assert!(
            remaining < 1e-3 * initial,
            "divergence {remaining} left of {initial}"
        );
    }

    #[test]
    fn test_projection_removes_divergence_3d() {
        let mut fluid = Fluid::new(CpuBackend::new());
        fluid
            .init(
                FluidOptions::default_3d()
                    .with_solver_resolution(Vector3::new(8, 8, 8))
                    .with_render_resolution(Vector2::new(8, 8))
                    .with_flags(SolverFlags::DOUBLE_PRECISION)
                    .with_diffuse_steps(400)
                    .with_fixed_time_interval(0.0),
            )
            .unwrap();
        let layout = fluid.layouts().solver;
        let cells: Vec<[f32; 4]> = layout
            .cells()
            .map(|(x, y, z)| {
                let s = bump(x, 2, 5) * bump(y, 2, 5) * bump(z, 2, 5);
                [s, -0.5 * s, 0.25 * s, 0.0]
            })
            .collect();
        fluid.upload_field(FieldId::Velocity, &cells).unwrap();
        let initial = max_divergence(&mut fluid);
        assert!(initial > 1.0);

        fluid.update(0.01).unwrap();
        let remaining = max_divergence(&mut fluid);
        assert!(
            remaining < 1e-3 * initial,
            "divergence {remaining} left of {initial}"
        );
    }

    #[test]
    fn test_projection_closes_walls_3d() {
        let mut fluid = Fluid::new(CpuBackend::new());
        fluid
            .init(
                FluidOptions::default_3d()
                    .with_solver_resolution(Vector3::new(8, 8, 8))
                    .with_render_resolution(Vector2::new(8, 8))
                    .with_flags(SolverFlags::DOUBLE_PRECISION)
                    .with_diffuse_steps(400)
                    .with_fixed_time_interval(0.0),
            )
            .unwrap();
        let layout = fluid.layouts().solver;
        let cells: Vec<[f32; 4]> = layout.cells().map(|_| [1.0, 0.5, 0.25, 0.0]).collect();
        fluid.upload_field(FieldId::Velocity, &cells).unwrap();
        let scale = wall_scale(&mut fluid);

        fluid.update(0.01).unwrap();
        let remaining = max_divergence(&mut fluid);
        assert!(remaining < 1e-3 * scale, "divergence {remaining} against {scale}");

        // Nothing crosses the x walls
        let velocity = fluid.read_field(FieldId::Velocity).unwrap();
        for y in 1..7 {
            for z in 1..7 {
                assert_eq!(velocity[layout.cell_index(1, y, z)][0], 0.0);
                assert_eq!(velocity[layout.cell_index(7, y, z)][0], 0.0);
            }
        }
    }

    #[test]
    fn test_vortex_against_walls_and_obstacle_is_divergence_free() {
        let mut fluid = fluid_2d(16, SolverFlags::NONE, 2000);
        fluid.add_arbitrary_boundary(Vector3::new(0.3, 0.6, 0.0), 0.25);
        fluid.update(0.0).unwrap();
        fluid.generate_circular_vortex().unwrap();
        let scale = wall_scale(&mut fluid);

        fluid.update(0.01).unwrap();
        let remaining = max_divergence(&mut fluid);
        assert!(remaining < 1e-3 * scale, "divergence {remaining} against {scale}");

        // The rotation survives away from the walls
        let layout = fluid.layouts().solver;
        let velocity = fluid.read_field(FieldId::Velocity).unwrap();
        assert!(velocity[layout.cell_index(12, 8, 0)][1] > 0.0);
    }

    #[test]
    fn test_self_advected_flow_stays_divergence_free() {
        let mut fluid = fluid_2d(
            16,
            SolverFlags::ADVECT_VELOCITY | SolverFlags::VORTICITY_CONFINEMENT,
            2000,
        );
        fluid.generate_circular_vortex().unwrap();
        let scale = wall_scale(&mut fluid);

        for substep in 0..3 {
            fluid.update(0.01).unwrap();
            let remaining = max_divergence(&mut fluid);
            assert!(
                remaining < 1e-3 * scale,
                "substep {substep}: divergence {remaining} against {scale}"
            );
        }
    }

    #[test]
    fn test_swirling_ink_is_conserved() {
        let mut fluid = fluid_2d(64, SolverFlags::ADVECT_DATA | SolverFlags::DIFFUSE_DATA, 10);
        stream_swirl(&mut fluid, 0.04);
        let layout = fluid.layouts().data;
        let cells: Vec<[f32; 4]> = layout
            .cells()
            .map(|(x, y, _)| {
                let s = bump(x, 20, 43) * bump(y, 24, 39);
                [s, 0.5 * s, 0.0, 1.0]
            })
            .collect();
        fluid.upload_field(FieldId::Data, &cells).unwrap();
        let before = ink_mass(&mut fluid);

        for _ in 0..100 {
            fluid.update(0.005).unwrap();
        }
        assert_eq!(fluid.poll_frame(), 100);
        let after = ink_mass(&mut fluid);
        let drift = ((after - before) / before).abs();
        assert!(drift <= 0.01, "ink drifted by {:.4}%", drift * 100.0);

        // The blob was carried round, not left in place
        let data = fluid.read_field(FieldId::Data).unwrap();
        let moved = data
            .iter()
            .zip(&cells)
            .map(|(now, was)| (now[0] - was[0]).abs())
            .fold(0.0f32, f32::max);
        assert!(moved > 0.05, "ink barely moved ({moved})");
    }

    #[test]
    fn test_advection_creates_no_new_extrema() {
        let mut fluid = fluid_2d(32, SolverFlags::ADVECT_VELOCITY | SolverFlags::ADVECT_DATA, 20);
        fluid.generate_circular_vortex().unwrap();
        fluid.inject_checkered_data().unwrap();

        for _ in 0..20 {
            fluid.update(0.02).unwrap();
        }
        let data = fluid.read_field(FieldId::Data).unwrap();
        for texel in &data {
            for channel in &texel[..3] {
                assert!(*channel >= -1e-5 && *channel <= 1.0 + 1e-5, "{channel}");
            }
        }
        // The pattern moved
        let mut fresh = fluid_2d(32, SolverFlags::NONE, 1);
        fresh.inject_checkered_data().unwrap();
        assert_ne!(data, fresh.read_field(FieldId::Data).unwrap());
    }

    #[test]
    fn test_zcull_leaves_results_unchanged() {
        let run = |flags: SolverFlags| {
            let mut fluid = fluid_2d(16, flags, 8);
            fluid.perturb(Vector3::new(0.3, 0.4, 0.0), Vector3::new(2.0, 1.0, 0.0), 0.05);
            for _ in 0..3 {
                fluid.update(0.01).unwrap();
            }
            (
                fluid.read_field(FieldId::Velocity).unwrap(),
                fluid.read_field(FieldId::Pressure).unwrap(),
                fluid.backend().dispatch_count(),
            )
        };

        let (velocity, pressure, plain) = run(SolverFlags::DIFFUSE_VELOCITY);
        let (culled_velocity, culled_pressure, culled) =
            run(SolverFlags::DIFFUSE_VELOCITY | SolverFlags::ZCULL);
        assert_eq!(velocity, culled_velocity);
        assert_eq!(pressure, culled_pressure);
        assert!(velocity.iter().any(|v| v[0] != 0.0));
        // Culling refreshes the occupancy mask before every iteration
        assert!(culled > plain);
    }

    #[test]
    fn test_bare_substep_dispatch_count() {
        let mut fluid = fluid_2d(16, SolverFlags::NONE, 4);
        fluid.update(0.01).unwrap();
        // offsets + buoyancy + boundary + divergence + 4 × (jacobi + boundary) + gradient
        assert_eq!(fluid.frame_stats().dispatches, 13);

        fluid.update(0.0).unwrap();
        assert_eq!(fluid.frame_stats().dispatches, 1);
    }

    #[test]
    fn test_solid_cells_hold_no_velocity() {
        let mut fluid = fluid_2d(16, SolverFlags::NONE, 20);
        fluid.add_arbitrary_boundary(Vector3::new(0.5, 0.5, 0.0), 0.25);
        fluid.update(0.0).unwrap();

        let layout = fluid.layouts().solver;
        let cells: Vec<[f32; 4]> = layout.cells().map(|_| [1.0, 0.5, 0.0, 0.0]).collect();
        fluid.upload_field(FieldId::Velocity, &cells).unwrap();
        fluid.update(0.01).unwrap();

        let velocity = fluid.read_field(FieldId::Velocity).unwrap();
        // Fully enclosed obstacle cells are zeroed and skipped by projection
        assert_eq!(velocity[layout.cell_index(7, 7, 0)], [0.0; 4]);
        assert_eq!(velocity[layout.cell_index(8, 8, 0)], [0.0; 4]);
        assert!(velocity.iter().all(|v| v.iter().all(|c| c.is_finite())));
    }

    #[test]
    fn test_volume_boundaries_write_through_solver_scratch() {
        let mut fluid = Fluid::new(CpuBackend::new());
        fluid
            .init(
                FluidOptions::default_3d()
                    .with_solver_resolution(Vector3::new(8, 8, 8))
                    .with_render_resolution(Vector2::new(8, 8))
                    .with_flags(SolverFlags::DOUBLE_PRECISION)
                    .with_fixed_time_interval(0.0),
            )
            .unwrap();
        let scratch = fluid.fields.handle(FieldId::BoundaryScratch).unwrap();

        fluid.add_arbitrary_boundary(Vector3::new(0.5, 0.5, 0.5), 0.25);
        fluid.update(0.0).unwrap();

        assert_eq!(fluid.fields.handle(FieldId::BoundaryScratch).unwrap(), scratch);
        let layout = fluid.layouts().solver;
        let mask = fluid.read_field(FieldId::Boundaries).unwrap();
        assert_eq!(mask[layout.cell_index(4, 4, 4)], [1.0; 4]);
        assert_eq!(mask[layout.cell_index(4, 4, 1)], [0.0; 4]);
    }

    #[test]
    fn test_volume_render_composites_ink() {
        let mut fluid = Fluid::new(CpuBackend::new());
        fluid
            .init(
                FluidOptions::default_3d()
                    .with_solver_resolution(Vector3::new(8, 8, 8))
                    .with_render_resolution(Vector2::new(16, 16))
                    .with_flags(SolverFlags::DOUBLE_PRECISION)
                    .with_fixed_time_interval(0.0),
            )
            .unwrap();
        fluid.inject(Vector3::new(0.5, 0.5, 0.5), 1.0, 0.0, 0.0, 0.25, true);
        fluid.update(0.0).unwrap();
        fluid.render().unwrap();

        let layout = fluid.layouts().render;
        let display = fluid.read_field(FieldId::Display).unwrap();
        let centre = display[layout.cell_index(8, 8, 0)];
        assert!(centre[0] > 0.0 && centre[3] > 0.0);
        assert_eq!(centre[1], 0.0);
        assert_eq!(display[layout.cell_index(0, 0, 0)], [0.0; 4]);
    }

    #[test]
    fn test_cell_box_clamps_into_grid() {
        let layout = GridLayout::flat(10, 10);
        let inv = Vector3::new(10.0, 10.0, 1.0);
        let (lo, hi) = cell_box(Vector3::new(0.0, 0.5, 0.0), 0.2, inv, layout);
        assert_eq!((lo[0], hi[0]), (0.0, 2.0));
        assert_eq!((lo[1], hi[1]), (4.0, 6.0));
        assert_eq!((lo[2], hi[2]), (0.0, 1.0));
    }
}
