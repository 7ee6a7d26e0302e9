//! # Fluid Solver
//!
//! [`Fluid`] is the public face of the solver. It owns the backend, the field
//! store and the kernel set, and drives the staged pipeline once per frame.
//!
//! ## Lifecycle
//!
//! 1. `Fluid::new(backend)` creates an unready solver
//! 2. `init(options)` allocates fields, loads kernels and marks it ready
//! 3. Per frame: queue interactions, then `update(dt)` and `render()`
//! 4. Changing size or resolution clears readiness until the next `init`
//!
//! While not ready every simulation and render call returns `Ok(())` without
//! doing anything.
//!
//! ## Usage
//!
//! ```rust
//! use cgmath::Vector3;
//! use stokes::backend::CpuBackend;
//! use stokes::options::FluidOptions;
//! use stokes::simulation::Fluid;
//!
//! let mut fluid = Fluid::new(CpuBackend::new());
//! fluid
//!     .init(FluidOptions::default_2d()
//!         .with_solver_resolution(Vector3::new(32, 32, 1))
//!         .with_render_resolution(cgmath::Vector2::new(64, 64)))
//!     .unwrap();
//!
//! fluid.inject(Vector3::new(0.5, 0.5, 0.0), 1.0, 0.2, 0.0, 0.1, false);
//! fluid.perturb(Vector3::new(0.5, 0.5, 0.0), Vector3::new(0.0, 1.0, 0.0), 0.05);
//! fluid.update(1.0 / 60.0).unwrap();
//! fluid.render().unwrap();
//! ```

use cgmath::{Vector2, Vector3};
use log::{debug, info, warn};

use crate::backend::ComputeBackend;
use crate::error::{FluidError, FluidResult};
use crate::fields::{FieldId, FieldLayouts, FieldStore};
use crate::grid::Dimensionality;
use crate::kernels::KernelSet;
use crate::options::{DerivedQuantities, FluidOptions, Precision};
use crate::simulation::interaction::{Boundary, Injector, InteractionQueue, Perturber};
use crate::simulation::poller::{PollerHandle, PollerRegistry, VelocityPoller};
use crate::simulation::scheduler::SubstepScheduler;

/// Work done by the most recent `update`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub substeps: u32,
    pub dispatches: u64,
    pub rebinds: u64,
    pub ink_splats: u32,
    pub perturbations: u32,
    pub boundary_splats: u32,
    pub polls: u32,
}

/// Fields carried across a re-init with unchanged resolutions
struct PreservedState {
    fields: Vec<(FieldId, Vec<[f32; 4]>)>,
}

/// Eulerian fluid solver over a compute backend
pub struct Fluid<B: ComputeBackend> {
    pub(crate) backend: B,
    pub(crate) options: FluidOptions,
    pub(crate) derived: DerivedQuantities,
    pub(crate) layouts: FieldLayouts,
    pub(crate) fields: FieldStore,
    pub(crate) kernels: Option<KernelSet>,
    kernel_precision: Option<Precision>,
    pub(crate) interactions: InteractionQueue,
    pub(crate) scheduler: SubstepScheduler,
    pub(crate) pollers: PollerRegistry,
    pub(crate) densities: Vector3<f32>,
    /// 2D obstacle mask waiting to be swapped in at the next update
    pub(crate) staged_boundaries: Option<Vec<[f32; 4]>>,
    pub(crate) ready: bool,
    pub(crate) stats: FrameStats,
    pub(crate) dispatch_total: u64,
}

impl<B: ComputeBackend> Fluid<B> {
    /// Creates an unready solver on `backend`
    pub fn new(backend: B) -> Self {
        let options = FluidOptions::default();
        Self {
            backend,
            derived: DerivedQuantities::from_options(&options),
            layouts: FieldLayouts::from_options(&options),
            options,
            fields: FieldStore::new(),
            kernels: None,
            kernel_precision: None,
            interactions: InteractionQueue::new(),
            scheduler: SubstepScheduler::default(),
            pollers: PollerRegistry::new(),
            densities: Vector3::new(0.0, 0.0, 0.0),
            staged_boundaries: None,
            ready: false,
            stats: FrameStats::default(),
            dispatch_total: 0,
        }
    }

    /// Configures the solver, discarding all simulation state
    pub fn init(&mut self, options: FluidOptions) -> FluidResult<()> {
        self.init_preserving(options, false)
    }

    /// Configures the solver
    ///
    /// # Arguments
    /// * `options` - New configuration
    /// * `preserve_state` - Carry velocity, pressure, ink and obstacles over
    ///   when the grid layouts are unchanged
    ///
    /// # Returns
    /// `InvalidOptions` for unusable options, `ProgramLoadFailure` if any
    /// kernel failed to compile
    pub fn init_preserving(&mut self, options: FluidOptions, preserve_state: bool) -> FluidResult<()> {
        options.validate()?;
        let layouts = FieldLayouts::from_options(&options);

        let preserved = if preserve_state {
            if self.ready && self.layouts == layouts {
                Some(self.capture_state()?)
            } else {
                warn!("preserve_state ignored: solver not ready or grid layouts changed");
                None
            }
        } else {
            None
        };

        self.ready = false;
        self.backend.flush()?;

        if options.is_anisotropic() {
            warn!(
                "Solver cells are not square ({:?} over {:?}); Jacobi stencils assume uniform spacing",
                options.size, options.solver_resolution
            );
        }

        let dimensionality = options.dimensionality();
        let precision = options.precision();
        let reload = match &self.kernels {
            Some(set) => {
                set.dimensionality() != dimensionality || self.kernel_precision != Some(precision)
            }
            None => true,
        };
        if reload {
            self.kernels = None;
            let set = KernelSet::load(&mut self.backend, dimensionality, precision);
            if let Some(err) = set.load_failure() {
                return Err(err);
            }
            self.kernels = Some(set);
            self.kernel_precision = Some(precision);
        }

        let summary = self.fields.allocate(&mut self.backend, &layouts, precision)?;
        self.layouts = layouts;
        self.derived = DerivedQuantities::from_options(&options);
        self.scheduler =
            SubstepScheduler::new(options.fixed_time_interval, options.max_substeps_per_frame);
        self.pollers.reset();
        self.staged_boundaries = None;
        self.options = options;

        if let Some(state) = preserved {
            self.restore_state(state)?;
        }

        self.ready = true;
        let res = self.layouts.solver.resolution();
        let data = self.layouts.data.resolution();
        info!(
            "Initialized {} fluid: solver {}x{}x{}, data {}x{}x{}, {:?} precision, {} fields ({} bytes)",
            dimensionality,
            res[0],
            res[1],
            res[2],
            data[0],
            data[1],
            data[2],
            precision,
            summary.textures,
            summary.bytes
        );
        Ok(())
    }

    /// Re-runs `init` with the current options
    pub fn reinitialize(&mut self) -> FluidResult<()> {
        self.init(self.options.clone())
    }

    fn capture_state(&mut self) -> FluidResult<PreservedState> {
        let mut fields = Vec::new();
        for id in [
            FieldId::Velocity,
            FieldId::Pressure,
            FieldId::Boundaries,
            FieldId::Data,
        ] {
            let handle = self.fields.handle(id)?;
            fields.push((id, self.backend.read_texels(handle)?));
        }
        Ok(PreservedState { fields })
    }

    fn restore_state(&mut self, state: PreservedState) -> FluidResult<()> {
        for (id, texels) in state.fields {
            let handle = self.fields.handle(id)?;
            self.backend.write_texels(handle, &texels)?;
        }
        debug!("Restored velocity, pressure, boundaries and data after re-init");
        Ok(())
    }

    /// Advances the simulation by `delta_time` seconds
    ///
    /// Queued interactions are applied first, then zero or more fixed
    /// substeps run. Velocity pollers may block on a readback.
    pub fn update(&mut self, delta_time: f32) -> FluidResult<()> {
        if !self.ready {
            return Ok(());
        }

        self.stats = FrameStats::default();
        let dispatches_before = self.dispatch_total;
        let rebinds_before = self.fields.rebind_count();

        self.inject_ink_step()?;
        self.perturb_fluid_step()?;
        self.update_arbitrary_boundary_step()?;
        self.update_offset_step()?;

        let plan = self.scheduler.plan(delta_time);
        for _ in 0..plan.count {
            self.update_step(plan.step)?;
        }
        self.backend.flush()?;

        self.stats.substeps = plan.count;
        self.stats.dispatches = self.dispatch_total - dispatches_before;
        self.stats.rebinds = self.fields.rebind_count() - rebinds_before;
        debug!(
            "update dt={:.4}: {} substeps, {} dispatches, {} rebinds, carry {:.4}s",
            delta_time,
            plan.count,
            self.stats.dispatches,
            self.stats.rebinds,
            self.scheduler.accumulator()
        );
        Ok(())
    }

    /// Writes the visualization into the display field
    pub fn render(&mut self) -> FluidResult<()> {
        if !self.ready {
            return Ok(());
        }
        self.render_step()?;
        self.backend.flush()
    }

    /// Queues a box of ink
    ///
    /// # Arguments
    /// * `position` - World-space centre (z ignored in 2D)
    /// * `r`, `g`, `b` - Ink colour
    /// * `size` - Side length of the box in world units
    /// * `overwrite` - Replace the covered colour instead of adding to it
    pub fn inject(&mut self, position: Vector3<f32>, r: f32, g: f32, b: f32, size: f32, overwrite: bool) {
        self.interactions.push_injector(Injector {
            position,
            color: Vector3::new(r, g, b),
            size,
            overwrite,
        });
    }

    /// Queues a radial velocity impulse
    pub fn perturb(&mut self, position: Vector3<f32>, velocity: Vector3<f32>, size: f32) {
        self.interactions.push_perturber(Perturber {
            position,
            velocity,
            size,
        });
    }

    /// Queues a solid box
    pub fn add_arbitrary_boundary(&mut self, position: Vector3<f32>, size: f32) {
        self.interactions.push_boundary(Boundary { position, size });
    }

    /// Replaces the whole obstacle mask, one value per solver cell (> 0 = solid)
    ///
    /// 2D solvers stage the mask and swap it in at the start of the next
    /// `update`; 3D solvers write it immediately.
    pub fn set_boundary_mask(&mut self, mask: &[f32]) -> FluidResult<()> {
        if !self.ready {
            return Ok(());
        }
        let layout = self.layouts.solver;
        if mask.len() != layout.cell_count() {
            return Err(FluidError::resource(
                FieldId::Boundaries.label(),
                format!("mask has {} cells, grid has {}", mask.len(), layout.cell_count()),
            ));
        }
        let cells: Vec<[f32; 4]> = mask
            .iter()
            .map(|&m| if m > 0.0 { [1.0; 4] } else { [0.0; 4] })
            .collect();
        let texels = layout.scatter(&cells);

        match layout.dimensionality() {
            Dimensionality::Two => self.staged_boundaries = Some(texels),
            Dimensionality::Three => {
                let handle = self.fields.handle(FieldId::Boundaries)?;
                self.backend.write_texels(handle, &texels)?;
            }
        }
        Ok(())
    }

    pub fn attach_poller(&mut self, poller: Box<dyn VelocityPoller>) -> PollerHandle {
        self.pollers.attach(poller)
    }

    pub fn detach_poller(&mut self, handle: PollerHandle) -> Option<Box<dyn VelocityPoller>> {
        self.pollers.detach(handle)
    }

    pub fn size(&self) -> Vector3<f32> {
        self.options.size
    }

    /// Changes the domain size; the solver is unready until the next `init`
    pub fn set_size(&mut self, size: Vector3<f32>) {
        self.options.size = size;
        self.derived = DerivedQuantities::from_options(&self.options);
        self.ready = false;
    }

    pub fn resolution(&self) -> Vector3<u32> {
        self.options.solver_resolution
    }

    /// Changes the solver grid; the solver is unready until the next `init`
    pub fn set_resolution(&mut self, resolution: Vector3<u32>) {
        self.options.solver_resolution = resolution;
        self.derived = DerivedQuantities::from_options(&self.options);
        self.ready = false;
    }

    pub fn render_resolution(&self) -> Vector2<u32> {
        self.options.render_resolution
    }

    /// Changes the display grid; the solver is unready until the next `init`
    pub fn set_render_resolution(&mut self, resolution: Vector2<u32>) {
        self.options.render_resolution = resolution;
        self.derived = DerivedQuantities::from_options(&self.options);
        self.ready = false;
    }

    /// Weight of each ink channel in the buoyancy force (positive sinks)
    pub fn set_color_densities(&mut self, r: f32, g: f32, b: f32) {
        self.densities = Vector3::new(r, g, b);
    }

    pub fn color_densities(&self) -> Vector3<f32> {
        self.densities
    }

    /// Overwrites the velocity with a vortex around the domain centre
    pub fn generate_circular_vortex(&mut self) -> FluidResult<()> {
        if !self.ready {
            return Ok(());
        }
        let [rx, ry, _] = self.layouts.solver.resolution();
        let (rx, ry) = (rx as f32, ry as f32);
        let cells: Vec<[f32; 4]> = self
            .layouts
            .solver
            .cells()
            .map(|(x, y, _)| {
                [
                    -(y as f32 - ry / 2.0) / (ry + 1.0),
                    (x as f32 - rx / 2.0) / (rx + 1.0),
                    0.0,
                    0.0,
                ]
            })
            .collect();
        self.upload_field(FieldId::Velocity, &cells)
    }

    /// Overwrites the ink with a coloured checker pattern
    pub fn inject_checkered_data(&mut self) -> FluidResult<()> {
        if !self.ready {
            return Ok(());
        }
        let planar = self.layouts.data.dimensionality() == Dimensionality::Two;
        let on = |b: bool| if b { 1.0 } else { 0.0 };
        let cells: Vec<[f32; 4]> = self
            .layouts
            .data
            .cells()
            .map(|(i, j, k)| {
                if planar {
                    [
                        on(i % 20 < 10 && j % 20 < 10),
                        on(i % 20 > 10 && j % 20 < 10),
                        on(i % 20 < 10 && j % 20 > 10),
                        1.0,
                    ]
                } else {
                    [
                        on(i % 16 < 8 || j % 16 > 8),
                        on(j % 16 < 8 || k % 16 > 8),
                        on(k % 16 < 8 || i % 16 > 8),
                        1.0,
                    ]
                }
            })
            .collect();
        self.upload_field(FieldId::Data, &cells)
    }

    /// Reads a field back in x-fastest cell order
    ///
    /// # Returns
    /// `ResourceValidation` while the solver is not initialized
    pub fn read_field(&mut self, id: FieldId) -> FluidResult<Vec<[f32; 4]>> {
        if !self.fields.is_allocated() {
            return Err(FluidError::resource(id.label(), "solver is not initialized"));
        }
        let desc = self.fields.desc(id)?;
        let texels = self.backend.read_texels(self.fields.handle(id)?)?;
        Ok(desc.layout.gather(&texels))
    }

    /// Replaces a field from values in x-fastest cell order
    pub fn upload_field(&mut self, id: FieldId, cells: &[[f32; 4]]) -> FluidResult<()> {
        if !self.fields.is_allocated() {
            return Err(FluidError::resource(id.label(), "solver is not initialized"));
        }
        let desc = self.fields.desc(id)?;
        if cells.len() != desc.layout.cell_count() {
            return Err(FluidError::resource(
                id.label(),
                format!("expected {} cells, got {}", desc.layout.cell_count(), cells.len()),
            ));
        }
        let texels = desc.layout.scatter(cells);
        self.backend.write_texels(self.fields.handle(id)?, &texels)
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.stats
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn options(&self) -> &FluidOptions {
        &self.options
    }

    pub fn derived(&self) -> &DerivedQuantities {
        &self.derived
    }

    pub fn layouts(&self) -> &FieldLayouts {
        &self.layouts
    }

    pub fn dimensionality(&self) -> Dimensionality {
        self.options.dimensionality()
    }

    /// Number of attached velocity pollers
    pub fn poller_count(&self) -> usize {
        self.pollers.len()
    }

    /// Number of substeps since init, the counter that gates polling
    pub fn poll_frame(&self) -> u64 {
        self.pollers.poll_frame()
    }

    pub fn scheduler(&self) -> &SubstepScheduler {
        &self.scheduler
    }

    /// Interactions queued for the next update
    pub fn pending_interactions(&self) -> usize {
        self.interactions.pending()
    }

    /// Target changes since creation
    pub fn rebind_count(&self) -> u64 {
        self.fields.rebind_count()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

impl<B: ComputeBackend> Drop for Fluid<B> {
    fn drop(&mut self) {
        self.fields.release(&mut self.backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::error::ConfigurationError;
    use crate::kernels::KernelKind;
    use crate::options::SolverFlags;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use std::cell::Cell;
    use std::rc::Rc;

    fn small_2d() -> FluidOptions {
        FluidOptions::default_2d()
            .with_solver_resolution(Vector3::new(16, 16, 1))
            .with_render_resolution(Vector2::new(16, 16))
            .with_flags(SolverFlags::NONE | SolverFlags::DOUBLE_PRECISION)
            .with_fixed_time_interval(0.0)
            .with_diffuse_steps(4)
    }

    fn ready_fluid(options: FluidOptions) -> Fluid<CpuBackend> {
        let mut fluid = Fluid::new(CpuBackend::new());
        fluid.init(options).expect("init succeeds");
        fluid
    }

    fn data_at(fluid: &mut Fluid<CpuBackend>, x: u32, y: u32) -> [f32; 4] {
        let layout = fluid.layouts().data;
        fluid.read_field(FieldId::Data).unwrap()[layout.cell_index(x, y, 0)]
    }

    #[test]
    fn test_init_is_idempotent() {
        let mut once = ready_fluid(small_2d());
        let mut twice = ready_fluid(small_2d());
        twice.init(small_2d()).unwrap();

        assert_eq!(once.layouts(), twice.layouts());
        assert_eq!(once.backend().texture_count(), twice.backend().texture_count());
        for id in FieldId::ALL {
            let a = once.read_field(id).unwrap();
            let b = twice.read_field(id).unwrap();
            assert_eq!(a, b, "{id}");
            assert!(a.iter().all(|t| *t == [0.0; 4]), "{id} not zeroed");
        }
    }

    #[test]
    fn test_unready_solver_ignores_calls() {
        let mut fluid = Fluid::new(CpuBackend::new());
        fluid.inject(Vector3::new(0.5, 0.5, 0.0), 1.0, 0.0, 0.0, 0.1, false);
        assert!(fluid.update(0.1).is_ok());
        assert!(fluid.render().is_ok());
        assert_eq!(fluid.backend().dispatch_count(), 0);
        assert!(fluid.read_field(FieldId::Velocity).is_err());
    }

    #[test]
    fn test_resize_invalidates_readiness() {
        let mut fluid = ready_fluid(small_2d());
        fluid.set_size(Vector3::new(2.0, 2.0, 1.0));
        assert!(!fluid.is_ready());
        assert!((fluid.derived().solver_delta.x - 2.0 / 16.0).abs() < 1e-7);

        let before = fluid.backend().dispatch_count();
        fluid.update(0.1).unwrap();
        assert_eq!(fluid.backend().dispatch_count(), before);

        fluid.reinitialize().unwrap();
        assert!(fluid.is_ready());

        fluid.set_resolution(Vector3::new(8, 8, 1));
        assert!(!fluid.is_ready());
        fluid.reinitialize().unwrap();
        assert_eq!(fluid.layouts().solver.resolution(), [8, 8, 1]);
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let mut fluid = Fluid::new(CpuBackend::new());
        let err = fluid.init(small_2d().with_diffuse_steps(0)).unwrap_err();
        assert!(matches!(
            err,
            FluidError::Configuration(ConfigurationError::InvalidOptions(_))
        ));
        assert!(!fluid.is_ready());
    }

    #[test]
    fn test_missing_kernel_fails_init() {
        let mut fluid = Fluid::new(CpuBackend::without_kernels(&[KernelKind::Divergence]));
        let err = fluid.init(small_2d()).unwrap_err();
        assert!(matches!(
            err,
            FluidError::Configuration(ConfigurationError::ProgramLoadFailure { .. })
        ));
        assert!(!fluid.is_ready());
    }

    #[test]
    fn test_queued_injections_drain_once() {
        let mut fluid = ready_fluid(small_2d());
        for i in 0..5 {
            let x = 0.1 + 0.15 * i as f32;
            fluid.inject(Vector3::new(x, 0.5, 0.0), 0.25, 0.0, 0.0, 0.05, false);
        }
        assert_eq!(fluid.pending_interactions(), 5);

        fluid.update(0.0).unwrap();
        assert_eq!(fluid.frame_stats().ink_splats, 5);
        assert_eq!(fluid.frame_stats().substeps, 0);
        assert_eq!(fluid.pending_interactions(), 0);

        fluid.update(0.0).unwrap();
        assert_eq!(fluid.frame_stats().ink_splats, 0);
    }

    #[test]
    fn test_overwrite_order_decides_colour() {
        let centre = Vector3::new(0.5, 0.5, 0.0);

        let mut fluid = ready_fluid(small_2d());
        fluid.inject(centre, 0.5, 0.0, 0.0, 0.25, false);
        fluid.inject(centre, 0.0, 0.0, 1.0, 0.25, true);
        fluid.update(0.0).unwrap();
        assert_eq!(data_at(&mut fluid, 8, 8), [0.0, 0.0, 1.0, 1.0]);

        let mut fluid = ready_fluid(small_2d());
        fluid.inject(centre, 0.0, 0.0, 1.0, 0.25, true);
        fluid.inject(centre, 0.5, 0.0, 0.0, 0.25, false);
        fluid.update(0.0).unwrap();
        assert_eq!(data_at(&mut fluid, 8, 8), [0.5, 0.0, 1.0, 1.0]);
        // Outside the box nothing changed
        assert_eq!(data_at(&mut fluid, 1, 1), [0.0; 4]);
    }

    #[test]
    fn test_additive_injections_commute() {
        let centre = Vector3::new(0.5, 0.5, 0.0);
        let mut colours = vec![
            (0.25, 0.0, 0.0),
            (0.0, 0.5, 0.0),
            (0.0, 0.0, 0.125),
            (0.25, 0.25, 0.0),
        ];
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        let mut expected = None;
        for _ in 0..4 {
            colours.shuffle(&mut rng);
            let mut fluid = ready_fluid(small_2d());
            for &(r, g, b) in &colours {
                fluid.inject(centre, r, g, b, 0.25, false);
            }
            fluid.update(0.0).unwrap();
            let value = data_at(&mut fluid, 8, 8);
            assert_eq!(value, *expected.get_or_insert(value));
        }
        assert_eq!(expected, Some([0.5, 0.75, 0.125, 1.0]));
    }

    struct CountingPoller {
        polls: Rc<Cell<u32>>,
        last: Rc<Cell<[f32; 3]>>,
    }

    impl VelocityPoller for CountingPoller {
        fn position(&self) -> Vector3<f32> {
            Vector3::new(0.5, 0.5, 0.0)
        }

        fn update_velocity(&mut self, velocity: Vector3<f32>) {
            self.polls.set(self.polls.get() + 1);
            self.last.set(velocity.into());
        }
    }

    fn polls_after_substeps(substeps: u32) -> u32 {
        let mut fluid = ready_fluid(small_2d().with_diffuse_steps(1));
        let polls = Rc::new(Cell::new(0));
        fluid.attach_poller(Box::new(CountingPoller {
            polls: polls.clone(),
            last: Rc::new(Cell::new([0.0; 3])),
        }));
        for _ in 0..substeps {
            fluid.update(0.01).unwrap();
        }
        assert_eq!(fluid.poll_frame(), substeps as u64);
        polls.get()
    }

    #[test]
    fn test_poller_cadence() {
        assert_eq!(polls_after_substeps(1), 1);
        assert_eq!(polls_after_substeps(20), 1);
        assert_eq!(polls_after_substeps(21), 2);
        assert_eq!(polls_after_substeps(40), 2);
    }

    #[test]
    fn test_poller_reads_local_velocity() {
        let mut fluid = ready_fluid(small_2d().with_diffuse_steps(1));
        let cells = vec![[0.0, 0.0, 0.0, 0.0]; 256];
        fluid.upload_field(FieldId::Velocity, &cells).unwrap();

        let polls = Rc::new(Cell::new(0));
        let last = Rc::new(Cell::new([9.0; 3]));
        let handle = fluid.attach_poller(Box::new(CountingPoller {
            polls: polls.clone(),
            last: last.clone(),
        }));
        fluid.update(0.01).unwrap();
        assert_eq!(polls.get(), 1);
        assert_eq!(last.get(), [0.0; 3]);

        assert!(fluid.detach_poller(handle).is_some());
        assert_eq!(fluid.poller_count(), 0);
    }

    #[test]
    fn test_preserving_init_keeps_ink() {
        let mut fluid = ready_fluid(small_2d());
        fluid.inject(Vector3::new(0.5, 0.5, 0.0), 1.0, 0.0, 0.0, 0.25, true);
        fluid.update(0.0).unwrap();

        fluid
            .init_preserving(small_2d().with_diffuse_steps(8), true)
            .unwrap();
        assert_eq!(data_at(&mut fluid, 8, 8), [1.0, 0.0, 0.0, 1.0]);

        fluid.init(small_2d()).unwrap();
        assert_eq!(data_at(&mut fluid, 8, 8), [0.0; 4]);
    }

    #[test]
    fn test_boundary_splat_marks_solid_cells() {
        let mut fluid = ready_fluid(small_2d());
        fluid.add_arbitrary_boundary(Vector3::new(0.5, 0.5, 0.0), 0.25);
        fluid.update(0.0).unwrap();
        assert_eq!(fluid.frame_stats().boundary_splats, 1);

        let layout = fluid.layouts().solver;
        let mask = fluid.read_field(FieldId::Boundaries).unwrap();
        assert!(mask[layout.cell_index(8, 8, 0)][0] > 0.0);
        assert_eq!(mask[layout.cell_index(2, 2, 0)][0], 0.0);

        let offsets = fluid.read_field(FieldId::Offsets).unwrap();
        // Left face of the obstacle mirrors the fluid cell to its left
        assert_eq!(offsets[layout.cell_index(6, 8, 0)], [-1.0, 0.0, 0.0, 1.0]);
        assert_eq!(offsets[layout.cell_index(3, 3, 0)], [0.0; 4]);
    }

    #[test]
    fn test_staged_boundary_mask_applies_on_update() {
        let mut fluid = ready_fluid(small_2d());
        let mut mask = vec![0.0; 256];
        mask[5 * 16 + 5] = 1.0;
        fluid.set_boundary_mask(&mask).unwrap();

        let layout = fluid.layouts().solver;
        let before = fluid.read_field(FieldId::Boundaries).unwrap();
        assert_eq!(before[layout.cell_index(5, 5, 0)][0], 0.0);

        fluid.update(0.0).unwrap();
        let after = fluid.read_field(FieldId::Boundaries).unwrap();
        assert_eq!(after[layout.cell_index(5, 5, 0)][0], 1.0);
        assert_eq!(after[layout.cell_index(6, 5, 0)][0], 0.0);
    }

    #[test]
    fn test_volume_ink_lands_in_the_right_slice() {
        let options = FluidOptions::default_3d()
            .with_solver_resolution(Vector3::new(8, 8, 12))
            .with_flags(SolverFlags::NONE | SolverFlags::DOUBLE_PRECISION)
            .with_fixed_time_interval(0.0);
        let mut fluid = ready_fluid(options);
        let size = fluid.size();
        // Centre of cell (2, 3, 9)
        let position = Vector3::new(2.5 / 8.0 * size.x, 3.5 / 8.0 * size.y, 9.5 / 12.0 * size.z);
        fluid.inject(position, 1.0, 0.0, 0.0, 0.01, true);
        fluid.update(0.0).unwrap();

        let layout = fluid.layouts().data;
        let data = fluid.read_field(FieldId::Data).unwrap();
        assert_eq!(data[layout.cell_index(2, 3, 9)], [1.0, 0.0, 0.0, 1.0]);
        let inked = data.iter().filter(|t| t[0] > 0.0).count();
        assert_eq!(inked, 1);
    }

    #[test]
    fn test_checkered_and_vortex_initial_conditions() {
        let mut fluid = ready_fluid(small_2d());
        fluid.inject_checkered_data().unwrap();
        assert_eq!(data_at(&mut fluid, 0, 0), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(data_at(&mut fluid, 12, 2), [0.0, 1.0, 0.0, 1.0]);

        fluid.generate_circular_vortex().unwrap();
        let velocity = fluid.read_field(FieldId::Velocity).unwrap();
        let layout = fluid.layouts().solver;
        // Flow circles the centre counter-clockwise
        assert!(velocity[layout.cell_index(8, 2, 0)][0] > 0.0);
        assert!(velocity[layout.cell_index(14, 8, 0)][1] > 0.0);
    }

    #[test]
    fn test_render_writes_display_only() {
        let mut fluid = ready_fluid(small_2d());
        fluid.inject(Vector3::new(0.5, 0.5, 0.0), 0.0, 1.0, 0.0, 0.25, true);
        fluid.update(0.0).unwrap();
        let data_before = fluid.read_field(FieldId::Data).unwrap();

        fluid.render().unwrap();
        let display = fluid.read_field(FieldId::Display).unwrap();
        let layout = fluid.layouts().render;
        assert_eq!(display[layout.cell_index(8, 8, 0)], [0.0, 1.0, 0.0, 1.0]);
        assert_eq!(fluid.read_field(FieldId::Data).unwrap(), data_before);
    }

    #[test]
    fn test_update_reports_rebinds_and_dispatches() {
        let mut fluid = ready_fluid(small_2d());
        fluid.update(0.01).unwrap();
        let stats = fluid.frame_stats();
        assert_eq!(stats.substeps, 1);
        assert!(stats.dispatches > 0);
        assert!(stats.rebinds <= stats.dispatches);
    }
}
