//! # Grid Field Store
//!
//! Owns every texture the solver reads or writes and maps solver roles
//! ([`FieldId`]) onto backend texture handles.
//!
//! ## Ping-pong discipline
//!
//! A dispatch never reads the texture it writes. Stages write into a scratch
//! role and then exchange identities with [`FieldStore::swap`], which moves no
//! data. Exactly one texture is bound as the write target at a time, and
//! binding the already-bound texture again is elided.

use std::collections::HashMap;

use log::{debug, info};

use crate::backend::{ComputeBackend, TextureDesc, TextureHandle};
use crate::error::{FluidError, FluidResult};
use crate::grid::GridLayout;
use crate::options::{FluidOptions, Precision};

/// Grid a field is sized to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GridKind {
    Solver,
    /// Ink grid: render resolution in 2D, solver resolution in 3D
    Data,
    /// Flat display image
    Render,
}

/// Role of a field in the solver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldId {
    Velocity,
    SolverScratch,
    Boundaries,
    BoundaryScratch,
    Offsets,
    VelocityRhs,
    Pressure,
    Divergence,
    ScalarScratch,
    Occupancy,
    Data,
    DataScratch,
    DataRhs,
    Display,
}

impl FieldId {
    pub const ALL: [FieldId; 14] = [
        FieldId::Velocity,
        FieldId::SolverScratch,
        FieldId::Boundaries,
        FieldId::BoundaryScratch,
        FieldId::Offsets,
        FieldId::VelocityRhs,
        FieldId::Pressure,
        FieldId::Divergence,
        FieldId::ScalarScratch,
        FieldId::Occupancy,
        FieldId::Data,
        FieldId::DataScratch,
        FieldId::DataRhs,
        FieldId::Display,
    ];

    pub fn components(self) -> u32 {
        match self {
            FieldId::Pressure
            | FieldId::Divergence
            | FieldId::ScalarScratch
            | FieldId::Occupancy => 1,
            _ => 4,
        }
    }

    pub fn grid(self) -> GridKind {
        match self {
            FieldId::Data | FieldId::DataScratch | FieldId::DataRhs => GridKind::Data,
            FieldId::Display => GridKind::Render,
            _ => GridKind::Solver,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FieldId::Velocity => "velocity",
            FieldId::SolverScratch => "solver_scratch",
            FieldId::Boundaries => "boundaries",
            FieldId::BoundaryScratch => "boundary_scratch",
            FieldId::Offsets => "offsets",
            FieldId::VelocityRhs => "velocity_rhs",
            FieldId::Pressure => "pressure",
            FieldId::Divergence => "divergence",
            FieldId::ScalarScratch => "scalar_scratch",
            FieldId::Occupancy => "occupancy",
            FieldId::Data => "data",
            FieldId::DataScratch => "data_scratch",
            FieldId::DataRhs => "data_rhs",
            FieldId::Display => "display",
        }
    }
}

impl std::fmt::Display for FieldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Layouts of the three grids a solver instance uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayouts {
    pub solver: GridLayout,
    pub data: GridLayout,
    pub render: GridLayout,
}

impl FieldLayouts {
    pub fn from_options(options: &FluidOptions) -> Self {
        let res = options.solver_resolution;
        let solver = GridLayout::for_resolution(res.x, res.y, res.z);
        let render = GridLayout::flat(options.render_resolution.x, options.render_resolution.y);
        let data = match solver.dimensionality() {
            crate::grid::Dimensionality::Two => render,
            crate::grid::Dimensionality::Three => solver,
        };
        Self {
            solver,
            data,
            render,
        }
    }

    pub fn layout(&self, grid: GridKind) -> GridLayout {
        match grid {
            GridKind::Solver => self.solver,
            GridKind::Data => self.data,
            GridKind::Render => self.render,
        }
    }
}

/// Totals reported after allocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationSummary {
    pub textures: usize,
    pub bytes: u64,
}

/// Role → texture mapping with render-target tracking
#[derive(Debug, Default)]
pub struct FieldStore {
    handles: HashMap<FieldId, TextureHandle>,
    descs: HashMap<TextureHandle, TextureDesc>,
    bound: Option<TextureHandle>,
    rebinds: u64,
}

impl FieldStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Releases any previous allocation, then creates every field zero-filled
    ///
    /// # Arguments
    /// * `backend` - Backend that owns the textures
    /// * `layouts` - Grid layouts derived from the options
    /// * `precision` - Storage precision for every field
    pub fn allocate<B: ComputeBackend>(
        &mut self,
        backend: &mut B,
        layouts: &FieldLayouts,
        precision: Precision,
    ) -> FluidResult<AllocationSummary> {
        self.release(backend);

        for id in FieldId::ALL {
            let desc = TextureDesc {
                label: id.label(),
                layout: layouts.layout(id.grid()),
                components: id.components(),
                precision,
            };
            let handle = backend.create_texture(&desc)?;
            self.handles.insert(id, handle);
            self.descs.insert(handle, desc);
        }

        let summary = self.summary();
        info!(
            "Allocated {} fields ({:.2} MiB) on {} backend",
            summary.textures,
            summary.bytes as f64 / (1024.0 * 1024.0),
            backend.name()
        );
        Ok(summary)
    }

    /// Frees every field; all handles become invalid
    pub fn release<B: ComputeBackend>(&mut self, backend: &mut B) {
        if self.handles.is_empty() {
            return;
        }
        let released = self.handles.len();
        for (_, handle) in self.handles.drain() {
            backend.release_texture(handle);
        }
        self.descs.clear();
        self.bound = None;
        debug!("Released {} fields", released);
    }

    pub fn is_allocated(&self) -> bool {
        !self.handles.is_empty()
    }

    pub fn handle(&self, id: FieldId) -> FluidResult<TextureHandle> {
        self.handles
            .get(&id)
            .copied()
            .ok_or_else(|| FluidError::resource(id.label(), "field is not allocated"))
    }

    pub fn desc(&self, id: FieldId) -> FluidResult<TextureDesc> {
        let handle = self.handle(id)?;
        self.descs
            .get(&handle)
            .copied()
            .ok_or_else(|| FluidError::resource(id.label(), "texture has no descriptor"))
    }

    /// Exchanges the textures behind two roles
    ///
    /// # Returns
    /// `ResourceValidation` when the textures differ in shape or format
    pub fn swap(&mut self, a: FieldId, b: FieldId) -> FluidResult<()> {
        let (desc_a, desc_b) = (self.desc(a)?, self.desc(b)?);
        if !desc_a.is_compatible(&desc_b) {
            return Err(FluidError::resource(
                a.label(),
                format!("cannot swap with `{}`: layouts differ", b.label()),
            ));
        }

        let handle_a = self.handle(a)?;
        let handle_b = self.handle(b)?;
        self.handles.insert(a, handle_b);
        self.handles.insert(b, handle_a);
        Ok(())
    }

    /// Makes `id` the active write target, eliding redundant rebinds
    ///
    /// # Returns
    /// The texture now bound
    pub fn bind_target(&mut self, id: FieldId) -> FluidResult<TextureHandle> {
        let handle = self.handle(id)?;
        if self.bound != Some(handle) {
            self.bound = Some(handle);
            self.rebinds += 1;
        }
        Ok(handle)
    }

    pub fn bound_target(&self) -> Option<TextureHandle> {
        self.bound
    }

    /// Number of target changes since creation
    pub fn rebind_count(&self) -> u64 {
        self.rebinds
    }

    pub fn summary(&self) -> AllocationSummary {
        AllocationSummary {
            textures: self.descs.len(),
            bytes: self.descs.values().map(TextureDesc::byte_size).sum(),
        }
    }
}
