//! # Compute Kernels
//!
//! A [`Kernel`] is one stage program plus the values bound to its declared
//! parameters. Kernels are produced by [`KernelLoader`], one factory per
//! stage, and owned by a [`KernelSet`] for the lifetime of a solver
//! configuration.
//!
//! ## Parameter contract
//!
//! - Setting a name the kernel never declared is an `InvalidParameter` error
//! - Binding a kernel whose program failed to load is a `ProgramLoadFailure`
//! - Declared parameters left unset at dispatch time read as zero
//! - Unbinding clears every bound value, so no state leaks between dispatches

pub mod params;

use log::{error, trace};

use crate::backend::{ComputeBackend, TextureHandle};
use crate::error::{FluidError, FluidResult};
use crate::grid::Dimensionality;
use crate::options::Precision;

pub use params::{signature, KernelSignature};

/// Texture inputs a kernel can sample
pub const MAX_TEXTURE_INPUTS: usize = 4;
/// Four-float uniform slots a kernel can declare
pub const MAX_VECTOR_PARAMS: usize = 4;

/// Every stage program the solver dispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelKind {
    Copy,
    Advect,
    Vorticity,
    SplatVelocity,
    Buoyancy,
    BoundaryScalar,
    BoundaryVector,
    Offsets,
    JacobiScalar,
    JacobiVector,
    ZCull,
    Divergence,
    SubtractGradient,
    SplatInk,
    SplatBoundary,
    Render,
}

impl KernelKind {
    pub const ALL: [KernelKind; 16] = [
        KernelKind::Copy,
        KernelKind::Advect,
        KernelKind::Vorticity,
        KernelKind::SplatVelocity,
        KernelKind::Buoyancy,
        KernelKind::BoundaryScalar,
        KernelKind::BoundaryVector,
        KernelKind::Offsets,
        KernelKind::JacobiScalar,
        KernelKind::JacobiVector,
        KernelKind::ZCull,
        KernelKind::Divergence,
        KernelKind::SubtractGradient,
        KernelKind::SplatInk,
        KernelKind::SplatBoundary,
        KernelKind::Render,
    ];

    /// WGSL entry point, also used as the kernel's name in errors
    pub fn entry_point(self) -> &'static str {
        match self {
            KernelKind::Copy => "copy",
            KernelKind::Advect => "advect",
            KernelKind::Vorticity => "vorticity",
            KernelKind::SplatVelocity => "splat_velocity",
            KernelKind::Buoyancy => "buoyancy",
            KernelKind::BoundaryScalar => "boundary_scalar",
            KernelKind::BoundaryVector => "boundary_vector",
            KernelKind::Offsets => "offsets",
            KernelKind::JacobiScalar => "jacobi_scalar",
            KernelKind::JacobiVector => "jacobi_vector",
            KernelKind::ZCull => "zcull",
            KernelKind::Divergence => "divergence",
            KernelKind::SubtractGradient => "subtract_gradient",
            KernelKind::SplatInk => "splat_ink",
            KernelKind::SplatBoundary => "splat_boundary",
            KernelKind::Render => "render",
        }
    }

    pub fn signature(self) -> KernelSignature {
        params::signature(self)
    }
}

impl std::fmt::Display for KernelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.entry_point())
    }
}

/// A loaded stage program and its bound parameter values
#[derive(Debug, Clone)]
pub struct Kernel {
    kind: KernelKind,
    signature: KernelSignature,
    load_error: Option<String>,
    vectors: [[f32; 4]; MAX_VECTOR_PARAMS],
    vectors_set: [bool; MAX_VECTOR_PARAMS],
    textures: [Option<TextureHandle>; MAX_TEXTURE_INPUTS],
    bound: bool,
}

impl Kernel {
    fn new(kind: KernelKind, load_error: Option<String>) -> Self {
        Self {
            kind,
            signature: kind.signature(),
            load_error,
            vectors: [[0.0; 4]; MAX_VECTOR_PARAMS],
            vectors_set: [false; MAX_VECTOR_PARAMS],
            textures: [None; MAX_TEXTURE_INPUTS],
            bound: false,
        }
    }

    pub fn kind(&self) -> KernelKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.entry_point()
    }

    pub fn is_loaded(&self) -> bool {
        self.load_error.is_none()
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Makes the kernel current
    ///
    /// # Returns
    /// `ProgramLoadFailure` if the program never compiled
    pub fn bind(&mut self) -> FluidResult<()> {
        if let Some(reason) = &self.load_error {
            return Err(FluidError::program_load_failure(self.name(), reason.clone()));
        }
        self.bound = true;
        Ok(())
    }

    /// Releases the kernel and forgets every bound value
    pub fn unbind(&mut self) {
        self.vectors = [[0.0; 4]; MAX_VECTOR_PARAMS];
        self.vectors_set = [false; MAX_VECTOR_PARAMS];
        self.textures = [None; MAX_TEXTURE_INPUTS];
        self.bound = false;
    }

    /// Sets a vector parameter from 1 to 4 floats; missing components are 0
    ///
    /// # Arguments
    /// * `name` - Declared parameter name
    /// * `values` - Between one and four components
    pub fn set_param(&mut self, name: &str, values: &[f32]) -> FluidResult<()> {
        let slot = self
            .signature
            .vector_slot(name)
            .ok_or_else(|| FluidError::invalid_parameter(self.name(), name))?;
        if values.is_empty() || values.len() > 4 {
            return Err(FluidError::invalid_parameter(
                self.name(),
                format!("{name} ({} components)", values.len()),
            ));
        }

        let mut packed = [0.0; 4];
        packed[..values.len()].copy_from_slice(values);
        self.vectors[slot] = packed;
        self.vectors_set[slot] = true;
        Ok(())
    }

    pub fn set_scalar(&mut self, name: &str, value: f32) -> FluidResult<()> {
        self.set_param(name, &[value])
    }

    /// Binds a texture to a declared sampler slot, enabling sampling from it
    pub fn set_texture(&mut self, name: &str, texture: TextureHandle) -> FluidResult<()> {
        let slot = self
            .signature
            .texture_slot(name)
            .ok_or_else(|| FluidError::invalid_parameter(self.name(), name))?;
        self.textures[slot] = Some(texture);
        Ok(())
    }

    pub fn vectors(&self) -> &[[f32; 4]; MAX_VECTOR_PARAMS] {
        if log::log_enabled!(log::Level::Trace) {
            for (slot, name) in self.signature.vectors.iter().enumerate() {
                if !self.vectors_set[slot] {
                    trace!("{}: parameter `{}` unset, reading zero", self.name(), name);
                }
            }
        }
        &self.vectors
    }

    pub fn textures(&self) -> [Option<TextureHandle>; MAX_TEXTURE_INPUTS] {
        self.textures
    }
}

/// Factory with one constructor per solver stage
pub struct KernelLoader<'a, B: ComputeBackend> {
    backend: &'a mut B,
    precision: Precision,
}

impl<'a, B: ComputeBackend> KernelLoader<'a, B> {
    pub fn new(backend: &'a mut B, precision: Precision) -> Self {
        Self { backend, precision }
    }

    fn load(&mut self, kind: KernelKind) -> Kernel {
        match self.backend.load_kernel(kind, self.precision) {
            Ok(()) => Kernel::new(kind, None),
            Err(err) => {
                error!("Could not load kernel `{}`: {}", kind, err);
                Kernel::new(kind, Some(err.to_string()))
            }
        }
    }

    pub fn copy(&mut self) -> Kernel {
        self.load(KernelKind::Copy)
    }

    pub fn advect(&mut self) -> Kernel {
        self.load(KernelKind::Advect)
    }

    pub fn vorticity(&mut self) -> Kernel {
        self.load(KernelKind::Vorticity)
    }

    pub fn splat_velocity(&mut self) -> Kernel {
        self.load(KernelKind::SplatVelocity)
    }

    pub fn buoyancy(&mut self) -> Kernel {
        self.load(KernelKind::Buoyancy)
    }

    pub fn boundary_scalar(&mut self) -> Kernel {
        self.load(KernelKind::BoundaryScalar)
    }

    pub fn boundary_vector(&mut self) -> Kernel {
        self.load(KernelKind::BoundaryVector)
    }

    pub fn offsets(&mut self) -> Kernel {
        self.load(KernelKind::Offsets)
    }

    pub fn jacobi_scalar(&mut self) -> Kernel {
        self.load(KernelKind::JacobiScalar)
    }

    pub fn jacobi_vector(&mut self) -> Kernel {
        self.load(KernelKind::JacobiVector)
    }

    pub fn zcull(&mut self) -> Kernel {
        self.load(KernelKind::ZCull)
    }

    pub fn divergence(&mut self) -> Kernel {
        self.load(KernelKind::Divergence)
    }

    pub fn subtract_gradient(&mut self) -> Kernel {
        self.load(KernelKind::SubtractGradient)
    }

    pub fn splat_ink(&mut self) -> Kernel {
        self.load(KernelKind::SplatInk)
    }

    pub fn splat_boundary(&mut self) -> Kernel {
        self.load(KernelKind::SplatBoundary)
    }

    pub fn render(&mut self) -> Kernel {
        self.load(KernelKind::Render)
    }
}

/// Every kernel one solver configuration dispatches
#[derive(Debug, Clone)]
pub struct SolverKernels {
    pub copy: Kernel,
    pub advect: Kernel,
    pub vorticity: Kernel,
    pub splat_velocity: Kernel,
    pub buoyancy: Kernel,
    pub boundary_scalar: Kernel,
    pub boundary_vector: Kernel,
    pub offsets: Kernel,
    pub jacobi_scalar: Kernel,
    pub jacobi_vector: Kernel,
    pub zcull: Kernel,
    pub divergence: Kernel,
    pub subtract_gradient: Kernel,
    pub splat_ink: Kernel,
    pub splat_boundary: Kernel,
    pub render: Kernel,
}

impl SolverKernels {
    fn load<B: ComputeBackend>(loader: &mut KernelLoader<'_, B>) -> Self {
        Self {
            copy: loader.copy(),
            advect: loader.advect(),
            vorticity: loader.vorticity(),
            splat_velocity: loader.splat_velocity(),
            buoyancy: loader.buoyancy(),
            boundary_scalar: loader.boundary_scalar(),
            boundary_vector: loader.boundary_vector(),
            offsets: loader.offsets(),
            jacobi_scalar: loader.jacobi_scalar(),
            jacobi_vector: loader.jacobi_vector(),
            zcull: loader.zcull(),
            divergence: loader.divergence(),
            subtract_gradient: loader.subtract_gradient(),
            splat_ink: loader.splat_ink(),
            splat_boundary: loader.splat_boundary(),
            render: loader.render(),
        }
    }

    fn get_mut(&mut self, kind: KernelKind) -> &mut Kernel {
        match kind {
            KernelKind::Copy => &mut self.copy,
            KernelKind::Advect => &mut self.advect,
            KernelKind::Vorticity => &mut self.vorticity,
            KernelKind::SplatVelocity => &mut self.splat_velocity,
            KernelKind::Buoyancy => &mut self.buoyancy,
            KernelKind::BoundaryScalar => &mut self.boundary_scalar,
            KernelKind::BoundaryVector => &mut self.boundary_vector,
            KernelKind::Offsets => &mut self.offsets,
            KernelKind::JacobiScalar => &mut self.jacobi_scalar,
            KernelKind::JacobiVector => &mut self.jacobi_vector,
            KernelKind::ZCull => &mut self.zcull,
            KernelKind::Divergence => &mut self.divergence,
            KernelKind::SubtractGradient => &mut self.subtract_gradient,
            KernelKind::SplatInk => &mut self.splat_ink,
            KernelKind::SplatBoundary => &mut self.splat_boundary,
            KernelKind::Render => &mut self.render,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Kernel> {
        [
            &self.copy,
            &self.advect,
            &self.vorticity,
            &self.splat_velocity,
            &self.buoyancy,
            &self.boundary_scalar,
            &self.boundary_vector,
            &self.offsets,
            &self.jacobi_scalar,
            &self.jacobi_vector,
            &self.zcull,
            &self.divergence,
            &self.subtract_gradient,
            &self.splat_ink,
            &self.splat_boundary,
            &self.render,
        ]
        .into_iter()
    }
}

/// Kernel set for one dimensionality
///
/// The variant selects how the shared pipeline addresses its grids: planar
/// kernels address textures directly, volumetric kernels go through the
/// slab atlas.
#[derive(Debug, Clone)]
pub enum KernelSet {
    Planar(SolverKernels),
    Volumetric(SolverKernels),
}

impl KernelSet {
    /// Loads every stage kernel through the backend
    pub fn load<B: ComputeBackend>(
        backend: &mut B,
        dimensionality: Dimensionality,
        precision: Precision,
    ) -> Self {
        let mut loader = KernelLoader::new(backend, precision);
        let kernels = SolverKernels::load(&mut loader);
        match dimensionality {
            Dimensionality::Two => KernelSet::Planar(kernels),
            Dimensionality::Three => KernelSet::Volumetric(kernels),
        }
    }

    pub fn dimensionality(&self) -> Dimensionality {
        match self {
            KernelSet::Planar(_) => Dimensionality::Two,
            KernelSet::Volumetric(_) => Dimensionality::Three,
        }
    }

    fn kernels(&self) -> &SolverKernels {
        match self {
            KernelSet::Planar(kernels) | KernelSet::Volumetric(kernels) => kernels,
        }
    }

    pub fn get_mut(&mut self, kind: KernelKind) -> &mut Kernel {
        match self {
            KernelSet::Planar(kernels) | KernelSet::Volumetric(kernels) => kernels.get_mut(kind),
        }
    }

    /// First kernel that failed to load, as the error binding it would raise
    pub fn load_failure(&self) -> Option<FluidError> {
        self.kernels().iter().find(|k| !k.is_loaded()).map(|k| {
            FluidError::program_load_failure(
                k.name(),
                k.load_error.clone().unwrap_or_default(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::error::ConfigurationError;

    #[test]
    fn test_undeclared_parameter_is_rejected() {
        let mut backend = CpuBackend::new();
        let mut kernel = KernelLoader::new(&mut backend, Precision::Full).advect();

        let err = kernel.set_param("viscosity", &[1.0]).unwrap_err();
        assert_eq!(
            err,
            FluidError::Configuration(ConfigurationError::InvalidParameter {
                kernel: "advect".into(),
                parameter: "viscosity".into(),
            })
        );
        assert!(kernel.set_texture("pressure", TextureHandle::new(0)).is_err());
    }

    #[test]
    fn test_parameters_pack_into_declared_slots() {
        let mut backend = CpuBackend::new();
        let mut kernel = KernelLoader::new(&mut backend, Precision::Full).advect();

        kernel.set_param("scale", &[2.0, 3.0]).unwrap();
        kernel.set_scalar("timestep", 0.5).unwrap();
        kernel.set_texture("data", TextureHandle::new(7)).unwrap();

        assert_eq!(kernel.vectors()[1], [2.0, 3.0, 0.0, 0.0]);
        assert_eq!(kernel.vectors()[2], [0.5, 0.0, 0.0, 0.0]);
        assert_eq!(kernel.textures()[1], Some(TextureHandle::new(7)));

        assert!(kernel.set_param("scale", &[]).is_err());
        assert!(kernel.set_param("scale", &[1.0; 5]).is_err());
    }

    #[test]
    fn test_unbind_clears_bound_values() {
        let mut backend = CpuBackend::new();
        let mut kernel = KernelLoader::new(&mut backend, Precision::Full).copy();
        kernel.bind().unwrap();
        kernel.set_texture("source", TextureHandle::new(3)).unwrap();
        kernel.unbind();
        assert!(!kernel.is_bound());
        assert_eq!(kernel.textures(), [None; MAX_TEXTURE_INPUTS]);
    }

    #[test]
    fn test_binding_failed_kernel_is_fatal() {
        let mut backend = CpuBackend::without_kernels(&[KernelKind::Vorticity]);
        let mut set = KernelSet::load(&mut backend, Dimensionality::Two, Precision::Full);

        assert!(set.get_mut(KernelKind::Advect).bind().is_ok());
        let err = set.get_mut(KernelKind::Vorticity).bind().unwrap_err();
        assert!(matches!(
            err,
            FluidError::Configuration(ConfigurationError::ProgramLoadFailure { ref kernel, .. })
                if kernel == "vorticity"
        ));
        assert!(set.load_failure().is_some());
    }

    #[test]
    fn test_kernel_set_variant_follows_dimensionality() {
        let mut backend = CpuBackend::new();
        let planar = KernelSet::load(&mut backend, Dimensionality::Two, Precision::Half);
        assert_eq!(planar.dimensionality(), Dimensionality::Two);
        let volumetric = KernelSet::load(&mut backend, Dimensionality::Three, Precision::Half);
        assert_eq!(volumetric.dimensionality(), Dimensionality::Three);
        assert!(volumetric.load_failure().is_none());
    }
}
