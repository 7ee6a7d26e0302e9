//! # Compute Backends
//!
//! The solver never touches device memory directly. It allocates textures,
//! loads kernels and issues dispatches through [`ComputeBackend`], which has
//! two implementations:
//!
//! - [`WgpuBackend`]: WGSL compute pipelines over `wgpu` textures
//! - [`CpuBackend`]: the same kernels evaluated on host texel arrays, used as
//!   the numerical reference and for deterministic tests
//!
//! Both store every field as a 2D texture in atlas order (see
//! [`crate::grid::atlas`]) and apply the same precision rules.

pub mod cpu;
pub mod gpu;

pub use cpu::CpuBackend;
pub use gpu::WgpuBackend;

use crate::error::FluidResult;
use crate::grid::GridLayout;
use crate::kernels::{KernelKind, MAX_TEXTURE_INPUTS, MAX_VECTOR_PARAMS};
use crate::options::Precision;

/// Opaque reference to a texture owned by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(u32);

impl TextureHandle {
    pub(crate) fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn id(self) -> u32 {
        self.0
    }
}

/// Shape and storage format of a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: &'static str,
    pub layout: GridLayout,
    /// 1 for scalar fields, 4 for vector and colour fields
    pub components: u32,
    pub precision: Precision,
}

impl TextureDesc {
    pub fn byte_size(&self) -> u64 {
        self.layout.texel_count() as u64
            * self.components as u64
            * self.precision.bytes_per_component()
    }

    /// `true` when two textures can exchange roles in a ping-pong swap
    pub fn is_compatible(&self, other: &TextureDesc) -> bool {
        self.layout == other.layout
            && self.components == other.components
            && self.precision == other.precision
    }
}

/// One kernel invocation covering every cell of the target grid
#[derive(Debug, Clone)]
pub struct Dispatch<'a> {
    pub kernel: KernelKind,
    /// Vector parameters in declaration order, unused slots zeroed
    pub params: &'a [[f32; 4]; MAX_VECTOR_PARAMS],
    /// Texture parameters in declaration order
    pub inputs: [Option<TextureHandle>; MAX_TEXTURE_INPUTS],
    pub target: TextureHandle,
    pub target_layout: GridLayout,
    /// Layout of the solver volume, used to address volumetric inputs
    pub source_layout: GridLayout,
}

/// Capability the solver needs from an execution device
pub trait ComputeBackend {
    /// Short name used in log output
    fn name(&self) -> &'static str;

    /// Compiles a kernel for the given precision if not already compiled
    ///
    /// # Returns
    /// `ProgramLoadFailure` carrying the compiler's reason on failure
    fn load_kernel(&mut self, kernel: KernelKind, precision: Precision) -> FluidResult<()>;

    /// Allocates a zero-filled texture
    fn create_texture(&mut self, desc: &TextureDesc) -> FluidResult<TextureHandle>;

    fn release_texture(&mut self, handle: TextureHandle);

    /// Number of live textures
    fn texture_count(&self) -> usize;

    /// Records or runs a dispatch; dispatches execute in submission order
    fn dispatch(&mut self, dispatch: &Dispatch<'_>) -> FluidResult<()>;

    /// Replaces every texel, in atlas order
    fn write_texels(&mut self, handle: TextureHandle, texels: &[[f32; 4]]) -> FluidResult<()>;

    /// Reads every texel in atlas order, blocking until pending work finishes
    fn read_texels(&mut self, handle: TextureHandle) -> FluidResult<Vec<[f32; 4]>>;

    /// Reads one texel, blocking until pending work finishes
    fn read_texel(&mut self, handle: TextureHandle, x: u32, y: u32) -> FluidResult<[f32; 4]>;

    /// Submits all recorded work
    fn flush(&mut self) -> FluidResult<()>;
}
