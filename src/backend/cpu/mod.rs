//! # CPU Reference Backend
//!
//! Runs every solver kernel on host memory with the addressing and precision
//! rules of the GPU backend. Dispatches execute immediately, so reads never
//! block on pending work.
//!
//! Textures store exactly as many components as their field declares;
//! half-precision textures round every stored component through `f16`.

mod kernels;

use std::collections::{HashMap, HashSet};

use cgmath::Vector4;
use log::trace;

use crate::backend::{ComputeBackend, Dispatch, TextureDesc, TextureHandle};
use crate::error::{FluidError, FluidResult};
use crate::kernels::{KernelKind, MAX_TEXTURE_INPUTS};
use crate::options::Precision;

use kernels::Evaluation;

/// Host-side texel storage for one texture
#[derive(Debug, Clone)]
pub(crate) struct CpuTexture {
    desc: TextureDesc,
    values: Vec<f32>,
}

impl CpuTexture {
    fn new(desc: TextureDesc) -> Self {
        let len = desc.layout.texel_count() * desc.components as usize;
        Self {
            desc,
            values: vec![0.0; len],
        }
    }

    fn stride(&self) -> usize {
        self.desc.components as usize
    }

    fn texel(&self, index: usize) -> Vector4<f32> {
        let stride = self.stride();
        let mut out = [0.0f32; 4];
        out[..stride].copy_from_slice(&self.values[index * stride..(index + 1) * stride]);
        Vector4::new(out[0], out[1], out[2], out[3])
    }

    fn store(&mut self, index: usize, value: Vector4<f32>) {
        let stride = self.stride();
        let precision = self.desc.precision;
        let value: [f32; 4] = value.into();
        for (slot, component) in self.values[index * stride..(index + 1) * stride]
            .iter_mut()
            .zip(value.iter())
        {
            *slot = precision.quantize(*component);
        }
    }

    /// Cell value with coordinates clamped to the grid
    pub(crate) fn fetch(&self, cell: [i32; 3]) -> Vector4<f32> {
        let res = self.desc.layout.resolution();
        let clamp = |v: i32, r: u32| v.clamp(0, r as i32 - 1) as u32;
        let index = self.desc.layout.texel_index(
            clamp(cell[0], res[0]),
            clamp(cell[1], res[1]),
            clamp(cell[2], res[2]),
        );
        self.texel(index)
    }
}

fn run_dispatch(
    textures: &HashMap<TextureHandle, CpuTexture>,
    target: &mut CpuTexture,
    dispatch: &Dispatch<'_>,
) -> FluidResult<()> {
    let mut inputs = [None; MAX_TEXTURE_INPUTS];
    for (slot, handle) in dispatch.inputs.iter().enumerate() {
        if let Some(handle) = handle {
            let texture = textures.get(handle).ok_or_else(|| {
                FluidError::resource(
                    dispatch.kernel.entry_point(),
                    format!("input slot {slot} is missing or aliases the target"),
                )
            })?;
            inputs[slot] = Some(texture);
        }
    }

    let evaluation = Evaluation::new(dispatch, inputs);
    let layout = target.desc.layout;
    for (x, y, z) in layout.cells() {
        let value = evaluation.evaluate([x as i32, y as i32, z as i32]);
        target.store(layout.texel_index(x, y, z), value);
    }
    Ok(())
}

/// Executes kernels on the CPU
#[derive(Debug, Default)]
pub struct CpuBackend {
    textures: HashMap<TextureHandle, CpuTexture>,
    next_handle: u32,
    loaded: HashSet<(KernelKind, Precision)>,
    unavailable: HashSet<KernelKind>,
    dispatches: u64,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend on which the listed kernels fail to load
    pub fn without_kernels(kernels: &[KernelKind]) -> Self {
        Self {
            unavailable: kernels.iter().copied().collect(),
            ..Self::default()
        }
    }

    /// Dispatches executed since creation
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }

    pub fn is_loaded(&self, kernel: KernelKind, precision: Precision) -> bool {
        self.loaded.contains(&(kernel, precision))
    }

    fn texture(&self, handle: TextureHandle) -> FluidResult<&CpuTexture> {
        self.textures
            .get(&handle)
            .ok_or_else(|| FluidError::resource(format!("texture #{}", handle.id()), "unknown handle"))
    }

    fn texture_mut(&mut self, handle: TextureHandle) -> FluidResult<&mut CpuTexture> {
        self.textures
            .get_mut(&handle)
            .ok_or_else(|| FluidError::resource(format!("texture #{}", handle.id()), "unknown handle"))
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn load_kernel(&mut self, kernel: KernelKind, precision: Precision) -> FluidResult<()> {
        if self.unavailable.contains(&kernel) {
            return Err(FluidError::program_load_failure(
                kernel.entry_point(),
                "kernel is not available on this backend",
            ));
        }
        self.loaded.insert((kernel, precision));
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> FluidResult<TextureHandle> {
        let handle = TextureHandle::new(self.next_handle);
        self.next_handle += 1;
        self.textures.insert(handle, CpuTexture::new(*desc));
        Ok(handle)
    }

    fn release_texture(&mut self, handle: TextureHandle) {
        self.textures.remove(&handle);
    }

    fn texture_count(&self) -> usize {
        self.textures.len()
    }

    fn dispatch(&mut self, dispatch: &Dispatch<'_>) -> FluidResult<()> {
        // The target leaves the map while it is written, so an input aliasing
        // it cannot be resolved below.
        let mut target = self.textures.remove(&dispatch.target).ok_or_else(|| {
            FluidError::resource(dispatch.kernel.entry_point(), "target texture is missing")
        })?;

        let result = run_dispatch(&self.textures, &mut target, dispatch);
        self.textures.insert(dispatch.target, target);
        self.dispatches += 1;
        trace!("cpu dispatch {} -> #{}", dispatch.kernel, dispatch.target.id());
        result
    }

    fn write_texels(&mut self, handle: TextureHandle, texels: &[[f32; 4]]) -> FluidResult<()> {
        let texture = self.texture_mut(handle)?;
        if texels.len() != texture.desc.layout.texel_count() {
            return Err(FluidError::resource(
                texture.desc.label,
                format!(
                    "upload of {} texels into a texture of {}",
                    texels.len(),
                    texture.desc.layout.texel_count()
                ),
            ));
        }
        for (index, texel) in texels.iter().enumerate() {
            texture.store(index, Vector4::from(*texel));
        }
        Ok(())
    }

    fn read_texels(&mut self, handle: TextureHandle) -> FluidResult<Vec<[f32; 4]>> {
        let texture = self.texture(handle)?;
        Ok((0..texture.desc.layout.texel_count())
            .map(|index| texture.texel(index).into())
            .collect())
    }

    fn read_texel(&mut self, handle: TextureHandle, x: u32, y: u32) -> FluidResult<[f32; 4]> {
        let texture = self.texture(handle)?;
        let (width, height) = texture.desc.layout.texture_extent();
        if x >= width || y >= height {
            return Err(FluidError::resource(
                texture.desc.label,
                format!("texel ({x}, {y}) outside {width}x{height}"),
            ));
        }
        Ok(texture.texel(y as usize * width as usize + x as usize).into())
    }

    fn flush(&mut self) -> FluidResult<()> {
        Ok(())
    }
}
