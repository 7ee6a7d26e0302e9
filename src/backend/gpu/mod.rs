//! # WGPU Compute Backend
//!
//! Runs the solver kernels in `fluid.wgsl` as compute pipelines. Every field
//! is an RGBA float texture (`Rgba32Float` or `Rgba16Float` by precision);
//! scalar fields only use the red channel and the other channels are held at
//! zero on every write.
//!
//! ## Recording
//!
//! Dispatches are recorded into one command encoder, each in its own compute
//! pass with its uniform block selected by dynamic offset. Nothing reaches the
//! queue until [`ComputeBackend::flush`], a readback, an upload, or a full
//! uniform ring forces a submit.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use log::{debug, error, info, trace};

use crate::backend::{ComputeBackend, Dispatch, TextureDesc, TextureHandle};
use crate::error::{FluidError, FluidResult};
use crate::fields::FieldId;
use crate::kernels::{KernelKind, MAX_TEXTURE_INPUTS, MAX_VECTOR_PARAMS};
use crate::options::Precision;
use crate::simulation::Fluid;
use crate::wgpu_utils::{self, UniformBuffer};

const SHADER_SOURCE: &str = include_str!("fluid.wgsl");
const WORKGROUP_SIZE: u32 = 8;
/// Dispatches recorded before the uniform ring forces a submit
const UNIFORM_SLOTS: u32 = 512;

/// Per-dispatch uniform block, mirrored by `Uniforms` in `fluid.wgsl`
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct KernelUniforms {
    target_res: [u32; 4],
    inputs: [[u32; 4]; MAX_TEXTURE_INPUTS],
    shape: [u32; 4],
    params: [[f32; 4]; MAX_VECTOR_PARAMS],
}

fn grid_block(desc: &TextureDesc) -> [u32; 4] {
    let [x, y, z] = desc.layout.resolution();
    [x, y, z, desc.layout.slices_per_row()]
}

impl KernelUniforms {
    fn new(
        dispatch: &Dispatch<'_>,
        target: &TextureDesc,
        inputs: &[Option<TextureDesc>; MAX_TEXTURE_INPUTS],
    ) -> Self {
        let mut blocks = [[0u32; 4]; MAX_TEXTURE_INPUTS];
        for (block, input) in blocks.iter_mut().zip(inputs.iter()) {
            if let Some(desc) = input {
                *block = grid_block(desc);
            }
        }

        let source = dispatch.source_layout;
        Self {
            target_res: grid_block(target),
            inputs: blocks,
            shape: [
                source.dimensionality().axis_count() as u32,
                target.components,
                source.resolution()[2],
                0,
            ],
            params: *dispatch.params,
        }
    }
}

fn texture_format(precision: Precision) -> wgpu::TextureFormat {
    match precision {
        Precision::Full => wgpu::TextureFormat::Rgba32Float,
        Precision::Half => wgpu::TextureFormat::Rgba16Float,
    }
}

/// WGSL source specialised to the storage format of one precision
pub(crate) fn shader_source(precision: Precision) -> String {
    let format = match precision {
        Precision::Full => "rgba32float",
        Precision::Half => "rgba16float",
    };
    SHADER_SOURCE.replace("{{FORMAT}}", format)
}

/// Texels as the bytes of an RGBA texture, zeroing unused channels
fn encode_texels(texels: &[[f32; 4]], components: u32, precision: Precision) -> Vec<u8> {
    let texel_bytes = 4 * precision.bytes_per_component() as usize;
    let mut bytes = Vec::with_capacity(texels.len() * texel_bytes);
    for texel in texels {
        for (channel, value) in texel.iter().enumerate() {
            let value = if channel < components as usize { *value } else { 0.0 };
            match precision {
                Precision::Full => bytes.extend_from_slice(&value.to_le_bytes()),
                Precision::Half => {
                    bytes.extend_from_slice(&half::f16::from_f32(value).to_le_bytes())
                }
            }
        }
    }
    bytes
}

fn decode_texels(bytes: &[u8], components: u32, precision: Precision) -> Vec<[f32; 4]> {
    let width = precision.bytes_per_component() as usize;
    bytes
        .chunks_exact(4 * width)
        .map(|chunk| {
            let mut texel = [0.0f32; 4];
            for (channel, raw) in chunk.chunks_exact(width).enumerate() {
                if channel >= components as usize {
                    break;
                }
                texel[channel] = match precision {
                    Precision::Full => f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
                    Precision::Half => half::f16::from_le_bytes([raw[0], raw[1]]).to_f32(),
                };
            }
            texel
        })
        .collect()
}

struct GpuTexture {
    desc: TextureDesc,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct KernelLayout {
    bind_group: wgpu::BindGroupLayout,
    pipeline: wgpu::PipelineLayout,
}

fn create_kernel_layout(device: &wgpu::Device, precision: Precision) -> KernelLayout {
    let mut entries = vec![wgpu_utils::compute_entry(
        0,
        wgpu_utils::uniform_dynamic(std::mem::size_of::<KernelUniforms>() as u64),
    )];
    for slot in 0..MAX_TEXTURE_INPUTS as u32 {
        entries.push(wgpu_utils::compute_entry(1 + slot, wgpu_utils::texture_2d()));
    }
    entries.push(wgpu_utils::compute_entry(
        1 + MAX_TEXTURE_INPUTS as u32,
        wgpu_utils::image_2d(texture_format(precision), wgpu::StorageTextureAccess::WriteOnly),
    ));

    let bind_group = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("fluid kernel bindings"),
        entries: &entries,
    });
    let pipeline = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("fluid kernel layout"),
        bind_group_layouts: &[&bind_group],
        push_constant_ranges: &[],
    });
    KernelLayout {
        bind_group,
        pipeline,
    }
}

type BindingKey = ([Option<TextureHandle>; MAX_TEXTURE_INPUTS], TextureHandle);

/// Executes kernels as WGSL compute pipelines
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    textures: HashMap<TextureHandle, GpuTexture>,
    next_handle: u32,
    modules: HashMap<Precision, wgpu::ShaderModule>,
    layouts: HashMap<Precision, KernelLayout>,
    pipelines: HashMap<(KernelKind, Precision), wgpu::ComputePipeline>,
    bind_groups: HashMap<BindingKey, wgpu::BindGroup>,
    uniforms: UniformBuffer<KernelUniforms>,
    /// Bound to input slots a kernel leaves empty
    placeholder: wgpu::TextureView,
    encoder: Option<wgpu::CommandEncoder>,
    dispatches: u64,
    submissions: u64,
}

impl WgpuBackend {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        let alignment = device.limits().min_uniform_buffer_offset_alignment;
        let uniforms = UniformBuffer::new(&device, UNIFORM_SLOTS, alignment);
        let placeholder = device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("empty input"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba32Float,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
            .create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            device,
            queue,
            textures: HashMap::new(),
            next_handle: 0,
            modules: HashMap::new(),
            layouts: HashMap::new(),
            pipelines: HashMap::new(),
            bind_groups: HashMap::new(),
            uniforms,
            placeholder,
            encoder: None,
            dispatches: 0,
            submissions: 0,
        }
    }

    /// Acquires a device without a surface, for offscreen solving
    pub fn headless() -> FluidResult<Self> {
        pollster::block_on(Self::request_headless())
    }

    async fn request_headless() -> FluidResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| FluidError::Backend(format!("no compatible adapter: {e}")))?;
        info!("Using GPU: {}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("stokes device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default().using_resolution(adapter.limits()),
                memory_hints: wgpu::MemoryHints::default(),
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| FluidError::Backend(format!("device request failed: {e}")))?;

        device.on_uncaptured_error(Box::new(|error| {
            error!("GPU uncaptured error: {error}");
        }));

        Ok(Self::new(Arc::new(device), Arc::new(queue)))
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// The texture behind a handle, for sharing with a renderer
    pub fn texture(&self, handle: TextureHandle) -> Option<&wgpu::Texture> {
        self.textures.get(&handle).map(|t| &t.texture)
    }

    pub fn is_loaded(&self, kernel: KernelKind, precision: Precision) -> bool {
        self.pipelines.contains_key(&(kernel, precision))
    }

    /// Dispatches recorded since creation
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }

    /// Command buffers submitted since creation
    pub fn submission_count(&self) -> u64 {
        self.submissions
    }

    fn gpu_texture(&self, handle: TextureHandle) -> FluidResult<&GpuTexture> {
        self.textures
            .get(&handle)
            .ok_or_else(|| FluidError::resource(format!("texture #{}", handle.id()), "unknown handle"))
    }

    fn create_bind_group(&self, key: &BindingKey, precision: Precision) -> FluidResult<wgpu::BindGroup> {
        let layout = self.layouts.get(&precision).ok_or_else(|| {
            FluidError::Backend(format!("no kernel loaded for {precision:?} precision"))
        })?;

        let (inputs, target) = key;
        let mut views = Vec::with_capacity(MAX_TEXTURE_INPUTS);
        for input in inputs {
            views.push(match input {
                Some(handle) => &self.gpu_texture(*handle)?.view,
                None => &self.placeholder,
            });
        }
        let target_view = &self.gpu_texture(*target)?.view;

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: self.uniforms.binding_resource(),
        }];
        for (slot, view) in views.into_iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: 1 + slot as u32,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: 1 + MAX_TEXTURE_INPUTS as u32,
            resource: wgpu::BindingResource::TextureView(target_view),
        });

        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("fluid kernel bind group"),
            layout: &layout.bind_group,
            entries: &entries,
        }))
    }

    /// Copies a texel rectangle into host memory
    fn read_region(
        &mut self,
        handle: TextureHandle,
        origin: (u32, u32),
        extent: (u32, u32),
    ) -> FluidResult<Vec<[f32; 4]>> {
        self.flush()?;

        let texture = self.gpu_texture(handle)?;
        let desc = texture.desc;
        let (width, height) = extent;
        let texel_bytes = 4 * desc.precision.bytes_per_component() as u32;
        let unpadded = width * texel_bytes;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = unpadded.div_ceil(align) * align;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size: padded as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: origin.0,
                    y: origin.1,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));
        self.submissions += 1;

        let slice = staging.slice(..);
        let (tx, rx) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| FluidError::Backend(format!("device poll failed: {e}")))?;

        match futures::executor::block_on(rx) {
            Ok(Ok(())) => {
                let mapped = slice.get_mapped_range();
                let mut texels = Vec::with_capacity((width * height) as usize);
                for row in mapped.chunks_exact(padded as usize) {
                    texels.extend(decode_texels(
                        &row[..unpadded as usize],
                        desc.components,
                        desc.precision,
                    ));
                }
                drop(mapped);
                staging.unmap();
                Ok(texels)
            }
            Ok(Err(e)) => Err(FluidError::Backend(format!("readback of `{}` failed: {e}", desc.label))),
            Err(_) => Err(FluidError::Backend(format!(
                "readback of `{}` was cancelled",
                desc.label
            ))),
        }
    }
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("textures", &self.textures.len())
            .field("pipelines", &self.pipelines.len())
            .field("bind_groups", &self.bind_groups.len())
            .field("dispatches", &self.dispatches)
            .finish()
    }
}

impl ComputeBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn load_kernel(&mut self, kernel: KernelKind, precision: Precision) -> FluidResult<()> {
        if self.pipelines.contains_key(&(kernel, precision)) {
            return Ok(());
        }

        let device = &self.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.modules.entry(precision).or_insert_with(|| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("fluid kernels"),
                source: wgpu::ShaderSource::Wgsl(shader_source(precision).into()),
            })
        });
        let layout = self
            .layouts
            .entry(precision)
            .or_insert_with(|| create_kernel_layout(device, precision));
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(kernel.entry_point()),
            layout: Some(&layout.pipeline),
            module,
            entry_point: Some(kernel.entry_point()),
            compilation_options: Default::default(),
            cache: None,
        });

        if let Some(failure) = pollster::block_on(device.pop_error_scope()) {
            error!("Kernel {} failed to compile: {}", kernel, failure);
            return Err(FluidError::program_load_failure(
                kernel.entry_point(),
                failure.to_string(),
            ));
        }

        debug!("Loaded kernel {} ({:?})", kernel, precision);
        self.pipelines.insert((kernel, precision), pipeline);
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> FluidResult<TextureHandle> {
        let (width, height) = desc.layout.texture_extent();
        let limit = self.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > limit || height > limit {
            return Err(FluidError::resource(
                desc.label,
                format!("texture of {width}x{height} exceeds the device limit of {limit}"),
            ));
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: texture_format(desc.precision),
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let handle = TextureHandle::new(self.next_handle);
        self.next_handle += 1;
        self.textures.insert(
            handle,
            GpuTexture {
                desc: *desc,
                texture,
                view,
            },
        );
        trace!("Created texture {} #{} ({}x{})", desc.label, handle.id(), width, height);
        Ok(handle)
    }

    fn release_texture(&mut self, handle: TextureHandle) {
        if self.textures.remove(&handle).is_some() {
            self.bind_groups
                .retain(|(inputs, target), _| *target != handle && !inputs.contains(&Some(handle)));
        }
    }

    fn texture_count(&self) -> usize {
        self.textures.len()
    }

    fn dispatch(&mut self, dispatch: &Dispatch<'_>) -> FluidResult<()> {
        let entry = dispatch.kernel.entry_point();
        if dispatch.inputs.contains(&Some(dispatch.target)) {
            return Err(FluidError::resource(entry, "an input aliases the target texture"));
        }

        let target = self
            .textures
            .get(&dispatch.target)
            .map(|t| t.desc)
            .ok_or_else(|| FluidError::resource(entry, "target texture is missing"))?;
        let mut inputs = [None; MAX_TEXTURE_INPUTS];
        for (slot, handle) in dispatch.inputs.iter().enumerate() {
            if let Some(handle) = handle {
                inputs[slot] = Some(self.gpu_texture(*handle)?.desc);
            }
        }

        let precision = target.precision;
        if !self.pipelines.contains_key(&(dispatch.kernel, precision)) {
            return Err(FluidError::program_load_failure(
                entry,
                format!("not loaded for {precision:?} precision"),
            ));
        }

        let uniforms = KernelUniforms::new(dispatch, &target, &inputs);
        let offset = match self.uniforms.push(&self.queue, &uniforms) {
            Some(offset) => offset,
            None => {
                self.flush()?;
                self.uniforms
                    .push(&self.queue, &uniforms)
                    .ok_or_else(|| FluidError::Backend("uniform ring has no slots".into()))?
            }
        };

        let key: BindingKey = (dispatch.inputs, dispatch.target);
        if !self.bind_groups.contains_key(&key) {
            let bind_group = self.create_bind_group(&key, precision)?;
            self.bind_groups.insert(key, bind_group);
        }

        let (width, height) = target.layout.texture_extent();
        let device = &self.device;
        let encoder = self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("fluid frame encoder"),
            })
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(entry),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipelines[&(dispatch.kernel, precision)]);
            pass.set_bind_group(0, Some(&self.bind_groups[&key]), &[offset]);
            pass.dispatch_workgroups(
                width.div_ceil(WORKGROUP_SIZE),
                height.div_ceil(WORKGROUP_SIZE),
                1,
            );
        }

        self.dispatches += 1;
        trace!("wgpu dispatch {} -> #{}", dispatch.kernel, dispatch.target.id());
        Ok(())
    }

    fn write_texels(&mut self, handle: TextureHandle, texels: &[[f32; 4]]) -> FluidResult<()> {
        // Recorded dispatches must land before the upload
        self.flush()?;

        let texture = self.gpu_texture(handle)?;
        let desc = texture.desc;
        if texels.len() != desc.layout.texel_count() {
            return Err(FluidError::resource(
                desc.label,
                format!(
                    "upload of {} texels into a texture of {}",
                    texels.len(),
                    desc.layout.texel_count()
                ),
            ));
        }

        let (width, height) = desc.layout.texture_extent();
        let bytes = encode_texels(texels, desc.components, desc.precision);
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * 4 * desc.precision.bytes_per_component() as u32),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn read_texels(&mut self, handle: TextureHandle) -> FluidResult<Vec<[f32; 4]>> {
        let extent = self.gpu_texture(handle)?.desc.layout.texture_extent();
        self.read_region(handle, (0, 0), extent)
    }

    fn read_texel(&mut self, handle: TextureHandle, x: u32, y: u32) -> FluidResult<[f32; 4]> {
        let desc = self.gpu_texture(handle)?.desc;
        let (width, height) = desc.layout.texture_extent();
        if x >= width || y >= height {
            return Err(FluidError::resource(
                desc.label,
                format!("texel ({x}, {y}) outside {width}x{height}"),
            ));
        }
        let texels = self.read_region(handle, (x, y), (1, 1))?;
        texels
            .first()
            .copied()
            .ok_or_else(|| FluidError::Backend(format!("empty readback of `{}`", desc.label)))
    }

    fn flush(&mut self) -> FluidResult<()> {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
            self.submissions += 1;
        }
        self.uniforms.reset();
        Ok(())
    }
}

impl Fluid<WgpuBackend> {
    /// Output of the last `render`, for presenting with an external renderer
    pub fn display_texture(&self) -> Option<&wgpu::Texture> {
        let handle = self.fields.handle(FieldId::Display).ok()?;
        self.backend().texture(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridLayout;

    fn gpu() -> Option<WgpuBackend> {
        match WgpuBackend::headless() {
            Ok(backend) => Some(backend),
            Err(e) => {
                eprintln!("skipping GPU test: {e}");
                None
            }
        }
    }

    fn desc(layout: GridLayout, components: u32, precision: Precision) -> TextureDesc {
        TextureDesc {
            label: "test",
            layout,
            components,
            precision,
        }
    }

    #[test]
    fn test_uniform_block_matches_wgsl_layout() {
        assert_eq!(std::mem::size_of::<KernelUniforms>(), 160);
    }

    #[test]
    fn test_shader_source_is_specialised() {
        let full = shader_source(Precision::Full);
        let half = shader_source(Precision::Half);
        assert!(full.contains("texture_storage_2d<rgba32float, write>"));
        assert!(half.contains("texture_storage_2d<rgba16float, write>"));
        assert!(!full.contains("{{FORMAT}}"));
        for kind in KernelKind::ALL {
            assert!(
                full.contains(&format!("fn {}(", kind.entry_point())),
                "missing entry point {kind}"
            );
        }
    }

    #[test]
    fn test_scalar_encoding_masks_extra_channels() {
        let bytes = encode_texels(&[[1.0, 2.0, 3.0, 4.0]], 1, Precision::Full);
        assert_eq!(bytes.len(), 16);
        assert_eq!(decode_texels(&bytes, 4, Precision::Full), vec![[1.0, 0.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_half_encoding_rounds_like_cpu() {
        let value = [0.1, 1.0, 65504.0, 1e-8];
        let bytes = encode_texels(&[value], 4, Precision::Half);
        assert_eq!(bytes.len(), 8);
        let decoded = decode_texels(&bytes, 4, Precision::Half)[0];
        for (got, want) in decoded.iter().zip(value.iter()) {
            assert_eq!(*got, Precision::Half.quantize(*want));
        }
    }

    #[test]
    fn test_uniforms_describe_inputs_and_target() {
        let solver = GridLayout::volume(4, 4, 9);
        let params = [[1.0; 4]; MAX_VECTOR_PARAMS];
        let dispatch = Dispatch {
            kernel: KernelKind::Copy,
            params: &params,
            inputs: [Some(TextureHandle::new(0)), None, None, None],
            target: TextureHandle::new(1),
            target_layout: solver,
            source_layout: solver,
        };
        let target = desc(solver, 1, Precision::Full);
        let uniforms = KernelUniforms::new(&dispatch, &target, &[Some(target), None, None, None]);
        assert_eq!(uniforms.target_res, [4, 4, 9, 8]);
        assert_eq!(uniforms.inputs[0], [4, 4, 9, 8]);
        assert_eq!(uniforms.inputs[1], [0; 4]);
        assert_eq!(uniforms.shape, [3, 1, 9, 0]);
    }

    #[test]
    fn test_gpu_round_trip_and_copy() {
        let Some(mut backend) = gpu() else { return };
        let layout = GridLayout::volume(3, 2, 9);
        let source = backend.create_texture(&desc(layout, 4, Precision::Full)).unwrap();
        let target = backend.create_texture(&desc(layout, 4, Precision::Full)).unwrap();
        let texels: Vec<[f32; 4]> = (0..layout.texel_count())
            .map(|i| [i as f32, 1.0, 2.0, 3.0])
            .collect();
        backend.write_texels(source, &texels).unwrap();
        assert_eq!(backend.read_texels(source).unwrap(), texels);

        backend.load_kernel(KernelKind::Copy, Precision::Full).unwrap();
        let params = [[0.0; 4]; MAX_VECTOR_PARAMS];
        backend
            .dispatch(&Dispatch {
                kernel: KernelKind::Copy,
                params: &params,
                inputs: [Some(source), None, None, None],
                target,
                target_layout: layout,
                source_layout: layout,
            })
            .unwrap();

        let copied = backend.read_texels(target).unwrap();
        for (x, y, z) in layout.cells() {
            let index = layout.texel_index(x, y, z);
            assert_eq!(copied[index], texels[index]);
        }
        assert_eq!(backend.read_texel(target, 4, 1).unwrap(), texels[layout.texel_index(1, 1, 1)]);
    }

    #[test]
    fn test_gpu_loads_every_kernel() {
        let Some(mut backend) = gpu() else { return };
        for precision in [Precision::Full, Precision::Half] {
            for kind in KernelKind::ALL {
                backend.load_kernel(kind, precision).unwrap();
                assert!(backend.is_loaded(kind, precision));
            }
        }
    }

    #[test]
    fn test_gpu_rejects_unloaded_kernel_and_aliasing() {
        let Some(mut backend) = gpu() else { return };
        let layout = GridLayout::flat(4, 4);
        let field = backend.create_texture(&desc(layout, 4, Precision::Full)).unwrap();
        let params = [[0.0; 4]; MAX_VECTOR_PARAMS];
        let mut dispatch = Dispatch {
            kernel: KernelKind::Copy,
            params: &params,
            inputs: [None; MAX_TEXTURE_INPUTS],
            target: field,
            target_layout: layout,
            source_layout: layout,
        };
        assert!(backend.dispatch(&dispatch).is_err());

        backend.load_kernel(KernelKind::Copy, Precision::Full).unwrap();
        dispatch.inputs[0] = Some(field);
        assert!(backend.dispatch(&dispatch).is_err());
        assert_eq!(backend.dispatch_count(), 0);
    }
}
