//! WGPU binding type utilities

use std::num::NonZeroU64;

/// Uniform block addressed through a dynamic offset
pub fn uniform_dynamic(min_size: u64) -> wgpu::BindingType {
    wgpu::BindingType::Buffer {
        ty: wgpu::BufferBindingType::Uniform,
        has_dynamic_offset: true,
        min_binding_size: NonZeroU64::new(min_size),
    }
}

/// Float texture read with `textureLoad`
///
/// Marked unfilterable so 32-bit float formats bind without the
/// `FLOAT32_FILTERABLE` feature.
pub fn texture_2d() -> wgpu::BindingType {
    wgpu::BindingType::Texture {
        sample_type: wgpu::TextureSampleType::Float { filterable: false },
        view_dimension: wgpu::TextureViewDimension::D2,
        multisampled: false,
    }
}

pub fn image_2d(
    format: wgpu::TextureFormat,
    access: wgpu::StorageTextureAccess,
) -> wgpu::BindingType {
    wgpu::BindingType::StorageTexture {
        access,
        view_dimension: wgpu::TextureViewDimension::D2,
        format,
    }
}

/// Layout entry visible to compute shaders only
pub fn compute_entry(binding: u32, ty: wgpu::BindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty,
        count: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_uniform_carries_min_size() {
        match uniform_dynamic(160) {
            wgpu::BindingType::Buffer {
                has_dynamic_offset,
                min_binding_size,
                ..
            } => {
                assert!(has_dynamic_offset);
                assert_eq!(min_binding_size.map(NonZeroU64::get), Some(160));
            }
            other => panic!("unexpected binding {other:?}"),
        }
    }

    #[test]
    fn test_compute_entry_visibility() {
        let entry = compute_entry(3, texture_2d());
        assert_eq!(entry.binding, 3);
        assert_eq!(entry.visibility, wgpu::ShaderStages::COMPUTE);
    }
}
