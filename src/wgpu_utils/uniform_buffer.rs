//! Ring of uniform blocks addressed by dynamic offset
//!
//! Every dispatch recorded into one command buffer needs its own uniform
//! values. Instead of a buffer per dispatch, blocks are appended to a single
//! buffer and selected with a dynamic offset; the ring is reset once the
//! recorded work has been submitted.

use std::marker::PhantomData;
use std::num::NonZeroU64;

pub struct UniformBuffer<Content> {
    buffer: wgpu::Buffer,
    content_type: PhantomData<Content>,
    stride: u64,
    capacity: u32,
    used: u32,
}

impl<Content: bytemuck::Pod> UniformBuffer<Content> {
    fn name() -> &'static str {
        let type_name = std::any::type_name::<Content>();
        match type_name.rfind(':') {
            Some(pos) => &type_name[(pos + 1)..],
            None => type_name,
        }
    }

    /// Byte distance between consecutive blocks
    pub fn stride_for(alignment: u32) -> u64 {
        let size = std::mem::size_of::<Content>() as u64;
        let alignment = alignment.max(1) as u64;
        size.div_ceil(alignment) * alignment
    }

    /// Create a ring of `capacity` blocks
    ///
    /// # Arguments
    /// * `alignment` - The device's `min_uniform_buffer_offset_alignment`
    pub fn new(device: &wgpu::Device, capacity: u32, alignment: u32) -> Self {
        let stride = Self::stride_for(alignment);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("UniformBuffer: {}", Self::name())),
            size: stride * capacity as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        UniformBuffer {
            buffer,
            content_type: PhantomData,
            stride,
            capacity,
            used: 0,
        }
    }

    /// Writes the next block
    ///
    /// # Returns
    /// The dynamic offset of the block, or `None` when the ring is full
    pub fn push(&mut self, queue: &wgpu::Queue, content: &Content) -> Option<u32> {
        if self.used >= self.capacity {
            return None;
        }
        let offset = self.used as u64 * self.stride;
        queue.write_buffer(&self.buffer, offset, bytemuck::bytes_of(content));
        self.used += 1;
        Some(offset as u32)
    }

    /// Marks every block free; only valid once pending work is submitted
    pub fn reset(&mut self) {
        self.used = 0;
    }

    pub fn len(&self) -> u32 {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// One block's window, moved by the dynamic offset
    pub fn binding_resource(&self) -> wgpu::BindingResource<'_> {
        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
            buffer: &self.buffer,
            offset: 0,
            size: NonZeroU64::new(std::mem::size_of::<Content>() as u64),
        })
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}
