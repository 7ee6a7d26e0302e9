//! WGPU utility functions and helpers
//!
//! Small wrappers over the binding and buffer boilerplate the compute
//! backend repeats for every kernel.

pub mod binding_types;
pub mod uniform_buffer;

pub use binding_types::*;
pub use uniform_buffer::UniformBuffer;
