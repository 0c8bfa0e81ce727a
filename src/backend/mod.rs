//! Narrow interfaces to the device the simulation runs on.
//!
//! The orchestration core only talks to these traits. [`gpu::WgpuBackend`]
//! drives a real adapter through `wgpu`; [`recording::RecordingBackend`]
//! keeps everything in host memory and records the command stream, which is
//! what the lifecycle and ping-pong tests assert against.

pub mod draw;
pub mod gpu;
pub mod program;
pub mod recording;

use crate::particles::error::SimError;
use crate::particles::render::DrawBounds;

/// Index of a kernel resolved from a compiled program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Full per-particle records, read and written by compute kernels.
    ParticleState,
    /// Render positions, written by compute and read by the draw.
    Positions,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size_bytes: u64,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    F32(f32),
    U32(u32),
    I32(i32),
}

impl Scalar {
    pub fn as_f32(self) -> f32 {
        match self {
            Self::F32(v) => v,
            Self::U32(v) => v as f32,
            Self::I32(v) => v as f32,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::F32(v) => v.max(0.0) as u32,
            Self::U32(v) => v,
            Self::I32(v) => v.max(0) as u32,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::F32(v) => v as i32,
            Self::U32(v) => v.min(i32::MAX as u32) as i32,
            Self::I32(v) => v,
        }
    }
}

pub trait BufferDevice {
    type Buffer;

    /// Largest single buffer the device accepts, in bytes.
    fn max_buffer_size(&self) -> u64;

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<Self::Buffer, SimError>;

    fn destroy_buffer(&mut self, buffer: Self::Buffer);
}

/// Compute side of the device. Dispatches are fire-and-forget; the device
/// queue orders them, so a dispatch sees every write issued before it.
pub trait ComputeBackend: BufferDevice {
    fn find_kernel(&mut self, name: &str) -> Result<KernelId, SimError>;

    /// Declared `@workgroup_size` of a resolved kernel, if the backend can
    /// reflect it.
    fn kernel_workgroup_size(&self, kernel: KernelId) -> Option<[u32; 3]>;

    fn set_buffer(
        &mut self,
        kernel: KernelId,
        binding: &str,
        buffer: &Self::Buffer,
    ) -> Result<(), SimError>;

    /// Program-wide uniform. Names the program does not declare are ignored.
    fn set_scalar(&mut self, name: &str, value: Scalar);

    fn set_vector(&mut self, name: &str, value: [f32; 4]);

    fn dispatch(&mut self, kernel: KernelId, groups: [u32; 3]) -> Result<(), SimError>;
}

pub trait RenderBackend: BufferDevice {
    /// One instanced procedural draw; instance `i` reads `positions[i]`.
    fn draw_instanced(&mut self, positions: &Self::Buffer, instance_count: u32, bounds: DrawBounds);
}

impl<T: BufferDevice + ?Sized> BufferDevice for &mut T {
    type Buffer = T::Buffer;

    fn max_buffer_size(&self) -> u64 {
        (**self).max_buffer_size()
    }

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<Self::Buffer, SimError> {
        (**self).create_buffer(desc)
    }

    fn destroy_buffer(&mut self, buffer: Self::Buffer) {
        (**self).destroy_buffer(buffer)
    }
}

impl<T: ComputeBackend + ?Sized> ComputeBackend for &mut T {
    fn find_kernel(&mut self, name: &str) -> Result<KernelId, SimError> {
        (**self).find_kernel(name)
    }

    fn kernel_workgroup_size(&self, kernel: KernelId) -> Option<[u32; 3]> {
        (**self).kernel_workgroup_size(kernel)
    }

    fn set_buffer(
        &mut self,
        kernel: KernelId,
        binding: &str,
        buffer: &Self::Buffer,
    ) -> Result<(), SimError> {
        (**self).set_buffer(kernel, binding, buffer)
    }

    fn set_scalar(&mut self, name: &str, value: Scalar) {
        (**self).set_scalar(name, value)
    }

    fn set_vector(&mut self, name: &str, value: [f32; 4]) {
        (**self).set_vector(name, value)
    }

    fn dispatch(&mut self, kernel: KernelId, groups: [u32; 3]) -> Result<(), SimError> {
        (**self).dispatch(kernel, groups)
    }
}

impl<T: RenderBackend + ?Sized> RenderBackend for &mut T {
    fn draw_instanced(&mut self, positions: &Self::Buffer, instance_count: u32, bounds: DrawBounds) {
        (**self).draw_instanced(positions, instance_count, bounds)
    }
}
