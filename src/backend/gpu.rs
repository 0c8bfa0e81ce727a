use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{mpsc, Arc};

use bytemuck::cast_slice;
use thiserror::Error;

use super::draw::{InstancedRenderer, RenderTargetConfig};
use super::program::{BindingKind, KernelProgram, ReflectedKernel};
use super::{BufferDesc, BufferDevice, BufferUsage, ComputeBackend, KernelId, RenderBackend, Scalar};
use crate::particles::compute::PositionRecord;
use crate::particles::error::SimError;
use crate::particles::render::DrawBounds;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no suitable GPU adapter found")]
    NoAdapter,
    #[error("failed to create device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
    #[error("failed to map GPU staging buffer: {0}")]
    MapFailed(#[from] wgpu::BufferAsyncError),
    #[error("staging-map channel closed before completion")]
    ChannelClosed,
}

/// Device buffer shared between the pool and kernel bindings.
#[derive(Debug)]
pub struct GpuBuffer {
    id: u64,
    size_bytes: u64,
    raw: Arc<wgpu::Buffer>,
}

impl GpuBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn raw(&self) -> &wgpu::Buffer {
        &self.raw
    }
}

struct GpuKernel {
    reflected: ReflectedKernel,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    bound: HashMap<String, Arc<wgpu::Buffer>>,
}

/// `wgpu` implementation of the device, compute and render backends for one
/// kernel program.
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    program: KernelProgram,
    shader: wgpu::ShaderModule,
    kernels: Vec<GpuKernel>,
    uniform_staging: Vec<u8>,
    uniform_buffer: Option<wgpu::Buffer>,
    renderer: Option<InstancedRenderer>,
    next_buffer_id: u64,
}

impl WgpuBackend {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, program: KernelProgram) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(program.label()),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(program.source().to_owned())),
        });

        let (uniform_staging, uniform_buffer) = match program.uniform() {
            Some(block) => {
                // Uniform bindings must be a multiple of 16 bytes.
                let size = u64::from(block.size).max(16).next_multiple_of(16);
                let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("particles.uniform"),
                    size,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                (vec![0u8; size as usize], Some(buffer))
            }
            None => (Vec::new(), None),
        };

        Self {
            device,
            queue,
            program,
            shader,
            kernels: Vec::new(),
            uniform_staging,
            uniform_buffer,
            renderer: None,
            next_buffer_id: 0,
        }
    }

    /// Requests a high-performance adapter with no surface.
    pub async fn request_headless(program: KernelProgram) -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(GpuError::NoAdapter)?;
        log::info!("using GPU: {:?}", adapter.get_info());

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("particles.device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults()
                        .using_resolution(adapter.limits()),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await?;

        device.on_uncaptured_error(Box::new(|error| {
            log::error!("GPU uncaptured error: {error}");
        }));

        Ok(Self::new(Arc::new(device), Arc::new(queue), program))
    }

    /// Adds an offscreen target so draws are actually rasterised.
    pub fn with_render_target(mut self, target: RenderTargetConfig) -> Self {
        self.renderer = Some(InstancedRenderer::new(&self.device, target));
        self
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn program(&self) -> &KernelProgram {
        &self.program
    }

    pub fn renderer(&self) -> Option<&InstancedRenderer> {
        self.renderer.as_ref()
    }

    /// Blocking copy of the first `count` positions back to the host.
    pub fn read_positions(
        &self,
        buffer: &GpuBuffer,
        count: u32,
    ) -> Result<Vec<PositionRecord>, GpuError> {
        let stride = std::mem::size_of::<PositionRecord>() as u64;
        let bytes_to_copy = (u64::from(count) * stride).min(buffer.size_bytes);
        if bytes_to_copy == 0 {
            return Ok(Vec::new());
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("particles.positions.staging"),
            size: bytes_to_copy,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("particles.positions.copy.encoder"),
            });
        encoder.copy_buffer_to_buffer(&buffer.raw, 0, &staging, 0, bytes_to_copy);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        rx.recv().map_err(|_| GpuError::ChannelClosed)??;

        let data = slice.get_mapped_range();
        let out = cast_slice::<u8, PositionRecord>(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(out)
    }

    fn kernel(&self, kernel: KernelId) -> Result<&GpuKernel, SimError> {
        self.kernels
            .get(kernel.0 as usize)
            .ok_or_else(|| SimError::KernelNotFound(format!("#{}", kernel.0)))
    }

    fn create_kernel(&self, reflected: &ReflectedKernel) -> GpuKernel {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = reflected
            .bindings
            .iter()
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding: binding.binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: match binding.kind {
                        BindingKind::Uniform => wgpu::BufferBindingType::Uniform,
                        BindingKind::Storage { read_only } => {
                            wgpu::BufferBindingType::Storage { read_only }
                        }
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let label = format!("particles.{}", reflected.name);
        let bind_group_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(&label),
                    entries: &entries,
                });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&label),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&label),
                layout: Some(&pipeline_layout),
                module: &self.shader,
                entry_point: &reflected.name,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        GpuKernel {
            reflected: reflected.clone(),
            pipeline,
            bind_group_layout,
            bound: HashMap::new(),
        }
    }
}

impl BufferDevice for WgpuBackend {
    type Buffer = GpuBuffer;

    fn max_buffer_size(&self) -> u64 {
        let limits = self.device.limits();
        limits
            .max_buffer_size
            .min(u64::from(limits.max_storage_buffer_binding_size))
    }

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<GpuBuffer, SimError> {
        let usage = match desc.usage {
            BufferUsage::ParticleState | BufferUsage::Positions => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST
            }
        };

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let raw = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size: desc.size_bytes,
            usage,
            mapped_at_creation: false,
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            raw.destroy();
            return Err(SimError::allocation(desc.label, error.to_string()));
        }

        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        Ok(GpuBuffer {
            id,
            size_bytes: desc.size_bytes,
            raw: Arc::new(raw),
        })
    }

    fn destroy_buffer(&mut self, buffer: GpuBuffer) {
        for kernel in &mut self.kernels {
            kernel.bound.retain(|_, bound| !Arc::ptr_eq(bound, &buffer.raw));
        }
        buffer.raw.destroy();
    }
}

impl ComputeBackend for WgpuBackend {
    fn find_kernel(&mut self, name: &str) -> Result<KernelId, SimError> {
        if let Some(index) = self.kernels.iter().position(|k| k.reflected.name == name) {
            return Ok(KernelId(index as u32));
        }
        let reflected = self
            .program
            .kernel(name)
            .ok_or_else(|| SimError::KernelNotFound(name.to_owned()))?
            .clone();
        let kernel = self.create_kernel(&reflected);
        self.kernels.push(kernel);
        Ok(KernelId(self.kernels.len() as u32 - 1))
    }

    fn kernel_workgroup_size(&self, kernel: KernelId) -> Option<[u32; 3]> {
        self.kernels
            .get(kernel.0 as usize)
            .map(|k| k.reflected.workgroup_size)
    }

    fn set_buffer(
        &mut self,
        kernel: KernelId,
        binding: &str,
        buffer: &GpuBuffer,
    ) -> Result<(), SimError> {
        let slot = self
            .kernels
            .get_mut(kernel.0 as usize)
            .ok_or_else(|| SimError::KernelNotFound(format!("#{}", kernel.0)))?;
        if slot.reflected.binding(binding).is_none() {
            return Err(SimError::UnknownBinding {
                kernel: slot.reflected.name.clone(),
                binding: binding.to_owned(),
            });
        }
        slot.bound.insert(binding.to_owned(), Arc::clone(&buffer.raw));
        Ok(())
    }

    fn set_scalar(&mut self, name: &str, value: Scalar) {
        let written = self
            .program
            .uniform()
            .is_some_and(|block| block.write_scalar(&mut self.uniform_staging, name, value));
        if !written {
            log::trace!("program has no uniform `{name}`");
        }
    }

    fn set_vector(&mut self, name: &str, value: [f32; 4]) {
        let written = self
            .program
            .uniform()
            .is_some_and(|block| block.write_vector(&mut self.uniform_staging, name, value));
        if !written {
            log::trace!("program has no uniform `{name}`");
        }
    }

    fn dispatch(&mut self, kernel: KernelId, groups: [u32; 3]) -> Result<(), SimError> {
        let gpu_kernel = self.kernel(kernel)?;

        let mut entries = Vec::with_capacity(gpu_kernel.reflected.bindings.len());
        for binding in &gpu_kernel.reflected.bindings {
            let buffer = match binding.kind {
                BindingKind::Uniform => self.uniform_buffer.as_ref(),
                BindingKind::Storage { .. } => {
                    gpu_kernel.bound.get(&binding.name).map(|b| b.as_ref())
                }
            }
            .ok_or_else(|| SimError::UnboundBinding {
                kernel: gpu_kernel.reflected.name.clone(),
                binding: binding.name.clone(),
            })?;
            entries.push(wgpu::BindGroupEntry {
                binding: binding.binding,
                resource: buffer.as_entire_binding(),
            });
        }

        if let Some(uniform) = &self.uniform_buffer {
            self.queue.write_buffer(uniform, 0, &self.uniform_staging);
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&gpu_kernel.reflected.name),
            layout: &gpu_kernel.bind_group_layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("particles.dispatch.encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&gpu_kernel.reflected.name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&gpu_kernel.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }
        // Submitted per dispatch so the uniform write above lands before
        // this kernel and after the previous one.
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }
}

impl RenderBackend for WgpuBackend {
    fn draw_instanced(&mut self, positions: &GpuBuffer, instance_count: u32, bounds: DrawBounds) {
        match self.renderer.as_mut() {
            Some(renderer) => {
                renderer.draw(&self.device, &self.queue, &positions.raw, instance_count, bounds)
            }
            None => log::trace!("no render target; skipped draw of {instance_count} instances"),
        }
    }
}
