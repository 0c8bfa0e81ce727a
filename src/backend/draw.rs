use std::borrow::Cow;

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::particles::render::DrawBounds;

pub const RENDER_PROGRAM_SOURCE: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/particles_render.wgsl"));

const CORNERS_PER_QUAD: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderTargetConfig {
    pub width: u32,
    pub height: u32,
    /// Fraction of the bounds edge used as the quad half-size.
    pub point_scale: f32,
    pub clear_color: wgpu::Color,
}

impl Default for RenderTargetConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            point_scale: 0.005,
            clear_color: wgpu::Color {
                r: 0.02,
                g: 0.02,
                b: 0.03,
                a: 1.0,
            },
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CameraUniform {
    pub view_proj: [[f32; 4]; 4],
    pub point_size: f32,
    pub _pad: [f32; 3],
}

impl CameraUniform {
    /// Orthographic view straight down -Z, framing the whole bounds box.
    pub fn framing(bounds: &DrawBounds, point_scale: f32) -> Self {
        let min = bounds.min();
        let max = bounds.max();
        let depth = bounds.size.z.max(f32::EPSILON);
        let proj = Mat4::orthographic_rh(min.x, max.x, min.y, max.y, -depth, depth);
        Self {
            view_proj: proj.to_cols_array_2d(),
            point_size: bounds.size.max_element() * point_scale,
            _pad: [0.0; 3],
        }
    }
}

/// Offscreen instanced point renderer.
pub struct InstancedRenderer {
    config: RenderTargetConfig,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    camera_buffer: wgpu::Buffer,
    target: wgpu::Texture,
    target_view: wgpu::TextureView,
    draws: u64,
}

impl InstancedRenderer {
    pub const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

    pub fn new(device: &wgpu::Device, config: RenderTargetConfig) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("particles.render.shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(RENDER_PROGRAM_SOURCE)),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("particles.render.bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("particles.render.layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("particles.render.pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: Self::FORMAT,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let camera_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("particles.render.camera"),
            size: std::mem::size_of::<CameraUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let target = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("particles.render.target"),
            size: wgpu::Extent3d {
                width: config.width.max(1),
                height: config.height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let target_view = target.create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            config,
            pipeline,
            bind_group_layout,
            camera_buffer,
            target,
            target_view,
            draws: 0,
        }
    }

    pub fn config(&self) -> &RenderTargetConfig {
        &self.config
    }

    pub fn target(&self) -> &wgpu::Texture {
        &self.target
    }

    /// Draws submitted so far.
    pub fn draw_count(&self) -> u64 {
        self.draws
    }

    pub fn draw(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        positions: &wgpu::Buffer,
        instance_count: u32,
        bounds: DrawBounds,
    ) {
        let camera = CameraUniform::framing(&bounds, self.config.point_scale);
        queue.write_buffer(&self.camera_buffer, 0, bytemuck::bytes_of(&camera));

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("particles.render.bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.camera_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: positions.as_entire_binding(),
                },
            ],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("particles.render.encoder"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("particles.render.pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.target_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(self.config.clear_color),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..CORNERS_PER_QUAD, 0..instance_count);
        }
        queue.submit(Some(encoder.finish()));
        self.draws += 1;
    }
}

#[cfg(test)]
mod tests {
    use glam::{Vec3, Vec4};

    use super::{CameraUniform, RENDER_PROGRAM_SOURCE};
    use crate::particles::render::DrawBounds;

    #[test]
    fn camera_uniform_matches_wgsl_layout() {
        // mat4x4<f32> + f32, rounded up to the struct's 16-byte alignment
        assert_eq!(std::mem::size_of::<CameraUniform>(), 80);
    }

    #[test]
    fn framing_maps_bounds_into_clip_space() {
        let bounds = DrawBounds::for_domain(1.0, 10);
        let camera = CameraUniform::framing(&bounds, 0.01);
        let view_proj = glam::Mat4::from_cols_array_2d(&camera.view_proj);

        for corner in [bounds.min(), bounds.max(), Vec3::ZERO] {
            let clip = view_proj * Vec4::from((corner, 1.0));
            assert!(clip.x.abs() <= 1.0 + 1e-5, "{clip:?}");
            assert!(clip.y.abs() <= 1.0 + 1e-5, "{clip:?}");
            assert!((0.0..=1.0).contains(&clip.z), "{clip:?}");
        }
        assert!((camera.point_size - 0.022).abs() < 1e-6);
    }

    #[test]
    fn render_shader_validates() {
        let module = naga::front::wgsl::parse_str(RENDER_PROGRAM_SOURCE).unwrap();
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .unwrap();
    }
}
