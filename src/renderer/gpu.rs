use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;

use anyhow::{Context, Result};
use glam::{Mat4, Vec3, Vec4};
use wgpu::util::DeviceExt;

use super::{RenderBackend, WindowSurface, DEPTH_FORMAT};
use crate::camera3d::Camera3D;
use crate::geometry::{Mesh, MeshVertex};
use crate::resources::{LineVertex, Material, ResourceId};
use crate::scene::Scene;

const SHADOW_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 0.3];
const SHADOW_LIFT: f32 = 0.001;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct FrameUniform {
    view_proj: [[f32; 4]; 4],
    light_dir: [f32; 4],
    light_color: [f32; 4],
    ambient_color: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct DrawUniform {
    model: [[f32; 4]; 4],
    normal: [[f32; 4]; 4],
    color: [f32; 4],
    /// x: 1.0 for unlit flat color.
    params: [f32; 4],
}

struct GpuMesh {
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
}

struct GpuLines {
    vertex_buffer: wgpu::Buffer,
    vertex_count: u32,
}

struct Pipelines {
    mesh: wgpu::RenderPipeline,
    shadow: wgpu::RenderPipeline,
    lines: wgpu::RenderPipeline,
    frame_buffer: wgpu::Buffer,
    frame_bind_group: wgpu::BindGroup,
    draw_layout: wgpu::BindGroupLayout,
}

struct DrawBuffer {
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    capacity: usize,
}

struct DrawCall {
    geometry: ResourceId,
    first_index: u32,
    index_count: u32,
    uniform_slot: usize,
    shadow: bool,
}

/// wgpu backend: lit meshes, an alpha-blended grid, and planar shadows on the ground plane.
pub struct GpuRenderer {
    surface: WindowSurface,
    pipelines: Option<Pipelines>,
    draw_buffer: Option<DrawBuffer>,
    draw_stride: u64,
    meshes: HashMap<ResourceId, GpuMesh>,
    lines: HashMap<ResourceId, GpuLines>,
    shadows: bool,
    disposed: bool,
}

impl GpuRenderer {
    pub fn new(surface: WindowSurface) -> Result<Self> {
        let alignment = surface.device()?.limits().min_uniform_buffer_offset_alignment as u64;
        let size = std::mem::size_of::<DrawUniform>() as u64;
        let draw_stride = size.div_ceil(alignment) * alignment;
        Ok(Self {
            surface,
            pipelines: None,
            draw_buffer: None,
            draw_stride,
            meshes: HashMap::new(),
            lines: HashMap::new(),
            shadows: true,
            disposed: false,
        })
    }

    fn ensure_pipelines(&mut self) -> Result<()> {
        if self.pipelines.is_some() {
            return Ok(());
        }
        let device = self.surface.device()?;
        let format = self.surface.surface_format()?;

        let frame_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Viewer Frame BGL"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let draw_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Viewer Draw BGL"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: NonZeroU64::new(std::mem::size_of::<DrawUniform>() as u64),
                },
                count: None,
            }],
        });

        let mesh_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Robot Mesh Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../assets/shaders/robot_mesh.wgsl").into()),
        });
        let line_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Grid Line Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../assets/shaders/grid_lines.wgsl").into()),
        });

        let mesh_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Robot Mesh Pipeline Layout"),
            bind_group_layouts: &[&frame_layout, &draw_layout],
            push_constant_ranges: &[],
        });
        let line_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Grid Line Pipeline Layout"),
            bind_group_layouts: &[&frame_layout],
            push_constant_ranges: &[],
        });

        let mesh_pipeline = |label: &str, depth_write: bool| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&mesh_layout),
                vertex: wgpu::VertexState {
                    module: &mesh_shader,
                    entry_point: Some("vs_main"),
                    buffers: &[MeshVertex::layout()],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &mesh_shader,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format,
                        blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    ..Default::default()
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: depth_write,
                    depth_compare: wgpu::CompareFunction::LessEqual,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        };
        let mesh = mesh_pipeline("Robot Mesh Pipeline", true);
        let shadow = mesh_pipeline("Planar Shadow Pipeline", false);

        let lines = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Grid Line Pipeline"),
            layout: Some(&line_layout),
            vertex: wgpu::VertexState {
                module: &line_shader,
                entry_point: Some("vs_main"),
                buffers: &[LineVertex::layout()],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &line_shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState { topology: wgpu::PrimitiveTopology::LineList, ..Default::default() },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: false,
                depth_compare: wgpu::CompareFunction::LessEqual,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let frame_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Viewer Frame Buffer"),
            size: std::mem::size_of::<FrameUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let frame_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Viewer Frame BG"),
            layout: &frame_layout,
            entries: &[wgpu::BindGroupEntry { binding: 0, resource: frame_buffer.as_entire_binding() }],
        });

        self.pipelines = Some(Pipelines { mesh, shadow, lines, frame_buffer, frame_bind_group, draw_layout });
        Ok(())
    }

    fn ensure_draw_capacity(&mut self, draws: usize) -> Result<()> {
        let needed = draws.max(1);
        if self.draw_buffer.as_ref().is_some_and(|buffer| buffer.capacity >= needed) {
            return Ok(());
        }
        let capacity = needed.next_power_of_two();
        let device = self.surface.device()?;
        let pipelines = self.pipelines.as_ref().context("Viewer pipelines missing")?;
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Viewer Draw Buffer"),
            size: self.draw_stride * capacity as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Viewer Draw BG"),
            layout: &pipelines.draw_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer,
                    offset: 0,
                    size: NonZeroU64::new(std::mem::size_of::<DrawUniform>() as u64),
                }),
            }],
        });
        self.draw_buffer = Some(DrawBuffer { buffer, bind_group, capacity });
        Ok(())
    }

    fn upload_mesh(&mut self, id: ResourceId, mesh: &Arc<Mesh>) -> Result<()> {
        if self.meshes.contains_key(&id) {
            return Ok(());
        }
        let device = self.surface.device()?;
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Robot Mesh Vertex Buffer"),
            contents: bytemuck::cast_slice(&mesh.vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Robot Mesh Index Buffer"),
            contents: bytemuck::cast_slice(&mesh.indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        self.meshes.insert(id, GpuMesh { vertex_buffer, index_buffer });
        Ok(())
    }

    fn upload_lines(&mut self, id: ResourceId, vertices: &[LineVertex]) -> Result<()> {
        if self.lines.contains_key(&id) {
            return Ok(());
        }
        let device = self.surface.device()?;
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Grid Vertex Buffer"),
            contents: bytemuck::cast_slice(vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        self.lines.insert(id, GpuLines { vertex_buffer, vertex_count: vertices.len() as u32 });
        Ok(())
    }
}

impl RenderBackend for GpuRenderer {
    fn resize(&mut self, width: u32, height: u32) {
        self.surface.resize(winit::dpi::PhysicalSize::new(width, height));
    }

    fn set_shadows(&mut self, enabled: bool) {
        self.shadows = enabled;
    }

    fn render(&mut self, scene: &Scene, camera: &Camera3D) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.ensure_pipelines()?;

        let shadow_matrix = scene
            .directional
            .as_ref()
            .filter(|light| self.shadows && light.cast_shadow)
            .map(|light| planar_shadow_matrix(light.position));

        let mut uniforms: Vec<DrawUniform> = Vec::new();
        let mut draws: Vec<DrawCall> = Vec::new();
        for (_, rig) in scene.rigs() {
            for (world, visual) in rig.posed_visuals() {
                self.upload_mesh(visual.geometry.id, &visual.geometry.mesh)?;
                for subset in &visual.geometry.mesh.subsets {
                    let color = visual.materials.for_slot(subset.material).map(|m| m.color);
                    uniforms.push(draw_uniform(world, color.unwrap_or(Material::DEFAULT_COLOR), false));
                    draws.push(DrawCall {
                        geometry: visual.geometry.id,
                        first_index: subset.index_offset,
                        index_count: subset.index_count,
                        uniform_slot: uniforms.len() - 1,
                        shadow: false,
                    });
                    if let Some(shadow) = shadow_matrix {
                        uniforms.push(draw_uniform(shadow * world, SHADOW_COLOR, true));
                        draws.push(DrawCall {
                            geometry: visual.geometry.id,
                            first_index: subset.index_offset,
                            index_count: subset.index_count,
                            uniform_slot: uniforms.len() - 1,
                            shadow: true,
                        });
                    }
                }
            }
        }
        if let Some(grid) = &scene.grid {
            self.upload_lines(grid.lines.id, &grid.lines.vertices)?;
        }
        self.ensure_draw_capacity(uniforms.len())?;

        let frame = frame_uniform(scene, camera);
        let mut staging = vec![0u8; self.draw_stride as usize * uniforms.len()];
        for (slot, uniform) in uniforms.iter().enumerate() {
            let start = slot * self.draw_stride as usize;
            staging[start..start + std::mem::size_of::<DrawUniform>()].copy_from_slice(bytemuck::bytes_of(uniform));
        }

        let surface_texture = self.surface.acquire_frame()?;
        let view = surface_texture.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let device = self.surface.device()?;
        let queue = self.surface.queue()?;
        let depth_view = self.surface.depth_view()?;
        let pipelines = self.pipelines.as_ref().context("Viewer pipelines missing")?;
        let draw_buffer = self.draw_buffer.as_ref().context("Viewer draw buffer missing")?;
        queue.write_buffer(&pipelines.frame_buffer, 0, bytemuck::bytes_of(&frame));
        if !staging.is_empty() {
            queue.write_buffer(&draw_buffer.buffer, 0, &staging);
        }

        let [r, g, b] = scene.background.to_linear();
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Viewer Encoder") });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Viewer Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color { r: r as f64, g: g as f64, b: b as f64, a: 1.0 }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: depth_view,
                    depth_ops: Some(wgpu::Operations { load: wgpu::LoadOp::Clear(1.0), store: wgpu::StoreOp::Store }),
                    stencil_ops: None,
                }),
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            pass.set_bind_group(0, &pipelines.frame_bind_group, &[]);

            if let Some(grid) = &scene.grid {
                if let Some(lines) = self.lines.get(&grid.lines.id) {
                    pass.set_pipeline(&pipelines.lines);
                    pass.set_vertex_buffer(0, lines.vertex_buffer.slice(..));
                    pass.draw(0..lines.vertex_count, 0..1);
                }
            }

            for shadow_pass in [true, false] {
                pass.set_pipeline(if shadow_pass { &pipelines.shadow } else { &pipelines.mesh });
                for draw in draws.iter().filter(|draw| draw.shadow == shadow_pass) {
                    let Some(mesh) = self.meshes.get(&draw.geometry) else { continue };
                    let offset = (draw.uniform_slot as u64 * self.draw_stride) as u32;
                    pass.set_bind_group(1, &draw_buffer.bind_group, &[offset]);
                    pass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
                    pass.set_index_buffer(mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
                    pass.draw_indexed(draw.first_index..draw.first_index + draw.index_count, 0, 0..1);
                }
            }
        }
        queue.submit(Some(encoder.finish()));
        surface_texture.present();
        Ok(())
    }

    fn release(&mut self, resource: ResourceId) {
        // Buffers free when dropped; materials hold no GPU state.
        self.meshes.remove(&resource);
        self.lines.remove(&resource);
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.meshes.clear();
        self.lines.clear();
        self.draw_buffer = None;
        self.pipelines = None;
        self.surface.release();
        self.disposed = true;
    }
}

fn frame_uniform(scene: &Scene, camera: &Camera3D) -> FrameUniform {
    let (light_dir, light_color) = match &scene.directional {
        Some(light) => {
            let [r, g, b] = light.color.to_linear();
            (light.direction(), Vec3::new(r, g, b) * light.intensity)
        }
        None => (Vec3::NEG_Y, Vec3::ZERO),
    };
    let ambient = match &scene.ambient {
        Some(light) => {
            let [r, g, b] = light.color.to_linear();
            Vec3::new(r, g, b) * light.intensity
        }
        None => Vec3::ZERO,
    };
    FrameUniform {
        view_proj: camera.view_projection().to_cols_array_2d(),
        light_dir: light_dir.extend(0.0).to_array(),
        light_color: light_color.extend(1.0).to_array(),
        ambient_color: ambient.extend(1.0).to_array(),
    }
}

fn draw_uniform(model: Mat4, color: [f32; 4], unlit: bool) -> DrawUniform {
    DrawUniform {
        model: model.to_cols_array_2d(),
        normal: model.inverse().transpose().to_cols_array_2d(),
        color,
        params: [if unlit { 1.0 } else { 0.0 }, 0.0, 0.0, 0.0],
    }
}

/// Projects geometry along the light direction onto the y = 0 plane, lifted slightly above it.
fn planar_shadow_matrix(light_position: Vec3) -> Mat4 {
    let plane = Vec4::new(0.0, 1.0, 0.0, 0.0);
    let light = light_position.normalize_or_zero().extend(0.0);
    let dot = plane.dot(light);
    let projection = Mat4::from_cols(
        Vec4::X * dot - light * plane.x,
        Vec4::Y * dot - light * plane.y,
        Vec4::Z * dot - light * plane.z,
        Vec4::W * dot - light * plane.w,
    );
    Mat4::from_translation(Vec3::Y * SHADOW_LIFT) * projection
}
