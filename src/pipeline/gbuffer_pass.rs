//! G-buffer pass
//!
//! Renders opaque geometry into multiple render targets:
//! - diffuse color
//! - specular color
//! - specular level and glossiness
//! - self illumination
//! - eye-space normal with linear depth in `w`
//! - depth buffer
//!
//! Targets are reallocated when the viewport port changes. Every output port
//! is set after drawing so downstream passes see fresh content each frame.

use super::geometry::{draw_batches, BatchBuilder, DynamicBuffer, ObjectInstance, INSTANCE_WGSL};
use super::view::VIEW_WGSL;
use super::*;
use crate::dataflow::{Port, PortError};
use crate::scene::{Model, ObjectId, SceneObject, FAR_PLANE};

/// Output ports of the G-buffer
#[derive(Debug, Clone, Default)]
pub struct GBufferPorts {
    pub diffuse_color: Port<RenderTarget>,
    pub specular_color: Port<RenderTarget>,
    pub specular_level: Port<RenderTarget>,
    pub self_illumination: Port<RenderTarget>,
    pub normal_z: Port<RenderTarget>,
    pub zbuffer: Port<RenderTarget>,
}

impl GBufferPorts {
    /// Fresh ports aliasing `producer`
    pub fn bound_to(producer: &GBufferPorts) -> Result<Self, PortError> {
        let mut ports = GBufferPorts::default();
        ports.diffuse_color.bind_from(&producer.diffuse_color)?;
        ports.specular_color.bind_from(&producer.specular_color)?;
        ports.specular_level.bind_from(&producer.specular_level)?;
        ports.self_illumination.bind_from(&producer.self_illumination)?;
        ports.normal_z.bind_from(&producer.normal_z)?;
        ports.zbuffer.bind_from(&producer.zbuffer)?;
        Ok(ports)
    }
}

#[derive(Debug, Clone, Copy)]
struct GBufferTargets {
    diffuse_color: RenderTarget,
    specular_color: RenderTarget,
    specular_level: RenderTarget,
    self_illumination: RenderTarget,
    normal_z: RenderTarget,
    zbuffer: RenderTarget,
}

impl GBufferTargets {
    fn new(backend: &mut dyn GraphicsBackend, viewport: Viewport) -> BackendResult<Self> {
        let usage = TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING;
        let (w, h) = (viewport.width, viewport.height);
        Ok(Self {
            diffuse_color: RenderTarget::new(backend, "GBuffer Diffuse", w, h, TextureFormat::Rgba8Unorm, usage)?,
            specular_color: RenderTarget::new(backend, "GBuffer Specular", w, h, TextureFormat::Rgba8Unorm, usage)?,
            specular_level: RenderTarget::new(backend, "GBuffer Specular Level", w, h, TextureFormat::Rgba16Float, usage)?,
            self_illumination: RenderTarget::new(backend, "GBuffer Self Illumination", w, h, TextureFormat::Rgba16Float, usage)?,
            normal_z: RenderTarget::new(backend, "GBuffer Normal Z", w, h, TextureFormat::Rgba16Float, usage)?,
            zbuffer: RenderTarget::new(backend, "GBuffer Depth", w, h, TextureFormat::Depth32Float, usage)?,
        })
    }

    fn all(&self) -> [RenderTarget; 6] {
        [
            self.diffuse_color,
            self.specular_color,
            self.specular_level,
            self.self_illumination,
            self.normal_z,
            self.zbuffer,
        ]
    }
}

struct OpaqueGather<'a> {
    batches: &'a mut BatchBuilder,
}

impl SceneVisitor for OpaqueGather<'_> {
    fn object(&mut self, _id: ObjectId, object: &SceneObject, model: &Model) {
        if !model.material.is_transparent() {
            self.batches.push(object, model);
        }
    }
}

pub struct GBufferPass {
    view: ViewPorts,
    outputs: GBufferPorts,
    targets: Option<GBufferTargets>,
    pipeline: RenderPipelineHandle,
    view_buffer: BufferHandle,
    view_bind_group: BindGroupHandle,
    instances: DynamicBuffer,
}

impl GBufferPass {
    pub fn new(backend: &mut dyn GraphicsBackend, view: ViewPorts) -> RendererResult<Self> {
        let layout = backend.create_bind_group_layout(&[layout_entry(
            0,
            ShaderStageFlags::VERTEX_FRAGMENT,
            BindingType::UniformBuffer,
        )])?;
        let view_buffer = uniform_buffer(
            backend,
            "GBuffer View",
            std::mem::size_of::<ViewUniformData>() as u64,
        )?;
        let view_bind_group =
            backend.create_bind_group(layout, &[(0, BindGroupEntry::buffer(view_buffer))])?;

        let color_targets = [
            TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba16Float,
            TextureFormat::Rgba16Float,
            TextureFormat::Rgba16Float,
        ]
        .into_iter()
        .map(ColorTargetState::opaque)
        .collect();

        let pipeline = create_render_pipeline(
            backend,
            &RenderPipelineDescriptor {
                label: Some("gbuffer".into()),
                shader: [VIEW_WGSL, INSTANCE_WGSL, GBUFFER_SHADER].concat(),
                has_fragment: true,
                vertex_layouts: vec![Vertex::layout(), ObjectInstance::layout()],
                bind_group_layouts: vec![layout],
                primitive_topology: PrimitiveTopology::TriangleList,
                front_face: FrontFace::Ccw,
                cull_mode: CullMode::Back,
                depth_stencil: Some(DepthStencilState {
                    format: TextureFormat::Depth32Float,
                    depth_write_enabled: true,
                    depth_compare: CompareFunction::Less,
                }),
                color_targets,
            },
        )?;

        Ok(Self {
            view,
            outputs: GBufferPorts::default(),
            targets: None,
            pipeline,
            view_buffer,
            view_bind_group,
            instances: DynamicBuffer::vertex("GBuffer Instances"),
        })
    }

    /// Producer side of the G-buffer ports
    pub fn outputs(&self) -> &GBufferPorts {
        &self.outputs
    }

    fn ensure_targets(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        viewport: Viewport,
    ) -> RendererResult<GBufferTargets> {
        let resized = self.view.viewport.updated();
        match self.targets {
            Some(targets) if !resized => Ok(targets),
            old => {
                if let Some(old) = old {
                    old.all().iter().for_each(|t| t.destroy(backend));
                }
                let targets = GBufferTargets::new(backend, viewport)?;
                log::debug!("G-buffer allocated at {}x{}", viewport.width, viewport.height);
                self.targets = Some(targets);
                Ok(targets)
            }
        }
    }
}

impl FramePass for GBufferPass {
    fn name(&self) -> &'static str {
        "gbuffer"
    }

    fn run(&mut self, ctx: &mut PassContext) -> RendererResult<()> {
        let view = self.view.resolve()?;
        let targets = self.ensure_targets(ctx.backend, view.viewport)?;

        ctx.backend.write_buffer(
            self.view_buffer,
            0,
            bytemuck::bytes_of(&view.uniform_data()),
        );

        let mut batches = BatchBuilder::new();
        ctx.visit(
            &view.frustum(),
            &mut OpaqueGather {
                batches: &mut batches,
            },
        );
        let mut instances = Vec::new();
        let batches = batches.finish(&mut instances);
        let instance_buffer = self
            .instances
            .upload(ctx.backend, bytemuck::cast_slice(&instances))?;

        let clear = |view| ColorAttachment {
            view,
            load_op: LoadOp::Clear([0.0, 0.0, 0.0, 0.0]),
            store_op: StoreOp::Store,
        };
        ctx.backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("GBuffer".into()),
            color_attachments: vec![
                clear(targets.diffuse_color.view),
                clear(targets.specular_color.view),
                clear(targets.specular_level.view),
                clear(targets.self_illumination.view),
                ColorAttachment {
                    view: targets.normal_z.view,
                    load_op: LoadOp::Clear([0.0, 0.0, 0.0, FAR_PLANE]),
                    store_op: StoreOp::Store,
                },
            ],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: targets.zbuffer.view,
                depth_load_op: LoadOp::Clear([1.0, 0.0, 0.0, 0.0]),
                depth_store_op: StoreOp::Store,
                depth_clear_value: 1.0,
            }),
        });
        ctx.backend.set_viewport(
            0.0,
            0.0,
            view.viewport.width as f32,
            view.viewport.height as f32,
            0.0,
            1.0,
        );
        if let Some(instance_buffer) = instance_buffer.filter(|_| !batches.is_empty()) {
            ctx.backend.set_render_pipeline(self.pipeline);
            ctx.backend.set_bind_group(0, self.view_bind_group);
            draw_batches(ctx.backend, &batches, instance_buffer, ctx.stats);
        }
        ctx.backend.end_render_pass();

        self.outputs.diffuse_color.set(targets.diffuse_color);
        self.outputs.specular_color.set(targets.specular_color);
        self.outputs.specular_level.set(targets.specular_level);
        self.outputs.self_illumination.set(targets.self_illumination);
        self.outputs.normal_z.set(targets.normal_z);
        self.outputs.zbuffer.set(targets.zbuffer);
        Ok(())
    }
}

const GBUFFER_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) eye_position: vec3<f32>,
    @location(1) eye_normal: vec3<f32>,
    @location(2) diffuse: vec4<f32>,
    @location(3) specular: vec4<f32>,
    @location(4) self_illumination: vec4<f32>,
}

struct GBufferOutput {
    @location(0) diffuse_color: vec4<f32>,
    @location(1) specular_color: vec4<f32>,
    @location(2) specular_level: vec4<f32>,
    @location(3) self_illumination: vec4<f32>,
    @location(4) normal_z: vec4<f32>,
}

@group(0) @binding(0) var<uniform> view: View;

@vertex
fn vs_main(vertex: VertexInput, instance: Instance) -> VertexOutput {
    let object_to_world = mat4x4<f32>(instance.m0, instance.m1, instance.m2, instance.m3);
    let object_to_eye = view.world_to_eye * object_to_world;
    let eye_position = object_to_eye * vec4<f32>(vertex.position, 1.0);

    var out: VertexOutput;
    out.clip_position = view.eye_to_projection * eye_position;
    out.eye_position = eye_position.xyz;
    out.eye_normal = (object_to_eye * vec4<f32>(vertex.normal, 0.0)).xyz;
    out.diffuse = instance.diffuse;
    out.specular = instance.specular;
    out.self_illumination = instance.self_illumination;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> GBufferOutput {
    var out: GBufferOutput;
    out.diffuse_color = vec4<f32>(in.diffuse.rgb, 1.0);
    out.specular_color = vec4<f32>(in.specular.rgb, 1.0);
    out.specular_level = vec4<f32>(in.specular.a, in.self_illumination.a, 0.0, 0.0);
    out.self_illumination = vec4<f32>(in.self_illumination.rgb, 1.0);
    out.normal_z = vec4<f32>(normalize(in.eye_normal), -in.eye_position.z);
    return out;
}
"#;
