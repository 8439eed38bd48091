//! Forward-lit transparent geometry
//!
//! Transparent objects are sorted back to front and blended over the lit
//! color target, tested against the G-buffer depth without writing it. Each
//! fragment walks the whole light buffer up to its zeroed terminator.

use super::geometry::{draw_batches, DrawBatch, DynamicBuffer, ObjectInstance, INSTANCE_WGSL};
use super::lightsource::{LIGHTING_WGSL, SHADE_LIGHT_WGSL};
use super::view::VIEW_WGSL;
use super::*;
use crate::dataflow::Port;
use crate::scene::{Model, ObjectId, SceneObject};
use glam::Vec3;

/// Inputs of the transparency pass
pub struct TransparencyInputs {
    pub view: ViewPorts,
    pub final_color: Port<RenderTarget>,
    pub zbuffer: Port<RenderTarget>,
    pub light_buffer: Port<BufferHandle>,
    pub shadow_maps: Port<ShadowMapArray>,
}

struct TransparentGather<'a> {
    eye: Vec3,
    found: &'a mut Vec<(f32, DrawBatch, ObjectInstance)>,
}

impl SceneVisitor for TransparentGather<'_> {
    fn object(&mut self, _id: ObjectId, object: &SceneObject, model: &Model) {
        if !model.material.is_transparent() {
            return;
        }
        let Some(mesh) = model.gpu() else {
            return;
        };
        let center = object.world_bounds(&model.bounds()).center();
        self.found.push((
            center.distance_squared(self.eye),
            DrawBatch {
                mesh: *mesh,
                instances: 0..1,
            },
            ObjectInstance::new(object, model),
        ));
    }
}

/// Order draws farthest first; returns the instances in draw order
pub fn sort_back_to_front(found: &mut Vec<(f32, DrawBatch, ObjectInstance)>) -> (Vec<DrawBatch>, Vec<ObjectInstance>) {
    found.sort_by(|a, b| b.0.total_cmp(&a.0));
    found
        .drain(..)
        .enumerate()
        .map(|(i, (_, batch, instance))| {
            let i = i as u32;
            (
                DrawBatch {
                    instances: i..i + 1,
                    ..batch
                },
                instance,
            )
        })
        .unzip()
}

pub struct TransparencyPass {
    inputs: TransparencyInputs,
    layout: BindGroupLayoutHandle,
    pipeline: RenderPipelineHandle,
    view_buffer: BufferHandle,
    binding: Option<((BufferHandle, TextureViewHandle), BindGroupHandle)>,
    instances: DynamicBuffer,
    found: Vec<(f32, DrawBatch, ObjectInstance)>,
}

impl TransparencyPass {
    pub fn new(backend: &mut dyn GraphicsBackend, inputs: TransparencyInputs) -> RendererResult<Self> {
        let layout = backend.create_bind_group_layout(&[
            layout_entry(0, ShaderStageFlags::VERTEX_FRAGMENT, BindingType::UniformBuffer),
            layout_entry(1, ShaderStageFlags::FRAGMENT, BindingType::StorageBuffer { read_only: true }),
            layout_entry(
                2,
                ShaderStageFlags::FRAGMENT,
                BindingType::Texture {
                    sample_type: TextureSampleType::Float { filterable: false },
                    view_dimension: TextureViewDimension::D2Array,
                },
            ),
        ])?;
        let pipeline = create_render_pipeline(
            backend,
            &RenderPipelineDescriptor {
                label: Some("transparency".into()),
                shader: [
                    VIEW_WGSL,
                    INSTANCE_WGSL,
                    LIGHTING_WGSL,
                    SHADE_LIGHT_WGSL,
                    TRANSPARENCY_SHADER,
                ]
                .concat(),
                has_fragment: true,
                vertex_layouts: vec![Vertex::layout(), ObjectInstance::layout()],
                bind_group_layouts: vec![layout],
                primitive_topology: PrimitiveTopology::TriangleList,
                front_face: FrontFace::Ccw,
                cull_mode: CullMode::Back,
                depth_stencil: Some(DepthStencilState {
                    format: TextureFormat::Depth32Float,
                    depth_write_enabled: false,
                    depth_compare: CompareFunction::Less,
                }),
                color_targets: vec![ColorTargetState {
                    format: TextureFormat::Rgba16Float,
                    blend: Some(BlendState::alpha_blending()),
                    write_mask: ColorWrites::ALL,
                }],
            },
        )?;
        let view_buffer = uniform_buffer(
            backend,
            "Transparency View",
            std::mem::size_of::<ViewUniformData>() as u64,
        )?;

        Ok(Self {
            inputs,
            layout,
            pipeline,
            view_buffer,
            binding: None,
            instances: DynamicBuffer::vertex("Transparency Instances"),
            found: Vec::new(),
        })
    }

    fn bind_group(&mut self, backend: &mut dyn GraphicsBackend) -> RendererResult<BindGroupHandle> {
        let key = (
            self.inputs.light_buffer.get()?,
            self.inputs.shadow_maps.with(|maps| maps.array_view)?,
        );
        match self.binding {
            Some((current, bind_group)) if current == key => return Ok(bind_group),
            Some((_, stale)) => backend.destroy_bind_group(stale),
            None => {}
        }
        let bind_group = backend.create_bind_group(
            self.layout,
            &[
                (0, BindGroupEntry::buffer(self.view_buffer)),
                (1, BindGroupEntry::buffer(key.0)),
                (2, BindGroupEntry::Texture(key.1)),
            ],
        )?;
        self.binding = Some((key, bind_group));
        Ok(bind_group)
    }
}

impl FramePass for TransparencyPass {
    fn name(&self) -> &'static str {
        "transparency"
    }

    fn run(&mut self, ctx: &mut PassContext) -> RendererResult<()> {
        let view = self.inputs.view.resolve()?;
        let final_color = self.inputs.final_color.get()?;
        let zbuffer = self.inputs.zbuffer.get()?;

        let mut found = std::mem::take(&mut self.found);
        ctx.visit(
            &view.frustum(),
            &mut TransparentGather {
                eye: view.eye_position(),
                found: &mut found,
            },
        );
        let (batches, instances) = sort_back_to_front(&mut found);
        self.found = found;
        if batches.is_empty() {
            return Ok(());
        }

        let bind_group = self.bind_group(ctx.backend)?;
        ctx.backend
            .write_buffer(self.view_buffer, 0, bytemuck::bytes_of(&view.uniform_data()));
        let Some(instance_buffer) = self
            .instances
            .upload(ctx.backend, bytemuck::cast_slice(&instances))?
        else {
            return Ok(());
        };

        ctx.backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Transparency".into()),
            color_attachments: vec![ColorAttachment {
                view: final_color.view,
                load_op: LoadOp::Load,
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: zbuffer.view,
                depth_load_op: LoadOp::Load,
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
        ctx.backend.set_render_pipeline(self.pipeline);
        ctx.backend.set_bind_group(0, bind_group);
        draw_batches(ctx.backend, &batches, instance_buffer, ctx.stats);
        ctx.backend.end_render_pass();
        Ok(())
    }
}

const TRANSPARENCY_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) eye_position: vec3<f32>,
    @location(1) eye_normal: vec3<f32>,
    @location(2) diffuse: vec4<f32>,
    @location(3) specular: vec4<f32>,
    @location(4) self_illumination: vec4<f32>,
}

@group(0) @binding(0) var<uniform> view: View;
@group(0) @binding(1) var<storage, read> lights: array<Light>;
@group(0) @binding(2) var shadow_maps: texture_2d_array<f32>;

@vertex
fn vs_main(vertex: VertexInput, instance: Instance) -> VertexOutput {
    let object_to_world = mat4x4<f32>(instance.m0, instance.m1, instance.m2, instance.m3);
    let eye_position = view.world_to_eye * object_to_world * vec4<f32>(vertex.position, 1.0);

    var out: VertexOutput;
    out.clip_position = view.eye_to_projection * eye_position;
    out.eye_position = eye_position.xyz;
    out.eye_normal = (view.world_to_eye * object_to_world * vec4<f32>(vertex.normal, 0.0)).xyz;
    out.diffuse = instance.diffuse;
    out.specular = instance.specular;
    out.self_illumination = instance.self_illumination;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let normal = normalize(in.eye_normal);
    let view_dir = normalize(-in.eye_position);
    let level = vec2<f32>(in.specular.a, in.self_illumination.a);

    var color = in.self_illumination.rgb;
    let count = arrayLength(&lights);
    for (var i = 0u; i < count; i = i + 1u) {
        let light = lights[i];
        if light.range.x == 0.0 {
            break;
        }
        color = color + shade_light(light, in.eye_position, normal, view_dir, in.diffuse.rgb, in.specular.rgb, level);
    }
    return vec4<f32>(color, in.diffuse.a);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;
    use crate::resources::{Material, Mesh};
    use crate::scene::{Scene, Transform};
    use bevy_ecs::entity::Entity;

    #[test]
    fn test_farthest_object_is_drawn_first() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut scene = Scene::new();
        let glass = scene.add_model(Mesh::cube(1.0), Material::glass());
        scene.prepare(&mut backend).unwrap();
        let model = scene.model(glass).unwrap();

        let mut found = Vec::new();
        let mut gather = TransparentGather {
            eye: Vec3::ZERO,
            found: &mut found,
        };
        for z in [-3.0, -9.0, -5.0] {
            let object = SceneObject::new(glass, Transform::from_position(Vec3::new(0.0, 0.0, z)));
            gather.object(ObjectId(Entity::PLACEHOLDER), &object, model);
        }

        let (batches, instances) = sort_back_to_front(&mut found);
        let depths: Vec<f32> = instances.iter().map(|i| i.object_to_world.w_axis.z).collect();
        assert_eq!(depths, vec![-9.0, -5.0, -3.0]);
        assert_eq!(batches[2].instances, 2..3);
    }

    #[test]
    fn test_opaque_objects_are_ignored() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut scene = Scene::new();
        let solid = scene.add_model(Mesh::cube(1.0), Material::default());
        scene.prepare(&mut backend).unwrap();

        let mut found = Vec::new();
        let object = SceneObject::new(solid, Transform::default());
        TransparentGather {
            eye: Vec3::ZERO,
            found: &mut found,
        }
        .object(ObjectId(Entity::PLACEHOLDER), &object, scene.model(solid).unwrap());
        assert!(found.is_empty());
    }
}
