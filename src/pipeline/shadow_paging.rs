//! Shadow map paging
//!
//! Lights wanting a shadow inside the cull frustum claim an entry in the
//! [`ShadowSlotCache`] every frame. After slots are assigned, only slots whose
//! content is stale (new owner, light moved, scene geometry changed) are drawn
//! again. Maps store the first two moments of linear light depth.

use super::geometry::{draw_batches, BatchBuilder, DrawBatch, DynamicBuffer, ObjectInstance, INSTANCE_WGSL};
use super::*;
use crate::dataflow::Port;
use crate::scene::{LightId, Model, ObjectId, SceneLight, SceneObject};
use crate::shadow::{ShadowSlotCache, ShadowStamp};
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

/// Light depth the maps are cleared to
const CLEAR_DEPTH: f32 = 1.0e4;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ShadowUniforms {
    world_to_shadow_projection: Mat4,
}

struct ShadowRequests<'a> {
    cache: &'a ShadowSlotCache,
    requested: &'a mut Vec<LightId>,
}

impl SceneVisitor for ShadowRequests<'_> {
    fn light(&mut self, id: LightId, light: &mut SceneLight) {
        if !light.wants_shadow() {
            return;
        }
        let cache = self.cache;
        light
            .shadow
            .get_or_insert_with(|| cache.create_entry())
            .use_in_frame();
        self.requested.push(id);
    }
}

struct ShadowCasters<'a> {
    batches: &'a mut BatchBuilder,
}

impl SceneVisitor for ShadowCasters<'_> {
    fn object(&mut self, _id: ObjectId, object: &SceneObject, model: &Model) {
        if !model.material.is_transparent() {
            self.batches.push(object, model);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ShadowJob {
    light: LightId,
    slot: u32,
    world_to_shadow_projection: Mat4,
    stamp: ShadowStamp,
}

pub struct ShadowPagingPass {
    view: ViewPorts,
    cache: ShadowSlotCache,
    maps: ShadowMapArray,
    output: Port<ShadowMapArray>,
    pipeline: RenderPipelineHandle,
    /// Uniform buffer and bind group per slot
    slot_bindings: Vec<(BufferHandle, BindGroupHandle)>,
    instances: DynamicBuffer,
    cull_frustum_far: f32,
    requested: Vec<LightId>,
}

impl ShadowPagingPass {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        view: ViewPorts,
        config: &crate::RendererConfig,
    ) -> RendererResult<Self> {
        if config.shadow_map_count == 0 {
            return Err(RendererError::InvalidConfig(
                "shadow_map_count must be at least 1".into(),
            ));
        }

        let layout = backend.create_bind_group_layout(&[layout_entry(
            0,
            ShaderStageFlags::VERTEX,
            BindingType::UniformBuffer,
        )])?;
        let pipeline = create_render_pipeline(
            backend,
            &RenderPipelineDescriptor {
                label: Some("shadow map".into()),
                shader: [INSTANCE_WGSL, SHADOW_SHADER].concat(),
                has_fragment: true,
                vertex_layouts: vec![Vertex::layout(), ObjectInstance::layout()],
                bind_group_layouts: vec![layout],
                primitive_topology: PrimitiveTopology::TriangleList,
                front_face: FrontFace::Ccw,
                cull_mode: CullMode::None,
                depth_stencil: Some(DepthStencilState {
                    format: TextureFormat::Depth32Float,
                    depth_write_enabled: true,
                    depth_compare: CompareFunction::Less,
                }),
                color_targets: vec![ColorTargetState::opaque(ShadowMapArray::FORMAT)],
            },
        )?;

        let maps = ShadowMapArray::new(backend, config.shadow_map_count, config.shadow_map_size)?;
        let slot_bindings = (0..maps.layers())
            .map(|_| {
                let buffer = uniform_buffer(
                    backend,
                    "Shadow Slot Uniforms",
                    std::mem::size_of::<ShadowUniforms>() as u64,
                )?;
                let bind_group =
                    backend.create_bind_group(layout, &[(0, BindGroupEntry::buffer(buffer))])?;
                Ok((buffer, bind_group))
            })
            .collect::<BackendResult<Vec<_>>>()?;

        Ok(Self {
            view,
            cache: ShadowSlotCache::new(maps.layers()),
            output: Port::with_value(maps.clone()),
            maps,
            pipeline,
            slot_bindings,
            instances: DynamicBuffer::vertex("Shadow Instances"),
            cull_frustum_far: config.cull_far_plane,
            requested: Vec::new(),
        })
    }

    /// Producer side of the shadow map array
    pub fn shadow_maps(&self) -> &Port<ShadowMapArray> {
        &self.output
    }

    pub fn cache(&self) -> &ShadowSlotCache {
        &self.cache
    }

    /// Claim entries for every shadow casting light in view and assign slots
    fn page_in(&mut self, ctx: &mut PassContext, view: &FrameView) -> Vec<ShadowJob> {
        self.cache.start_frame();
        self.requested.clear();
        let mut requests = ShadowRequests {
            cache: &self.cache,
            requested: &mut self.requested,
        };
        ctx.visit(&view.cull_frustum(self.cull_frustum_far), &mut requests);
        self.cache.assign_indexes();

        let scene_revision = ctx.scene.geometry_revision();
        self.requested
            .iter()
            .filter_map(|&id| {
                let light = ctx.scene.light(id)?;
                let entry = light.shadow.as_ref()?;
                let slot = entry.slot()?;
                let stamp = ShadowStamp {
                    light_revision: light.revision(),
                    scene_revision,
                };
                entry.needs_render(stamp).then(|| ShadowJob {
                    light: id,
                    slot,
                    world_to_shadow_projection: light.world_to_shadow_projection(),
                    stamp,
                })
            })
            .collect()
    }
}

impl FramePass for ShadowPagingPass {
    fn name(&self) -> &'static str {
        "shadow paging"
    }

    fn run(&mut self, ctx: &mut PassContext) -> RendererResult<()> {
        let view = self.view.resolve()?;
        let jobs = self.page_in(ctx, &view);
        if jobs.len() < self.requested.len() {
            log::trace!(
                "{} of {} shadow maps still valid",
                self.requested.len() - jobs.len(),
                self.requested.len()
            );
        }
        if jobs.is_empty() {
            return Ok(());
        }

        let mut instances = Vec::new();
        let job_batches: Vec<Vec<DrawBatch>> = jobs
            .iter()
            .map(|job| {
                let mut batches = BatchBuilder::new();
                ctx.visit(
                    &Frustum::from_matrix(&job.world_to_shadow_projection),
                    &mut ShadowCasters {
                        batches: &mut batches,
                    },
                );
                batches.finish(&mut instances)
            })
            .collect();
        let instance_buffer = self
            .instances
            .upload(ctx.backend, bytemuck::cast_slice(&instances))?;

        for (job, batches) in jobs.iter().zip(&job_batches) {
            let Some(&(uniforms, bind_group)) = self.slot_bindings.get(job.slot as usize) else {
                continue;
            };
            ctx.backend.write_buffer(
                uniforms,
                0,
                bytemuck::bytes_of(&ShadowUniforms {
                    world_to_shadow_projection: job.world_to_shadow_projection,
                }),
            );

            ctx.backend.begin_render_pass(&RenderPassDescriptor {
                label: Some("Shadow Map".into()),
                color_attachments: vec![ColorAttachment {
                    view: self.maps.layer_views[job.slot as usize],
                    load_op: LoadOp::Clear([CLEAR_DEPTH, CLEAR_DEPTH * CLEAR_DEPTH, 0.0, 0.0]),
                    store_op: StoreOp::Store,
                }],
                depth_stencil_attachment: Some(DepthStencilAttachment {
                    view: self.maps.depth.view,
                    depth_load_op: LoadOp::Clear([1.0, 0.0, 0.0, 0.0]),
                    depth_store_op: StoreOp::Discard,
                    depth_clear_value: 1.0,
                }),
            });
            let size = self.maps.size as f32;
            ctx.backend.set_viewport(0.0, 0.0, size, size, 0.0, 1.0);
            if let Some(instance_buffer) = instance_buffer.filter(|_| !batches.is_empty()) {
                ctx.backend.set_render_pipeline(self.pipeline);
                ctx.backend.set_bind_group(0, bind_group);
                draw_batches(ctx.backend, batches, instance_buffer, ctx.stats);
            }
            ctx.backend.end_render_pass();

            if let Some(entry) = ctx.scene.light(job.light).and_then(|l| l.shadow.as_ref()) {
                entry.mark_rendered(job.stamp);
            }
            ctx.stats.shadow_maps_rendered += 1;
        }
        Ok(())
    }
}

const SHADOW_SHADER: &str = r#"
struct ShadowUniforms {
    world_to_shadow_projection: mat4x4<f32>,
}

struct ShadowOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) light_depth: f32,
}

@group(0) @binding(0) var<uniform> shadow: ShadowUniforms;

@vertex
fn vs_main(vertex: VertexInput, instance: Instance) -> ShadowOutput {
    let object_to_world = mat4x4<f32>(instance.m0, instance.m1, instance.m2, instance.m3);
    let clip = shadow.world_to_shadow_projection * object_to_world * vec4<f32>(vertex.position, 1.0);
    var out: ShadowOutput;
    out.clip_position = clip;
    out.light_depth = clip.w;
    return out;
}

@fragment
fn fs_main(in: ShadowOutput) -> @location(0) vec4<f32> {
    let depth = in.light_depth;
    return vec4<f32>(depth, depth * depth, 0.0, 0.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;
    use crate::scene::Scene;
    use glam::{Quat, Vec3};

    fn frame(pass: &mut ShadowPagingPass, backend: &mut RecordingBackend, scene: &mut Scene) -> FrameStats {
        let mut stats = FrameStats::default();
        let frame = backend.begin_frame().unwrap();
        let mut ctx = PassContext {
            backend: &mut *backend,
            scene: &mut *scene,
            stats: &mut stats,
            frame,
        };
        pass.run(&mut ctx).unwrap();
        backend.end_frame().unwrap();
        stats
    }

    fn setup(slots: u32) -> (RecordingBackend, ShadowPagingPass, ViewPorts) {
        let mut backend = RecordingBackend::new(64, 64);
        let producer = ViewPorts::default();
        producer.viewport.set(Viewport::new(64, 64));
        producer.field_of_view.set(60.0);
        producer.world_to_eye.set(Mat4::look_at_rh(Vec3::new(0.0, 0.0, 20.0), Vec3::ZERO, Vec3::Y));
        let config = crate::RendererConfig {
            shadow_map_count: slots,
            shadow_map_size: 32,
            ..Default::default()
        };
        let pass =
            ShadowPagingPass::new(&mut backend, ViewPorts::bound_to(&producer).unwrap(), &config).unwrap();
        (backend, pass, producer)
    }

    fn shadow_spot(x: f32) -> SceneLight {
        SceneLight::spot(Vec3::new(x, 5.0, 0.0), Quat::from_rotation_x(-1.2), Vec3::ONE, 30.0)
            .with_shadow(true)
    }

    #[test]
    fn test_unchanged_maps_are_not_redrawn() {
        let (mut backend, mut pass, _view) = setup(4);
        let mut scene = Scene::new();
        scene.add_light(shadow_spot(0.0));
        scene.add_light(shadow_spot(4.0));

        assert_eq!(frame(&mut pass, &mut backend, &mut scene).shadow_maps_rendered, 2);
        assert_eq!(frame(&mut pass, &mut backend, &mut scene).shadow_maps_rendered, 0);
        assert_eq!(pass.cache().assigned_count(), 2);
    }

    #[test]
    fn test_moved_light_is_redrawn() {
        let (mut backend, mut pass, _view) = setup(4);
        let mut scene = Scene::new();
        let moving = scene.add_light(shadow_spot(0.0));
        scene.add_light(shadow_spot(4.0));
        frame(&mut pass, &mut backend, &mut scene);

        scene.update_light(moving, |light| light.position.x = 1.0);
        assert_eq!(frame(&mut pass, &mut backend, &mut scene).shadow_maps_rendered, 1);
    }

    #[test]
    fn test_exhausted_pool_leaves_lights_unshadowed() {
        let (mut backend, mut pass, _view) = setup(1);
        let mut scene = Scene::new();
        let a = scene.add_light(shadow_spot(0.0));
        let b = scene.add_light(shadow_spot(4.0));
        frame(&mut pass, &mut backend, &mut scene);

        let indices = [scene.light(a).unwrap().shadow_index(), scene.light(b).unwrap().shadow_index()];
        assert_eq!(indices.iter().filter(|&&i| i == 0).count(), 1);
        assert_eq!(indices.iter().filter(|&&i| i == -1).count(), 1);
        assert!(pass.cache().assigned_count() <= 1);
    }

    #[test]
    fn test_omni_lights_get_no_slot() {
        let (mut backend, mut pass, _view) = setup(2);
        let mut scene = Scene::new();
        let omni = scene.add_light(SceneLight::omni(Vec3::ZERO, Vec3::ONE, 10.0).with_shadow(true));
        let stats = frame(&mut pass, &mut backend, &mut scene);
        assert_eq!(stats.shadow_maps_rendered, 0);
        assert_eq!(scene.light(omni).unwrap().shadow_index(), -1);
    }
}
