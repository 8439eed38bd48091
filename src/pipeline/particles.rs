//! Particle emitter simulation and billboard drawing
//!
//! Emitters found in the cull frustum are marked visible and spawn; emitters
//! that left it keep simulating until their last particle dies, then their
//! simulation is retired. Particles are drawn per emitter, farthest emitter
//! first and each emitter's particles back to front.

use super::geometry::DynamicBuffer;
use super::view::VIEW_WGSL;
use super::*;
use crate::dataflow::Port;
use crate::scene::{EmitterId, EmitterSimulation, ParticleEmitter};
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use std::collections::HashMap;

/// Inputs of the particle pass
pub struct ParticleInputs {
    pub view: ViewPorts,
    pub final_color: Port<RenderTarget>,
    pub zbuffer: Port<RenderTarget>,
    /// Seconds since the previous frame
    pub elapsed: Port<f32>,
}

/// Per-particle instance: (position, size) and its current color
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ParticleInstance {
    pub position_size: [f32; 4],
    pub color: [f32; 4],
}

impl ParticleInstance {
    /// Expand the two packed vectors of a particle with the emitter's color ramp
    pub fn from_vectors(vectors: &[f32; 8], emitter: &ParticleEmitter) -> Self {
        let life = vectors[4].clamp(0.0, 1.0);
        Self {
            position_size: [vectors[0], vectors[1], vectors[2], vectors[3]],
            color: emitter.start_color.lerp(emitter.end_color, life).to_array(),
        }
    }

    pub fn layout() -> VertexBufferLayout {
        VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as u64,
            step_mode: VertexStepMode::Instance,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float32x4,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: VertexFormat::Float32x4,
                    offset: 16,
                },
            ],
        }
    }
}

struct EmitterGather<'a> {
    simulations: &'a mut HashMap<EmitterId, EmitterSimulation>,
}

impl SceneVisitor for EmitterGather<'_> {
    fn emitter(&mut self, id: EmitterId, _emitter: &ParticleEmitter) {
        self.simulations
            .entry(id)
            .or_insert_with(|| EmitterSimulation::new(id.seed()))
            .visible = true;
    }
}

pub struct ParticleEmitterPass {
    inputs: ParticleInputs,
    cull_far_plane: f32,
    pipeline: RenderPipelineHandle,
    view_buffer: BufferHandle,
    bind_group: BindGroupHandle,
    instances: DynamicBuffer,
    simulations: HashMap<EmitterId, EmitterSimulation>,
}

impl ParticleEmitterPass {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        inputs: ParticleInputs,
        config: &crate::RendererConfig,
    ) -> RendererResult<Self> {
        let layout = backend.create_bind_group_layout(&[layout_entry(
            0,
            ShaderStageFlags::VERTEX,
            BindingType::UniformBuffer,
        )])?;
        let pipeline = create_render_pipeline(
            backend,
            &RenderPipelineDescriptor {
                label: Some("particles".into()),
                shader: [VIEW_WGSL, PARTICLE_SHADER].concat(),
                has_fragment: true,
                vertex_layouts: vec![ParticleInstance::layout()],
                bind_group_layouts: vec![layout],
                primitive_topology: PrimitiveTopology::TriangleList,
                front_face: FrontFace::Ccw,
                cull_mode: CullMode::None,
                depth_stencil: Some(DepthStencilState {
                    format: TextureFormat::Depth32Float,
                    depth_write_enabled: false,
                    depth_compare: CompareFunction::LessEqual,
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
            "Particles View",
            std::mem::size_of::<ViewUniformData>() as u64,
        )?;
        let bind_group = backend.create_bind_group(layout, &[(0, BindGroupEntry::buffer(view_buffer))])?;

        Ok(Self {
            inputs,
            cull_far_plane: config.cull_far_plane,
            pipeline,
            view_buffer,
            bind_group,
            instances: DynamicBuffer::vertex("Particle Instances"),
            simulations: HashMap::new(),
        })
    }

    /// Emitters currently simulated, visible or draining
    pub fn active_emitters(&self) -> usize {
        self.simulations.len()
    }

    /// Advance every simulation and drop the ones that went inactive or whose
    /// emitter was removed from the scene
    fn update(&mut self, ctx: &mut PassContext, view: &FrameView, elapsed: f32) {
        for simulation in self.simulations.values_mut() {
            simulation.visible = false;
        }
        ctx.visit(
            &view.cull_frustum(self.cull_far_plane),
            &mut EmitterGather {
                simulations: &mut self.simulations,
            },
        );

        let scene = &*ctx.scene;
        self.simulations.retain(|id, simulation| match scene.emitter(*id) {
            Some(emitter) => simulation.update(emitter, elapsed),
            None => false,
        });
    }

    /// Instances in draw order plus the instance range of every emitter
    fn build_instances(&self, scene: &crate::scene::Scene, eye: Vec3) -> (Vec<ParticleInstance>, Vec<std::ops::Range<u32>>) {
        let mut emitters: Vec<(f32, &ParticleEmitter, &EmitterSimulation)> = self
            .simulations
            .iter()
            .filter(|(_, simulation)| !simulation.particles().is_empty())
            .filter_map(|(id, simulation)| {
                let emitter = scene.emitter(*id)?;
                Some((emitter.position.distance_squared(eye), emitter, simulation))
            })
            .collect();
        emitters.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut instances = Vec::new();
        let mut ranges = Vec::with_capacity(emitters.len());
        for (_, emitter, simulation) in emitters {
            let start = instances.len() as u32;
            instances.extend(
                simulation
                    .instance_vectors(eye)
                    .iter()
                    .map(|vectors| ParticleInstance::from_vectors(vectors, emitter)),
            );
            ranges.push(start..instances.len() as u32);
        }
        (instances, ranges)
    }
}

impl FramePass for ParticleEmitterPass {
    fn name(&self) -> &'static str {
        "particles"
    }

    fn run(&mut self, ctx: &mut PassContext) -> RendererResult<()> {
        let view = self.inputs.view.resolve()?;
        let elapsed = self.inputs.elapsed.get()?;
        let final_color = self.inputs.final_color.get()?;
        let zbuffer = self.inputs.zbuffer.get()?;

        self.update(ctx, &view, elapsed);
        let (instances, ranges) = self.build_instances(&*ctx.scene, view.eye_position());
        if instances.is_empty() {
            return Ok(());
        }
        let Some(instance_buffer) = self
            .instances
            .upload(ctx.backend, bytemuck::cast_slice(&instances))?
        else {
            return Ok(());
        };
        ctx.backend
            .write_buffer(self.view_buffer, 0, bytemuck::bytes_of(&view.uniform_data()));

        ctx.backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Particles".into()),
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
        ctx.backend.set_bind_group(0, self.bind_group);
        ctx.backend.set_vertex_buffer(0, instance_buffer, 0);
        for range in ranges {
            ctx.stats.particles_drawn += range.len() as u32;
            ctx.backend.draw(0..6, range);
        }
        ctx.backend.end_render_pass();
        Ok(())
    }
}

const PARTICLE_SHADER: &str = r#"
struct ParticleOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
    @location(1) color: vec4<f32>,
}

@group(0) @binding(0) var<uniform> view: View;

@vertex
fn vs_main(
    @builtin(vertex_index) index: u32,
    @location(0) position_size: vec4<f32>,
    @location(1) color: vec4<f32>,
) -> ParticleOutput {
    var corners = array<vec2<f32>, 6>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(1.0, -1.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(-1.0, 1.0),
    );
    let corner = corners[index];
    let center = view.world_to_eye * vec4<f32>(position_size.xyz, 1.0);
    let eye = center.xyz + vec3<f32>(corner * (position_size.w * 0.5), 0.0);

    var out: ParticleOutput;
    out.position = view.eye_to_projection * vec4<f32>(eye, 1.0);
    out.uv = corner;
    out.color = color;
    return out;
}

@fragment
fn fs_main(in: ParticleOutput) -> @location(0) vec4<f32> {
    let falloff = clamp(1.0 - length(in.uv), 0.0, 1.0);
    return vec4<f32>(in.color.rgb, in.color.a * falloff);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;
    use crate::scene::Scene;
    use glam::{Mat4, Vec4};

    struct Fixture {
        backend: RecordingBackend,
        pass: ParticleEmitterPass,
        view: ViewPorts,
        elapsed: Port<f32>,
    }

    fn setup() -> Fixture {
        let mut backend = RecordingBackend::new(64, 64);
        let view = ViewPorts::default();
        view.viewport.set(Viewport::new(64, 64));
        view.field_of_view.set(60.0);
        view.world_to_eye
            .set(Mat4::look_at_rh(Vec3::new(0.0, 0.0, 20.0), Vec3::ZERO, Vec3::Y));
        let usage = TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING;
        let color = RenderTarget::new(&mut backend, "color", 64, 64, TextureFormat::Rgba16Float, usage).unwrap();
        let depth = RenderTarget::new(&mut backend, "depth", 64, 64, TextureFormat::Depth32Float, usage).unwrap();
        let elapsed = Port::new();

        let mut inputs = ParticleInputs {
            view: ViewPorts::bound_to(&view).unwrap(),
            final_color: Port::with_value(color),
            zbuffer: Port::with_value(depth),
            elapsed: Port::new(),
        };
        inputs.elapsed.bind_from(&elapsed).unwrap();
        let pass = ParticleEmitterPass::new(&mut backend, inputs, &crate::RendererConfig::default()).unwrap();
        Fixture {
            backend,
            pass,
            view,
            elapsed,
        }
    }

    fn frame(fixture: &mut Fixture, scene: &mut Scene, elapsed: f32) -> FrameStats {
        fixture.elapsed.set(elapsed);
        let mut stats = FrameStats::default();
        let frame = fixture.backend.begin_frame().unwrap();
        let mut ctx = PassContext {
            backend: &mut fixture.backend,
            scene: &mut *scene,
            stats: &mut stats,
            frame,
        };
        fixture.pass.run(&mut ctx).unwrap();
        fixture.backend.end_frame().unwrap();
        stats
    }

    fn fountain(position: Vec3) -> ParticleEmitter {
        ParticleEmitter {
            particles_per_second: 10.0,
            life_span: 1.0,
            ..ParticleEmitter::new(position)
        }
    }

    #[test]
    fn test_visible_emitter_spawns_and_draws() {
        let mut fixture = setup();
        let mut scene = Scene::new();
        scene.add_emitter(fountain(Vec3::ZERO));

        let stats = frame(&mut fixture, &mut scene, 0.5);
        assert_eq!(stats.particles_drawn, 5);
        assert_eq!(fixture.pass.active_emitters(), 1);
    }

    #[test]
    fn test_removed_emitter_is_retired() {
        let mut fixture = setup();
        let mut scene = Scene::new();
        let id = scene.add_emitter(fountain(Vec3::ZERO));
        frame(&mut fixture, &mut scene, 0.5);

        scene.remove_emitter(id);
        let stats = frame(&mut fixture, &mut scene, 0.1);
        assert_eq!(stats.particles_drawn, 0);
        assert_eq!(fixture.pass.active_emitters(), 0);
    }

    #[test]
    fn test_emitter_out_of_view_drains_then_retires() {
        let mut fixture = setup();
        let mut scene = Scene::new();
        scene.add_emitter(fountain(Vec3::ZERO));
        frame(&mut fixture, &mut scene, 0.5);

        // Turn the camera away; particles already in flight keep drawing
        fixture
            .view
            .world_to_eye
            .set(Mat4::look_at_rh(Vec3::new(0.0, 0.0, 20.0), Vec3::new(0.0, 0.0, 40.0), Vec3::Y));
        frame(&mut fixture, &mut scene, 0.25);
        assert_eq!(fixture.pass.active_emitters(), 1);

        frame(&mut fixture, &mut scene, 1.0);
        assert_eq!(fixture.pass.active_emitters(), 0);
    }

    #[test]
    fn test_instance_color_follows_life() {
        let emitter = ParticleEmitter {
            start_color: Vec4::new(1.0, 0.0, 0.0, 1.0),
            end_color: Vec4::new(0.0, 0.0, 1.0, 0.0),
            ..Default::default()
        };
        let instance = ParticleInstance::from_vectors(&[1.0, 2.0, 3.0, 0.5, 0.25, 0.0, 0.0, 0.0], &emitter);
        assert_eq!(instance.position_size, [1.0, 2.0, 3.0, 0.5]);
        assert_eq!(instance.color, [0.75, 0.0, 0.25, 0.75]);
    }
}
