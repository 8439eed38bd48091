//! Star field and cloud cube behind the scene
//!
//! Both programs push their vertices to the far plane (`clip.xyww`) and test
//! `LessEqual` against the G-buffer depth without writing it, so they only
//! land on pixels no geometry covered. Stars are drawn first and the cloud
//! layer is blended over them.

use super::*;
use crate::dataflow::Port;
use crate::scene::XorShift32;
use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4, Vec4};

pub const STAR_COUNT: usize = 1024;
pub const STAR_RANGE: f32 = 700.0;
pub const STAR_MIN_RADIUS: f32 = 350.0;
const CLOUD_TEXTURE_SIZE: u32 = 128;

/// Inputs of the skybox pass
pub struct SkyboxInputs {
    pub view: ViewPorts,
    pub final_color: Port<RenderTarget>,
    pub zbuffer: Port<RenderTarget>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SkyUniforms {
    /// Camera rotation only, the sky never gets closer
    object_to_eye: Mat4,
    eye_to_projection: Mat4,
}

/// Star positions in the shell between [`STAR_MIN_RADIUS`] and the range cube
pub fn generate_stars(count: usize, seed: u32) -> Vec<Vec4> {
    let mut rng = XorShift32::new(seed);
    (0..count)
        .map(|_| loop {
            let p = glam::Vec3::new(rng.next_signed(), rng.next_signed(), rng.next_signed()) * STAR_RANGE;
            if p.length() >= STAR_MIN_RADIUS {
                break p.extend(1.0);
            }
        })
        .collect()
}

/// Tileable cloud layer as Rgba8Unorm texels
pub fn cloud_texels(size: u32, seed: u32) -> Vec<u8> {
    const LATTICE: usize = 16;
    let mut rng = XorShift32::new(seed);
    let lattice: Vec<f32> = (0..LATTICE * LATTICE).map(|_| rng.next_f32()).collect();
    let sample = |x: f32, y: f32| {
        let (x0, y0) = (x.floor(), y.floor());
        let (fx, fy) = (x - x0, y - y0);
        let (sx, sy) = (fx * fx * (3.0 - 2.0 * fx), fy * fy * (3.0 - 2.0 * fy));
        let at = |ix: f32, iy: f32| {
            let ix = (ix as i64).rem_euclid(LATTICE as i64) as usize;
            let iy = (iy as i64).rem_euclid(LATTICE as i64) as usize;
            lattice[iy * LATTICE + ix]
        };
        let top = at(x0, y0) + (at(x0 + 1.0, y0) - at(x0, y0)) * sx;
        let bottom = at(x0, y0 + 1.0) + (at(x0 + 1.0, y0 + 1.0) - at(x0, y0 + 1.0)) * sx;
        top + (bottom - top) * sy
    };

    let size = size.max(1);
    let mut texels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let (u, v) = (x as f32 / size as f32, y as f32 / size as f32);
            let mut turbulence = 0.0;
            let mut amplitude = 0.5;
            let mut frequency = 2.0;
            let mut total = 0.0;
            while frequency <= LATTICE as f32 {
                // Lattice wraps every LATTICE cells, so integer frequencies tile
                turbulence += sample(u * frequency, v * frequency) * amplitude;
                total += amplitude;
                amplitude *= 0.5;
                frequency *= 2.0;
            }
            let t = turbulence / total;
            let alpha = ((t - 0.45) * 2.5).clamp(0.0, 1.0);
            texels.extend_from_slice(&[31, 26, 60, (alpha * 255.0) as u8]);
        }
    }
    texels
}

/// Corners of the unit cube as a triangle list
fn cube_vertices() -> Vec<[f32; 3]> {
    const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
        ([-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
        ([0.0, -1.0, 0.0], [0.0, 0.0, -1.0], [1.0, 0.0, 0.0]),
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
    ];
    let mut vertices = Vec::with_capacity(36);
    for (n, a, b) in FACES {
        let corner = |sa: f32, sb: f32| [0, 1, 2].map(|i| n[i] + a[i] * sa + b[i] * sb);
        vertices.extend([
            corner(-1.0, -1.0),
            corner(1.0, -1.0),
            corner(1.0, 1.0),
            corner(-1.0, -1.0),
            corner(1.0, 1.0),
            corner(-1.0, 1.0),
        ]);
    }
    vertices
}

pub struct SkyboxPass {
    inputs: SkyboxInputs,
    stars_pipeline: RenderPipelineHandle,
    cloud_pipeline: RenderPipelineHandle,
    uniform_buffer: BufferHandle,
    bind_group: BindGroupHandle,
    star_buffer: BufferHandle,
    cube_buffer: BufferHandle,
    star_count: u32,
}

impl SkyboxPass {
    pub fn new(backend: &mut dyn GraphicsBackend, inputs: SkyboxInputs, seed: u32) -> RendererResult<Self> {
        let layout = backend.create_bind_group_layout(&[
            layout_entry(0, ShaderStageFlags::VERTEX, BindingType::UniformBuffer),
            layout_entry(1, ShaderStageFlags::FRAGMENT, BindingType::texture_2d()),
            layout_entry(2, ShaderStageFlags::FRAGMENT, BindingType::Sampler { comparison: false }),
        ])?;

        let sky_pipeline = |label: &str, shader: &str, vertex_layout: VertexBufferLayout| RenderPipelineDescriptor {
            label: Some(label.to_string()),
            shader: [SKY_WGSL, shader].concat(),
            has_fragment: true,
            vertex_layouts: vec![vertex_layout],
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
        };
        let stars_pipeline = create_render_pipeline(
            backend,
            &sky_pipeline(
                "skybox stars",
                STARS_SHADER,
                VertexBufferLayout {
                    array_stride: 16,
                    step_mode: VertexStepMode::Instance,
                    attributes: vec![VertexAttribute {
                        location: 0,
                        format: VertexFormat::Float32x4,
                        offset: 0,
                    }],
                },
            ),
        )?;
        let cloud_pipeline = create_render_pipeline(
            backend,
            &sky_pipeline(
                "skybox clouds",
                CLOUD_SHADER,
                VertexBufferLayout {
                    array_stride: 12,
                    step_mode: VertexStepMode::Vertex,
                    attributes: vec![VertexAttribute {
                        location: 0,
                        format: VertexFormat::Float32x3,
                        offset: 0,
                    }],
                },
            ),
        )?;

        let stars = generate_stars(STAR_COUNT, seed);
        let star_buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some("Skybox Stars".into()),
                size: std::mem::size_of_val(stars.as_slice()) as u64,
                usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
                mapped_at_creation: false,
            },
            bytemuck::cast_slice(&stars),
        )?;
        let cube = cube_vertices();
        let cube_buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some("Skybox Cube".into()),
                size: std::mem::size_of_val(cube.as_slice()) as u64,
                usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
                mapped_at_creation: false,
            },
            bytemuck::cast_slice(&cube),
        )?;

        let clouds = backend.create_texture(&TextureDescriptor {
            label: Some("Skybox Clouds".into()),
            width: CLOUD_TEXTURE_SIZE,
            height: CLOUD_TEXTURE_SIZE,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            ..Default::default()
        })?;
        backend.write_texture(
            clouds,
            &cloud_texels(CLOUD_TEXTURE_SIZE, seed ^ 0x5bd1_e995),
            CLOUD_TEXTURE_SIZE,
            CLOUD_TEXTURE_SIZE,
        );
        let clouds_view = backend.create_texture_view(clouds, &TextureViewDescriptor::default())?;
        let sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("Skybox Clouds".into()),
            address_mode_u: AddressMode::Repeat,
            ..Default::default()
        })?;

        let uniform_buffer = uniform_buffer(backend, "Skybox", std::mem::size_of::<SkyUniforms>() as u64)?;
        let bind_group = backend.create_bind_group(
            layout,
            &[
                (0, BindGroupEntry::buffer(uniform_buffer)),
                (1, BindGroupEntry::Texture(clouds_view)),
                (2, BindGroupEntry::Sampler(sampler)),
            ],
        )?;

        Ok(Self {
            inputs,
            stars_pipeline,
            cloud_pipeline,
            uniform_buffer,
            bind_group,
            star_buffer,
            cube_buffer,
            star_count: stars.len() as u32,
        })
    }
}

impl FramePass for SkyboxPass {
    fn name(&self) -> &'static str {
        "skybox"
    }

    fn run(&mut self, ctx: &mut PassContext) -> RendererResult<()> {
        let view = self.inputs.view.resolve()?;
        let final_color = self.inputs.final_color.get()?;
        let zbuffer = self.inputs.zbuffer.get()?;

        let uniforms = SkyUniforms {
            object_to_eye: Mat4::from_mat3(Mat3::from_mat4(view.world_to_eye)),
            eye_to_projection: view.eye_to_projection,
        };
        ctx.backend
            .write_buffer(self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));

        ctx.backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Skybox".into()),
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
        ctx.backend.set_bind_group(0, self.bind_group);

        ctx.backend.set_render_pipeline(self.stars_pipeline);
        ctx.backend.set_vertex_buffer(0, self.star_buffer, 0);
        ctx.backend.draw(0..6, 0..self.star_count);

        ctx.backend.set_render_pipeline(self.cloud_pipeline);
        ctx.backend.set_vertex_buffer(0, self.cube_buffer, 0);
        ctx.backend.draw(0..36, 0..1);
        ctx.backend.end_render_pass();
        Ok(())
    }
}

const SKY_WGSL: &str = r#"
struct Sky {
    object_to_eye: mat4x4<f32>,
    eye_to_projection: mat4x4<f32>,
}

@group(0) @binding(0) var<uniform> sky: Sky;
@group(0) @binding(1) var clouds: texture_2d<f32>;
@group(0) @binding(2) var cloud_sampler: sampler;
"#;

const STARS_SHADER: &str = r#"
const STAR_SIZE: f32 = 1.5;

struct StarOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) index: u32, @location(0) star: vec4<f32>) -> StarOutput {
    var corners = array<vec2<f32>, 6>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(1.0, -1.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(-1.0, 1.0),
    );
    let corner = corners[index];
    let center = (sky.object_to_eye * vec4<f32>(star.xyz, 1.0)).xyz;
    let eye = center + vec3<f32>(corner * STAR_SIZE, 0.0);
    let clip = sky.eye_to_projection * vec4<f32>(eye, 1.0);

    var out: StarOutput;
    out.position = clip.xyww;
    out.uv = corner;
    return out;
}

@fragment
fn fs_main(in: StarOutput) -> @location(0) vec4<f32> {
    let alpha = clamp((1.0 - length(in.uv)) * 1.25, 0.0, 1.0);
    return vec4<f32>(0.9, 0.9, 1.0, alpha);
}
"#;

const CLOUD_SHADER: &str = r#"
const PI: f32 = 3.14159265;

struct CloudOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) direction: vec3<f32>,
}

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> CloudOutput {
    let eye = (sky.object_to_eye * vec4<f32>(position * 100.0, 1.0)).xyz;
    let clip = sky.eye_to_projection * vec4<f32>(eye, 1.0);

    var out: CloudOutput;
    out.position = clip.xyww;
    out.direction = position;
    return out;
}

@fragment
fn fs_main(in: CloudOutput) -> @location(0) vec4<f32> {
    let dir = normalize(in.direction);
    let uv = vec2<f32>(atan2(dir.x, dir.z) / (2.0 * PI) + 0.5, acos(clamp(dir.y, -1.0, 1.0)) / PI);
    return textureSampleLevel(clouds, cloud_sampler, uv, 0.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stars_stay_inside_shell() {
        let stars = generate_stars(500, 11);
        assert_eq!(stars.len(), 500);
        for star in &stars {
            let p = star.truncate();
            assert!(p.length() >= STAR_MIN_RADIUS);
            assert!(p.abs().max_element() <= STAR_RANGE);
        }
    }

    #[test]
    fn test_star_field_is_deterministic_per_seed() {
        assert_eq!(generate_stars(64, 5), generate_stars(64, 5));
        assert_ne!(generate_stars(64, 5), generate_stars(64, 6));
    }

    #[test]
    fn test_cloud_texels_vary() {
        let texels = cloud_texels(32, 9);
        assert_eq!(texels.len(), 32 * 32 * 4);
        let first = texels[3];
        assert!(texels.chunks(4).any(|t| t[3] != first));
    }

    #[test]
    fn test_cube_faces_lie_on_unit_cube() {
        let vertices = cube_vertices();
        assert_eq!(vertices.len(), 36);
        for v in vertices {
            let max = v.iter().fold(0.0f32, |m, c| m.max(c.abs()));
            assert!((max - 1.0).abs() < 1e-6);
        }
    }
}
