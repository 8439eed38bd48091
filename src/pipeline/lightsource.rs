//! Tiled deferred lighting
//!
//! Each frame the pass gathers the lights touching the cull frustum, packs
//! them into a storage buffer ended by a zeroed record, culls them against
//! every screen tile's depth range and shades the G-buffer into the final
//! color target. A tile keeps at most `light_slots_per_tile` lights; the
//! rest are dropped for that tile.

use super::gbuffer_pass::GBufferPorts;
use super::tile_culler::TileDepthRange;
use super::*;
use crate::dataflow::Port;
use crate::scene::{LightId, LightType, SceneLight};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

/// Marks the end of a tile's light list
pub const TILE_LIST_END: u32 = u32::MAX;

/// One light as seen by the lighting shaders
///
/// - `position`: eye-space position, `w` is the shadow map layer or -1
/// - `color`: rgb color, `w` is the ambient illumination
/// - `range`: squared radius, attenuation start, reciprocal attenuation
///   length and squared hotspot/falloff ratio
/// - `spot_x`, `spot_y`, `spot_z`: linear part of rows x, y and w of the
///   eye to shadow projection, applied to `point - light`; `spot_x.w` is the
///   type (0 omni, 1 spot, 2 rectangle spot)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct GpuLight {
    pub position: Vec4,
    pub color: Vec4,
    pub range: Vec4,
    pub spot_x: Vec4,
    pub spot_y: Vec4,
    pub spot_z: Vec4,
}

impl GpuLight {
    pub fn pack(light: &SceneLight, shadow_index: i32, world_to_eye: &Mat4, eye_to_world: &Mat4) -> Self {
        let mut radius = light.attenuation_end;
        if light.rectangle_shape {
            radius *= std::f32::consts::SQRT_2;
        }
        let attenuation_delta = (light.attenuation_end - light.attenuation_start).max(1e-6);

        let (light_type, sqr_falloff_begin) = match light.light_type {
            LightType::Omni => (0.0, 0.0),
            LightType::Spot => {
                let falloff_begin = (light.hotspot / light.falloff.max(1e-3)).clamp(0.0, 0.999);
                let light_type = if light.rectangle_shape { 2.0 } else { 1.0 };
                (light_type, falloff_begin * falloff_begin)
            }
        };

        let position_in_eye = world_to_eye.transform_point3(light.position);
        let eye_to_shadow_projection = light.world_to_shadow_projection() * *eye_to_world;
        let row = |index| eye_to_shadow_projection.row(index).truncate();

        Self {
            position: position_in_eye.extend(shadow_index as f32),
            color: light.color.extend(light.ambient_illumination),
            range: Vec4::new(
                radius * radius,
                light.attenuation_start,
                1.0 / attenuation_delta,
                sqr_falloff_begin,
            ),
            spot_x: row(0).extend(light_type),
            spot_y: row(1).extend(0.0),
            spot_z: row(3).extend(0.0),
        }
    }

    /// The zeroed record ending the light list
    pub fn terminator() -> Self {
        Self::zeroed()
    }

    pub fn is_terminator(&self) -> bool {
        self.range.x == 0.0
    }
}

/// A light picked up by the gather step
#[derive(Debug, Clone)]
pub struct GatheredLight {
    pub id: LightId,
    pub light: SceneLight,
    pub shadow_index: i32,
}

impl GatheredLight {
    fn has_shadow(&self) -> bool {
        self.shadow_index >= 0
    }

    fn type_rank(&self) -> u8 {
        match self.light.light_type {
            LightType::Omni => 0,
            LightType::Spot => 1,
        }
    }
}

/// Unshadowed lights first, then by type; ties keep gather order
pub fn sort_lights(lights: &mut [GatheredLight]) {
    lights.sort_by_key(|light| (light.has_shadow(), light.type_rank()));
}

struct LightGather<'a> {
    lights: &'a mut Vec<GatheredLight>,
    limit: usize,
    skipped: usize,
}

impl SceneVisitor for LightGather<'_> {
    fn light(&mut self, id: LightId, light: &mut SceneLight) {
        if !light.light_caster || light.attenuation_end <= 0.0 {
            return;
        }
        if self.lights.len() >= self.limit {
            self.skipped += 1;
            return;
        }
        self.lights.push(GatheredLight {
            id,
            light: light.clone(),
            shadow_index: light.shadow_index(),
        });
    }
}

/// Pack sorted lights plus the terminator
pub fn pack_lights(lights: &[GatheredLight], world_to_eye: &Mat4) -> Vec<GpuLight> {
    let eye_to_world = world_to_eye.inverse();
    lights
        .iter()
        .map(|l| GpuLight::pack(&l.light, l.shadow_index, world_to_eye, &eye_to_world))
        .chain(std::iter::once(GpuLight::terminator()))
        .collect()
}

/// Screen bounds of a tile as eye-space slopes (x/depth, y/depth)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileBounds {
    pub left: f32,
    pub right: f32,
    pub bottom: f32,
    pub top: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl TileBounds {
    pub fn new(uniforms: &LightingUniforms, tile_x: u32, tile_y: u32, depth_range: [f32; 2]) -> Self {
        let tile_size = uniforms.tile_size as f32;
        let [two_rcp_w, two_rcp_h] = uniforms.two_rcp_viewport_size;
        let (x0, x1) = (tile_x as f32 * tile_size, (tile_x + 1) as f32 * tile_size);
        let (y0, y1) = (tile_y as f32 * tile_size, (tile_y + 1) as f32 * tile_size);
        Self {
            left: (x0 * two_rcp_w - 1.0) * uniforms.rcp_f_div_aspect,
            right: (x1 * two_rcp_w - 1.0) * uniforms.rcp_f_div_aspect,
            top: (1.0 - y0 * two_rcp_h) * uniforms.rcp_f,
            bottom: (1.0 - y1 * two_rcp_h) * uniforms.rcp_f,
            min_depth: depth_range[0],
            max_depth: depth_range[1],
        }
    }

    /// Sphere test of a light against the tile, same as the cull shader
    pub fn touches(&self, light: &GpuLight) -> bool {
        let radius = light.range.x.sqrt();
        let depth = -light.position.z;
        let (x, y) = (light.position.x, light.position.y);
        let side = |slope: f32| -radius * (1.0 + slope * slope).sqrt();
        depth + radius >= self.min_depth
            && depth - radius <= self.max_depth
            && x - self.left * depth >= side(self.left)
            && self.right * depth - x >= side(self.right)
            && y - self.bottom * depth >= side(self.bottom)
            && self.top * depth - y >= side(self.top)
    }
}

/// Light list of one tile, truncated to `slots` and padded with [`TILE_LIST_END`]
pub fn cull_tile(lights: &[GpuLight], bounds: &TileBounds, slots: u32) -> Vec<u32> {
    let mut list: Vec<u32> = lights
        .iter()
        .take_while(|light| !light.is_terminator())
        .enumerate()
        .filter(|(_, light)| bounds.touches(light))
        .map(|(index, _)| index as u32)
        .take(slots as usize)
        .collect();
    list.resize(slots as usize, TILE_LIST_END);
    list
}

/// Matches the `Uniforms` struct of the lighting shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct LightingUniforms {
    pub rcp_f: f32,
    pub rcp_f_div_aspect: f32,
    pub two_rcp_viewport_size: [f32; 2],
    pub num_lights: u32,
    pub num_tiles_x: u32,
    pub num_tiles_y: u32,
    pub tile_size: u32,
    pub viewport_size: [u32; 2],
    pub padding: [u32; 2],
}

impl LightingUniforms {
    pub fn new(view: &FrameView, tile_size: u32, num_lights: u32) -> Self {
        let viewport = view.viewport;
        let f = 1.0 / (view.field_of_view.clamp(1.0, 179.0).to_radians() * 0.5).tan();
        let (num_tiles_x, num_tiles_y) = viewport.tiles(tile_size);
        Self {
            rcp_f: 1.0 / f,
            rcp_f_div_aspect: 1.0 / (f / viewport.aspect()),
            two_rcp_viewport_size: [
                2.0 / viewport.width.max(1) as f32,
                2.0 / viewport.height.max(1) as f32,
            ],
            num_lights,
            num_tiles_x,
            num_tiles_y,
            tile_size,
            viewport_size: [viewport.width, viewport.height],
            padding: [0; 2],
        }
    }
}

/// Inputs of the lightsource pass
pub struct LightsourceInputs {
    pub view: ViewPorts,
    pub gbuffer: GBufferPorts,
    pub tile_depth: Port<TileDepthRange>,
    pub shadow_maps: Port<ShadowMapArray>,
}

#[derive(Debug, Clone, Copy)]
struct LightingTargets {
    final_color: RenderTarget,
    visible_lights: BufferHandle,
}

/// Views the bind groups were built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BindingKey {
    tile_depth: TextureViewHandle,
    normal_z: TextureViewHandle,
    diffuse: TextureViewHandle,
    specular: TextureViewHandle,
    specular_level: TextureViewHandle,
    self_illumination: TextureViewHandle,
    shadow_maps: TextureViewHandle,
    final_color: TextureViewHandle,
    visible_lights: BufferHandle,
}

pub struct LightsourcePass {
    inputs: LightsourceInputs,
    tile_size: u32,
    max_lights: u32,
    light_slots_per_tile: u32,
    cull_frustum_far: f32,
    final_color: Port<RenderTarget>,
    light_buffer_port: Port<BufferHandle>,
    uniform_buffer: BufferHandle,
    light_buffer: BufferHandle,
    cull_layout: BindGroupLayoutHandle,
    shade_layout: BindGroupLayoutHandle,
    cull_pipeline: ComputePipelineHandle,
    shade_pipeline: ComputePipelineHandle,
    targets: Option<LightingTargets>,
    bindings: Option<(BindingKey, BindGroupHandle, BindGroupHandle)>,
    lights: Vec<GatheredLight>,
}

impl LightsourcePass {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        inputs: LightsourceInputs,
        config: &crate::RendererConfig,
    ) -> RendererResult<Self> {
        if config.max_lights < 2 {
            return Err(RendererError::InvalidConfig(
                "max_lights must leave room for the terminator".into(),
            ));
        }
        if config.light_slots_per_tile == 0 {
            return Err(RendererError::InvalidConfig(
                "light_slots_per_tile must be at least 1".into(),
            ));
        }

        let compute = ShaderStageFlags::COMPUTE;
        let texture = BindingType::texture_2d_unfilterable;
        let cull_layout = backend.create_bind_group_layout(&[
            layout_entry(0, compute, BindingType::UniformBuffer),
            layout_entry(1, compute, BindingType::StorageBuffer { read_only: true }),
            layout_entry(2, compute, BindingType::StorageBuffer { read_only: false }),
            layout_entry(3, compute, texture()),
        ])?;
        let shade_layout = backend.create_bind_group_layout(&[
            layout_entry(0, compute, BindingType::UniformBuffer),
            layout_entry(1, compute, BindingType::StorageBuffer { read_only: true }),
            layout_entry(2, compute, BindingType::StorageBuffer { read_only: true }),
            layout_entry(3, compute, texture()),
            layout_entry(4, compute, texture()),
            layout_entry(5, compute, texture()),
            layout_entry(6, compute, texture()),
            layout_entry(7, compute, texture()),
            layout_entry(
                8,
                compute,
                BindingType::Texture {
                    sample_type: TextureSampleType::Float { filterable: false },
                    view_dimension: TextureViewDimension::D2Array,
                },
            ),
            layout_entry(
                9,
                compute,
                BindingType::StorageTexture {
                    format: TextureFormat::Rgba16Float,
                },
            ),
        ])?;

        let slots = config.light_slots_per_tile.to_string();
        let cull_pipeline = create_compute_pipeline(
            backend,
            "lightsource cull",
            [LIGHTING_WGSL, CULL_TILES_SHADER].concat().replace("LIGHT_SLOTS", &slots),
            "main",
            vec![cull_layout],
        )?;
        let shade_pipeline = create_compute_pipeline(
            backend,
            "lightsource shade",
            [LIGHTING_WGSL, SHADE_LIGHT_WGSL, RENDER_TILES_SHADER].concat().replace("LIGHT_SLOTS", &slots),
            "main",
            vec![shade_layout],
        )?;

        let uniform_buffer = uniform_buffer(
            backend,
            "Lightsource Uniforms",
            std::mem::size_of::<LightingUniforms>() as u64,
        )?;
        let light_buffer = backend.create_buffer(&BufferDescriptor {
            label: Some("Lights".into()),
            size: config.max_lights as u64 * std::mem::size_of::<GpuLight>() as u64,
            usage: BufferUsage::STORAGE | BufferUsage::COPY_DST,
            mapped_at_creation: false,
        })?;

        Ok(Self {
            inputs,
            tile_size: config.tile_size,
            max_lights: config.max_lights,
            light_slots_per_tile: config.light_slots_per_tile,
            cull_frustum_far: config.cull_far_plane,
            final_color: Port::new(),
            light_buffer_port: Port::with_value(light_buffer),
            uniform_buffer,
            light_buffer,
            cull_layout,
            shade_layout,
            cull_pipeline,
            shade_pipeline,
            targets: None,
            bindings: None,
            lights: Vec::new(),
        })
    }

    /// Producer side of the lit color target
    pub fn final_color(&self) -> &Port<RenderTarget> {
        &self.final_color
    }

    /// Producer side of the packed light buffer
    pub fn light_buffer(&self) -> &Port<BufferHandle> {
        &self.light_buffer_port
    }

    /// Lights gathered in the last frame, in upload order
    pub fn lights(&self) -> &[GatheredLight] {
        &self.lights
    }

    fn find_lights(&mut self, ctx: &mut PassContext, view: &FrameView) {
        let mut lights = std::mem::take(&mut self.lights);
        lights.clear();
        let mut gather = LightGather {
            lights: &mut lights,
            limit: self.max_lights as usize - 1,
            skipped: 0,
        };
        ctx.visit(&view.cull_frustum(self.cull_frustum_far), &mut gather);
        if gather.skipped > 0 {
            log::trace!("{} lights over the limit of {} were skipped", gather.skipped, gather.limit);
        }
        sort_lights(&mut lights);
        ctx.stats.lights_gathered = lights.len() as u32;
        self.lights = lights;
    }

    fn upload(&mut self, backend: &mut dyn GraphicsBackend, view: &FrameView) {
        let uniforms = LightingUniforms::new(view, self.tile_size, self.lights.len() as u32);
        backend.write_buffer(self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
        let packed = pack_lights(&self.lights, &view.world_to_eye);
        backend.write_buffer(self.light_buffer, 0, bytemuck::cast_slice(&packed));
    }

    fn update_buffers(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        viewport: Viewport,
    ) -> RendererResult<LightingTargets> {
        let resized = self.inputs.view.viewport.updated();
        if let Some(targets) = self.targets.filter(|_| !resized) {
            return Ok(targets);
        }
        if let Some(old) = self.targets.take() {
            old.final_color.destroy(backend);
            backend.destroy_buffer(old.visible_lights);
        }

        let final_color = RenderTarget::new(
            backend,
            "Final Color",
            viewport.width,
            viewport.height,
            TextureFormat::Rgba16Float,
            TextureUsage::STORAGE_BINDING | TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        )?;
        let (tiles_x, tiles_y) = viewport.tiles(self.tile_size);
        let visible_lights = backend.create_buffer(&BufferDescriptor {
            label: Some("Visible Light Indices".into()),
            size: (tiles_x * tiles_y * self.light_slots_per_tile) as u64 * 4,
            usage: BufferUsage::STORAGE,
            mapped_at_creation: false,
        })?;
        log::debug!(
            "Lightsource targets allocated for {}x{} tiles",
            tiles_x,
            tiles_y
        );

        let targets = LightingTargets {
            final_color,
            visible_lights,
        };
        self.targets = Some(targets);
        Ok(targets)
    }

    fn update_bindings(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        targets: &LightingTargets,
    ) -> RendererResult<(BindGroupHandle, BindGroupHandle)> {
        let gbuffer = &self.inputs.gbuffer;
        let key = BindingKey {
            tile_depth: self.inputs.tile_depth.get()?.view,
            normal_z: gbuffer.normal_z.get()?.view,
            diffuse: gbuffer.diffuse_color.get()?.view,
            specular: gbuffer.specular_color.get()?.view,
            specular_level: gbuffer.specular_level.get()?.view,
            self_illumination: gbuffer.self_illumination.get()?.view,
            shadow_maps: self.inputs.shadow_maps.with(|maps| maps.array_view)?,
            final_color: targets.final_color.view,
            visible_lights: targets.visible_lights,
        };
        match self.bindings {
            Some((current, cull, shade)) if current == key => return Ok((cull, shade)),
            Some((_, cull, shade)) => {
                backend.destroy_bind_group(cull);
                backend.destroy_bind_group(shade);
            }
            None => {}
        }

        let cull = backend.create_bind_group(
            self.cull_layout,
            &[
                (0, BindGroupEntry::buffer(self.uniform_buffer)),
                (1, BindGroupEntry::buffer(self.light_buffer)),
                (2, BindGroupEntry::buffer(key.visible_lights)),
                (3, BindGroupEntry::Texture(key.tile_depth)),
            ],
        )?;
        let shade = backend.create_bind_group(
            self.shade_layout,
            &[
                (0, BindGroupEntry::buffer(self.uniform_buffer)),
                (1, BindGroupEntry::buffer(self.light_buffer)),
                (2, BindGroupEntry::buffer(key.visible_lights)),
                (3, BindGroupEntry::Texture(key.normal_z)),
                (4, BindGroupEntry::Texture(key.diffuse)),
                (5, BindGroupEntry::Texture(key.specular)),
                (6, BindGroupEntry::Texture(key.specular_level)),
                (7, BindGroupEntry::Texture(key.self_illumination)),
                (8, BindGroupEntry::Texture(key.shadow_maps)),
                (9, BindGroupEntry::StorageTexture(key.final_color)),
            ],
        )?;
        self.bindings = Some((key, cull, shade));
        Ok((cull, shade))
    }
}

impl FramePass for LightsourcePass {
    fn name(&self) -> &'static str {
        "lightsource"
    }

    fn run(&mut self, ctx: &mut PassContext) -> RendererResult<()> {
        let view = self.inputs.view.resolve()?;
        self.find_lights(ctx, &view);
        self.upload(ctx.backend, &view);

        let targets = self.update_buffers(ctx.backend, view.viewport)?;
        let (cull, shade) = self.update_bindings(ctx.backend, &targets)?;
        let (tiles_x, tiles_y) = view.viewport.tiles(self.tile_size);

        ctx.backend.begin_compute_pass(Some("Lightsource Cull"));
        ctx.backend.set_compute_pipeline(self.cull_pipeline);
        ctx.backend.set_bind_group(0, cull);
        ctx.backend.dispatch_compute(tiles_x, tiles_y, 1);
        ctx.backend.end_compute_pass();

        ctx.backend.begin_compute_pass(Some("Lightsource Shade"));
        ctx.backend.set_compute_pipeline(self.shade_pipeline);
        ctx.backend.set_bind_group(0, shade);
        ctx.backend.dispatch_compute(tiles_x, tiles_y, 1);
        ctx.backend.end_compute_pass();

        self.final_color.set(targets.final_color);
        Ok(())
    }
}

/// Declarations shared by the cull and shade programs
pub const LIGHTING_WGSL: &str = r#"
struct Uniforms {
    rcp_f: f32,
    rcp_f_div_aspect: f32,
    two_rcp_viewport_size: vec2<f32>,
    num_lights: u32,
    num_tiles_x: u32,
    num_tiles_y: u32,
    tile_size: u32,
    viewport_size: vec2<u32>,
    padding: vec2<u32>,
}

struct Light {
    position: vec4<f32>,
    color: vec4<f32>,
    range: vec4<f32>,
    spot_x: vec4<f32>,
    spot_y: vec4<f32>,
    spot_z: vec4<f32>,
}

const TILE_LIST_END: u32 = 0xffffffffu;
"#;

/// Contribution of one light at an eye-space point; expects the including
/// program to declare `shadow_maps` as a `texture_2d_array<f32>`
pub const SHADE_LIGHT_WGSL: &str = r#"
fn shadow_visibility(index: i32, ndc: vec2<f32>, light_depth: f32) -> f32 {
    let size = vec2<i32>(textureDimensions(shadow_maps));
    let uv = vec2<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
    let texel = clamp(vec2<i32>(uv * vec2<f32>(size)), vec2<i32>(0, 0), size - vec2<i32>(1, 1));
    let moments = textureLoad(shadow_maps, texel, index, 0).xy;
    if light_depth <= moments.x {
        return 1.0;
    }
    let variance = max(moments.y - moments.x * moments.x, 0.0001);
    let delta = light_depth - moments.x;
    return variance / (variance + delta * delta);
}

fn shade_light(
    light: Light,
    eye: vec3<f32>,
    normal: vec3<f32>,
    view_dir: vec3<f32>,
    diffuse: vec3<f32>,
    specular: vec3<f32>,
    level: vec2<f32>,
) -> vec3<f32> {
    let to_light = light.position.xyz - eye;
    let sqr_distance = dot(to_light, to_light);
    if sqr_distance >= light.range.x {
        return vec3<f32>(0.0);
    }
    let light_distance = sqrt(sqr_distance);
    let attenuation = clamp(1.0 - (light_distance - light.range.y) * light.range.z, 0.0, 1.0);
    let light_dir = to_light / max(light_distance, 0.0001);

    var visibility = 1.0;
    let light_type = light.spot_x.w;
    if light_type > 0.5 {
        let from_light = -to_light;
        let sx = dot(light.spot_x.xyz, from_light);
        let sy = dot(light.spot_y.xyz, from_light);
        let sw = dot(light.spot_z.xyz, from_light);
        if sw <= 0.0 {
            return vec3<f32>(0.0);
        }
        let ndc = vec2<f32>(sx, sy) / sw;
        var edge = dot(ndc, ndc);
        if light_type > 1.5 {
            let extent = max(abs(ndc.x), abs(ndc.y));
            edge = extent * extent;
        }
        visibility = 1.0 - smoothstep(light.range.w, 1.0, edge);
        let shadow_index = i32(light.position.w);
        if shadow_index >= 0 && visibility > 0.0 {
            visibility = visibility * shadow_visibility(shadow_index, ndc, sw);
        }
    }

    let n_dot_l = max(dot(normal, light_dir), 0.0);
    let half_vector = normalize(light_dir + view_dir);
    let shininess = max(level.y, 1.0);
    let highlight = pow(max(dot(normal, half_vector), 0.0), shininess) * level.x;
    let lit = (diffuse * n_dot_l + specular * highlight) * visibility + diffuse * light.color.w;
    return light.color.rgb * lit * attenuation;
}
"#;

const CULL_TILES_SHADER: &str = r#"
@group(0) @binding(0) var<uniform> uniforms: Uniforms;
@group(0) @binding(1) var<storage, read> lights: array<Light>;
@group(0) @binding(2) var<storage, read_write> visible_lights: array<u32>;
@group(0) @binding(3) var zminmax: texture_2d<f32>;

var<workgroup> tile_light_count: atomic<u32>;
var<workgroup> tile_lights: array<u32, LIGHT_SLOTS>;

fn side_margin(slope: f32, radius: f32) -> f32 {
    return -radius * sqrt(1.0 + slope * slope);
}

@compute @workgroup_size(64)
fn main(
    @builtin(workgroup_id) tile: vec3<u32>,
    @builtin(local_invocation_index) local_index: u32,
) {
    if local_index == 0u {
        atomicStore(&tile_light_count, 0u);
    }
    workgroupBarrier();

    let depth_range = textureLoad(zminmax, vec2<i32>(tile.xy), 0).xy;
    let tile_size = f32(uniforms.tile_size);
    let x0 = f32(tile.x) * tile_size;
    let x1 = x0 + tile_size;
    let y0 = f32(tile.y) * tile_size;
    let y1 = y0 + tile_size;
    let left = (x0 * uniforms.two_rcp_viewport_size.x - 1.0) * uniforms.rcp_f_div_aspect;
    let right = (x1 * uniforms.two_rcp_viewport_size.x - 1.0) * uniforms.rcp_f_div_aspect;
    let top = (1.0 - y0 * uniforms.two_rcp_viewport_size.y) * uniforms.rcp_f;
    let bottom = (1.0 - y1 * uniforms.two_rcp_viewport_size.y) * uniforms.rcp_f;

    for (var i = local_index; i < uniforms.num_lights; i = i + 64u) {
        let light = lights[i];
        let radius = sqrt(light.range.x);
        let depth = -light.position.z;
        let x = light.position.x;
        let y = light.position.y;
        let inside = depth + radius >= depth_range.x
            && depth - radius <= depth_range.y
            && x - left * depth >= side_margin(left, radius)
            && right * depth - x >= side_margin(right, radius)
            && y - bottom * depth >= side_margin(bottom, radius)
            && top * depth - y >= side_margin(top, radius);
        if inside {
            let slot = atomicAdd(&tile_light_count, 1u);
            if slot < LIGHT_SLOTSu {
                tile_lights[slot] = i;
            }
        }
    }
    workgroupBarrier();

    let count = min(atomicLoad(&tile_light_count), LIGHT_SLOTSu);
    let base = (tile.y * uniforms.num_tiles_x + tile.x) * LIGHT_SLOTSu;
    for (var i = local_index; i < LIGHT_SLOTSu; i = i + 64u) {
        visible_lights[base + i] = select(TILE_LIST_END, tile_lights[i], i < count);
    }
}
"#;

const RENDER_TILES_SHADER: &str = r#"
@group(0) @binding(0) var<uniform> uniforms: Uniforms;
@group(0) @binding(1) var<storage, read> lights: array<Light>;
@group(0) @binding(2) var<storage, read> visible_lights: array<u32>;
@group(0) @binding(3) var normal_z: texture_2d<f32>;
@group(0) @binding(4) var diffuse_color: texture_2d<f32>;
@group(0) @binding(5) var specular_color: texture_2d<f32>;
@group(0) @binding(6) var specular_level: texture_2d<f32>;
@group(0) @binding(7) var self_illumination: texture_2d<f32>;
@group(0) @binding(8) var shadow_maps: texture_2d_array<f32>;
@group(0) @binding(9) var out_final: texture_storage_2d<rgba16float, write>;

var<workgroup> tile_lights: array<u32, LIGHT_SLOTS>;

fn shade_pixel(id: vec2<u32>) {
    let pixel = vec2<i32>(id);
    let nz = textureLoad(normal_z, pixel, 0);
    let emission = textureLoad(self_illumination, pixel, 0).rgb;
    if dot(nz.xyz, nz.xyz) < 0.25 {
        textureStore(out_final, pixel, vec4<f32>(0.0, 0.0, 0.0, 1.0));
        return;
    }

    let depth = nz.w;
    let ndc = vec2<f32>(
        (f32(id.x) + 0.5) * uniforms.two_rcp_viewport_size.x - 1.0,
        1.0 - (f32(id.y) + 0.5) * uniforms.two_rcp_viewport_size.y,
    );
    let eye = vec3<f32>(ndc.x * uniforms.rcp_f_div_aspect * depth, ndc.y * uniforms.rcp_f * depth, -depth);
    let normal = normalize(nz.xyz);
    let view_dir = normalize(-eye);
    let diffuse = textureLoad(diffuse_color, pixel, 0).rgb;
    let specular = textureLoad(specular_color, pixel, 0).rgb;
    let level = textureLoad(specular_level, pixel, 0).xy;

    var color = emission;
    for (var i = 0u; i < LIGHT_SLOTSu; i = i + 1u) {
        let index = tile_lights[i];
        if index == TILE_LIST_END {
            break;
        }
        color = color + shade_light(lights[index], eye, normal, view_dir, diffuse, specular, level);
    }
    textureStore(out_final, pixel, vec4<f32>(color, 1.0));
}

// One workgroup per tile; the tile's light list is read once into shared memory
@compute @workgroup_size(8, 8)
fn main(
    @builtin(workgroup_id) tile: vec3<u32>,
    @builtin(local_invocation_id) local: vec3<u32>,
    @builtin(local_invocation_index) local_index: u32,
) {
    let base = (tile.y * uniforms.num_tiles_x + tile.x) * LIGHT_SLOTSu;
    for (var i = local_index; i < LIGHT_SLOTSu; i = i + 64u) {
        tile_lights[i] = visible_lights[base + i];
    }
    workgroupBarrier();

    let origin = tile.xy * uniforms.tile_size;
    for (var y = local.y; y < uniforms.tile_size; y = y + 8u) {
        for (var x = local.x; x < uniforms.tile_size; x = x + 8u) {
            let pixel = origin + vec2<u32>(x, y);
            if pixel.x < uniforms.viewport_size.x && pixel.y < uniforms.viewport_size.y {
                shade_pixel(pixel);
            }
        }
    }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Scene;
    use glam::{Quat, Vec3};

    fn gathered(scene: &mut Scene, light: SceneLight, shadow_index: i32) -> GatheredLight {
        let id = scene.add_light(light.clone());
        GatheredLight {
            id,
            light,
            shadow_index,
        }
    }

    #[test]
    fn test_pack_omni_light() {
        let light = SceneLight::omni(Vec3::new(0.0, 0.0, -10.0), Vec3::new(1.0, 0.5, 0.25), 20.0)
            .with_ambient(0.1);
        let packed = GpuLight::pack(&light, -1, &Mat4::IDENTITY, &Mat4::IDENTITY);
        assert_eq!(packed.position, Vec4::new(0.0, 0.0, -10.0, -1.0));
        assert_eq!(packed.color, Vec4::new(1.0, 0.5, 0.25, 0.1));
        assert_eq!(packed.range.x, 400.0);
        assert_eq!(packed.range.y, light.attenuation_start);
        assert!((packed.range.z - 1.0 / (20.0 - light.attenuation_start)).abs() < 1e-6);
        assert_eq!(packed.spot_x.w, 0.0);
    }

    #[test]
    fn test_pack_rect_spot_light() {
        let light = SceneLight::spot(Vec3::ZERO, Quat::IDENTITY, Vec3::ONE, 10.0)
            .with_cone(30.0, 60.0)
            .with_rectangle_shape(1.0);
        let packed = GpuLight::pack(&light, 3, &Mat4::IDENTITY, &Mat4::IDENTITY);
        assert_eq!(packed.position.w, 3.0);
        assert!((packed.range.x - 200.0).abs() < 1e-3);
        assert!((packed.range.w - 0.25).abs() < 1e-6);
        assert_eq!(packed.spot_x.w, 2.0);

        // A point straight ahead of the spot projects to the cone center
        let ahead = Vec3::new(0.0, 0.0, -5.0);
        let w = packed.spot_z.truncate().dot(ahead);
        let x = packed.spot_x.truncate().dot(ahead) / w;
        assert!((w - 5.0).abs() < 1e-4);
        assert!(x.abs() < 1e-5);
    }

    #[test]
    fn test_sort_puts_shadowed_lights_last() {
        let mut scene = Scene::new();
        let omni = SceneLight::omni(Vec3::ZERO, Vec3::ONE, 5.0);
        let spot = SceneLight::spot(Vec3::ZERO, Quat::IDENTITY, Vec3::ONE, 5.0);
        let mut lights = vec![
            gathered(&mut scene, spot.clone(), 0),
            gathered(&mut scene, spot.clone(), -1),
            gathered(&mut scene, omni.clone(), -1),
            gathered(&mut scene, spot, 1),
        ];
        let ids: Vec<LightId> = lights.iter().map(|l| l.id).collect();
        sort_lights(&mut lights);
        let order: Vec<LightId> = lights.iter().map(|l| l.id).collect();
        assert_eq!(order, vec![ids[2], ids[1], ids[0], ids[3]]);
    }

    #[test]
    fn test_packed_list_ends_with_terminator() {
        let mut scene = Scene::new();
        let lights = vec![
            gathered(&mut scene, SceneLight::omni(Vec3::ZERO, Vec3::ONE, 5.0), -1),
            gathered(&mut scene, SceneLight::omni(Vec3::X, Vec3::ONE, 5.0), -1),
        ];
        let packed = pack_lights(&lights, &Mat4::IDENTITY);
        assert_eq!(packed.len(), 3);
        assert!(!packed[1].is_terminator());
        assert!(packed[2].is_terminator());
        assert_eq!(std::mem::size_of::<GpuLight>(), 96);
    }

    #[test]
    fn test_tile_list_is_truncated_to_slots() {
        let view = FrameView::new(Viewport::new(64, 64), 90.0, Mat4::IDENTITY);
        let uniforms = LightingUniforms::new(&view, 16, 200);
        // Center tile of a 4x4 grid, geometry between 5 and 15 units away
        let bounds = TileBounds::new(&uniforms, 1, 1, [5.0, 15.0]);

        let light = GpuLight::pack(
            &SceneLight::omni(Vec3::new(0.0, 0.0, -10.0), Vec3::ONE, 20.0),
            -1,
            &Mat4::IDENTITY,
            &Mat4::IDENTITY,
        );
        let mut lights = vec![light; 200];
        lights.push(GpuLight::terminator());

        let list = cull_tile(&lights, &bounds, 128);
        assert_eq!(list.len(), 128);
        assert!(list.iter().all(|&index| index != TILE_LIST_END));
        assert_eq!(list[127], 127);
    }

    #[test]
    fn test_tile_skips_lights_outside_depth_range() {
        let view = FrameView::new(Viewport::new(64, 64), 90.0, Mat4::IDENTITY);
        let uniforms = LightingUniforms::new(&view, 16, 2);
        let bounds = TileBounds::new(&uniforms, 1, 1, [5.0, 15.0]);

        let near = GpuLight::pack(
            &SceneLight::omni(Vec3::new(0.0, 0.0, -10.0), Vec3::ONE, 2.0),
            -1,
            &Mat4::IDENTITY,
            &Mat4::IDENTITY,
        );
        let far = GpuLight::pack(
            &SceneLight::omni(Vec3::new(0.0, 0.0, -100.0), Vec3::ONE, 2.0),
            -1,
            &Mat4::IDENTITY,
            &Mat4::IDENTITY,
        );
        let list = cull_tile(&[far, near, GpuLight::terminator()], &bounds, 4);
        assert_eq!(list, vec![1, TILE_LIST_END, TILE_LIST_END, TILE_LIST_END]);
    }
}
