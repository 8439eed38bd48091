//! Per-tile depth range reduction
//!
//! Builds a (min, max) linear depth texel per screen tile by repeatedly
//! halving the G-buffer's normal+z target. The first step reads the `w`
//! channel of the G-buffer, clamping reads to its edge; later steps combine
//! 2x2 texels of the previous (min, max) level. Steps alternate between two
//! Rg32Float targets sized `ceil(viewport / tile) * tile / 2`.

use super::*;
use crate::dataflow::Port;

/// Reduction output consumed by light culling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileDepthRange {
    pub view: TextureViewHandle,
    pub tiles_x: u32,
    pub tiles_y: u32,
}

/// Number of halving steps from a pixel to a tile of `tile_size`
pub fn find_iterations(tile_size: u32) -> u32 {
    tile_size.max(1).ilog2()
}

/// Size of the first reduction level for a source of `width` x `height`
pub fn find_texture_size(width: u32, height: u32, tile_size: u32) -> (u32, u32) {
    let (tiles_x, tiles_y) = Viewport::new(width, height).tiles(tile_size);
    ((tiles_x * tile_size / 2).max(1), (tiles_y * tile_size / 2).max(1))
}

/// CPU version of the reduction, one `[min, max]` per tile in row order
///
/// `depth` holds `width * height` linear depths in row order.
pub fn reduce_min_max(depth: &[f32], width: u32, height: u32, tile_size: u32) -> Vec<[f32; 2]> {
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let (w, h) = (width as usize, height as usize);
    if depth.len() < w * h {
        return Vec::new();
    }
    let (mut level_w, mut level_h) = find_texture_size(width, height, tile_size);
    let (mut lw, mut lh) = (level_w as usize, level_h as usize);

    // First step: clamp reads to the source edge
    let mut level: Vec<[f32; 2]> = Vec::with_capacity(lw * lh);
    for y in 0..lh {
        for x in 0..lw {
            let mut range = [f32::MAX, f32::MIN];
            for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                let sx = (x * 2 + dx).min(w - 1);
                let sy = (y * 2 + dy).min(h - 1);
                let z = depth[sy * w + sx];
                range = [range[0].min(z), range[1].max(z)];
            }
            level.push(range);
        }
    }

    for _ in 1..find_iterations(tile_size) {
        let (src, src_w) = (level, lw);
        level_w = (level_w / 2).max(1);
        level_h = (level_h / 2).max(1);
        (lw, lh) = (level_w as usize, level_h as usize);
        level = Vec::with_capacity(lw * lh);
        for y in 0..lh {
            for x in 0..lw {
                let mut range = [f32::MAX, f32::MIN];
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let texel = src[(y * 2 + dy) * src_w + x * 2 + dx];
                    range = [range[0].min(texel[0]), range[1].max(texel[1])];
                }
                level.push(range);
            }
        }
    }
    level
}

#[derive(Debug, Clone, Copy)]
struct ReductionTargets {
    targets: [RenderTarget; 2],
    size: (u32, u32),
    source: TextureViewHandle,
    /// Bind group per step
    bind_groups: [BindGroupHandle; 3],
}

pub struct TileCuller {
    tile_size: u32,
    iterations: u32,
    normal_z: Port<RenderTarget>,
    result: Port<TileDepthRange>,
    first_step: RenderPipelineHandle,
    next_step: RenderPipelineHandle,
    layout: BindGroupLayoutHandle,
    targets: Option<ReductionTargets>,
}

impl TileCuller {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        tile_size: u32,
        normal_z: Port<RenderTarget>,
    ) -> RendererResult<Self> {
        if tile_size < 2 || !tile_size.is_power_of_two() {
            return Err(RendererError::InvalidConfig(format!(
                "tile size {tile_size} must be a power of two of at least 2"
            )));
        }

        let layout = backend.create_bind_group_layout(&[layout_entry(
            0,
            ShaderStageFlags::FRAGMENT,
            BindingType::texture_2d_unfilterable(),
        )])?;
        let target = ColorTargetState::opaque(TextureFormat::Rg32Float);
        let first_step = create_render_pipeline(
            backend,
            &fullscreen_pipeline(
                "zminmax first step",
                [FULLSCREEN_WGSL, FIRST_STEP_SHADER].concat(),
                vec![layout],
                target.clone(),
            ),
        )?;
        let next_step = create_render_pipeline(
            backend,
            &fullscreen_pipeline(
                "zminmax step",
                [FULLSCREEN_WGSL, NEXT_STEP_SHADER].concat(),
                vec![layout],
                target,
            ),
        )?;

        Ok(Self {
            tile_size,
            iterations: find_iterations(tile_size),
            normal_z,
            result: Port::new(),
            first_step,
            next_step,
            layout,
            targets: None,
        })
    }

    /// Producer side of the reduction result
    pub fn result(&self) -> &Port<TileDepthRange> {
        &self.result
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    fn update_buffers(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        normal_z: &RenderTarget,
    ) -> RendererResult<ReductionTargets> {
        let size = find_texture_size(normal_z.width, normal_z.height, self.tile_size);
        if let Some(current) = self.targets {
            if current.size == size && current.source == normal_z.view {
                return Ok(current);
            }
        }

        if let Some(stale) = self.targets {
            stale.bind_groups.iter().for_each(|&group| backend.destroy_bind_group(group));
        }
        let targets = match self.targets {
            Some(current) if current.size == size => current.targets,
            old => {
                if let Some(old) = old {
                    old.targets.iter().for_each(|t| t.destroy(backend));
                }
                let usage = TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING;
                log::debug!("Tile depth reduction targets resized to {}x{}", size.0, size.1);
                [
                    RenderTarget::new(backend, "ZMinMax 0", size.0, size.1, TextureFormat::Rg32Float, usage)?,
                    RenderTarget::new(backend, "ZMinMax 1", size.0, size.1, TextureFormat::Rg32Float, usage)?,
                ]
            }
        };

        let mut bind = |view| backend.create_bind_group(self.layout, &[(0, BindGroupEntry::Texture(view))]);
        let bind_groups = [bind(normal_z.view)?, bind(targets[0].view)?, bind(targets[1].view)?];

        let reduction = ReductionTargets {
            targets,
            size,
            source: normal_z.view,
            bind_groups,
        };
        self.targets = Some(reduction);
        Ok(reduction)
    }
}

impl FramePass for TileCuller {
    fn name(&self) -> &'static str {
        "zminmax"
    }

    fn run(&mut self, ctx: &mut PassContext) -> RendererResult<()> {
        if !self.normal_z.updated() {
            return Ok(());
        }
        let normal_z = self.normal_z.get()?;
        let reduction = self.update_buffers(ctx.backend, &normal_z)?;

        for i in 0..self.iterations {
            let (width, height) = ((reduction.size.0 >> i).max(1), (reduction.size.1 >> i).max(1));
            let output = reduction.targets[(i % 2) as usize];
            // Step 0 reads the G-buffer, odd steps read target 0, even ones target 1
            let input = match i {
                0 => reduction.bind_groups[0],
                i if i % 2 == 1 => reduction.bind_groups[1],
                _ => reduction.bind_groups[2],
            };

            ctx.backend.begin_render_pass(&color_pass(
                "ZMinMax",
                output.view,
                LoadOp::Clear([0.0, 0.0, 0.0, 0.0]),
            ));
            ctx.backend.set_viewport(0.0, 0.0, width as f32, height as f32, 0.0, 1.0);
            ctx.backend
                .set_render_pipeline(if i == 0 { self.first_step } else { self.next_step });
            ctx.backend.set_bind_group(0, input);
            ctx.backend.draw(0..3, 0..1);
            ctx.backend.end_render_pass();
        }

        let last = reduction.targets[((self.iterations + 1) % 2) as usize];
        let (tiles_x, tiles_y) = Viewport::new(normal_z.width, normal_z.height).tiles(self.tile_size);
        self.result.set(TileDepthRange {
            view: last.view,
            tiles_x,
            tiles_y,
        });
        Ok(())
    }
}

const FIRST_STEP_SHADER: &str = r#"
@group(0) @binding(0) var source: texture_2d<f32>;

@fragment
fn fs_main(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let size = vec2<i32>(textureDimensions(source)) - vec2<i32>(1, 1);
    let pos = vec2<i32>(frag_coord.xy) * 2;
    let z0 = textureLoad(source, min(pos, size), 0).w;
    let z1 = textureLoad(source, min(pos + vec2<i32>(1, 0), size), 0).w;
    let z2 = textureLoad(source, min(pos + vec2<i32>(0, 1), size), 0).w;
    let z3 = textureLoad(source, min(pos + vec2<i32>(1, 1), size), 0).w;
    let zmin = min(min(z0, z1), min(z2, z3));
    let zmax = max(max(z0, z1), max(z2, z3));
    return vec4<f32>(zmin, zmax, 0.0, 0.0);
}
"#;

const NEXT_STEP_SHADER: &str = r#"
@group(0) @binding(0) var source: texture_2d<f32>;

@fragment
fn fs_main(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let pos = vec2<i32>(frag_coord.xy) * 2;
    let z0 = textureLoad(source, pos, 0).xy;
    let z1 = textureLoad(source, pos + vec2<i32>(1, 0), 0).xy;
    let z2 = textureLoad(source, pos + vec2<i32>(0, 1), 0).xy;
    let z3 = textureLoad(source, pos + vec2<i32>(1, 1), 0).xy;
    let zmin = min(min(z0.x, z1.x), min(z2.x, z3.x));
    let zmax = max(max(z0.y, z1.y), max(z2.y, z3.y));
    return vec4<f32>(zmin, zmax, 0.0, 0.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iterations_and_size() {
        assert_eq!(find_iterations(16), 4);
        assert_eq!(find_iterations(8), 3);
        assert_eq!(find_texture_size(640, 480, 16), (320, 240));
        assert_eq!(find_texture_size(650, 470, 16), (328, 240));
    }

    #[test]
    fn test_uniform_depth_reduces_to_same_value() {
        let (w, h) = (50, 37);
        let depth = vec![0.25f32; (w * h) as usize];
        let tiles = reduce_min_max(&depth, w, h, 16);
        assert_eq!(tiles.len(), 4 * 3);
        assert!(tiles.iter().all(|t| *t == [0.25, 0.25]));
    }

    #[test]
    fn test_tile_spans_extremes_within_it() {
        let (w, h) = (32u32, 16u32);
        let mut depth = vec![0.5f32; (w * h) as usize];
        depth[(3 * w + 2) as usize] = 0.1;
        depth[(12 * w + 9) as usize] = 0.9;
        let tiles = reduce_min_max(&depth, w, h, 16);
        assert_eq!(tiles, vec![[0.1, 0.9], [0.5, 0.5]]);
    }

    #[test]
    fn test_edge_tile_only_sees_clamped_texels() {
        // 20 pixels wide: the second tile covers pixels 16..19 and clamps beyond
        let (w, h) = (20u32, 4u32);
        let mut depth = vec![0.3f32; (w * h) as usize];
        depth[19] = 0.8;
        let tiles = reduce_min_max(&depth, w, h, 16);
        assert_eq!(tiles, vec![[0.3, 0.3], [0.3, 0.8]]);
    }

    #[test]
    fn test_empty_surface_reduces_to_nothing() {
        assert!(reduce_min_max(&[0.5], 0, 0, 16).is_empty());
        assert!(reduce_min_max(&[0.5; 8], 8, 0, 16).is_empty());
        assert!(reduce_min_max(&[0.5; 8], 0, 8, 16).is_empty());
    }
}
