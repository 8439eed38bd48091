//! Per-frame render passes
//!
//! Every pass is driven once per frame in a fixed order by the
//! [`SceneRenderer`](crate::SceneRenderer):
//!
//! 1. [`ShadowPagingPass`] - assigns shadow slots and redraws stale shadow maps
//! 2. [`GBufferPass`] - opaque geometry into the G-buffer
//! 3. [`TileCuller`] - per-tile depth min/max pyramid
//! 4. [`LightsourcePass`] - light gathering, tile culling and shading
//! 5. [`TransparencyPass`], [`SkyboxPass`], [`ParticleEmitterPass`]
//! 6. [`BloomPass`] - bright pass extraction and blur
//! 7. [`FinalPass`] - tone mapping and composite to the surface
//!
//! Passes exchange textures and buffers through [`Port`](crate::Port)s wired
//! up at construction. A pass only reallocates when a port it depends on
//! reports an update.

pub mod final_pass;
pub mod gbuffer_pass;
pub mod geometry;
pub mod gpu_timer;
pub mod lightsource;
pub mod particles;
pub mod postprocess;
pub mod shadow_paging;
pub mod skybox;
pub mod stats;
pub mod target;
pub mod tile_culler;
pub mod transparency;
pub mod view;

pub use final_pass::FinalPass;
pub use gbuffer_pass::{GBufferPass, GBufferPorts};
pub use gpu_timer::{GpuTimeResult, GpuTimer};
pub use lightsource::{GpuLight, LightsourcePass};
pub use particles::ParticleEmitterPass;
pub use postprocess::{BloomPass, GaussianBlur};
pub use shadow_paging::ShadowPagingPass;
pub use skybox::SkyboxPass;
pub use stats::FrameStats;
pub use target::{RenderTarget, ShadowMapArray, Viewport};
pub use tile_culler::{TileCuller, TileDepthRange};
pub use transparency::TransparencyPass;
pub use view::{FrameView, ViewPorts, ViewUniformData};

use crate::backend::shader::validate_render_program;
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RendererError, RendererResult};
use crate::scene::{Frustum, Scene, SceneVisitor};

/// What a pass gets to work with while it records its commands
pub struct PassContext<'a> {
    pub backend: &'a mut dyn GraphicsBackend,
    pub scene: &'a mut Scene,
    pub stats: &'a mut FrameStats,
    pub frame: FrameContext,
}

impl PassContext<'_> {
    /// Frustum query against the scene, counted in the frame statistics
    pub fn visit(&mut self, frustum: &Frustum, visitor: &mut dyn SceneVisitor) -> usize {
        self.stats.scene_visits += 1;
        self.scene.visit(frustum, visitor)
    }
}

/// A stage of the frame
pub trait FramePass {
    /// Name used for GPU timing and command labels
    fn name(&self) -> &'static str;

    /// Record this frame's commands
    fn run(&mut self, ctx: &mut PassContext) -> RendererResult<()>;
}

/// Validate and create a render pipeline; failure is fatal for construction
pub(crate) fn create_render_pipeline(
    backend: &mut dyn GraphicsBackend,
    desc: &RenderPipelineDescriptor,
) -> RendererResult<RenderPipelineHandle> {
    let name = desc.label.clone().unwrap_or_default();
    validate_render_program(&name, &desc.shader, desc.has_fragment)
        .map_err(|e| RendererError::shader(&name, e))?;
    backend
        .create_render_pipeline(desc)
        .map_err(|e| RendererError::shader(&name, e))
}

/// Validate and create a compute pipeline; failure is fatal for construction
pub(crate) fn create_compute_pipeline(
    backend: &mut dyn GraphicsBackend,
    label: &str,
    shader: String,
    entry_point: &str,
    bind_group_layouts: Vec<BindGroupLayoutHandle>,
) -> RendererResult<ComputePipelineHandle> {
    crate::backend::shader::validate_wgsl(label, &shader, &[(entry_point, ShaderStage::Compute)])
        .map_err(|e| RendererError::shader(label, e))?;
    backend
        .create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some(label.to_string()),
            shader,
            entry_point: entry_point.to_string(),
            bind_group_layouts,
        })
        .map_err(|e| RendererError::shader(label, e))
}

pub(crate) fn uniform_buffer(
    backend: &mut dyn GraphicsBackend,
    label: &str,
    size: u64,
) -> BackendResult<BufferHandle> {
    backend.create_buffer(&BufferDescriptor {
        label: Some(label.to_string()),
        size: size.max(16),
        usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
        mapped_at_creation: false,
    })
}

pub(crate) fn layout_entry(
    binding: u32,
    visibility: ShaderStageFlags,
    ty: BindingType,
) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility,
        ty,
    }
}

/// Pipeline drawing a fullscreen triangle with [`FULLSCREEN_WGSL`]'s `vs_main`
pub(crate) fn fullscreen_pipeline(
    label: &str,
    shader: String,
    bind_group_layouts: Vec<BindGroupLayoutHandle>,
    target: ColorTargetState,
) -> RenderPipelineDescriptor {
    RenderPipelineDescriptor {
        label: Some(label.to_string()),
        shader,
        has_fragment: true,
        vertex_layouts: Vec::new(),
        bind_group_layouts,
        primitive_topology: PrimitiveTopology::TriangleList,
        front_face: FrontFace::Ccw,
        cull_mode: CullMode::None,
        depth_stencil: None,
        color_targets: vec![target],
    }
}

/// Single color attachment render pass
pub(crate) fn color_pass(label: &str, view: TextureViewHandle, load_op: LoadOp) -> RenderPassDescriptor {
    RenderPassDescriptor {
        label: Some(label.to_string()),
        color_attachments: vec![ColorAttachment {
            view,
            load_op,
            store_op: StoreOp::Store,
        }],
        depth_stencil_attachment: None,
    }
}

/// Vertex stage covering the viewport with one triangle; `uv` has its origin
/// at the top left
pub const FULLSCREEN_WGSL: &str = r#"
struct FullscreenOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> FullscreenOutput {
    let uv = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    var out: FullscreenOutput;
    out.position = vec4<f32>(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0, 0.0, 1.0);
    out.uv = uv;
    return out;
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;

    const BLIT_FRAGMENT: &str = r#"
@fragment
fn fs_main(in: FullscreenOutput) -> @location(0) vec4<f32> {
    return vec4<f32>(in.uv, 0.0, 1.0);
}
"#;

    fn blit(label: &str, fragment: &str) -> RenderPipelineDescriptor {
        fullscreen_pipeline(
            label,
            [FULLSCREEN_WGSL, fragment].concat(),
            Vec::new(),
            ColorTargetState::opaque(TextureFormat::Rgba8Unorm),
        )
    }

    fn shader_error_name(err: RendererError) -> String {
        match err {
            RendererError::Shader { name, .. } => name,
            other => panic!("expected a shader error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_render_program_creates_pipeline() {
        let mut backend = RecordingBackend::new(4, 4);
        assert!(create_render_pipeline(&mut backend, &blit("blit", BLIT_FRAGMENT)).is_ok());
    }

    #[test]
    fn test_invalid_render_program_names_the_pipeline() {
        let mut backend = RecordingBackend::new(4, 4);
        let broken = "@fragment\nfn fs_main() -> @location(0) vec4<f32> { return missing_color; }\n";
        let err = create_render_pipeline(&mut backend, &blit("broken blit", broken)).unwrap_err();
        assert_eq!(shader_error_name(err), "broken blit");

        // Parses, but has no fragment entry point
        let err = create_render_pipeline(&mut backend, &blit("vertex only", "")).unwrap_err();
        assert_eq!(shader_error_name(err), "vertex only");
    }

    #[test]
    fn test_invalid_compute_program_names_the_pipeline() {
        let mut backend = RecordingBackend::new(4, 4);
        let err = create_compute_pipeline(
            &mut backend,
            "broken cull",
            "@compute @workgroup_size(64)\nfn main( {\n}\n".to_string(),
            "main",
            Vec::new(),
        )
        .unwrap_err();
        assert_eq!(shader_error_name(err), "broken cull");

        let err = create_compute_pipeline(
            &mut backend,
            "wrong entry",
            "@compute @workgroup_size(1)\nfn cull() {}\n".to_string(),
            "main",
            Vec::new(),
        )
        .unwrap_err();
        assert_eq!(shader_error_name(err), "wrong entry");
    }
}
