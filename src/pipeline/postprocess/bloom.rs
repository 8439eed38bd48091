//! Bloom: bright pass extraction at half resolution, then a Gaussian blur

use super::super::*;
use super::GaussianBlur;
use crate::dataflow::Port;
use bytemuck::{Pod, Zeroable};

/// Inputs of the bloom pass
pub struct BloomInputs {
    pub viewport: Port<Viewport>,
    pub final_color: Port<RenderTarget>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BloomParams {
    threshold: f32,
    _padding: [f32; 3],
}

#[derive(Debug, Clone, Copy)]
struct BloomTargets {
    extract: RenderTarget,
    blurred: RenderTarget,
}

/// Half the viewport, rounded up, at least one texel
pub fn bloom_size(viewport: Viewport) -> (u32, u32) {
    (viewport.width.div_ceil(2).max(1), viewport.height.div_ceil(2).max(1))
}

pub struct BloomPass {
    inputs: BloomInputs,
    output: Port<RenderTarget>,
    threshold: f32,
    blur_amount: f32,
    sample_count: u32,
    extract_pipeline: RenderPipelineHandle,
    layout: BindGroupLayoutHandle,
    params_buffer: BufferHandle,
    sampler: SamplerHandle,
    binding: Option<(TextureViewHandle, BindGroupHandle)>,
    targets: Option<BloomTargets>,
    blur: GaussianBlur,
}

impl BloomPass {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        inputs: BloomInputs,
        config: &crate::RendererConfig,
    ) -> RendererResult<Self> {
        let layout = backend.create_bind_group_layout(&[
            layout_entry(0, ShaderStageFlags::FRAGMENT, BindingType::texture_2d()),
            layout_entry(1, ShaderStageFlags::FRAGMENT, BindingType::Sampler { comparison: false }),
            layout_entry(2, ShaderStageFlags::FRAGMENT, BindingType::UniformBuffer),
        ])?;
        let extract_pipeline = create_render_pipeline(
            backend,
            &fullscreen_pipeline(
                "bloom extract",
                [FULLSCREEN_WGSL, BLOOM_EXTRACT_SHADER].concat(),
                vec![layout],
                ColorTargetState::opaque(TextureFormat::Rgba16Float),
            ),
        )?;
        let mut blur = GaussianBlur::new(backend, TextureFormat::Rgba16Float)?;
        blur.prepare(backend, config.bloom_blur_amount, config.bloom_sample_count)?;

        let params_buffer = uniform_buffer(backend, "Bloom Params", std::mem::size_of::<BloomParams>() as u64)?;
        let sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("Bloom".into()),
            ..Default::default()
        })?;

        Ok(Self {
            inputs,
            output: Port::new(),
            threshold: config.bloom_threshold,
            blur_amount: config.bloom_blur_amount,
            sample_count: config.bloom_sample_count,
            extract_pipeline,
            layout,
            params_buffer,
            sampler,
            binding: None,
            targets: None,
            blur,
        })
    }

    /// Producer side of the blurred bloom contribution
    pub fn output(&self) -> &Port<RenderTarget> {
        &self.output
    }

    fn update_targets(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        viewport: Viewport,
    ) -> RendererResult<BloomTargets> {
        let resized = self.inputs.viewport.updated();
        match self.targets {
            Some(targets) if !resized => Ok(targets),
            old => {
                if let Some(old) = old {
                    old.extract.destroy(backend);
                    old.blurred.destroy(backend);
                }
                let (w, h) = bloom_size(viewport);
                let usage = TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING;
                let targets = BloomTargets {
                    extract: RenderTarget::new(backend, "Bloom Extract", w, h, TextureFormat::Rgba16Float, usage)?,
                    blurred: RenderTarget::new(backend, "Bloom Contribution", w, h, TextureFormat::Rgba16Float, usage)?,
                };
                log::debug!("Bloom targets allocated at {w}x{h}");
                self.targets = Some(targets);
                Ok(targets)
            }
        }
    }

    fn bind_group(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        source: TextureViewHandle,
    ) -> RendererResult<BindGroupHandle> {
        match self.binding {
            Some((current, bind_group)) if current == source => return Ok(bind_group),
            Some((_, stale)) => backend.destroy_bind_group(stale),
            None => {}
        }
        let bind_group = backend.create_bind_group(
            self.layout,
            &[
                (0, BindGroupEntry::Texture(source)),
                (1, BindGroupEntry::Sampler(self.sampler)),
                (2, BindGroupEntry::buffer(self.params_buffer)),
            ],
        )?;
        self.binding = Some((source, bind_group));
        Ok(bind_group)
    }
}

impl FramePass for BloomPass {
    fn name(&self) -> &'static str {
        "bloom"
    }

    fn run(&mut self, ctx: &mut PassContext) -> RendererResult<()> {
        let viewport = self.inputs.viewport.get()?;
        let final_color = self.inputs.final_color.get()?;
        let targets = self.update_targets(ctx.backend, viewport)?;
        let bind_group = self.bind_group(ctx.backend, final_color.view)?;

        let params = BloomParams {
            threshold: self.threshold,
            _padding: [0.0; 3],
        };
        ctx.backend
            .write_buffer(self.params_buffer, 0, bytemuck::bytes_of(&params));

        ctx.backend.begin_render_pass(&color_pass(
            "Bloom Extract",
            targets.extract.view,
            LoadOp::Clear([0.0, 0.0, 0.0, 0.0]),
        ));
        ctx.backend.set_viewport(
            0.0,
            0.0,
            targets.extract.width as f32,
            targets.extract.height as f32,
            0.0,
            1.0,
        );
        ctx.backend.set_render_pipeline(self.extract_pipeline);
        ctx.backend.set_bind_group(0, bind_group);
        ctx.backend.draw(0..3, 0..1);
        ctx.backend.end_render_pass();

        self.blur.blur(
            ctx.backend,
            &targets.extract,
            &targets.blurred,
            self.blur_amount,
            self.sample_count,
        )?;
        self.output.set(targets.blurred);
        Ok(())
    }
}

const BLOOM_EXTRACT_SHADER: &str = r#"
struct BloomParams {
    threshold: f32,
}

@group(0) @binding(0) var hdr_texture: texture_2d<f32>;
@group(0) @binding(1) var hdr_sampler: sampler;
@group(0) @binding(2) var<uniform> params: BloomParams;

@fragment
fn fs_main(in: FullscreenOutput) -> @location(0) vec4<f32> {
    let color = textureSampleLevel(hdr_texture, hdr_sampler, in.uv, 0.0);
    let luminance = dot(color.rgb, vec3<f32>(0.2126, 0.7152, 0.0722));
    let weight = max(luminance - params.threshold, 0.0) / max(luminance, 0.0001);
    return vec4<f32>(color.rgb * weight, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;

    #[test]
    fn test_bloom_is_half_resolution() {
        assert_eq!(bloom_size(Viewport::new(640, 480)), (320, 240));
        assert_eq!(bloom_size(Viewport::new(641, 1)), (321, 1));
    }

    #[test]
    fn test_targets_follow_viewport() {
        let mut backend = RecordingBackend::new(64, 64);
        let viewport = Port::with_value(Viewport::new(64, 32));
        let usage = TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING;
        let color = RenderTarget::new(&mut backend, "color", 64, 32, TextureFormat::Rgba16Float, usage).unwrap();
        let mut inputs = BloomInputs {
            viewport: Port::new(),
            final_color: Port::with_value(color),
        };
        inputs.viewport.bind_from(&viewport).unwrap();
        let mut pass = BloomPass::new(&mut backend, inputs, &crate::RendererConfig::default()).unwrap();

        let mut scene = crate::scene::Scene::new();
        let mut stats = FrameStats::default();
        let frame = backend.begin_frame().unwrap();
        let mut ctx = PassContext {
            backend: &mut backend,
            scene: &mut scene,
            stats: &mut stats,
            frame,
        };
        pass.run(&mut ctx).unwrap();
        backend.end_frame().unwrap();

        let blurred = pass.output().get().unwrap();
        assert_eq!((blurred.width, blurred.height), (32, 16));
        assert_eq!(
            backend.submitted_pass_labels(),
            vec!["Bloom Extract", "Gaussian Blur Horizontal", "Gaussian Blur Vertical"]
        );
    }
}
