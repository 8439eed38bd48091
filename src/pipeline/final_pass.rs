//! Composite of the lit color and bloom onto the output surface
//!
//! Adds the bloom contribution, tone maps with the ACES fit and applies gamma
//! when the surface does not encode sRGB itself.

use super::*;
use crate::dataflow::Port;
use bytemuck::{Pod, Zeroable};

/// Inputs of the final pass
pub struct FinalInputs {
    pub final_color: Port<RenderTarget>,
    pub bloom: Port<RenderTarget>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CompositeParams {
    pub exposure: f32,
    pub gamma: f32,
    pub bloom_strength: f32,
    pub _padding: f32,
}

impl CompositeParams {
    pub fn for_format(format: TextureFormat) -> Self {
        Self {
            exposure: 1.0,
            gamma: if format.is_srgb() { 1.0 } else { 2.2 },
            bloom_strength: 1.0,
            _padding: 0.0,
        }
    }
}

pub struct FinalPass {
    inputs: FinalInputs,
    pipeline: RenderPipelineHandle,
    layout: BindGroupLayoutHandle,
    params_buffer: BufferHandle,
    sampler: SamplerHandle,
    binding: Option<((TextureViewHandle, TextureViewHandle), BindGroupHandle)>,
}

impl FinalPass {
    pub fn new(backend: &mut dyn GraphicsBackend, inputs: FinalInputs) -> RendererResult<Self> {
        let layout = backend.create_bind_group_layout(&[
            layout_entry(0, ShaderStageFlags::FRAGMENT, BindingType::texture_2d()),
            layout_entry(1, ShaderStageFlags::FRAGMENT, BindingType::texture_2d()),
            layout_entry(2, ShaderStageFlags::FRAGMENT, BindingType::Sampler { comparison: false }),
            layout_entry(3, ShaderStageFlags::FRAGMENT, BindingType::UniformBuffer),
        ])?;
        let format = backend.swapchain_format();
        let pipeline = create_render_pipeline(
            backend,
            &fullscreen_pipeline(
                "final",
                [FULLSCREEN_WGSL, FINAL_SHADER].concat(),
                vec![layout],
                ColorTargetState::opaque(format),
            ),
        )?;
        let params_buffer = uniform_buffer(
            backend,
            "Final Params",
            std::mem::size_of::<CompositeParams>() as u64,
        )?;
        backend.write_buffer(
            params_buffer,
            0,
            bytemuck::bytes_of(&CompositeParams::for_format(format)),
        );
        let sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("Final".into()),
            ..Default::default()
        })?;

        Ok(Self {
            inputs,
            pipeline,
            layout,
            params_buffer,
            sampler,
            binding: None,
        })
    }

    fn bind_group(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        key: (TextureViewHandle, TextureViewHandle),
    ) -> RendererResult<BindGroupHandle> {
        match self.binding {
            Some((current, bind_group)) if current == key => return Ok(bind_group),
            Some((_, stale)) => backend.destroy_bind_group(stale),
            None => {}
        }
        let bind_group = backend.create_bind_group(
            self.layout,
            &[
                (0, BindGroupEntry::Texture(key.0)),
                (1, BindGroupEntry::Texture(key.1)),
                (2, BindGroupEntry::Sampler(self.sampler)),
                (3, BindGroupEntry::buffer(self.params_buffer)),
            ],
        )?;
        self.binding = Some((key, bind_group));
        Ok(bind_group)
    }
}

impl FramePass for FinalPass {
    fn name(&self) -> &'static str {
        "final"
    }

    fn run(&mut self, ctx: &mut PassContext) -> RendererResult<()> {
        let final_color = self.inputs.final_color.get()?;
        let bloom = self.inputs.bloom.get()?;
        let bind_group = self.bind_group(ctx.backend, (final_color.view, bloom.view))?;

        ctx.backend.begin_render_pass(&color_pass(
            "Final",
            ctx.frame.swapchain_view,
            LoadOp::Clear([0.0, 0.0, 0.0, 1.0]),
        ));
        ctx.backend.set_viewport(
            0.0,
            0.0,
            ctx.frame.width as f32,
            ctx.frame.height as f32,
            0.0,
            1.0,
        );
        ctx.backend.set_render_pipeline(self.pipeline);
        ctx.backend.set_bind_group(0, bind_group);
        ctx.backend.draw(0..3, 0..1);
        ctx.backend.end_render_pass();
        Ok(())
    }
}

const FINAL_SHADER: &str = r#"
struct CompositeParams {
    exposure: f32,
    gamma: f32,
    bloom_strength: f32,
}

@group(0) @binding(0) var final_color: texture_2d<f32>;
@group(0) @binding(1) var bloom: texture_2d<f32>;
@group(0) @binding(2) var linear_sampler: sampler;
@group(0) @binding(3) var<uniform> params: CompositeParams;

fn aces_tonemap(color: vec3<f32>) -> vec3<f32> {
    let a = 2.51;
    let b = 0.03;
    let c = 2.43;
    let d = 0.59;
    let e = 0.14;
    return saturate((color * (a * color + b)) / (color * (c * color + d) + e));
}

@fragment
fn fs_main(in: FullscreenOutput) -> @location(0) vec4<f32> {
    let lit = textureSampleLevel(final_color, linear_sampler, in.uv, 0.0).rgb;
    let glow = textureSampleLevel(bloom, linear_sampler, in.uv, 0.0).rgb;
    let mapped = aces_tonemap((lit + glow * params.bloom_strength) * params.exposure);
    return vec4<f32>(pow(mapped, vec3<f32>(1.0 / params.gamma)), 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gamma_skipped_for_srgb_surfaces() {
        assert_eq!(CompositeParams::for_format(TextureFormat::Bgra8UnormSrgb).gamma, 1.0);
        assert_eq!(CompositeParams::for_format(TextureFormat::Bgra8Unorm).gamma, 2.2);
    }
}
