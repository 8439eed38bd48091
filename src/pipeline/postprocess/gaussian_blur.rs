//! Separable Gaussian blur
//!
//! A horizontal pass writes an intermediate target, a vertical pass writes
//! the output. Tap weights and offsets are baked into generated programs,
//! one pair per `(blur_amount, sample_count)` combination, kept for reuse.

use super::super::*;
use std::fmt::Write as _;

/// Weight of the tap `n` texels from the centre for spread `theta`
pub fn compute_gaussian(n: f32, theta: f32) -> f32 {
    (1.0 / (2.0 * std::f32::consts::PI * theta).sqrt()) * (-(n * n) / (2.0 * theta * theta)).exp()
}

/// Normalized weights and texel offsets along `(dx, dy)`
///
/// The centre tap comes first, followed by mirrored pairs. `sample_count` is
/// rounded up to the next odd number so every tap has its mirror.
pub fn compute_blur_samples(sample_count: u32, blur_amount: f32, dx: i32, dy: i32) -> (Vec<f32>, Vec<[i32; 2]>) {
    let sample_count = odd_sample_count(sample_count) as usize;
    let mut weights = Vec::with_capacity(sample_count);
    let mut offsets = Vec::with_capacity(sample_count);
    weights.push(compute_gaussian(0.0, blur_amount));
    offsets.push([0, 0]);
    for i in 0..sample_count / 2 {
        let distance = i as i32 + 1;
        let weight = compute_gaussian(distance as f32, blur_amount);
        weights.extend([weight, weight]);
        offsets.extend([[dx * distance, dy * distance], [-dx * distance, -dy * distance]]);
    }
    let total: f32 = weights.iter().sum();
    if total > 0.0 {
        weights.iter_mut().for_each(|w| *w /= total);
    }
    (weights, offsets)
}

pub fn odd_sample_count(sample_count: u32) -> u32 {
    sample_count.max(1) | 1
}

/// Fragment program summing the taps with edge-clamped loads
pub fn blur_shader(weights: &[f32], offsets: &[[i32; 2]]) -> String {
    let mut taps = String::new();
    for (weight, [x, y]) in weights.iter().zip(offsets) {
        let _ = writeln!(
            taps,
            "    sum = sum + textureLoad(source, clamp(pos + vec2<i32>({x}, {y}), vec2<i32>(0, 0), last), 0) * {weight:?};"
        );
    }
    format!(
        r#"{FULLSCREEN_WGSL}
@group(0) @binding(0) var source: texture_2d<f32>;

@fragment
fn fs_main(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {{
    let last = vec2<i32>(textureDimensions(source)) - vec2<i32>(1, 1);
    let pos = vec2<i32>(frag_coord.xy);
    var sum = vec4<f32>(0.0);
{taps}    return sum;
}}
"#
    )
}

#[derive(Debug, Clone, Copy)]
struct BlurSetup {
    blur_amount: f32,
    sample_count: u32,
    horizontal: RenderPipelineHandle,
    vertical: RenderPipelineHandle,
}

#[derive(Debug, Clone, Copy)]
struct BlurBindings {
    input: TextureViewHandle,
    intermediate: TextureViewHandle,
    input_group: BindGroupHandle,
    intermediate_group: BindGroupHandle,
}

pub struct GaussianBlur {
    format: TextureFormat,
    layout: BindGroupLayoutHandle,
    setups: Vec<BlurSetup>,
    intermediate: Option<RenderTarget>,
    bindings: Option<BlurBindings>,
}

impl GaussianBlur {
    pub fn new(backend: &mut dyn GraphicsBackend, format: TextureFormat) -> RendererResult<Self> {
        let layout = backend.create_bind_group_layout(&[layout_entry(
            0,
            ShaderStageFlags::FRAGMENT,
            BindingType::texture_2d_unfilterable(),
        )])?;
        Ok(Self {
            format,
            layout,
            setups: Vec::new(),
            intermediate: None,
            bindings: None,
        })
    }

    /// Number of cached program pairs
    pub fn program_count(&self) -> usize {
        self.setups.len()
    }

    /// Build, or find, the programs for a blur configuration
    pub fn prepare(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        blur_amount: f32,
        sample_count: u32,
    ) -> RendererResult<()> {
        self.setup(backend, blur_amount, sample_count).map(|_| ())
    }

    fn setup(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        blur_amount: f32,
        sample_count: u32,
    ) -> RendererResult<BlurSetup> {
        let sample_count = odd_sample_count(sample_count);
        if let Some(setup) = self
            .setups
            .iter()
            .find(|s| s.blur_amount.to_bits() == blur_amount.to_bits() && s.sample_count == sample_count)
        {
            return Ok(*setup);
        }

        let mut program = |label: &str, dx: i32, dy: i32| {
            let (weights, offsets) = compute_blur_samples(sample_count, blur_amount, dx, dy);
            create_render_pipeline(
                backend,
                &fullscreen_pipeline(
                    label,
                    blur_shader(&weights, &offsets),
                    vec![self.layout],
                    ColorTargetState::opaque(self.format),
                ),
            )
        };
        let setup = BlurSetup {
            blur_amount,
            sample_count,
            horizontal: program("horizontal gaussian blur", 1, 0)?,
            vertical: program("vertical gaussian blur", 0, 1)?,
        };
        log::debug!("Built Gaussian blur programs for amount {blur_amount}, {sample_count} samples");
        self.setups.push(setup);
        Ok(setup)
    }

    fn intermediate(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
    ) -> RendererResult<RenderTarget> {
        if let Some(target) = self.intermediate {
            if target.width == width && target.height == height {
                return Ok(target);
            }
            target.destroy(backend);
        }
        let target = RenderTarget::new(
            backend,
            "Gaussian Blur Pass 0",
            width,
            height,
            self.format,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        )?;
        self.intermediate = Some(target);
        Ok(target)
    }

    fn bindings(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        input: TextureViewHandle,
        intermediate: TextureViewHandle,
    ) -> RendererResult<BlurBindings> {
        if let Some(bindings) = self.bindings {
            if bindings.input == input && bindings.intermediate == intermediate {
                return Ok(bindings);
            }
            backend.destroy_bind_group(bindings.input_group);
            backend.destroy_bind_group(bindings.intermediate_group);
        }
        let bindings = BlurBindings {
            input,
            intermediate,
            input_group: backend.create_bind_group(self.layout, &[(0, BindGroupEntry::Texture(input))])?,
            intermediate_group: backend
                .create_bind_group(self.layout, &[(0, BindGroupEntry::Texture(intermediate))])?,
        };
        self.bindings = Some(bindings);
        Ok(bindings)
    }

    /// Blur `input` into `output`; both must have the same size
    pub fn blur(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        input: &RenderTarget,
        output: &RenderTarget,
        blur_amount: f32,
        sample_count: u32,
    ) -> RendererResult<()> {
        let setup = self.setup(backend, blur_amount, sample_count)?;
        let intermediate = self.intermediate(backend, input.width, input.height)?;
        let bindings = self.bindings(backend, input.view, intermediate.view)?;
        let (width, height) = (input.width as f32, input.height as f32);

        backend.begin_render_pass(&color_pass(
            "Gaussian Blur Horizontal",
            intermediate.view,
            LoadOp::Clear([0.0, 0.0, 0.0, 0.0]),
        ));
        backend.set_viewport(0.0, 0.0, width, height, 0.0, 1.0);
        backend.set_render_pipeline(setup.horizontal);
        backend.set_bind_group(0, bindings.input_group);
        backend.draw(0..3, 0..1);
        backend.end_render_pass();

        backend.begin_render_pass(&color_pass(
            "Gaussian Blur Vertical",
            output.view,
            LoadOp::Clear([0.0, 0.0, 0.0, 0.0]),
        ));
        backend.set_viewport(0.0, 0.0, width, height, 0.0, 1.0);
        backend.set_render_pipeline(setup.vertical);
        backend.set_bind_group(0, bindings.intermediate_group);
        backend.draw(0..3, 0..1);
        backend.end_render_pass();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;

    #[test]
    fn test_weights_are_normalized_and_mirrored() {
        let (weights, offsets) = compute_blur_samples(15, 2.0, 1, 0);
        assert_eq!(weights.len(), 15);
        assert!((weights.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert_eq!(offsets[0], [0, 0]);
        assert_eq!(offsets[1], [1, 0]);
        assert_eq!(offsets[2], [-1, 0]);
        assert_eq!(weights[1], weights[2]);
        assert!(weights[0] > weights[1]);
        assert!(weights[1] > weights[13]);
    }

    #[test]
    fn test_even_sample_count_rounds_up() {
        assert_eq!(odd_sample_count(4), 5);
        assert_eq!(odd_sample_count(0), 1);
        let (weights, offsets) = compute_blur_samples(4, 1.0, 0, 1);
        assert_eq!(weights.len(), 5);
        assert_eq!(offsets[4], [0, -2]);
    }

    #[test]
    fn test_gaussian_formula() {
        let theta = 2.0f32;
        let expected = 1.0 / (2.0 * std::f32::consts::PI * theta).sqrt();
        assert!((compute_gaussian(0.0, theta) - expected).abs() < 1e-6);
        assert!(compute_gaussian(3.0, theta) < compute_gaussian(1.0, theta));
    }

    #[test]
    fn test_programs_are_cached_per_configuration() {
        let mut backend = RecordingBackend::new(16, 16);
        let mut blur = GaussianBlur::new(&mut backend, TextureFormat::Rgba16Float).unwrap();
        blur.prepare(&mut backend, 2.0, 15).unwrap();
        blur.prepare(&mut backend, 2.0, 15).unwrap();
        assert_eq!(blur.program_count(), 1);
        blur.prepare(&mut backend, 3.0, 15).unwrap();
        blur.prepare(&mut backend, 2.0, 14).unwrap();
        assert_eq!(blur.program_count(), 2);
    }

    #[test]
    fn test_blur_records_two_passes() {
        let mut backend = RecordingBackend::new(16, 16);
        let mut blur = GaussianBlur::new(&mut backend, TextureFormat::Rgba16Float).unwrap();
        let usage = TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING;
        let input = RenderTarget::new(&mut backend, "in", 16, 16, TextureFormat::Rgba16Float, usage).unwrap();
        let output = RenderTarget::new(&mut backend, "out", 16, 16, TextureFormat::Rgba16Float, usage).unwrap();

        backend.begin_frame().unwrap();
        blur.blur(&mut backend, &input, &output, 2.0, 7).unwrap();
        backend.end_frame().unwrap();
        assert_eq!(
            backend.submitted_pass_labels(),
            vec!["Gaussian Blur Horizontal", "Gaussian Blur Vertical"]
        );
    }
}
