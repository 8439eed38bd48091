//! Frame orchestrator
//!
//! Owns the backend, the scene and every pass, wires the passes' ports
//! together once at construction and runs them in a fixed order each frame.

use crate::backend::traits::*;
use crate::dataflow::Port;
use crate::error::RendererResult;
use crate::pipeline::final_pass::FinalInputs;
use crate::pipeline::particles::ParticleInputs;
use crate::pipeline::postprocess::BloomInputs;
use crate::pipeline::skybox::SkyboxInputs;
use crate::pipeline::transparency::TransparencyInputs;
use crate::pipeline::lightsource::LightsourceInputs;
use crate::pipeline::{
    BloomPass, FinalPass, FramePass, FrameStats, GBufferPass, GBufferPorts, GpuTimeResult, GpuTimer,
    LightsourcePass, ParticleEmitterPass, PassContext, ShadowPagingPass, SkyboxPass, TileCuller,
    TransparencyPass, ViewPorts, Viewport,
};
use crate::scene::{Camera, Scene};
use crate::RendererConfig;

const SKY_SEED: u32 = 0x2545_f491;

/// The 3D scene renderer
pub struct SceneRenderer<B: GraphicsBackend> {
    backend: B,
    scene: Scene,
    config: RendererConfig,
    view: ViewPorts,
    elapsed: Port<f32>,
    field_of_view: Option<f32>,
    stats: FrameStats,
    timer: GpuTimer,

    shadow_paging: ShadowPagingPass,
    gbuffer: GBufferPass,
    tile_culler: TileCuller,
    lightsource: LightsourcePass,
    transparency: TransparencyPass,
    skybox: SkyboxPass,
    particles: ParticleEmitterPass,
    bloom: BloomPass,
    final_pass: FinalPass,
}

impl<B: GraphicsBackend> SceneRenderer<B> {
    /// Build every pass; any program that fails to validate aborts construction
    pub fn new(mut backend: B, config: RendererConfig) -> RendererResult<Self> {
        let view = ViewPorts::default();
        view.viewport.set(Viewport::new(config.width, config.height));
        let elapsed = Port::new();
        let backend_ref: &mut dyn GraphicsBackend = &mut backend;

        let shadow_paging = ShadowPagingPass::new(backend_ref, ViewPorts::bound_to(&view)?, &config)?;
        let gbuffer = GBufferPass::new(backend_ref, ViewPorts::bound_to(&view)?)?;
        let gbuffer_out = gbuffer.outputs();
        let tile_culler = TileCuller::new(
            backend_ref,
            config.tile_size,
            Port::bound_to(&gbuffer_out.normal_z)?,
        )?;
        let lightsource = LightsourcePass::new(
            backend_ref,
            LightsourceInputs {
                view: ViewPorts::bound_to(&view)?,
                gbuffer: GBufferPorts::bound_to(gbuffer_out)?,
                tile_depth: Port::bound_to(tile_culler.result())?,
                shadow_maps: Port::bound_to(shadow_paging.shadow_maps())?,
            },
            &config,
        )?;
        let transparency = TransparencyPass::new(
            backend_ref,
            TransparencyInputs {
                view: ViewPorts::bound_to(&view)?,
                final_color: Port::bound_to(lightsource.final_color())?,
                zbuffer: Port::bound_to(&gbuffer_out.zbuffer)?,
                light_buffer: Port::bound_to(lightsource.light_buffer())?,
                shadow_maps: Port::bound_to(shadow_paging.shadow_maps())?,
            },
        )?;
        let skybox = SkyboxPass::new(
            backend_ref,
            SkyboxInputs {
                view: ViewPorts::bound_to(&view)?,
                final_color: Port::bound_to(lightsource.final_color())?,
                zbuffer: Port::bound_to(&gbuffer_out.zbuffer)?,
            },
            SKY_SEED,
        )?;
        let particles = ParticleEmitterPass::new(
            backend_ref,
            ParticleInputs {
                view: ViewPorts::bound_to(&view)?,
                final_color: Port::bound_to(lightsource.final_color())?,
                zbuffer: Port::bound_to(&gbuffer_out.zbuffer)?,
                elapsed: Port::bound_to(&elapsed)?,
            },
            &config,
        )?;
        let bloom = BloomPass::new(
            backend_ref,
            BloomInputs {
                viewport: Port::bound_to(&view.viewport)?,
                final_color: Port::bound_to(lightsource.final_color())?,
            },
            &config,
        )?;
        let final_pass = FinalPass::new(
            backend_ref,
            FinalInputs {
                final_color: Port::bound_to(lightsource.final_color())?,
                bloom: Port::bound_to(bloom.output())?,
            },
        )?;
        let timer = GpuTimer::new(backend_ref, config.gpu_timer_frames)?;

        log::info!(
            "Scene renderer ready: {}x{}, {} shadow slots, {} light records",
            config.width,
            config.height,
            config.shadow_map_count,
            config.max_lights
        );

        Ok(Self {
            backend,
            scene: Scene::new(),
            config,
            view,
            elapsed,
            field_of_view: None,
            stats: FrameStats::default(),
            timer,
            shadow_paging,
            gbuffer,
            tile_culler,
            lightsource,
            transparency,
            skybox,
            particles,
            bloom,
            final_pass,
        })
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Counters of the last rendered frame
    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// GPU time per pass of the newest frame read back; never waits
    pub fn gpu_times(&self) -> &[GpuTimeResult] {
        self.timer.results()
    }

    pub fn shadow_paging(&self) -> &ShadowPagingPass {
        &self.shadow_paging
    }

    pub fn lightsource(&self) -> &LightsourcePass {
        &self.lightsource
    }

    pub fn particles(&self) -> &ParticleEmitterPass {
        &self.particles
    }

    /// Handle a surface resize
    pub fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.backend.resize(width, height);
        }
    }

    /// Publish the frame's camera state; ports only change when values do
    fn publish_view(&mut self, camera: &Camera, viewport: Viewport, elapsed: f32) {
        if self.view.viewport.get().ok() != Some(viewport) {
            log::debug!("Viewport changed to {}x{}", viewport.width, viewport.height);
            self.view.viewport.set(viewport);
        }
        if self.field_of_view != Some(camera.field_of_view) {
            self.field_of_view = Some(camera.field_of_view);
            self.view.field_of_view.set(camera.field_of_view);
        }
        self.view.world_to_eye.set(camera.world_to_eye());
        self.elapsed.set(elapsed);
    }

    /// Render one frame seen through `camera`, `elapsed` seconds after the last
    pub fn render(&mut self, camera: &Camera, elapsed: f32) -> RendererResult<()> {
        let (width, height) = self.backend.surface_size();
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.stats.reset();
        self.publish_view(camera, Viewport::new(width, height), elapsed);
        self.scene.prepare(&mut self.backend)?;

        let frame = self.backend.begin_frame()?;
        self.timer.begin_frame(&mut self.backend);

        let passes: [&mut dyn FramePass; 9] = [
            &mut self.shadow_paging,
            &mut self.gbuffer,
            &mut self.tile_culler,
            &mut self.lightsource,
            &mut self.transparency,
            &mut self.skybox,
            &mut self.particles,
            &mut self.bloom,
            &mut self.final_pass,
        ];
        let mut ctx = PassContext {
            backend: &mut self.backend,
            scene: &mut self.scene,
            stats: &mut self.stats,
            frame,
        };
        for pass in passes {
            self.timer.begin_scope(ctx.backend, pass.name());
            let result = pass.run(&mut ctx);
            self.timer.end_scope(ctx.backend);
            result?;
        }

        self.timer.end_frame(&mut self.backend);
        self.backend.end_frame()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;

    #[test]
    fn test_passes_run_in_fixed_order() {
        let mut renderer =
            SceneRenderer::new(RecordingBackend::new(64, 48), RendererConfig::default()).unwrap();
        renderer.render(&Camera::default(), 0.016).unwrap();

        let labels = renderer.backend().submitted_pass_labels();
        let position = |label: &str| labels.iter().position(|l| l == label);
        let order = [
            "GBuffer",
            "ZMinMax",
            "Lightsource Cull",
            "Lightsource Shade",
            "Skybox",
            "Bloom Extract",
            "Final",
        ];
        let found: Vec<usize> = order.iter().map(|l| position(l).unwrap()).collect();
        assert!(found.windows(2).all(|w| w[0] < w[1]), "{labels:?}");
    }

    #[test]
    fn test_zero_sized_surface_skips_frame() {
        let mut renderer =
            SceneRenderer::new(RecordingBackend::new(0, 0), RendererConfig::default()).unwrap();
        renderer.render(&Camera::default(), 0.016).unwrap();
        assert_eq!(renderer.backend().frames_submitted(), 0);
    }
}
