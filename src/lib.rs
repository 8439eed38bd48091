//! Scene Renderer - per-frame 3D scene pipeline over wgpu
//!
//! Passes communicate through change-tracked dataflow ports and run in a
//! fixed order every frame:
//!
//! shadow paging -> G-buffer -> tile min/max -> lightsource -> transparency ->
//! skybox -> particles -> bloom -> final composite
//!
//! # Features
//! - Typed dataflow ports with generation stamps and aliasing
//! - Fixed-capacity shadow map slot cache with LRU eviction
//! - Tiled light culling over a depth min/max pyramid
//! - Scene graph on Bevy ECS with frustum-bounded visitation
//! - Non-blocking GPU pass timing
//! - A command-recording backend for running the whole pipeline without a GPU

pub mod backend;
pub mod dataflow;
pub mod error;
pub mod pipeline;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod shadow;

// Re-export Bevy ECS prelude for users
pub use bevy_ecs::prelude::*;

pub use backend::recording::RecordingBackend;
pub use backend::wgpu_backend::WgpuBackend;
pub use backend::GraphicsBackend;
pub use dataflow::{Port, PortError};
pub use error::{RendererError, RendererResult};
pub use pipeline::{FrameStats, GpuTimeResult};
pub use renderer::SceneRenderer;
pub use scene::{Camera, ParticleEmitter, Scene, SceneLight, SceneObject};
pub use shadow::{ShadowEntry, ShadowSlotCache};

/// Configuration for constructing a [`SceneRenderer`]
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Initial viewport width, replaced by the surface size once frames render
    pub width: u32,
    /// Initial viewport height
    pub height: u32,
    /// Tile size for light culling (in pixels), a power of two
    pub tile_size: u32,
    /// Light records in the GPU light buffer, one is reserved for the terminator
    pub max_lights: u32,
    /// Light indices stored per tile; extra lights in a tile are dropped
    pub light_slots_per_tile: u32,
    /// Number of shadow map slots
    pub shadow_map_count: u32,
    /// Shadow map edge in texels
    pub shadow_map_size: u32,
    /// Luminance above which pixels feed the bloom
    pub bloom_threshold: f32,
    pub bloom_blur_amount: f32,
    pub bloom_sample_count: u32,
    /// Far distance of the frusta used to gather lights and emitters
    pub cull_far_plane: f32,
    /// Timestamp query sets kept in flight
    pub gpu_timer_frames: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            tile_size: 16,
            max_lights: 1024,
            light_slots_per_tile: 128,
            shadow_map_count: 64,
            shadow_map_size: 512,
            bloom_threshold: 0.8,
            bloom_blur_amount: 2.0,
            bloom_sample_count: 15,
            cull_far_plane: 150.0,
            gpu_timer_frames: 4,
        }
    }
}
