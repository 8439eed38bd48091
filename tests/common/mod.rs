//! Common utilities for frame pipeline integration tests.
//!
//! Everything here drives the renderer through the command-recording backend,
//! so the tests need no GPU.

#![allow(dead_code)]

use glam::{Quat, Vec3};
use scene_renderer::resources::{Material, Mesh};
use scene_renderer::scene::Transform;
use scene_renderer::{
    Camera, RecordingBackend, RendererConfig, SceneLight, SceneObject, SceneRenderer,
};

/// Route `log` output through the test harness; safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Renderer Construction
// ============================================================================

/// Renderer over a recording backend with the given surface size.
pub fn renderer(width: u32, height: u32, config: RendererConfig) -> SceneRenderer<RecordingBackend> {
    init_logging();
    let config = RendererConfig {
        width,
        height,
        ..config
    };
    SceneRenderer::new(RecordingBackend::new(width, height), config)
        .expect("renderer construction should succeed")
}

/// Default configuration with small shadow maps and `slots` shadow slots.
pub fn config_with_slots(slots: u32) -> RendererConfig {
    RendererConfig {
        shadow_map_count: slots,
        shadow_map_size: 32,
        ..Default::default()
    }
}

// ============================================================================
// Scene Helpers
// ============================================================================

/// Camera 20 units up the Z axis, looking at the origin.
pub fn overview_camera() -> Camera {
    let mut camera = Camera::new(Vec3::new(0.0, 4.0, 20.0), Quat::IDENTITY);
    camera.look_at(Vec3::ZERO, Vec3::Y);
    camera
}

/// Floor plane with a cube resting on it.
pub fn add_floor_and_cube(renderer: &mut SceneRenderer<RecordingBackend>) {
    let scene = renderer.scene_mut();
    let floor = scene.add_model(Mesh::plane(40.0, 40.0), Material::new("floor"));
    let cube = scene.add_model(Mesh::cube(2.0), Material::new("cube"));
    scene.add_object(SceneObject::new(floor, Transform::from_position(Vec3::ZERO)));
    scene.add_object(SceneObject::new(cube, Transform::from_position(Vec3::new(0.0, 1.0, 0.0))));
}

/// Shadow casting spot light above the floor at `x`, tilted down.
pub fn shadow_spot(x: f32) -> SceneLight {
    SceneLight::spot(
        Vec3::new(x, 5.0, 0.0),
        Quat::from_rotation_x(-1.2),
        Vec3::ONE,
        30.0,
    )
    .with_shadow(true)
}
