//! End-to-end frame pipeline tests over the recording backend.

mod common;

use common::*;
use glam::Vec3;
use rstest::rstest;
use scene_renderer::pipeline::tile_culler::reduce_min_max;
use scene_renderer::resources::{Material, Mesh};
use scene_renderer::scene::Transform;
use scene_renderer::backend::RecordedCommand;
use scene_renderer::{
    ParticleEmitter, Port, PortError, RecordingBackend, RendererConfig, SceneLight, SceneObject,
    SceneRenderer, ShadowSlotCache,
};

// ============================================================================
// Dataflow Ports
// ============================================================================

#[test]
fn test_port_change_is_seen_once_through_alias() {
    let producer = Port::new();
    let mut consumer = Port::bound_to(&producer).unwrap();
    assert_eq!(consumer.get(), Err(PortError::NotProduced { generation: 0 }));
    assert!(!consumer.updated());

    producer.set(7u32);
    assert!(consumer.updated());
    assert!(!consumer.updated());
    assert_eq!(consumer.get(), Ok(7));

    // Rebinding to the same producer is not a change
    consumer.bind_from(&producer).unwrap();
    assert!(!consumer.updated());
}

// ============================================================================
// Shadow Slot Cache
// ============================================================================

#[rstest]
#[case::single_slot(1, 3)]
#[case::exact_fit(4, 4)]
#[case::oversubscribed(4, 9)]
fn test_assigned_slots_never_exceed_capacity(#[case] capacity: u32, #[case] lights: usize) {
    let mut cache = ShadowSlotCache::new(capacity);
    let entries: Vec<_> = (0..lights).map(|_| cache.create_entry()).collect();

    for frame in 0..3 {
        cache.start_frame();
        for entry in entries.iter().skip(frame % 2) {
            entry.use_in_frame();
        }
        cache.assign_indexes();
        assert!(cache.assigned_count() <= capacity as usize);

        let mut slots: Vec<u32> = entries.iter().filter_map(|e| e.slot()).collect();
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), cache.assigned_count(), "slots must be unique");
    }
}

#[test]
fn test_least_recently_used_entry_is_evicted() {
    let mut cache = ShadowSlotCache::new(2);
    let a = cache.create_entry();
    let b = cache.create_entry();
    let c = cache.create_entry();

    cache.start_frame();
    a.use_in_frame();
    cache.assign_indexes();

    cache.start_frame();
    b.use_in_frame();
    cache.assign_indexes();

    // A was used longest ago and loses its slot to C
    cache.start_frame();
    c.use_in_frame();
    b.use_in_frame();
    cache.assign_indexes();

    assert_eq!(a.index(), -1);
    assert_eq!(c.index(), 0);
    assert_eq!(b.index(), 1);
}

#[test]
fn test_dropped_entry_frees_its_slot() {
    let mut cache = ShadowSlotCache::new(2);
    let entry = cache.create_entry();
    cache.start_frame();
    entry.use_in_frame();
    cache.assign_indexes();
    assert_eq!(cache.free_count(), 1);

    drop(entry);
    assert_eq!(cache.free_count(), 2);
    assert_eq!(cache.assigned_count(), 0);
}

// ============================================================================
// Tile Depth Reduction
// ============================================================================

#[rstest]
#[case::one_tile(16, 16, 16, 1)]
#[case::partial_tiles(40, 20, 16, 6)]
#[case::small_tiles(32, 32, 8, 16)]
fn test_uniform_depth_reduces_to_itself(
    #[case] width: u32,
    #[case] height: u32,
    #[case] tile_size: u32,
    #[case] tiles: usize,
) {
    let depth = vec![0.25; (width * height) as usize];
    let result = reduce_min_max(&depth, width, height, tile_size);
    assert_eq!(result.len(), tiles);
    assert!(result.iter().all(|&range| range == [0.25, 0.25]));
}

#[test]
fn test_tile_keeps_its_extremes() {
    let mut depth = vec![0.5; 16 * 16];
    depth[3] = 0.1;
    depth[200] = 0.9;
    assert_eq!(reduce_min_max(&depth, 16, 16, 16), vec![[0.1, 0.9]]);
}

// ============================================================================
// Full Frames
// ============================================================================

#[test]
fn test_frame_passes_run_in_order() {
    let mut renderer = renderer(96, 64, RendererConfig::default());
    add_floor_and_cube(&mut renderer);
    renderer.scene_mut().add_light(shadow_spot(0.0));
    renderer.render(&overview_camera(), 0.016).unwrap();

    let labels = renderer.backend().submitted_pass_labels();
    let expected = [
        "Shadow Map",
        "GBuffer",
        "ZMinMax",
        "Lightsource Cull",
        "Lightsource Shade",
        "Skybox",
        "Bloom Extract",
        "Gaussian Blur Horizontal",
        "Gaussian Blur Vertical",
        "Final",
    ];
    let positions: Vec<usize> = expected
        .iter()
        .map(|label| {
            labels
                .iter()
                .position(|l| l == label)
                .unwrap_or_else(|| panic!("missing pass {label} in {labels:?}"))
        })
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{labels:?}");
}

#[test]
fn test_lit_scene_with_shadows() {
    let mut renderer = renderer(96, 64, config_with_slots(4));
    add_floor_and_cube(&mut renderer);
    let scene = renderer.scene_mut();
    let left = scene.add_light(shadow_spot(-3.0));
    let right = scene.add_light(shadow_spot(3.0));
    scene.add_light(SceneLight::omni(Vec3::new(0.0, 2.0, 2.0), Vec3::ONE, 10.0));

    let camera = overview_camera();
    renderer.render(&camera, 0.016).unwrap();
    let stats = *renderer.stats();
    assert_eq!(stats.lights_gathered, 3);
    assert_eq!(stats.shadow_maps_rendered, 2);
    assert!(stats.draw_calls > 0);

    let mut indices = [
        renderer.scene().light(left).unwrap().shadow_index(),
        renderer.scene().light(right).unwrap().shadow_index(),
    ];
    indices.sort_unstable();
    assert!(indices[0] >= 0 && indices[0] != indices[1]);

    // Nothing moved, so the shadow maps stay valid
    renderer.render(&camera, 0.016).unwrap();
    assert_eq!(renderer.stats().shadow_maps_rendered, 0);
    assert_eq!(renderer.stats().lights_gathered, 3);
}

#[test]
fn test_geometry_edit_redraws_shadow_maps() {
    let mut renderer = renderer(64, 64, config_with_slots(4));
    add_floor_and_cube(&mut renderer);
    let scene = renderer.scene_mut();
    let cube = scene.add_model(Mesh::cube(1.0), Material::new("crate"));
    let object = scene.add_object(SceneObject::new(cube, Transform::from_position(Vec3::new(2.0, 0.5, 0.0))));
    let light = scene.add_light(shadow_spot(0.0));

    let camera = overview_camera();
    renderer.render(&camera, 0.016).unwrap();
    assert_eq!(renderer.stats().shadow_maps_rendered, 1);

    renderer
        .scene_mut()
        .update_object(object, |o| o.transform.position.x = -2.0);
    renderer.render(&camera, 0.016).unwrap();
    assert_eq!(renderer.stats().shadow_maps_rendered, 1);

    assert!(renderer.scene_mut().remove_object(object));
    renderer.render(&camera, 0.016).unwrap();
    assert_eq!(renderer.stats().shadow_maps_rendered, 1);

    // Removing the light hands its slot back at once
    assert!(renderer.scene_mut().remove_light(light));
    assert_eq!(renderer.shadow_paging().cache().assigned_count(), 0);
}

#[rstest]
#[case::one_slot(1, 3)]
#[case::two_slots(2, 5)]
fn test_exhausted_shadow_pool_degrades(#[case] slots: u32, #[case] lights: usize) {
    let mut renderer = renderer(64, 64, config_with_slots(slots));
    add_floor_and_cube(&mut renderer);
    let ids: Vec<_> = (0..lights)
        .map(|i| renderer.scene_mut().add_light(shadow_spot(i as f32 * 2.0 - 4.0)))
        .collect();

    renderer.render(&overview_camera(), 0.016).unwrap();

    let shadowed = ids
        .iter()
        .filter(|&&id| renderer.scene().light(id).unwrap().shadow_index() >= 0)
        .count();
    assert_eq!(shadowed, slots as usize);
    assert_eq!(renderer.stats().shadow_maps_rendered, slots);
    assert_eq!(renderer.stats().lights_gathered, lights as u32);
    assert!(renderer.shadow_paging().cache().assigned_count() <= slots as usize);
}

#[test]
fn test_gpu_times_arrive_without_blocking() {
    let mut renderer = renderer(64, 64, RendererConfig::default());
    let camera = overview_camera();

    renderer.render(&camera, 0.016).unwrap();
    assert!(renderer.gpu_times().is_empty());

    for _ in 0..3 {
        renderer.render(&camera, 0.016).unwrap();
    }
    let names: Vec<&str> = renderer.gpu_times().iter().map(|t| t.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "shadow paging",
            "gbuffer",
            "zminmax",
            "lightsource",
            "transparency",
            "skybox",
            "particles",
            "bloom",
            "final",
        ]
    );
}

#[test]
fn test_particles_spawn_and_draw() {
    let mut renderer = renderer(64, 64, RendererConfig::default());
    let emitter = renderer.scene_mut().add_emitter(ParticleEmitter::new(Vec3::ZERO));
    let camera = overview_camera();

    renderer.render(&camera, 0.5).unwrap();
    assert_eq!(renderer.particles().active_emitters(), 1);
    assert_eq!(renderer.stats().particles_drawn, 5);
    assert!(renderer
        .backend()
        .submitted_pass_labels()
        .iter()
        .any(|label| label == "Particles"));

    renderer.scene_mut().remove_emitter(emitter);
    renderer.render(&camera, 0.5).unwrap();
    assert_eq!(renderer.particles().active_emitters(), 0);
    assert_eq!(renderer.stats().particles_drawn, 0);
}

#[test]
fn test_resize_reallocates_targets() {
    let mut renderer = renderer(64, 64, RendererConfig::default());
    let camera = overview_camera();
    renderer.render(&camera, 0.016).unwrap();
    let before = renderer.lightsource().final_color().get().unwrap();

    renderer.resize(128, 32);
    renderer.render(&camera, 0.016).unwrap();
    let after = renderer.lightsource().final_color().get().unwrap();

    assert_eq!((after.width, after.height), (128, 32));
    let backend = renderer.backend();
    let texture = backend.view_texture_descriptor(after.view).unwrap();
    assert_eq!((texture.width, texture.height), (128, 32));
    assert!(backend.view_texture_descriptor(before.view).is_none());
    assert_eq!(backend.frames_submitted(), 2);
}

fn dispatch_of(renderer: &SceneRenderer<RecordingBackend>, label: &str) -> Option<(u32, u32, u32)> {
    renderer
        .backend()
        .submitted_commands()
        .iter()
        .skip_while(|cmd| {
            !matches!(cmd, RecordedCommand::BeginComputePass { label: Some(l) } if l == label)
        })
        .find_map(|cmd| match cmd {
            RecordedCommand::Dispatch { x, y, z } => Some((*x, *y, *z)),
            _ => None,
        })
}

#[rstest]
#[case(96, 64, 16, (6, 4, 1))]
#[case(100, 40, 16, (7, 3, 1))]
#[case(100, 40, 32, (4, 2, 1))]
fn test_lightsource_dispatches_one_group_per_tile(
    #[case] width: u32,
    #[case] height: u32,
    #[case] tile_size: u32,
    #[case] groups: (u32, u32, u32),
) {
    let config = RendererConfig {
        tile_size,
        ..RendererConfig::default()
    };
    let mut renderer = renderer(width, height, config);
    add_floor_and_cube(&mut renderer);
    renderer.scene_mut().add_light(shadow_spot(0.0));
    renderer.render(&overview_camera(), 0.016).unwrap();

    assert_eq!(dispatch_of(&renderer, "Lightsource Cull"), Some(groups));
    assert_eq!(dispatch_of(&renderer, "Lightsource Shade"), Some(groups));
}

#[test]
fn test_repeated_resizes_release_old_resources() {
    let mut renderer = renderer(64, 64, RendererConfig::default());
    add_floor_and_cube(&mut renderer);
    renderer.scene_mut().add_light(shadow_spot(0.0));
    let camera = overview_camera();
    renderer.render(&camera, 0.016).unwrap();

    let live = |renderer: &SceneRenderer<RecordingBackend>| {
        let backend = renderer.backend();
        (
            backend.live_texture_count(),
            backend.live_view_count(),
            backend.live_bind_group_count(),
        )
    };
    let baseline = live(&renderer);

    for (width, height) in [(128, 32), (96, 80), (64, 64), (200, 150)] {
        renderer.resize(width, height);
        renderer.render(&camera, 0.016).unwrap();
        assert_eq!(live(&renderer), baseline, "after resizing to {width}x{height}");
    }
}

#[test]
fn test_zero_sized_surface_renders_nothing() {
    let mut renderer = renderer(0, 0, RendererConfig::default());
    renderer.render(&overview_camera(), 0.016).unwrap();
    assert_eq!(renderer.backend().frames_submitted(), 0);
}
