//! Light sources

use super::Aabb;
use crate::shadow::ShadowEntry;
use bevy_ecs::prelude::*;
use glam::{Mat4, Quat, Vec3};

/// Shape of the emitted light
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LightType {
    #[default]
    Omni,
    Spot,
}

/// Light source component
///
/// Spot lights shine along local -Z of `orientation`. Falloff and hotspot are
/// full cone angles in degrees.
#[derive(Component, Debug)]
pub struct SceneLight {
    pub light_type: LightType,
    pub position: Vec3,
    pub orientation: Quat,
    pub color: Vec3,
    pub ambient_illumination: f32,
    pub attenuation_start: f32,
    pub attenuation_end: f32,
    pub falloff: f32,
    pub hotspot: f32,
    /// Pyramid instead of cone for spot lights
    pub rectangle_shape: bool,
    pub aspect_ratio: f32,
    pub shadow_caster: bool,
    pub light_caster: bool,
    pub(crate) shadow: Option<ShadowEntry>,
    pub(crate) revision: u64,
}

impl Default for SceneLight {
    fn default() -> Self {
        Self {
            light_type: LightType::Omni,
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            color: Vec3::ONE,
            ambient_illumination: 0.0,
            attenuation_start: 1.0,
            attenuation_end: 100.0,
            falloff: 90.0,
            hotspot: 45.0,
            rectangle_shape: false,
            aspect_ratio: 1.0,
            shadow_caster: false,
            light_caster: true,
            shadow: None,
            revision: 0,
        }
    }
}

impl Clone for SceneLight {
    /// Clones the parameters only, the copy has no shadow slot
    fn clone(&self) -> Self {
        Self {
            light_type: self.light_type,
            position: self.position,
            orientation: self.orientation,
            color: self.color,
            ambient_illumination: self.ambient_illumination,
            attenuation_start: self.attenuation_start,
            attenuation_end: self.attenuation_end,
            falloff: self.falloff,
            hotspot: self.hotspot,
            rectangle_shape: self.rectangle_shape,
            aspect_ratio: self.aspect_ratio,
            shadow_caster: self.shadow_caster,
            light_caster: self.light_caster,
            shadow: None,
            revision: 0,
        }
    }
}

impl SceneLight {
    pub fn omni(position: Vec3, color: Vec3, attenuation_end: f32) -> Self {
        Self {
            position,
            color,
            attenuation_start: (attenuation_end * 0.1).min(1.0),
            attenuation_end,
            ..Default::default()
        }
    }

    pub fn spot(position: Vec3, orientation: Quat, color: Vec3, attenuation_end: f32) -> Self {
        Self {
            light_type: LightType::Spot,
            position,
            orientation,
            color,
            attenuation_start: (attenuation_end * 0.1).min(1.0),
            attenuation_end,
            ..Default::default()
        }
    }

    pub fn with_cone(mut self, hotspot: f32, falloff: f32) -> Self {
        self.hotspot = hotspot;
        self.falloff = falloff;
        self
    }

    pub fn with_shadow(mut self, shadow_caster: bool) -> Self {
        self.shadow_caster = shadow_caster;
        self
    }

    pub fn with_rectangle_shape(mut self, aspect_ratio: f32) -> Self {
        self.rectangle_shape = true;
        self.aspect_ratio = aspect_ratio;
        self
    }

    pub fn with_ambient(mut self, ambient_illumination: f32) -> Self {
        self.ambient_illumination = ambient_illumination;
        self
    }

    /// Box enclosing everything the light can reach
    pub fn bounding_box(&self) -> Aabb {
        let extent = self.attenuation_end * std::f32::consts::SQRT_2;
        Aabb::from_center(self.position, Vec3::splat(extent))
    }

    /// Only spot lights get a shadow map
    pub fn wants_shadow(&self) -> bool {
        self.light_caster && self.shadow_caster && self.light_type == LightType::Spot
    }

    /// World space to the light's clip space
    pub fn world_to_shadow_projection(&self) -> Mat4 {
        match self.light_type {
            LightType::Omni => Mat4::IDENTITY,
            LightType::Spot => {
                let projection = Mat4::perspective_rh(
                    self.falloff.clamp(1.0, 179.0).to_radians(),
                    self.aspect_ratio.max(1e-3),
                    0.1,
                    self.attenuation_end.max(0.2),
                );
                let light_to_world =
                    Mat4::from_rotation_translation(self.orientation, self.position);
                projection * light_to_world.inverse()
            }
        }
    }

    /// Shadow slot held this frame, if any
    pub fn shadow_index(&self) -> i32 {
        self.shadow.as_ref().map_or(-1, |entry| entry.index())
    }

    /// Bumped whenever the light is changed through the scene
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounding_box_uses_sqrt2_extent() {
        let light = SceneLight::omni(Vec3::new(1.0, 0.0, 0.0), Vec3::ONE, 10.0);
        let bounds = light.bounding_box();
        let expected = 10.0 * std::f32::consts::SQRT_2;
        assert!((bounds.max.x - (1.0 + expected)).abs() < 1e-4);
        assert!((bounds.min.y + expected).abs() < 1e-4);
    }

    #[test]
    fn test_only_spot_casters_want_shadows() {
        let omni = SceneLight::omni(Vec3::ZERO, Vec3::ONE, 5.0).with_shadow(true);
        assert!(!omni.wants_shadow());

        let spot = SceneLight::spot(Vec3::ZERO, Quat::IDENTITY, Vec3::ONE, 5.0).with_shadow(true);
        assert!(spot.wants_shadow());

        let mut dark = spot.clone();
        dark.light_caster = false;
        assert!(!dark.wants_shadow());
    }

    #[test]
    fn test_spot_projection_maps_axis_to_center() {
        let spot = SceneLight::spot(Vec3::new(0.0, 5.0, 0.0), Quat::IDENTITY, Vec3::ONE, 20.0);
        let clip = spot.world_to_shadow_projection() * Vec3::new(0.0, 5.0, -10.0).extend(1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn test_clone_drops_shadow_entry() {
        let cache = crate::shadow::ShadowSlotCache::new(1);
        let mut light = SceneLight::default();
        light.shadow = Some(cache.create_entry());
        assert!(light.clone().shadow.is_none());
    }
}
