//! Surface parameters written into the G-buffer

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

/// Material of a scene model
///
/// Opaque materials are drawn by the G-buffer pass, materials with
/// `opacity < 1` by the transparency pass.
#[derive(Debug, Clone)]
pub struct Material {
    pub name: String,
    pub diffuse: Vec3,
    pub specular: Vec3,
    /// Specular exponent scale, stored in the specular level target
    pub glossiness: f32,
    pub specular_level: f32,
    /// Emitted color, feeds the bloom through the final color target
    pub self_illumination: Vec3,
    pub opacity: f32,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            diffuse: Vec3::splat(0.8),
            specular: Vec3::ONE,
            glossiness: 20.0,
            specular_level: 0.3,
            self_illumination: Vec3::ZERO,
            opacity: 1.0,
        }
    }
}

impl Material {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_diffuse(mut self, color: Vec3) -> Self {
        self.diffuse = color;
        self
    }

    pub fn with_specular(mut self, color: Vec3, level: f32, glossiness: f32) -> Self {
        self.specular = color;
        self.specular_level = level;
        self.glossiness = glossiness;
        self
    }

    pub fn with_self_illumination(mut self, color: Vec3) -> Self {
        self.self_illumination = color;
        self
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity.clamp(0.0, 1.0);
        self
    }

    pub fn is_transparent(&self) -> bool {
        self.opacity < 1.0
    }

    pub fn uniform_data(&self) -> MaterialUniformData {
        MaterialUniformData {
            diffuse: self.diffuse.extend(self.opacity),
            specular: self.specular.extend(self.specular_level),
            self_illumination: self.self_illumination.extend(self.glossiness),
        }
    }

    pub fn glass() -> Self {
        Self::new("glass")
            .with_diffuse(Vec3::new(0.6, 0.7, 0.8))
            .with_specular(Vec3::ONE, 0.8, 60.0)
            .with_opacity(0.35)
    }

    pub fn glowing(color: Vec3) -> Self {
        Self::new("glowing").with_diffuse(color).with_self_illumination(color)
    }
}

/// Material uniform data for GPU
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MaterialUniformData {
    /// xyz = diffuse, w = opacity
    pub diffuse: Vec4,
    /// xyz = specular color, w = specular level
    pub specular: Vec4,
    /// xyz = self illumination, w = glossiness
    pub self_illumination: Vec4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opacity_is_clamped() {
        assert_eq!(Material::new("m").with_opacity(2.0).opacity, 1.0);
        assert!(Material::glass().is_transparent());
        assert!(!Material::default().is_transparent());
    }

    #[test]
    fn test_uniform_packing() {
        let data = Material::new("m")
            .with_diffuse(Vec3::new(0.1, 0.2, 0.3))
            .with_opacity(0.5)
            .uniform_data();
        assert_eq!(data.diffuse, Vec4::new(0.1, 0.2, 0.3, 0.5));
        assert_eq!(std::mem::size_of::<MaterialUniformData>(), 48);
    }
}
