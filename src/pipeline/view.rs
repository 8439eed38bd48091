//! Camera state as seen by the passes

use super::Viewport;
use crate::dataflow::{Port, PortError};
use crate::scene::{Frustum, FAR_PLANE, NEAR_PLANE};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

/// The ports every pass reads to set up its camera
#[derive(Debug, Clone, Default)]
pub struct ViewPorts {
    pub viewport: Port<Viewport>,
    /// Vertical field of view in degrees
    pub field_of_view: Port<f32>,
    pub world_to_eye: Port<Mat4>,
}

impl ViewPorts {
    /// Fresh ports aliasing `producer`, with their own change bookmarks
    pub fn bound_to(producer: &ViewPorts) -> Result<Self, PortError> {
        let mut ports = ViewPorts::default();
        ports.viewport.bind_from(&producer.viewport)?;
        ports.field_of_view.bind_from(&producer.field_of_view)?;
        ports.world_to_eye.bind_from(&producer.world_to_eye)?;
        Ok(ports)
    }

    pub fn resolve(&self) -> Result<FrameView, PortError> {
        let viewport = self.viewport.get()?;
        let field_of_view = self.field_of_view.get()?;
        let world_to_eye = self.world_to_eye.get()?;
        Ok(FrameView::new(viewport, field_of_view, world_to_eye))
    }
}

/// Matrices derived from the view ports for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameView {
    pub viewport: Viewport,
    pub field_of_view: f32,
    pub world_to_eye: Mat4,
    pub eye_to_world: Mat4,
    pub eye_to_projection: Mat4,
}

impl FrameView {
    pub fn new(viewport: Viewport, field_of_view: f32, world_to_eye: Mat4) -> Self {
        let eye_to_projection = Mat4::perspective_rh(
            field_of_view.clamp(1.0, 179.0).to_radians(),
            viewport.aspect(),
            NEAR_PLANE,
            FAR_PLANE,
        );
        Self {
            viewport,
            field_of_view,
            world_to_eye,
            eye_to_world: world_to_eye.inverse(),
            eye_to_projection,
        }
    }

    pub fn eye_position(&self) -> glam::Vec3 {
        self.eye_to_world.w_axis.truncate()
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_matrix(&(self.eye_to_projection * self.world_to_eye))
    }

    /// Frustum cut off at `far`, bounding light and emitter gathering
    pub fn cull_frustum(&self, far: f32) -> Frustum {
        let projection = Mat4::perspective_rh(
            self.field_of_view.clamp(1.0, 179.0).to_radians(),
            self.viewport.aspect(),
            NEAR_PLANE,
            far.max(NEAR_PLANE * 2.0),
        );
        Frustum::from_matrix(&(projection * self.world_to_eye))
    }

    pub fn uniform_data(&self) -> ViewUniformData {
        let width = self.viewport.width.max(1) as f32;
        let height = self.viewport.height.max(1) as f32;
        ViewUniformData {
            world_to_eye: self.world_to_eye,
            eye_to_projection: self.eye_to_projection,
            eye_to_world: self.eye_to_world,
            projection_to_eye: self.eye_to_projection.inverse(),
            viewport: Vec4::new(width, height, 1.0 / width, 1.0 / height),
            eye_position: self.eye_position().extend(1.0),
        }
    }
}

/// Matches the `View` struct declared by the shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ViewUniformData {
    pub world_to_eye: Mat4,
    pub eye_to_projection: Mat4,
    pub eye_to_world: Mat4,
    pub projection_to_eye: Mat4,
    pub viewport: Vec4,
    pub eye_position: Vec4,
}

pub const VIEW_WGSL: &str = r#"
struct View {
    world_to_eye: mat4x4<f32>,
    eye_to_projection: mat4x4<f32>,
    eye_to_world: mat4x4<f32>,
    projection_to_eye: mat4x4<f32>,
    viewport: vec4<f32>,
    eye_position: vec4<f32>,
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    #[test]
    fn test_unset_port_reports_not_produced() {
        let ports = ViewPorts::default();
        assert!(matches!(ports.resolve(), Err(PortError::NotProduced { .. })));
    }

    #[test]
    fn test_bound_ports_see_producer_values() {
        let producer = ViewPorts::default();
        let mut consumer = ViewPorts::bound_to(&producer).unwrap();
        producer.viewport.set(Viewport::new(800, 600));
        producer.field_of_view.set(60.0);
        producer.world_to_eye.set(Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0)));

        assert!(consumer.viewport.updated());
        let view = consumer.resolve().unwrap();
        assert_eq!(view.viewport, Viewport::new(800, 600));
        assert!((view.eye_position() - Vec3::new(0.0, 0.0, 5.0)).length() < 1e-5);
    }

    #[test]
    fn test_cull_frustum_is_shorter() {
        let view = FrameView::new(
            Viewport::new(100, 100),
            60.0,
            crate::scene::Camera::new(Vec3::ZERO, Quat::IDENTITY).world_to_eye(),
        );
        let far_box = crate::scene::Aabb::from_center(Vec3::new(0.0, 0.0, -500.0), Vec3::ONE);
        assert!(view.frustum().intersects_aabb(&far_box));
        assert!(!view.cull_frustum(150.0).intersects_aabb(&far_box));
    }
}
