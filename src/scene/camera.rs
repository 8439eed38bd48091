//! Scene camera

use glam::{Mat3, Mat4, Quat, Vec3};

pub const NEAR_PLANE: f32 = 0.1;
pub const FAR_PLANE: f32 = 1.0e4;

/// Viewer placement and lens
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub orientation: Quat,
    /// Vertical field of view in degrees
    pub field_of_view: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            field_of_view: 60.0,
        }
    }
}

impl Camera {
    pub fn new(position: Vec3, orientation: Quat) -> Self {
        Self {
            position,
            orientation,
            ..Default::default()
        }
    }

    /// Turn the camera so that -Z points at `target`
    pub fn look_at(&mut self, target: Vec3, up: Vec3) {
        let forward = (target - self.position).normalize_or_zero();
        if forward == Vec3::ZERO {
            return;
        }
        let right = forward.cross(up).normalize_or_zero();
        if right == Vec3::ZERO {
            return;
        }
        let up = right.cross(forward);
        self.orientation = Quat::from_mat3(&Mat3::from_cols(right, up, -forward));
    }

    pub fn forward(&self) -> Vec3 {
        self.orientation * -Vec3::Z
    }

    pub fn eye_to_world(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.orientation, self.position)
    }

    pub fn world_to_eye(&self) -> Mat4 {
        Mat4::from_quat(self.orientation.inverse()) * Mat4::from_translation(-self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_to_eye_inverts_eye_to_world() {
        let camera = Camera::new(
            Vec3::new(3.0, -2.0, 7.0),
            Quat::from_euler(glam::EulerRot::YXZ, 0.4, -0.2, 0.0),
        );
        let product = camera.world_to_eye() * camera.eye_to_world();
        assert!(product.abs_diff_eq(Mat4::IDENTITY, 1e-5));
    }

    #[test]
    fn test_look_at_points_forward_at_target() {
        let mut camera = Camera::new(Vec3::new(0.0, 0.0, 10.0), Quat::IDENTITY);
        camera.look_at(Vec3::new(10.0, 0.0, 10.0), Vec3::Y);
        assert!((camera.forward() - Vec3::X).length() < 1e-5);

        let eye = camera.world_to_eye().transform_point3(Vec3::new(10.0, 0.0, 10.0));
        assert!(eye.z < 0.0);
    }
}
