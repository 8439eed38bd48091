//! View frustum for scene culling

use super::Aabb;
use glam::{Mat4, Vec3, Vec4};

#[derive(Debug, Clone, Copy)]
pub struct FrustumPlane {
    pub normal: Vec3,
    pub d: f32,
}

impl FrustumPlane {
    fn from_row(v: Vec4) -> Self {
        let normal = v.truncate();
        let len = normal.length();
        if len > 0.0 {
            FrustumPlane {
                normal: normal / len,
                d: v.w / len,
            }
        } else {
            FrustumPlane { normal, d: v.w }
        }
    }

    pub fn distance_to(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.d
    }
}

/// How a box relates to a frustum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    Outside,
    Intersecting,
    Inside,
}

/// Six clip planes, normals pointing inward
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    planes: [FrustumPlane; 6],
}

impl Frustum {
    /// Extract planes from a world-to-projection matrix with a 0..1 depth range
    pub fn from_matrix(m: &Mat4) -> Self {
        let row0 = m.row(0);
        let row1 = m.row(1);
        let row2 = m.row(2);
        let row3 = m.row(3);

        Frustum {
            planes: [
                FrustumPlane::from_row(row3 + row0), // left
                FrustumPlane::from_row(row3 - row0), // right
                FrustumPlane::from_row(row3 + row1), // bottom
                FrustumPlane::from_row(row3 - row1), // top
                FrustumPlane::from_row(row2),        // near
                FrustumPlane::from_row(row3 - row2), // far
            ],
        }
    }

    pub fn planes(&self) -> &[FrustumPlane; 6] {
        &self.planes
    }

    pub fn classify(&self, aabb: &Aabb) -> Containment {
        let mut result = Containment::Inside;
        for plane in &self.planes {
            // Corner furthest along the normal, and the one opposite
            let positive = Vec3::select(plane.normal.cmpge(Vec3::ZERO), aabb.max, aabb.min);
            let negative = Vec3::select(plane.normal.cmpge(Vec3::ZERO), aabb.min, aabb.max);
            if plane.distance_to(positive) < 0.0 {
                return Containment::Outside;
            }
            if plane.distance_to(negative) < 0.0 {
                result = Containment::Intersecting;
            }
        }
        result
    }

    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        self.classify(aabb) != Containment::Outside
    }

    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes.iter().all(|p| p.distance_to(center) >= -radius)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera_frustum() -> Frustum {
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 100.0);
        Frustum::from_matrix(&proj)
    }

    #[test]
    fn test_box_in_front_is_inside() {
        let f = camera_frustum();
        let b = Aabb::from_center(Vec3::new(0.0, 0.0, -10.0), Vec3::ONE);
        assert_eq!(f.classify(&b), Containment::Inside);
    }

    #[test]
    fn test_box_behind_is_outside() {
        let f = camera_frustum();
        let b = Aabb::from_center(Vec3::new(0.0, 0.0, 10.0), Vec3::ONE);
        assert_eq!(f.classify(&b), Containment::Outside);
    }

    #[test]
    fn test_box_beyond_far_is_outside() {
        let f = camera_frustum();
        let b = Aabb::from_center(Vec3::new(0.0, 0.0, -200.0), Vec3::ONE);
        assert!(!f.intersects_aabb(&b));
    }

    #[test]
    fn test_box_straddling_edge_intersects() {
        let f = camera_frustum();
        let b = Aabb::from_center(Vec3::new(0.0, 0.0, 0.0), Vec3::splat(2.0));
        assert_eq!(f.classify(&b), Containment::Intersecting);
    }

    #[test]
    fn test_sphere() {
        let f = camera_frustum();
        assert!(f.intersects_sphere(Vec3::new(0.0, 0.0, -5.0), 1.0));
        assert!(!f.intersects_sphere(Vec3::new(0.0, 0.0, 5.0), 1.0));
    }
}
