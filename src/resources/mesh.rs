//! Mesh data and GPU upload

use crate::backend::traits::{BackendResult, BufferHandle, GraphicsBackend};
use crate::backend::types::{BufferDescriptor, BufferUsage, Vertex};
use crate::scene::Aabb;
use glam::{Vec2, Vec3, Vec4};
use std::f32::consts::PI;

/// A mesh with vertex and index data
#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub name: String,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            name: name.to_string(),
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Object-space bounds; a point box at the origin for an empty mesh
    pub fn bounds(&self) -> Aabb {
        let points: Vec<Vec3> = self.vertices.iter().map(|v| v.position).collect();
        Aabb::from_points(&points).unwrap_or(Aabb::new(Vec3::ZERO, Vec3::ZERO))
    }

    fn push_vertex(&mut self, position: Vec3, normal: Vec3, uv: Vec2) {
        let helper = if normal.y.abs() > 0.9 { Vec3::X } else { Vec3::Y };
        let tangent = helper.cross(normal).normalize_or_zero();
        self.vertices.push(Vertex {
            position,
            normal,
            uv,
            tangent: Vec4::new(tangent.x, tangent.y, tangent.z, 1.0),
        });
    }

    /// Axis-aligned cube with edge length `size`, centered at the origin
    pub fn cube(size: f32) -> Self {
        let mut mesh = Mesh::new("cube");
        let h = size * 0.5;
        let faces = [
            (Vec3::Z, Vec3::X, Vec3::Y),
            (-Vec3::Z, -Vec3::X, Vec3::Y),
            (Vec3::X, -Vec3::Z, Vec3::Y),
            (-Vec3::X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::X, -Vec3::Z),
            (-Vec3::Y, Vec3::X, Vec3::Z),
        ];

        for (normal, right, up) in faces {
            let base = mesh.vertices.len() as u32;
            let center = normal * h;
            for (u, v) in [(0.0, 1.0), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)] {
                let position = center + right * (u * 2.0 - 1.0) * h + up * (1.0 - v * 2.0) * h;
                mesh.push_vertex(position, normal, Vec2::new(u, v));
            }
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        mesh
    }

    /// UV sphere of unit radius
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let mut mesh = Mesh::new("sphere");
        let segments = segments.max(3);
        let rings = rings.max(2);

        for ring in 0..=rings {
            let phi = ring as f32 * PI / rings as f32;
            for segment in 0..=segments {
                let theta = segment as f32 * 2.0 * PI / segments as f32;
                let normal = Vec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
                let uv = Vec2::new(segment as f32 / segments as f32, ring as f32 / rings as f32);
                mesh.push_vertex(normal, normal, uv);
            }
        }

        let stride = segments + 1;
        for ring in 0..rings {
            for segment in 0..segments {
                let a = ring * stride + segment;
                let b = a + stride;
                mesh.indices.extend_from_slice(&[a, a + 1, b, a + 1, b + 1, b]);
            }
        }
        mesh
    }

    /// Flat ground plane facing +Y
    pub fn plane(width: f32, depth: f32) -> Self {
        let mut mesh = Mesh::new("plane");
        let (hw, hd) = (width * 0.5, depth * 0.5);
        for (x, z, u, v) in [(-hw, hd, 0.0, 1.0), (hw, hd, 1.0, 1.0), (hw, -hd, 1.0, 0.0), (-hw, -hd, 0.0, 0.0)] {
            mesh.push_vertex(Vec3::new(x, 0.0, z), Vec3::Y, Vec2::new(u, v));
        }
        mesh.indices.extend_from_slice(&[0, 1, 2, 0, 2, 3]);
        mesh
    }
}

/// Vertex and index buffers of an uploaded mesh
#[derive(Debug, Clone, Copy)]
pub struct GpuMesh {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
}

impl GpuMesh {
    pub fn upload(backend: &mut dyn GraphicsBackend, mesh: &Mesh) -> BackendResult<Self> {
        let vertex_buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} Vertices", mesh.name)),
                size: mesh.vertex_bytes().len() as u64,
                usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
                mapped_at_creation: false,
            },
            mesh.vertex_bytes(),
        )?;
        let index_buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} Indices", mesh.name)),
                size: mesh.index_bytes().len() as u64,
                usage: BufferUsage::INDEX | BufferUsage::COPY_DST,
                mapped_at_creation: false,
            },
            mesh.index_bytes(),
        )?;
        log::debug!(
            "Uploaded mesh '{}' ({} vertices, {} triangles)",
            mesh.name,
            mesh.vertices.len(),
            mesh.triangle_count()
        );
        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: mesh.indices.len() as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_shape() {
        let cube = Mesh::cube(2.0);
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.triangle_count(), 12);
        let bounds = cube.bounds();
        assert!((bounds.min - Vec3::splat(-1.0)).length() < 1e-5);
        assert!((bounds.max - Vec3::splat(1.0)).length() < 1e-5);
    }

    #[test]
    fn test_sphere_indices_in_range() {
        let sphere = Mesh::sphere(8, 4);
        let count = sphere.vertices.len() as u32;
        assert!(sphere.indices.iter().all(|&i| i < count));
        assert_eq!(sphere.triangle_count(), 8 * 4 * 2);
    }

    #[test]
    fn test_empty_mesh_bounds() {
        let mesh = Mesh::new("empty");
        assert_eq!(mesh.bounds().extent(), Vec3::ZERO);
    }
}
