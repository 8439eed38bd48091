//! Renderable objects and the models they instance

use super::{Aabb, Transform};
use crate::backend::traits::{BackendResult, GraphicsBackend};
use crate::resources::{GpuMesh, Material, Mesh};
use bevy_ecs::prelude::*;

/// Index of a model registered with the scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub(crate) u32);

impl ModelId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Mesh plus material, shared by every object that instances it
#[derive(Debug)]
pub struct Model {
    pub mesh: Mesh,
    pub material: Material,
    bounds: Aabb,
    gpu: Option<GpuMesh>,
}

impl Model {
    pub fn new(mesh: Mesh, material: Material) -> Self {
        let bounds = mesh.bounds();
        Self {
            mesh,
            material,
            bounds,
            gpu: None,
        }
    }

    /// Object-space bounds of the mesh
    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    /// Buffers of the mesh, available once the scene has been prepared
    pub fn gpu(&self) -> Option<&GpuMesh> {
        self.gpu.as_ref()
    }

    pub(crate) fn upload(&mut self, backend: &mut dyn GraphicsBackend) -> BackendResult<()> {
        if self.gpu.is_none() && !self.mesh.indices.is_empty() {
            self.gpu = Some(GpuMesh::upload(backend, &self.mesh)?);
        }
        Ok(())
    }
}

/// Instance of a model placed in the world
#[derive(Component, Debug, Clone, PartialEq)]
pub struct SceneObject {
    pub model: ModelId,
    pub transform: Transform,
}

impl SceneObject {
    pub fn new(model: ModelId, transform: Transform) -> Self {
        Self { model, transform }
    }

    /// World-space bounds given the model's object-space box
    pub fn world_bounds(&self, model_bounds: &Aabb) -> Aabb {
        model_bounds.transformed(&self.transform.matrix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_world_bounds_follow_transform() {
        let model = Model::new(Mesh::cube(2.0), Material::default());
        let object = SceneObject::new(
            ModelId(0),
            Transform::from_position(Vec3::new(10.0, 0.0, 0.0)).with_scale(Vec3::splat(3.0)),
        );
        let bounds = object.world_bounds(&model.bounds());
        assert!((bounds.min - Vec3::new(7.0, -3.0, -3.0)).length() < 1e-4);
        assert!((bounds.max - Vec3::new(13.0, 3.0, 3.0)).length() < 1e-4);
    }

    #[test]
    fn test_upload_is_lazy_and_once() {
        let mut backend = crate::backend::RecordingBackend::new(4, 4);
        let mut model = Model::new(Mesh::cube(1.0), Material::default());
        assert!(model.gpu().is_none());
        model.upload(&mut backend).unwrap();
        let first = *model.gpu().unwrap();
        model.upload(&mut backend).unwrap();
        assert_eq!(model.gpu().unwrap().vertex_buffer, first.vertex_buffer);
        assert_eq!(first.index_count, 36);
    }
}
