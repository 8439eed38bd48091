//! Instanced mesh drawing shared by the geometry passes

use super::FrameStats;
use crate::backend::traits::{BackendResult, BufferHandle, GraphicsBackend, IndexFormat};
use crate::backend::types::{
    BufferDescriptor, BufferUsage, VertexAttribute, VertexBufferLayout, VertexFormat,
    VertexStepMode,
};
use crate::resources::GpuMesh;
use crate::scene::{Model, ModelId, SceneObject};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use std::collections::BTreeMap;
use std::ops::Range;

/// Per-instance vertex data: placement plus material
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ObjectInstance {
    pub object_to_world: Mat4,
    /// rgb diffuse, a opacity
    pub diffuse: Vec4,
    /// rgb specular, a specular level
    pub specular: Vec4,
    /// rgb self illumination, a glossiness
    pub self_illumination: Vec4,
}

impl ObjectInstance {
    pub fn new(object: &SceneObject, model: &Model) -> Self {
        let material = model.material.uniform_data();
        Self {
            object_to_world: object.transform.matrix(),
            diffuse: material.diffuse,
            specular: material.specular,
            self_illumination: material.self_illumination,
        }
    }

    /// Instance attributes at shader locations 4 to 10
    pub fn layout() -> VertexBufferLayout {
        VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as u64,
            step_mode: VertexStepMode::Instance,
            attributes: (0..7)
                .map(|i| VertexAttribute {
                    location: 4 + i,
                    format: VertexFormat::Float32x4,
                    offset: i as u64 * 16,
                })
                .collect(),
        }
    }
}

/// WGSL input for [`ObjectInstance`]
pub const INSTANCE_WGSL: &str = r#"
struct Instance {
    @location(4) m0: vec4<f32>,
    @location(5) m1: vec4<f32>,
    @location(6) m2: vec4<f32>,
    @location(7) m3: vec4<f32>,
    @location(8) diffuse: vec4<f32>,
    @location(9) specular: vec4<f32>,
    @location(10) self_illumination: vec4<f32>,
}

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) tangent: vec4<f32>,
}
"#;

/// Vertex buffer that grows to fit what is uploaded into it
#[derive(Debug)]
pub struct DynamicBuffer {
    label: &'static str,
    usage: BufferUsage,
    buffer: Option<BufferHandle>,
    capacity: u64,
}

impl DynamicBuffer {
    pub fn new(label: &'static str, usage: BufferUsage) -> Self {
        Self {
            label,
            usage: usage | BufferUsage::COPY_DST,
            buffer: None,
            capacity: 0,
        }
    }

    pub fn vertex(label: &'static str) -> Self {
        Self::new(label, BufferUsage::VERTEX)
    }

    pub fn buffer(&self) -> Option<BufferHandle> {
        self.buffer
    }

    /// Write `data` at offset zero, reallocating when it does not fit
    pub fn upload(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        data: &[u8],
    ) -> BackendResult<Option<BufferHandle>> {
        if data.is_empty() {
            return Ok(self.buffer);
        }
        let size = data.len() as u64;
        let buffer = match self.buffer {
            Some(buffer) if self.capacity >= size => buffer,
            old => {
                if let Some(old) = old {
                    backend.destroy_buffer(old);
                }
                let capacity = size.next_power_of_two().max(256);
                let buffer = backend.create_buffer(&BufferDescriptor {
                    label: Some(self.label.to_string()),
                    size: capacity,
                    usage: self.usage,
                    mapped_at_creation: false,
                })?;
                log::debug!("Grew '{}' to {} bytes", self.label, capacity);
                self.buffer = Some(buffer);
                self.capacity = capacity;
                buffer
            }
        };
        backend.write_buffer(buffer, 0, data);
        Ok(Some(buffer))
    }
}

/// One instanced draw of a mesh
#[derive(Debug, Clone)]
pub struct DrawBatch {
    pub mesh: GpuMesh,
    pub instances: Range<u32>,
}

/// Groups visible objects by model so each model is drawn once
#[derive(Debug, Default)]
pub struct BatchBuilder {
    groups: BTreeMap<ModelId, (GpuMesh, Vec<ObjectInstance>)>,
}

impl BatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, object: &SceneObject, model: &Model) {
        let Some(mesh) = model.gpu() else {
            return;
        };
        self.groups
            .entry(object.model)
            .or_insert_with(|| (*mesh, Vec::new()))
            .1
            .push(ObjectInstance::new(object, model));
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Append this builder's instances to `instances` and return the draws
    pub fn finish(self, instances: &mut Vec<ObjectInstance>) -> Vec<DrawBatch> {
        self.groups
            .into_values()
            .map(|(mesh, group)| {
                let start = instances.len() as u32;
                instances.extend(group);
                DrawBatch {
                    mesh,
                    instances: start..instances.len() as u32,
                }
            })
            .collect()
    }
}

/// Record the draws; the instance buffer is bound at vertex slot 1
pub fn draw_batches(
    backend: &mut dyn GraphicsBackend,
    batches: &[DrawBatch],
    instance_buffer: BufferHandle,
    stats: &mut FrameStats,
) {
    for batch in batches {
        backend.set_vertex_buffer(0, batch.mesh.vertex_buffer, 0);
        backend.set_vertex_buffer(1, instance_buffer, 0);
        backend.set_index_buffer(batch.mesh.index_buffer, 0, IndexFormat::Uint32);
        backend.draw_indexed(0..batch.mesh.index_count, 0, batch.instances.clone());
        stats.record_draw(batch.mesh.index_count, batch.instances.len() as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;
    use crate::resources::{Material, Mesh};
    use crate::scene::{Scene, Transform};

    #[test]
    fn test_instance_layout_matches_struct() {
        let layout = ObjectInstance::layout();
        assert_eq!(layout.array_stride, 112);
        assert_eq!(layout.attributes.len(), 7);
        assert_eq!(layout.attributes[6].location, 10);
    }

    #[test]
    fn test_batches_group_by_model() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut scene = Scene::new();
        let cube = scene.add_model(Mesh::cube(1.0), Material::default());
        let plane = scene.add_model(Mesh::plane(1.0, 1.0), Material::default());
        scene.prepare(&mut backend).unwrap();

        let mut builder = BatchBuilder::new();
        for (model, count) in [(cube, 3), (plane, 2)] {
            for _ in 0..count {
                let object = SceneObject::new(model, Transform::default());
                builder.push(&object, scene.model(model).unwrap());
            }
        }

        let mut instances = Vec::new();
        let batches = builder.finish(&mut instances);
        assert_eq!(instances.len(), 5);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].instances, 0..3);
        assert_eq!(batches[1].instances, 3..5);
    }

    #[test]
    fn test_dynamic_buffer_grows_only_when_needed() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut buffer = DynamicBuffer::vertex("Instances");
        let first = buffer.upload(&mut backend, &[0u8; 100]).unwrap().unwrap();
        let second = buffer.upload(&mut backend, &[1u8; 200]).unwrap().unwrap();
        assert_eq!(first, second);
        let third = buffer.upload(&mut backend, &[2u8; 300]).unwrap().unwrap();
        assert_ne!(first, third);
        assert_eq!(backend.buffer_contents(third).unwrap()[..300], [2u8; 300]);
    }
}
