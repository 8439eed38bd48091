//! Scene graph
//!
//! Objects, lights and particle emitters live as components in a Bevy ECS
//! [`World`]. A bounding-volume tree over their world boxes is rebuilt lazily
//! after edits and answers the frustum queries passes use to gather work.

mod aabb;
mod camera;
mod emitter;
mod frustum;
mod light;
mod object;
mod random;
mod transform;
mod tree;

pub use aabb::Aabb;
pub use camera::{Camera, FAR_PLANE, NEAR_PLANE};
pub use emitter::{EmitterSimulation, EmitterType, Particle, ParticleEmitter, MAX_PARTICLES_PER_EMITTER};
pub use frustum::{Containment, Frustum, FrustumPlane};
pub use light::{LightType, SceneLight};
pub use object::{Model, ModelId, SceneObject};
pub use random::XorShift32;
pub use transform::Transform;

use crate::backend::traits::{BackendResult, GraphicsBackend};
use crate::resources::{Material, Mesh};
use bevy_ecs::prelude::*;
use tree::{ItemKind, SceneTree, TreeItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) Entity);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LightId(pub(crate) Entity);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EmitterId(pub(crate) Entity);

impl EmitterId {
    /// Stable per-emitter seed for particle spawning
    pub(crate) fn seed(&self) -> u32 {
        self.0.index().wrapping_mul(0x9E37_79B1) ^ 0x5bd1_e995
    }
}

/// Receives the items found by [`Scene::visit`]
///
/// Each pass implements the callbacks for the kinds it cares about.
pub trait SceneVisitor {
    fn object(&mut self, _id: ObjectId, _object: &SceneObject, _model: &Model) {}

    fn light(&mut self, _id: LightId, _light: &mut SceneLight) {}

    fn emitter(&mut self, _id: EmitterId, _emitter: &ParticleEmitter) {}
}

/// Scene content: models, objects, lights and emitters
pub struct Scene {
    world: World,
    models: Vec<Model>,
    tree: Option<SceneTree>,
    geometry_revision: u64,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    pub fn new() -> Self {
        Self {
            world: World::new(),
            models: Vec::new(),
            tree: None,
            geometry_revision: 0,
        }
    }

    /// Register a mesh and material pair that objects can instance
    pub fn add_model(&mut self, mesh: Mesh, material: Material) -> ModelId {
        let id = ModelId(self.models.len() as u32);
        self.models.push(Model::new(mesh, material));
        id
    }

    pub fn model(&self, id: ModelId) -> Option<&Model> {
        self.models.get(id.index())
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    /// Upload meshes that are not on the GPU yet
    pub fn prepare(&mut self, backend: &mut dyn GraphicsBackend) -> BackendResult<()> {
        for model in &mut self.models {
            model.upload(backend)?;
        }
        Ok(())
    }

    /// Bumped whenever shadow casting geometry changes
    pub fn geometry_revision(&self) -> u64 {
        self.geometry_revision
    }

    fn geometry_changed(&mut self) {
        self.geometry_revision += 1;
        self.tree = None;
    }

    // Objects

    pub fn add_object(&mut self, object: SceneObject) -> ObjectId {
        let entity = self.world.spawn(object).id();
        self.geometry_changed();
        ObjectId(entity)
    }

    pub fn object(&self, id: ObjectId) -> Option<&SceneObject> {
        self.world.get::<SceneObject>(id.0)
    }

    /// Edit an object in place; returns false if it no longer exists
    pub fn update_object(&mut self, id: ObjectId, f: impl FnOnce(&mut SceneObject)) -> bool {
        let Some(mut object) = self.world.get_mut::<SceneObject>(id.0) else {
            return false;
        };
        f(&mut *object);
        self.geometry_changed();
        true
    }

    pub fn remove_object(&mut self, id: ObjectId) -> bool {
        if self.world.get::<SceneObject>(id.0).is_none() {
            return false;
        }
        self.world.despawn(id.0);
        self.geometry_changed();
        true
    }

    pub fn object_count(&self) -> usize {
        self.count::<SceneObject>()
    }

    // Lights

    pub fn add_light(&mut self, mut light: SceneLight) -> LightId {
        light.shadow = None;
        light.revision = 1;
        let entity = self.world.spawn(light).id();
        self.tree = None;
        LightId(entity)
    }

    pub fn light(&self, id: LightId) -> Option<&SceneLight> {
        self.world.get::<SceneLight>(id.0)
    }

    /// Edit a light in place; a held shadow map is redrawn on next use
    pub fn update_light(&mut self, id: LightId, f: impl FnOnce(&mut SceneLight)) -> bool {
        let Some(mut light) = self.world.get_mut::<SceneLight>(id.0) else {
            return false;
        };
        f(&mut *light);
        light.revision += 1;
        if !light.wants_shadow() {
            light.shadow = None;
        }
        self.tree = None;
        true
    }

    /// Remove a light, returning its shadow slot to the cache immediately
    pub fn remove_light(&mut self, id: LightId) -> bool {
        if self.world.get::<SceneLight>(id.0).is_none() {
            return false;
        }
        self.world.despawn(id.0);
        self.tree = None;
        true
    }

    pub fn light_count(&self) -> usize {
        self.count::<SceneLight>()
    }

    // Emitters

    pub fn add_emitter(&mut self, emitter: ParticleEmitter) -> EmitterId {
        let entity = self.world.spawn(emitter).id();
        self.tree = None;
        EmitterId(entity)
    }

    pub fn emitter(&self, id: EmitterId) -> Option<&ParticleEmitter> {
        self.world.get::<ParticleEmitter>(id.0)
    }

    pub fn update_emitter(&mut self, id: EmitterId, f: impl FnOnce(&mut ParticleEmitter)) -> bool {
        let Some(mut emitter) = self.world.get_mut::<ParticleEmitter>(id.0) else {
            return false;
        };
        f(&mut *emitter);
        self.tree = None;
        true
    }

    pub fn remove_emitter(&mut self, id: EmitterId) -> bool {
        if self.world.get::<ParticleEmitter>(id.0).is_none() {
            return false;
        }
        self.world.despawn(id.0);
        self.tree = None;
        true
    }

    pub fn emitter_count(&self) -> usize {
        self.count::<ParticleEmitter>()
    }

    fn count<C: Component>(&self) -> usize {
        self.world
            .iter_entities()
            .filter(|entity| entity.contains::<C>())
            .count()
    }

    fn rebuild_tree(&mut self) -> SceneTree {
        let mut items = Vec::new();

        let mut objects = self.world.query::<(Entity, &SceneObject)>();
        for (entity, object) in objects.iter(&self.world) {
            let Some(model) = self.models.get(object.model.index()) else {
                continue;
            };
            items.push(TreeItem {
                entity,
                kind: ItemKind::Object,
                aabb: object.world_bounds(&model.bounds()),
            });
        }

        let mut lights = self.world.query::<(Entity, &SceneLight)>();
        for (entity, light) in lights.iter(&self.world) {
            items.push(TreeItem {
                entity,
                kind: ItemKind::Light,
                aabb: light.bounding_box(),
            });
        }

        let mut emitters = self.world.query::<(Entity, &ParticleEmitter)>();
        for (entity, emitter) in emitters.iter(&self.world) {
            items.push(TreeItem {
                entity,
                kind: ItemKind::Emitter,
                aabb: emitter.bounding_box(),
            });
        }

        log::debug!("Rebuilt scene tree with {} items", items.len());
        SceneTree::build(items)
    }

    /// Call `visitor` for every object, light and emitter whose bounds touch
    /// `frustum`. Returns the number of items visited.
    pub fn visit(&mut self, frustum: &Frustum, visitor: &mut dyn SceneVisitor) -> usize {
        let tree = match self.tree.take() {
            Some(tree) => tree,
            None => self.rebuild_tree(),
        };
        let mut found = Vec::new();
        tree.query(frustum, |item| found.push(*item));
        self.tree = Some(tree);

        for item in &found {
            match item.kind {
                ItemKind::Object => {
                    if let Some(object) = self.world.get::<SceneObject>(item.entity) {
                        if let Some(model) = self.models.get(object.model.index()) {
                            visitor.object(ObjectId(item.entity), object, model);
                        }
                    }
                }
                ItemKind::Light => {
                    if let Some(mut light) = self.world.get_mut::<SceneLight>(item.entity) {
                        visitor.light(LightId(item.entity), &mut *light);
                    }
                }
                ItemKind::Emitter => {
                    if let Some(emitter) = self.world.get::<ParticleEmitter>(item.entity) {
                        visitor.emitter(EmitterId(item.entity), emitter);
                    }
                }
            }
        }
        found.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow::ShadowSlotCache;
    use glam::{Mat4, Quat, Vec3};

    #[derive(Default)]
    struct Collect {
        objects: Vec<ObjectId>,
        lights: Vec<LightId>,
        emitters: Vec<EmitterId>,
    }

    impl SceneVisitor for Collect {
        fn object(&mut self, id: ObjectId, _object: &SceneObject, _model: &Model) {
            self.objects.push(id);
        }

        fn light(&mut self, id: LightId, _light: &mut SceneLight) {
            self.lights.push(id);
        }

        fn emitter(&mut self, id: EmitterId, _emitter: &ParticleEmitter) {
            self.emitters.push(id);
        }
    }

    fn view_frustum() -> Frustum {
        // Camera at the origin looking down -Z
        let projection = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 50.0);
        Frustum::from_matrix(&projection)
    }

    #[test]
    fn test_visit_reports_only_items_in_view() {
        let mut scene = Scene::new();
        let cube = scene.add_model(Mesh::cube(1.0), Material::default());
        let ahead = scene.add_object(SceneObject::new(
            cube,
            Transform::from_position(Vec3::new(0.0, 0.0, -10.0)),
        ));
        scene.add_object(SceneObject::new(
            cube,
            Transform::from_position(Vec3::new(0.0, 0.0, 10.0)),
        ));
        let light = scene.add_light(SceneLight::omni(Vec3::new(0.0, 0.0, -5.0), Vec3::ONE, 2.0));
        scene.add_light(SceneLight::omni(Vec3::new(0.0, 0.0, 40.0), Vec3::ONE, 2.0));
        let emitter = scene.add_emitter(ParticleEmitter::new(Vec3::new(1.0, 0.0, -20.0)));

        let mut collect = Collect::default();
        let visited = scene.visit(&view_frustum(), &mut collect);

        assert_eq!(collect.objects, vec![ahead]);
        assert_eq!(collect.lights, vec![light]);
        assert_eq!(collect.emitters, vec![emitter]);
        assert_eq!(visited, 3);
    }

    #[test]
    fn test_moved_object_is_found_after_update() {
        let mut scene = Scene::new();
        let cube = scene.add_model(Mesh::cube(1.0), Material::default());
        let id = scene.add_object(SceneObject::new(
            cube,
            Transform::from_position(Vec3::new(0.0, 0.0, 10.0)),
        ));

        let mut collect = Collect::default();
        scene.visit(&view_frustum(), &mut collect);
        assert!(collect.objects.is_empty());

        let before = scene.geometry_revision();
        assert!(scene.update_object(id, |o| o.transform.position.z = -10.0));
        assert!(scene.geometry_revision() > before);

        let mut collect = Collect::default();
        scene.visit(&view_frustum(), &mut collect);
        assert_eq!(collect.objects, vec![id]);
    }

    #[test]
    fn test_update_light_bumps_revision() {
        let mut scene = Scene::new();
        let id = scene.add_light(SceneLight::default());
        let before = scene.light(id).unwrap().revision();
        scene.update_light(id, |l| l.color = Vec3::X);
        assert_eq!(scene.light(id).unwrap().revision(), before + 1);
        assert_eq!(scene.light(id).unwrap().color, Vec3::X);
    }

    #[test]
    fn test_remove_light_releases_shadow_slot() {
        let mut cache = ShadowSlotCache::new(1);
        let mut scene = Scene::new();
        let id = scene.add_light(
            SceneLight::spot(Vec3::ZERO, Quat::IDENTITY, Vec3::ONE, 10.0).with_shadow(true),
        );
        scene.update_light(id, |light| {
            let entry = cache.create_entry();
            entry.use_in_frame();
            light.shadow = Some(entry);
        });
        cache.assign_indexes();
        assert_eq!(scene.light(id).unwrap().shadow_index(), 0);
        assert_eq!(cache.free_count(), 0);

        assert!(scene.remove_light(id));
        assert_eq!(cache.free_count(), 1);
        assert_eq!(scene.light_count(), 0);
        assert!(!scene.remove_light(id));
    }

    #[test]
    fn test_counts() {
        let mut scene = Scene::new();
        let cube = scene.add_model(Mesh::cube(1.0), Material::default());
        scene.add_object(SceneObject::new(cube, Transform::default()));
        scene.add_light(SceneLight::default());
        scene.add_emitter(ParticleEmitter::default());
        scene.add_emitter(ParticleEmitter::default());
        assert_eq!(scene.object_count(), 1);
        assert_eq!(scene.light_count(), 1);
        assert_eq!(scene.emitter_count(), 2);
        assert_eq!(scene.model_count(), 1);
    }
}
