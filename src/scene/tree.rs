//! Bounding volume hierarchy over scene items

use super::{Aabb, Containment, Frustum};
use bevy_ecs::entity::Entity;

const LEAF_SIZE: usize = 4;

/// What kind of component an item refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Object,
    Light,
    Emitter,
}

#[derive(Debug, Clone, Copy)]
pub struct TreeItem {
    pub entity: Entity,
    pub kind: ItemKind,
    pub aabb: Aabb,
}

#[derive(Debug)]
enum NodeKind {
    Leaf { start: usize, count: usize },
    Inner { left: usize, right: usize },
}

#[derive(Debug)]
struct Node {
    aabb: Aabb,
    kind: NodeKind,
}

/// Median-split AABB tree, rebuilt from scratch when the scene changes
#[derive(Debug, Default)]
pub struct SceneTree {
    nodes: Vec<Node>,
    items: Vec<TreeItem>,
}

impl SceneTree {
    pub fn build(mut items: Vec<TreeItem>) -> Self {
        let mut nodes = Vec::new();
        if !items.is_empty() {
            let len = items.len();
            Self::build_node(&mut nodes, &mut items, 0, len);
        }
        Self { nodes, items }
    }

    fn build_node(nodes: &mut Vec<Node>, items: &mut [TreeItem], start: usize, end: usize) -> usize {
        let slice = &mut items[start..end];
        let aabb = slice
            .iter()
            .skip(1)
            .fold(slice[0].aabb, |acc, item| acc.union(&item.aabb));

        let index = nodes.len();
        nodes.push(Node {
            aabb,
            kind: NodeKind::Leaf {
                start,
                count: end - start,
            },
        });

        if end - start <= LEAF_SIZE {
            return index;
        }

        // Split on the longest axis of the centroid spread
        let centroids = slice.iter().map(|i| i.aabb.center()).collect::<Vec<_>>();
        let spread = Aabb::from_points(&centroids).map_or(glam::Vec3::ZERO, |b| b.extent());
        let axis = if spread.x >= spread.y && spread.x >= spread.z {
            0
        } else if spread.y >= spread.z {
            1
        } else {
            2
        };
        slice.sort_by(|a, b| a.aabb.center()[axis].total_cmp(&b.aabb.center()[axis]));

        let mid = start + (end - start) / 2;
        let left = Self::build_node(nodes, items, start, mid);
        let right = Self::build_node(nodes, items, mid, end);
        nodes[index].kind = NodeKind::Inner { left, right };
        index
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Call `f` for every item whose box touches the frustum
    pub fn query(&self, frustum: &Frustum, mut f: impl FnMut(&TreeItem)) {
        if self.nodes.is_empty() {
            return;
        }
        let mut stack = vec![(0usize, false)];
        while let Some((index, inside)) = stack.pop() {
            let node = &self.nodes[index];
            let inside = inside || {
                match frustum.classify(&node.aabb) {
                    Containment::Outside => continue,
                    Containment::Inside => true,
                    Containment::Intersecting => false,
                }
            };
            match node.kind {
                NodeKind::Leaf { start, count } => {
                    for item in &self.items[start..start + count] {
                        if inside || frustum.intersects_aabb(&item.aabb) {
                            f(item);
                        }
                    }
                }
                NodeKind::Inner { left, right } => {
                    stack.push((right, inside));
                    stack.push((left, inside));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat4, Vec3};

    fn items(world: &mut bevy_ecs::world::World, centers: &[Vec3]) -> Vec<TreeItem> {
        centers
            .iter()
            .map(|c| TreeItem {
                entity: world.spawn_empty().id(),
                kind: ItemKind::Object,
                aabb: Aabb::from_center(*c, Vec3::splat(0.5)),
            })
            .collect()
    }

    #[test]
    fn test_query_matches_brute_force() {
        let mut world = bevy_ecs::world::World::new();
        let centers: Vec<Vec3> = (0..50)
            .map(|i| {
                let f = i as f32;
                Vec3::new((f * 7.3) % 40.0 - 20.0, (f * 3.1) % 10.0 - 5.0, -(f * 1.7) % 60.0)
            })
            .collect();
        let all = items(&mut world, &centers);
        let tree = SceneTree::build(all.clone());
        assert_eq!(tree.len(), 50);

        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.5, 0.1, 30.0);
        let frustum = Frustum::from_matrix(&proj);

        let mut found = Vec::new();
        tree.query(&frustum, |item| found.push(item.entity));
        let mut expected: Vec<Entity> = all
            .iter()
            .filter(|i| frustum.intersects_aabb(&i.aabb))
            .map(|i| i.entity)
            .collect();
        found.sort();
        expected.sort();
        assert_eq!(found, expected);
        assert!(!found.is_empty());
    }

    #[test]
    fn test_empty_tree() {
        let tree = SceneTree::build(Vec::new());
        let frustum = Frustum::from_matrix(&Mat4::IDENTITY);
        let mut count = 0;
        tree.query(&frustum, |_| count += 1);
        assert_eq!(count, 0);
        assert!(tree.is_empty());
    }
}
