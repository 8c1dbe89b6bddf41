//! Interest management: per-entity sync priorities from the observer
//! relation.

use std::collections::HashMap;

use glam::{Quat, Vec3};

use crate::{scene::Scene, sync_state::EntitySyncState, types::EntityId};

/// Assigns each entity's sync state a priority scalar. Higher priority means
/// a shorter update interval; the core sorts each connection's dirty queue
/// by the result and stretches per-entity send intervals accordingly.
pub trait EntityPrioritizer {
    fn compute_sync_priorities(
        &mut self,
        entities: &mut HashMap<EntityId, EntitySyncState>,
        observer_pos: Vec3,
        observer_rot: Quat,
        scene: &Scene,
    );
}

/// Ranks entities by distance to the observer. Entities without a world
/// position keep maximum priority so they are never starved.
#[derive(Debug, Default)]
pub struct DefaultEntityPrioritizer;

impl EntityPrioritizer for DefaultEntityPrioritizer {
    fn compute_sync_priorities(
        &mut self,
        entities: &mut HashMap<EntityId, EntitySyncState>,
        observer_pos: Vec3,
        _observer_rot: Quat,
        scene: &Scene,
    ) {
        for (id, state) in entities.iter_mut() {
            match scene.world_transform(*id) {
                Some(transform) => {
                    let dist_sq = transform.pos.distance_squared(observer_pos);
                    state.priority = 100.0 / (1.0 + dist_sq);
                }
                None => state.priority = 100.0,
            }
            state.relevancy = 1.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        math::Transform,
        scene::{AttributeValue, PLACEABLE_TYPE_ID},
        types::{ChangeKind, HostType},
    };

    fn scene_with_entity_at(pos: Vec3) -> (Scene, EntityId) {
        let mut scene = Scene::new(HostType::Server);
        let id = scene.create_entity(0, ChangeKind::Replicate).unwrap();
        let comp = scene
            .create_component_with_id(id, 0, PLACEABLE_TYPE_ID, "", ChangeKind::Replicate)
            .unwrap();
        scene
            .set_attribute(
                id,
                comp,
                0,
                AttributeValue::Transform(Transform::from_pos(pos)),
                ChangeKind::Replicate,
            )
            .unwrap();
        (scene, id)
    }

    #[test]
    fn nearer_entities_rank_higher() {
        let (mut scene, near) = scene_with_entity_at(Vec3::new(1.0, 0.0, 0.0));
        let far = scene.create_entity(0, ChangeKind::Replicate).unwrap();
        let comp = scene
            .create_component_with_id(far, 0, PLACEABLE_TYPE_ID, "", ChangeKind::Replicate)
            .unwrap();
        scene
            .set_attribute(
                far,
                comp,
                0,
                AttributeValue::Transform(Transform::from_pos(Vec3::new(100.0, 0.0, 0.0))),
                ChangeKind::Replicate,
            )
            .unwrap();

        let mut entities = HashMap::new();
        for id in [near, far] {
            let mut state = crate::sync_state::SceneSyncState::default();
            state.mark_entity_dirty(id);
            entities.insert(id, state.entities.remove(&id).unwrap());
        }
        DefaultEntityPrioritizer.compute_sync_priorities(
            &mut entities,
            Vec3::ZERO,
            Quat::IDENTITY,
            &scene,
        );
        assert!(entities[&near].final_priority() > entities[&far].final_priority());
        // Near entity syncs at the base rate, far one is stretched.
        assert!(
            entities[&far].compute_prioritized_update_interval(0.05)
                > entities[&near].compute_prioritized_update_interval(0.05)
        );
    }

    #[test]
    fn entities_without_position_keep_max_priority() {
        let scene = Scene::new(HostType::Server);
        let mut entities = HashMap::new();
        let mut state = crate::sync_state::SceneSyncState::default();
        state.mark_entity_dirty(9);
        entities.insert(9, state.entities.remove(&9).unwrap());
        DefaultEntityPrioritizer.compute_sync_priorities(
            &mut entities,
            Vec3::new(1000.0, 0.0, 0.0),
            Quat::IDENTITY,
            &scene,
        );
        assert_eq!(entities[&9].priority, 100.0);
    }
}
