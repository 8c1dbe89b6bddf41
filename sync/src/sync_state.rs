//! Per-connection replication state: what the peer knows, what remains
//! dirty, and what is queued to go out.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

use glam::{Quat, Vec3};

use crate::{
    math::Transform,
    messages::EntityActionMsg,
    types::{AttributeIndex, ComponentId, EntityId, PacketId},
};

/// Maximum attribute slots per component (indices are u8).
const DIRTY_BITMAP_BYTES: usize = 32;

/// Snapshot of a rigid body's replicated motion variables. Angular velocity
/// is a ZYX Euler rate in degrees per second, matching the attribute layout.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RigidBodyState {
    pub pos: Vec3,
    pub rot: Quat,
    pub scale: Vec3,
    pub vel: Vec3,
    pub ang_vel: Vec3,
}

impl Default for RigidBodyState {
    fn default() -> Self {
        Self {
            pos: Vec3::ZERO,
            rot: Quat::IDENTITY,
            scale: Vec3::ONE,
            vel: Vec3::ZERO,
            ang_vel: Vec3::ZERO,
        }
    }
}

/// Receiver-side smoothing state for one entity's rigid-body channel. Kept
/// in the table after the interpolator goes inactive as a cache of the last
/// received motion state.
#[derive(Clone, Debug, Default)]
pub struct RigidBodyInterpolationState {
    pub interp_start: RigidBodyState,
    pub interp_end: RigidBodyState,
    /// Curve time in units of the sender's update period.
    pub interp_time: f32,
    pub interpolator_active: bool,
    pub last_received_packet_counter: PacketId,
    /// Set when the entity was handed off to local physics; local physics
    /// must not drive the entity while the interpolator is active.
    pub client_extrapolating: bool,
}

/// Dirty tracking for one component on one connection.
#[derive(Clone, Debug)]
pub struct ComponentSyncState {
    pub id: ComponentId,
    /// New states start dirty: the first transmission is a full create.
    pub is_new: bool,
    pub removed: bool,
    pub is_in_queue: bool,
    dirty_attributes: [u8; DIRTY_BITMAP_BYTES],
    /// Attribute index -> created (true) or removed (false), pending send.
    pub new_and_removed_attributes: BTreeMap<AttributeIndex, bool>,
}

impl ComponentSyncState {
    fn new(id: ComponentId) -> Self {
        Self {
            id,
            is_new: true,
            removed: false,
            is_in_queue: false,
            dirty_attributes: [0; DIRTY_BITMAP_BYTES],
            new_and_removed_attributes: BTreeMap::new(),
        }
    }

    pub fn mark_attribute_dirty(&mut self, index: AttributeIndex) {
        self.dirty_attributes[usize::from(index) >> 3] |= 1 << (index & 7);
    }

    pub fn clear_attribute_dirty(&mut self, index: AttributeIndex) {
        self.dirty_attributes[usize::from(index) >> 3] &= !(1 << (index & 7));
    }

    pub fn is_attribute_dirty(&self, index: AttributeIndex) -> bool {
        self.dirty_attributes[usize::from(index) >> 3] & (1 << (index & 7)) != 0
    }

    pub fn dirty_attribute_indices(&self) -> Vec<AttributeIndex> {
        let mut indices = Vec::new();
        for (byte_index, byte) in self.dirty_attributes.iter().enumerate() {
            if *byte == 0 {
                continue;
            }
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    indices.push((byte_index * 8 + bit) as AttributeIndex);
                }
            }
        }
        indices
    }

    pub fn has_dirty_attributes(&self) -> bool {
        self.dirty_attributes.iter().any(|b| *b != 0)
    }

    pub fn clear_all_dirty_attributes(&mut self) {
        self.dirty_attributes = [0; DIRTY_BITMAP_BYTES];
    }

    /// Everything pending has been transmitted or received.
    pub fn dirty_processed(&mut self) {
        self.clear_all_dirty_attributes();
        self.new_and_removed_attributes.clear();
        self.is_new = false;
    }
}

/// Dirty tracking for one entity on one connection.
#[derive(Clone, Debug)]
pub struct EntitySyncState {
    pub id: EntityId,
    pub is_new: bool,
    pub removed: bool,
    pub is_in_queue: bool,
    pub has_property_changes: bool,
    pub has_parent_change: bool,
    pub components: HashMap<ComponentId, ComponentSyncState>,
    /// Ordered queue of dirty component ids within this entity.
    dirty_components: VecDeque<ComponentId>,
    pub last_network_send_time: Option<Instant>,
    last_network_receive_time: Option<Instant>,
    /// Exponential average of the inter-receive wall time, seconds.
    pub avg_update_interval: f32,
    /// Last-sent motion state, for significance thresholds.
    pub transform: Transform,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    /// Interest-management priority; higher syncs more often.
    pub priority: f32,
    pub relevancy: f32,
}

impl EntitySyncState {
    fn new(id: EntityId) -> Self {
        Self {
            id,
            is_new: true,
            removed: false,
            is_in_queue: false,
            has_property_changes: false,
            has_parent_change: false,
            components: HashMap::new(),
            dirty_components: VecDeque::new(),
            last_network_send_time: None,
            last_network_receive_time: None,
            avg_update_interval: 0.0,
            transform: Transform::default(),
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            priority: 100.0,
            relevancy: 1.0,
        }
    }

    pub fn final_priority(&self) -> f32 {
        self.priority * self.relevancy
    }

    /// Update interval scaled by priority: a multiple of `update_period`
    /// that grows as priority falls, capped at 16x.
    pub fn compute_prioritized_update_interval(&self, update_period: f32) -> f32 {
        let priority = self.final_priority().max(1e-6);
        update_period * (10.0 / priority).clamp(1.0, 16.0)
    }

    pub fn seconds_since_last_send(&self) -> f32 {
        match self.last_network_send_time {
            Some(at) => at.elapsed().as_secs_f32(),
            None => f32::INFINITY,
        }
    }

    pub fn touch_send_time(&mut self) {
        self.last_network_send_time = Some(Instant::now());
    }

    /// Folds a newly observed inter-receive interval into the average, used
    /// to size metadata-driven attribute interpolation.
    pub fn refresh_avg_update_interval(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_network_receive_time {
            let measured = (now - last).as_secs_f32();
            self.avg_update_interval = if self.avg_update_interval == 0.0 {
                measured
            } else {
                0.5 * measured + 0.5 * self.avg_update_interval
            };
        }
        self.last_network_receive_time = Some(now);
    }

    pub fn component_state_mut(&mut self, id: ComponentId) -> &mut ComponentSyncState {
        self.components.entry(id).or_insert_with(|| ComponentSyncState::new(id))
    }

    pub fn queue_component(&mut self, id: ComponentId) {
        let state = self.components.entry(id).or_insert_with(|| ComponentSyncState::new(id));
        if !state.is_in_queue {
            state.is_in_queue = true;
            self.dirty_components.push_back(id);
        }
    }

    pub fn pop_dirty_component(&mut self) -> Option<ComponentId> {
        self.dirty_components.pop_front()
    }

    pub fn has_dirty_components(&self) -> bool {
        !self.dirty_components.is_empty()
    }

    pub fn remove_component_from_queue(&mut self, id: ComponentId) {
        self.dirty_components.retain(|c| *c != id);
        if let Some(state) = self.components.get_mut(&id) {
            state.is_in_queue = false;
        }
    }

    /// Clears every pending flag after a full transmission of the entity.
    pub fn dirty_processed(&mut self) {
        for component in self.components.values_mut() {
            component.dirty_processed();
            component.is_in_queue = false;
        }
        self.dirty_components.clear();
        self.is_new = false;
        self.has_property_changes = false;
        self.has_parent_change = false;
    }
}

/// Everything the core tracks for one connection: per-entity dirty state,
/// the transmission queue, observer pose, queued actions, pending id
/// reconciliation, and receiver-side rigid-body smoothing.
#[derive(Default)]
pub struct SceneSyncState {
    pub entities: HashMap<EntityId, EntitySyncState>,
    dirty_queue: VecDeque<EntityId>,
    pub observer_pos: Vec3,
    pub observer_rot: Quat,
    /// Client side: pose included in the last observer-position message.
    pub last_sent_observer: Option<(Vec3, Quat)>,
    pub queued_actions: VecDeque<EntityActionMsg>,
    /// Server side: optimistic client id -> the id actually assigned.
    pub unacked_to_real_ids: HashMap<EntityId, EntityId>,
    placeholder_components_sent: bool,
    pub interpolations: HashMap<EntityId, RigidBodyInterpolationState>,
}

impl SceneSyncState {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn entity_state_mut(&mut self, id: EntityId) -> &mut EntitySyncState {
        self.entities.entry(id).or_insert_with(|| EntitySyncState::new(id))
    }

    fn queue_entity(&mut self, id: EntityId) {
        let state = self.entities.entry(id).or_insert_with(|| EntitySyncState::new(id));
        if !state.is_in_queue {
            state.is_in_queue = true;
            self.dirty_queue.push_back(id);
        }
    }

    pub fn mark_entity_dirty(&mut self, id: EntityId) {
        self.mark_entity_dirty_with(id, false, false);
    }

    pub fn mark_entity_dirty_with(&mut self, id: EntityId, properties: bool, parent: bool) {
        let state = self.entity_state_mut(id);
        if properties {
            state.has_property_changes = true;
        }
        if parent {
            state.has_parent_change = true;
        }
        self.queue_entity(id);
    }

    pub fn mark_entity_removed(&mut self, id: EntityId) {
        // The peer never had the entity; nothing to tell it.
        if !self.entities.contains_key(&id) {
            return;
        }
        // An entity removed while still marked new stays queued with both
        // flags; the sync pass resolves the conflict at dequeue time.
        self.entity_state_mut(id).removed = true;
        self.queue_entity(id);
    }

    pub fn mark_component_dirty(&mut self, entity: EntityId, component: ComponentId) {
        self.queue_entity(entity);
        let entity_state = self.entity_state_mut(entity);
        entity_state.queue_component(component);
    }

    /// Unlike entities, a component created and deleted between two syncs is
    /// dropped here rather than at dequeue time: the per-component pass has
    /// no conflict recovery, and the peer has nothing to roll back.
    pub fn mark_component_removed(&mut self, entity: EntityId, component: ComponentId) {
        let Some(entity_state) = self.entities.get_mut(&entity) else { return };
        let Some(component_state) = entity_state.components.get(&component) else { return };
        if component_state.is_new {
            entity_state.remove_component_from_queue(component);
            entity_state.components.remove(&component);
            return;
        }
        entity_state.component_state_mut(component).removed = true;
        self.mark_component_dirty(entity, component);
    }

    pub fn mark_attribute_dirty(
        &mut self,
        entity: EntityId,
        component: ComponentId,
        index: AttributeIndex,
    ) {
        self.mark_component_dirty(entity, component);
        self.entity_state_mut(entity)
            .component_state_mut(component)
            .mark_attribute_dirty(index);
    }

    pub fn mark_attribute_created(
        &mut self,
        entity: EntityId,
        component: ComponentId,
        index: AttributeIndex,
    ) {
        self.mark_component_dirty(entity, component);
        self.entity_state_mut(entity)
            .component_state_mut(component)
            .new_and_removed_attributes
            .insert(index, true);
    }

    pub fn mark_attribute_removed(
        &mut self,
        entity: EntityId,
        component: ComponentId,
        index: AttributeIndex,
    ) {
        self.mark_component_dirty(entity, component);
        self.entity_state_mut(entity)
            .component_state_mut(component)
            .new_and_removed_attributes
            .insert(index, false);
    }

    /// Clears all pending state for an entity after it was fully sent or
    /// received (creating the undirty record if absent, so later edits
    /// replicate incrementally).
    pub fn mark_entity_processed(&mut self, id: EntityId) {
        self.entity_state_mut(id).dirty_processed();
    }

    pub fn mark_component_processed(&mut self, entity: EntityId, component: ComponentId) {
        self.entity_state_mut(entity)
            .component_state_mut(component)
            .dirty_processed();
    }

    pub fn remove_from_queue(&mut self, id: EntityId) {
        self.dirty_queue.retain(|e| *e != id);
        if let Some(state) = self.entities.get_mut(&id) {
            state.is_in_queue = false;
        }
    }

    pub fn remove_entity_state(&mut self, id: EntityId) {
        self.remove_from_queue(id);
        self.entities.remove(&id);
    }

    /// Snapshot of the dirty queue, for passes that must not drain it.
    pub fn dirty_queue_ids(&self) -> Vec<EntityId> {
        self.dirty_queue.iter().copied().collect()
    }

    /// Takes the queue for draining; entries left unprocessed must be
    /// restored with [`restore_dirty_queue`](Self::restore_dirty_queue).
    pub fn take_dirty_queue(&mut self) -> VecDeque<EntityId> {
        std::mem::take(&mut self.dirty_queue)
    }

    pub fn restore_dirty_queue(&mut self, mut kept: VecDeque<EntityId>) {
        // Entries marked dirty during the drain land behind the kept ones.
        kept.extend(self.dirty_queue.drain(..));
        self.dirty_queue = kept;
    }

    pub fn requeue_entity(&mut self, id: EntityId) {
        self.queue_entity(id);
    }

    /// Orders the dirty queue by descending priority.
    pub fn sort_dirty_queue(&mut self) {
        let mut ids: Vec<EntityId> = self.dirty_queue.drain(..).collect();
        ids.sort_by(|a, b| {
            let pa = self.entities.get(a).map(|s| s.final_priority()).unwrap_or(0.0);
            let pb = self.entities.get(b).map(|s| s.final_priority()).unwrap_or(0.0);
            pb.partial_cmp(&pa).unwrap_or(std::cmp::Ordering::Equal)
        });
        self.dirty_queue = ids.into();
    }

    pub fn need_send_placeholder_components(&self) -> bool {
        !self.placeholder_components_sent
    }

    pub fn mark_placeholder_components_sent(&mut self) {
        self.placeholder_components_sent = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_starts_dirty() {
        let mut state = SceneSyncState::default();
        state.mark_entity_dirty(4);
        let entity = &state.entities[&4];
        assert!(entity.is_new);
        assert!(entity.is_in_queue);
        assert_eq!(state.dirty_queue_ids(), vec![4]);
    }

    #[test]
    fn removal_of_unsent_entity_keeps_the_conflict_queued() {
        let mut state = SceneSyncState::default();
        state.mark_entity_dirty(4);
        state.mark_entity_removed(4);
        // Both flags stay set; the sync pass warns and drops the removal.
        let entity = &state.entities[&4];
        assert!(entity.is_new);
        assert!(entity.removed);
        assert_eq!(state.dirty_queue_ids(), vec![4]);
    }

    #[test]
    fn removal_of_sent_entity_queues_removal() {
        let mut state = SceneSyncState::default();
        state.mark_entity_processed(4);
        state.mark_entity_removed(4);
        assert!(state.entities[&4].removed);
        assert_eq!(state.dirty_queue_ids(), vec![4]);
    }

    #[test]
    fn removal_of_unknown_entity_is_ignored() {
        let mut state = SceneSyncState::default();
        state.mark_entity_removed(9);
        assert!(state.entities.is_empty());
    }

    #[test]
    fn attribute_bits_round_trip() {
        let mut component = ComponentSyncState::new(7);
        component.mark_attribute_dirty(0);
        component.mark_attribute_dirty(13);
        component.mark_attribute_dirty(255);
        assert!(component.is_attribute_dirty(13));
        assert_eq!(component.dirty_attribute_indices(), vec![0, 13, 255]);
        component.clear_attribute_dirty(13);
        assert_eq!(component.dirty_attribute_indices(), vec![0, 255]);
    }

    #[test]
    fn processed_component_is_not_new() {
        let mut state = SceneSyncState::default();
        state.mark_component_processed(1, 2);
        assert!(!state.entities[&1].components[&2].is_new);
        // A subsequent attribute change is incremental, not a create.
        state.mark_attribute_dirty(1, 2, 0);
        assert!(!state.entities[&1].components[&2].is_new);
        assert!(state.entities[&1].components[&2].is_attribute_dirty(0));
    }

    #[test]
    fn removal_of_unsent_component_drops_state() {
        let mut state = SceneSyncState::default();
        state.mark_component_dirty(1, 2);
        state.mark_component_removed(1, 2);
        assert!(state.entities[&1].components.is_empty());
    }

    #[test]
    fn queue_does_not_duplicate() {
        let mut state = SceneSyncState::default();
        state.mark_entity_dirty(4);
        state.mark_entity_dirty(4);
        state.mark_attribute_dirty(4, 1, 0);
        assert_eq!(state.dirty_queue_ids(), vec![4]);
    }

    #[test]
    fn sort_orders_by_priority() {
        let mut state = SceneSyncState::default();
        state.mark_entity_dirty(1);
        state.mark_entity_dirty(2);
        state.mark_entity_dirty(3);
        state.entity_state_mut(1).priority = 1.0;
        state.entity_state_mut(2).priority = 50.0;
        state.entity_state_mut(3).priority = 10.0;
        state.sort_dirty_queue();
        assert_eq!(state.dirty_queue_ids(), vec![2, 3, 1]);
    }

    #[test]
    fn prioritized_interval_grows_as_priority_falls() {
        let mut state = EntitySyncState::new(1);
        state.priority = 100.0;
        let fast = state.compute_prioritized_update_interval(0.05);
        state.priority = 1.0;
        let slow = state.compute_prioritized_update_interval(0.05);
        assert!((fast - 0.05).abs() < 1e-6);
        assert!(slow > fast);
        state.priority = 0.001;
        assert!((state.compute_prioritized_update_interval(0.05) - 0.8).abs() < 1e-6);
    }
}
