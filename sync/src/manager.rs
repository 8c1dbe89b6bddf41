//! The protocol engine: drains scene changes into per-connection dirty
//! state, runs the tick loop, and assembles outbound messages. Inbound
//! dispatch lives in `handlers`.

use std::collections::{HashSet, VecDeque};

use glam::{Mat3, Vec3};
use log::warn;

use undine_serde::{BitWrite, BitWriter};

use crate::{
    config::SyncConfig,
    connection::{ConnectionRegistry, UserConnection},
    messages::{self, EntityActionMsg},
    prioritizer::{DefaultEntityPrioritizer, EntityPrioritizer},
    rigid_body::{
        self, detect_pos_send_type, detect_rot_send_type, detect_scale_send_type, entity_transform,
        write_optimized_pos_rot, REST_VELOCITY_SQ,
    },
    scene::{
        registry::{
            vec3_attribute, RIGID_BODY_ANGULAR_VELOCITY_INDEX, RIGID_BODY_LINEAR_VELOCITY_INDEX,
        },
        Component, Scene, SceneEvent, PLACEABLE_TYPE_ID, RIGID_BODY_TYPE_ID,
    },
    types::{
        ChangeKind, ComponentTypeId, ConnectionId, EntityId, ExecType, HostType, ProtocolVersion,
        LAST_REPLICATED_ID,
    },
};

/// Soft cap for coalesced outbound messages.
const MAX_MESSAGE_SIZE_BYTES: usize = 1400;
/// Conservative bound for one rigid-body entry; the message flushes when
/// fewer bits remain.
const MAX_RIGID_BODY_ENTRY_BITS: usize = 350;

/// Scene id slot on the wire. Single-scene addressing for now.
pub(crate) const SCENE_ID: u32 = 0;

#[derive(Default)]
pub(crate) struct ScratchBuffers {
    pub misc: BitWriter,
    pub create_entity: BitWriter,
    pub remove_comps: BitWriter,
    pub remove_attrs: BitWriter,
    pub create_comps: BitWriter,
    pub create_attrs: BitWriter,
    pub edit_attrs: BitWriter,
    pub attr_data: BitWriter,
    pub rigid_body: BitWriter,
}

/// Replicates one scene between this host and its peers.
pub struct SyncManager {
    host: HostType,
    update_period: f32,
    update_acc: f32,
    priority_update_period: f32,
    prio_update_acc: f32,
    client_extrapolation_time_ms: Option<f32>,
    max_lin_extrap_time: f32,
    no_client_physics_handoff: bool,
    prioritizer: Option<Box<dyn EntityPrioritizer>>,
    /// Client side: entity whose pose feeds observer-position updates.
    observer_entity: Option<EntityId>,
    /// Client side: types the server announced, never echoed back.
    component_types_from_server: HashSet<ComponentTypeId>,
    /// Warn-once set for static attribute layout mismatches.
    pub(crate) mismatching_component_types: HashSet<ComponentTypeId>,
    /// Peer whose type description is being applied; suppresses echo.
    pub(crate) component_type_sender: Option<ConnectionId>,
    /// Peer whose action is being executed, queryable during execution.
    pub(crate) action_sender: Option<ConnectionId>,
    pub(crate) scratch: ScratchBuffers,
}

impl SyncManager {
    pub fn new(host: HostType, config: &SyncConfig) -> Self {
        let config = config.clone().clamped();
        let mut manager = Self {
            host,
            update_period: config.update_period,
            update_acc: 0.0,
            priority_update_period: config.priority_update_period,
            prio_update_acc: 0.0,
            client_extrapolation_time_ms: config.client_extrapolation_time_ms,
            max_lin_extrap_time: config.max_lin_extrap_time(),
            no_client_physics_handoff: config.no_client_physics,
            prioritizer: None,
            observer_entity: None,
            component_types_from_server: HashSet::new(),
            mismatching_component_types: HashSet::new(),
            component_type_sender: None,
            action_sender: None,
            scratch: ScratchBuffers::default(),
        };
        manager.set_interest_management_enabled(config.interest_management);
        manager
    }

    pub fn host(&self) -> HostType {
        self.host
    }

    pub fn update_period(&self) -> f32 {
        self.update_period
    }

    pub fn set_update_period(&mut self, period: f32) {
        self.update_period = period.max(0.01);
        self.max_lin_extrap_time = SyncConfig {
            update_period: self.update_period,
            client_extrapolation_time_ms: self.client_extrapolation_time_ms,
            ..SyncConfig::default()
        }
        .max_lin_extrap_time();
    }

    pub fn set_priority_update_period(&mut self, period: f32) {
        self.priority_update_period = period.max(self.update_period);
    }

    pub fn set_interest_management_enabled(&mut self, enabled: bool) {
        self.set_prioritizer(if enabled {
            Some(Box::new(DefaultEntityPrioritizer))
        } else {
            None
        });
    }

    /// Replaces the priority computer driving per-entity update rates.
    pub fn set_prioritizer(&mut self, prioritizer: Option<Box<dyn EntityPrioritizer>>) {
        self.prioritizer = prioritizer;
    }

    /// Client side: the entity whose pose is reported to the server for
    /// interest management.
    pub fn set_observer(&mut self, entity: Option<EntityId>) {
        self.observer_entity = entity;
    }

    /// During inbound action execution: the connection that sent the action.
    pub fn action_sender(&self) -> Option<ConnectionId> {
        self.action_sender
    }

    /// Admits a connection: marks every non-local entity dirty so the whole
    /// scene replicates, and seeds priorities when interest management is
    /// enabled. Call when the peer has authenticated.
    pub fn on_connection_added(&mut self, scene: &Scene, connection: &mut UserConnection) {
        connection.sync_state.clear();
        for entity in scene.entities() {
            if entity.is_local() {
                continue;
            }
            connection.sync_state.mark_entity_dirty(entity.id());
        }
        if let Some(prioritizer) = &mut self.prioritizer {
            let observer_pos = connection.sync_state.observer_pos;
            let observer_rot = connection.sync_state.observer_rot;
            prioritizer.compute_sync_priorities(
                &mut connection.sync_state.entities,
                observer_pos,
                observer_rot,
                scene,
            );
        }
    }

    /// Per-frame entry point. Accumulates frame time and performs a network
    /// tick when due.
    pub fn update(&mut self, frametime: f32, scene: &mut Scene, connections: &mut ConnectionRegistry) {
        self.pump_scene_events(scene, connections);

        if self.host == HostType::Client {
            // Smooth rigid bodies and metadata-driven attribute
            // interpolations every frame, not just on network ticks.
            for connection in connections.iter_mut() {
                rigid_body::interpolate_rigid_bodies(
                    frametime,
                    scene,
                    &mut connection.sync_state,
                    self.update_period,
                    self.max_lin_extrap_time,
                    self.no_client_physics_handoff,
                );
            }
            scene.update_interpolations(frametime);
        }

        self.update_acc += frametime;
        self.prio_update_acc += frametime;
        if self.update_acc < self.update_period {
            return;
        }
        // If multiple periods passed, still sync just once.
        self.update_acc %= self.update_period;

        let priority_tick_due = self.prio_update_acc >= self.priority_update_period;
        if priority_tick_due {
            self.prio_update_acc %= self.priority_update_period;
        }

        if self.host == HostType::Server {
            for id in connections.ids() {
                let Some(connection) = connections.get_mut(id) else { continue };
                if !connection.is_authenticated() {
                    continue;
                }
                if let Some(prioritizer) = &mut self.prioritizer {
                    if priority_tick_due {
                        let observer_pos = connection.sync_state.observer_pos;
                        let observer_rot = connection.sync_state.observer_rot;
                        prioritizer.compute_sync_priorities(
                            &mut connection.sync_state.entities,
                            observer_pos,
                            observer_rot,
                            scene,
                        );
                    }
                    connection.sync_state.sort_dirty_queue();
                }
                // Fixed per-tick order: pending type descriptions, then
                // rigid-body states (whose cleared bits keep the generic
                // pass from double-replicating motion), then the rest.
                self.send_placeholder_batch(scene, connection);
                if connection.protocol_version() >= ProtocolVersion::WebClientRigidBodyMessage {
                    self.replicate_rigid_body_changes(scene, connection);
                }
                self.process_sync_state(scene, connection);
            }
        } else {
            for id in connections.ids() {
                let Some(connection) = connections.get_mut(id) else { continue };
                self.process_sync_state(scene, connection);
                if priority_tick_due {
                    self.send_observer_position(scene, connection);
                }
            }
        }
    }

    // Change bus

    /// Drains scene change events into every connection's dirty state.
    /// Inbound handlers call this after mutating the scene and before
    /// clearing the sender's bits, so a received change is never echoed.
    pub(crate) fn pump_scene_events(
        &mut self,
        scene: &mut Scene,
        connections: &mut ConnectionRegistry,
    ) {
        for event in scene.drain_events() {
            match event {
                SceneEvent::EntityCreated { entity } => {
                    self.for_each_state(connections, |state| {
                        if state.entities.get(&entity).map(|s| s.removed).unwrap_or(false) {
                            warn!(
                                "entity {entity} is queued for deletion but a new entity is taking its id"
                            );
                        }
                        state.mark_entity_dirty(entity);
                    });
                }
                SceneEvent::EntityRemoved { entity } => {
                    self.for_each_state(connections, |state| state.mark_entity_removed(entity));
                }
                SceneEvent::EntityPropertiesChanged { entity } => {
                    self.for_each_state(connections, |state| {
                        state.mark_entity_dirty_with(entity, true, false)
                    });
                }
                SceneEvent::EntityParentChanged { entity } => {
                    self.for_each_state(connections, |state| {
                        state.mark_entity_dirty_with(entity, false, true)
                    });
                }
                SceneEvent::ComponentAdded { entity, component } => {
                    self.for_each_state(connections, |state| {
                        state.mark_component_dirty(entity, component)
                    });
                }
                SceneEvent::ComponentRemoved { entity, component } => {
                    self.for_each_state(connections, |state| {
                        state.mark_component_removed(entity, component)
                    });
                }
                SceneEvent::AttributeChanged { entity, component, index } => {
                    self.for_each_state(connections, |state| {
                        state.mark_attribute_dirty(entity, component, index)
                    });
                }
                SceneEvent::AttributeAdded { entity, component, index } => {
                    self.for_each_state(connections, |state| {
                        state.mark_attribute_created(entity, component, index)
                    });
                }
                SceneEvent::AttributeRemoved { entity, component, index } => {
                    self.for_each_state(connections, |state| {
                        state.mark_attribute_removed(entity, component, index)
                    });
                }
                SceneEvent::ActionTriggered { entity, name, params, exec_type } => {
                    self.route_action(scene, connections, entity, &name, &params, exec_type);
                }
                SceneEvent::ComponentTypeRegistered { type_id } => {
                    self.replicate_component_type(scene, connections, type_id);
                }
            }
        }
    }

    fn for_each_state(
        &self,
        connections: &mut ConnectionRegistry,
        mut mark: impl FnMut(&mut crate::sync_state::SceneSyncState),
    ) {
        let require_auth = self.host == HostType::Server;
        for connection in connections.iter_mut() {
            if require_auth && !connection.is_authenticated() {
                continue;
            }
            mark(&mut connection.sync_state);
        }
    }

    // Entity actions

    fn route_action(
        &mut self,
        scene: &mut Scene,
        connections: &mut ConnectionRegistry,
        entity: EntityId,
        name: &str,
        params: &[String],
        exec_type: ExecType,
    ) {
        if self.host == HostType::Server {
            // A server-targeted action triggered on the server executes here.
            if exec_type.contains(ExecType::SERVER) {
                scene.exec_local(entity, name, params);
            }
            if exec_type.contains(ExecType::PEERS) {
                // Queued, and sent after scene sync this tick.
                let msg = EntityActionMsg {
                    entity_id: entity,
                    exec_type: ExecType::LOCAL,
                    name: name.to_string(),
                    params: params.to_vec(),
                };
                for connection in connections.iter_mut() {
                    if connection.is_authenticated() {
                        connection.sync_state.queued_actions.push_back(msg.clone());
                    }
                }
            }
        } else if exec_type.contains(ExecType::SERVER) || exec_type.contains(ExecType::PEERS) {
            // Request the server to run it; the local bit was handled here.
            let msg = EntityActionMsg {
                entity_id: entity,
                exec_type: exec_type.without(ExecType::LOCAL),
                name: name.to_string(),
                params: params.to_vec(),
            };
            let mut writer = std::mem::take(&mut self.scratch.misc);
            writer.reset();
            msg.write(&mut writer);
            for connection in connections.iter_mut() {
                connection.send(messages::ENTITY_ACTION, true, true, &writer.to_bytes());
            }
            self.scratch.misc = writer;
        }
    }

    // Placeholder component types

    fn replicate_component_type(
        &mut self,
        scene: &Scene,
        connections: &mut ConnectionRegistry,
        type_id: ComponentTypeId,
    ) {
        let skip = self.component_type_sender;
        for id in connections.ids() {
            if Some(id) == skip {
                continue;
            }
            let Some(connection) = connections.get_mut(id) else { continue };
            if self.host == HostType::Server && !connection.is_authenticated() {
                continue;
            }
            self.replicate_component_type_to(scene, connection, type_id);
        }
    }

    /// Sends one placeholder type description to one peer, version
    /// permitting.
    pub(crate) fn replicate_component_type_to(
        &mut self,
        scene: &Scene,
        connection: &mut UserConnection,
        type_id: ComponentTypeId,
    ) {
        if connection.protocol_version() < ProtocolVersion::CustomComponents {
            return;
        }
        let Some(descriptor) = scene.registry().descriptor(type_id).filter(|d| d.placeholder)
        else {
            warn!("cannot describe unknown component type {type_id}");
            return;
        };
        let mut writer = std::mem::take(&mut self.scratch.misc);
        writer.reset();
        writer.write_vle_u32(descriptor.type_id);
        writer.write_string(&descriptor.type_name);
        writer.write_vle_u32(descriptor.attributes.len() as u32);
        for attribute in &descriptor.attributes {
            writer.write_byte(attribute.type_id);
            writer.write_string(&attribute.id);
            writer.write_string(&attribute.name);
        }
        connection.send(messages::REGISTER_COMPONENT_TYPE, true, true, &writer.to_bytes());
        self.scratch.misc = writer;
    }

    /// Client side: remembers a server-announced type so the initial
    /// placeholder batch does not echo it back.
    pub(crate) fn note_component_type_from_server(&mut self, type_id: ComponentTypeId) {
        self.component_types_from_server.insert(type_id);
    }

    // Rigid-body encode pass

    /// Steals the transform and velocity dirty bits from the sync state and
    /// replicates them through the compact motion message. Runs before the
    /// generic pass each tick.
    fn replicate_rigid_body_changes(&mut self, scene: &Scene, connection: &mut UserConnection) {
        let mut writer = std::mem::take(&mut self.scratch.rigid_body);
        writer.reset();
        let mut msg_reliable = false;

        for id in connection.sync_state.dirty_queue_ids() {
            // Flush when another entry may not fit.
            if MAX_MESSAGE_SIZE_BYTES * 8 - writer.bits_written() <= MAX_RIGID_BODY_ENTRY_BITS {
                connection.send(messages::RIGID_BODY_UPDATE, msg_reliable, true, &writer.to_bytes());
                writer.reset();
                msg_reliable = false;
            }

            let Some(entity) = scene.entity(id) else { continue };
            let Some(placeable) = entity.component_of_type(PLACEABLE_TYPE_ID) else { continue };
            let rigid_body = entity.component_of_type(RIGID_BODY_TYPE_ID);

            let Some(entity_state) = connection.sync_state.entities.get_mut(&id) else { continue };
            if entity_state.is_new || entity_state.removed {
                // Creations and removals go through the generic mechanism.
                continue;
            }

            let mut transform_dirty = false;
            if let Some(placeable_state) = entity_state.components.get_mut(&placeable.id()) {
                if !placeable_state.is_new && !placeable_state.removed {
                    transform_dirty = placeable_state.is_attribute_dirty(0);
                    placeable_state.clear_attribute_dirty(0);
                }
            }

            let linear_vel = rigid_body
                .and_then(|c| vec3_attribute(c, RIGID_BODY_LINEAR_VELOCITY_INDEX))
                .unwrap_or(Vec3::ZERO);
            let angular_vel = rigid_body
                .and_then(|c| vec3_attribute(c, RIGID_BODY_ANGULAR_VELOCITY_INDEX))
                .unwrap_or(Vec3::ZERO);

            let mut velocity_dirty = false;
            let mut angular_velocity_dirty = false;
            if let Some(rigid_body) = rigid_body {
                if let Some(rigid_state) = entity_state.components.get_mut(&rigid_body.id()) {
                    if !rigid_state.is_new && !rigid_state.removed {
                        velocity_dirty =
                            rigid_state.is_attribute_dirty(RIGID_BODY_LINEAR_VELOCITY_INDEX);
                        angular_velocity_dirty =
                            rigid_state.is_attribute_dirty(RIGID_BODY_ANGULAR_VELOCITY_INDEX);
                        rigid_state.clear_attribute_dirty(RIGID_BODY_LINEAR_VELOCITY_INDEX);
                        rigid_state.clear_attribute_dirty(RIGID_BODY_ANGULAR_VELOCITY_INDEX);

                        velocity_dirty = velocity_dirty
                            && linear_vel.distance_squared(entity_state.linear_velocity) >= 1e-2;
                        angular_velocity_dirty = angular_velocity_dirty
                            && angular_vel.distance_squared(entity_state.angular_velocity) >= 1e-1;

                        // A body entering rest forces a reliable update so
                        // the receiver is guaranteed to stop extrapolating.
                        if linear_vel.length_squared() <= REST_VELOCITY_SQ
                            && entity_state.linear_velocity.length_squared() > REST_VELOCITY_SQ
                        {
                            velocity_dirty = true;
                            msg_reliable = true;
                        }
                        if angular_vel.length_squared() <= REST_VELOCITY_SQ
                            && entity_state.angular_velocity.length_squared() > REST_VELOCITY_SQ
                        {
                            angular_velocity_dirty = true;
                            msg_reliable = true;
                        }
                    }
                }
            }

            if !transform_dirty && !velocity_dirty && !angular_velocity_dirty {
                continue;
            }

            if self.prioritizer.is_some()
                && entity_state.seconds_since_last_send()
                    < entity_state.compute_prioritized_update_interval(self.update_period)
            {
                continue;
            }

            let Some(transform) = entity_transform(scene, id) else { continue };

            let pos_changed = transform_dirty
                && transform.pos.distance_squared(entity_state.transform.pos) > 1e-3;
            let rot_changed = transform_dirty
                && transform.rot.distance_squared(entity_state.transform.rot) > 1e-1;
            let scale_changed = transform_dirty
                && transform.scale.distance_squared(entity_state.transform.scale) > 1e-3;

            let rot = transform.orientation_mat3();
            let pos_send_type = detect_pos_send_type(pos_changed, transform.pos);
            let rot_send_type = detect_rot_send_type(rot_changed, &rot);
            let scale_send_type = detect_scale_send_type(scale_changed, transform.scale);
            let vel_send_type = if velocity_dirty {
                if linear_vel.length_squared() >= 64.0 {
                    2
                } else {
                    1
                }
            } else {
                0
            };
            let ang_vel_send_type = u32::from(angular_velocity_dirty);

            if pos_send_type == 0
                && rot_send_type == 0
                && scale_send_type == 0
                && vel_send_type == 0
                && ang_vel_send_type == 0
            {
                continue;
            }

            writer.write_vle_u32(id & LAST_REPLICATED_ID);
            writer.write_arithmetic_encoded(
                8,
                &[
                    (pos_send_type, 3),
                    (rot_send_type, 4),
                    (scale_send_type, 3),
                    (vel_send_type, 3),
                    (ang_vel_send_type, 2),
                ],
            );
            write_optimized_pos_rot(&mut writer, pos_send_type, transform.pos, rot_send_type, &rot);

            if scale_send_type == 1 {
                writer.write_bits(transform.scale.x.to_bits(), 32);
            } else if scale_send_type == 2 {
                writer.write_bits(transform.scale.x.to_bits(), 32);
                writer.write_bits(transform.scale.y.to_bits(), 32);
                writer.write_bits(transform.scale.z.to_bits(), 32);
            }

            if vel_send_type == 1 {
                writer.write_vec3(linear_vel.x, linear_vel.y, linear_vel.z, 11, 10, 3, 8);
                entity_state.linear_velocity = linear_vel;
            } else if vel_send_type == 2 {
                writer.write_vec3(linear_vel.x, linear_vel.y, linear_vel.z, 11, 10, 10, 8);
                entity_state.linear_velocity = linear_vel;
            }

            if ang_vel_send_type == 1 {
                rigid_body::write_quat_axis_angle(&mut writer, rigid_body::ang_vel_to_quat(angular_vel));
                entity_state.angular_velocity = angular_vel;
            }

            if pos_send_type != 0 {
                entity_state.transform.pos = transform.pos;
            }
            if rot_send_type != 0 {
                entity_state.transform.rot = transform.rot;
            }
            if scale_send_type != 0 {
                entity_state.transform.scale = transform.scale;
            }
            entity_state.touch_send_time();
        }

        if writer.bytes_written() > 0 {
            connection.send(messages::RIGID_BODY_UPDATE, msg_reliable, true, &writer.to_bytes());
        }
        writer.reset();
        self.scratch.rigid_body = writer;
    }

    // Generic sync pass

    /// Drains the connection's dirty queue in order, assembling create,
    /// remove, and edit messages, then flushes queued entity actions.
    /// Sends the full current set of placeholder type descriptions exactly
    /// once per connection, before any component of such a type can arrive.
    fn send_placeholder_batch(&mut self, scene: &Scene, connection: &mut UserConnection) {
        if connection.protocol_version() < ProtocolVersion::CustomComponents
            || !connection.sync_state.need_send_placeholder_components()
        {
            return;
        }
        for type_id in scene.registry().placeholder_type_ids() {
            if self.host == HostType::Server || !self.component_types_from_server.contains(&type_id)
            {
                self.replicate_component_type_to(scene, connection, type_id);
            }
        }
        connection.sync_state.mark_placeholder_components_sent();
    }

    fn process_sync_state(&mut self, scene: &mut Scene, connection: &mut UserConnection) {
        self.send_placeholder_batch(scene, connection);

        let server_im = self.host == HostType::Server && self.prioritizer.is_some();

        let mut queue = connection.sync_state.take_dirty_queue();
        let mut kept: VecDeque<EntityId> = VecDeque::new();
        while let Some(id) = queue.pop_front() {
            let Some(entity_state) = connection.sync_state.entities.get_mut(&id) else { continue };

            if server_im
                && entity_state.seconds_since_last_send()
                    < entity_state.compute_prioritized_update_interval(self.update_period)
            {
                kept.push_back(id);
                continue;
            }
            entity_state.is_in_queue = false;

            let mut remove_state = false;
            let entity_exists = match scene.entity(id) {
                None => {
                    if !entity_state.removed {
                        warn!(
                            "entity {id} went missing without a removal signal, dropping its sync state"
                        );
                    }
                    entity_state.is_new = false;
                    remove_state = true;
                    false
                }
                Some(entity) => {
                    // Local entities never sync; unacked ones wait for the
                    // ack after their create was sent.
                    if entity.is_local() || (!entity_state.is_new && entity.is_unacked()) {
                        continue;
                    }
                    true
                }
            };

            if entity_state.removed {
                if entity_state.is_new {
                    warn!("entity {id} queued for both deletion and creation, dropping the removal");
                    entity_state.removed = false;
                    entity_state.is_in_queue = true;
                    kept.push_back(id);
                    continue;
                }
                let mut writer = std::mem::take(&mut self.scratch.misc);
                writer.reset();
                writer.write_vle_u32(SCENE_ID);
                writer.write_vle_u32(id & LAST_REPLICATED_ID);
                connection.send(messages::REMOVE_ENTITY, true, true, &writer.to_bytes());
                self.scratch.misc = writer;
                connection.sync_state.remove_entity_state(id);
                continue;
            }

            if entity_state.is_new {
                self.send_create_entity(scene, connection, id);
            } else if entity_exists {
                self.send_incremental_update(scene, connection, id);
            }

            if remove_state {
                connection.sync_state.entities.remove(&id);
            }
        }
        connection.sync_state.restore_dirty_queue(kept);

        // Queued entity actions go out after scene sync.
        while let Some(msg) = connection.sync_state.queued_actions.pop_front() {
            let mut writer = std::mem::take(&mut self.scratch.misc);
            writer.reset();
            msg.write(&mut writer);
            connection.send(messages::ENTITY_ACTION, true, true, &writer.to_bytes());
            self.scratch.misc = writer;
        }
    }

    /// Serializes one component as a full update: id, type, name, and the
    /// nested attribute block (static prefix back-to-back, then dynamic
    /// attributes until end-of-block).
    pub(crate) fn write_component_full_update(
        attr_scratch: &mut BitWriter,
        writer: &mut BitWriter,
        component: &Component,
    ) {
        writer.write_vle_u32(component.id() & LAST_REPLICATED_ID);
        writer.write_vle_u32(component.type_id());
        writer.write_string(&component.name);

        attr_scratch.reset();
        let static_count = component.num_static_attributes();
        for slot in component.attributes().iter().take(static_count) {
            if let Some(attribute) = slot {
                attribute.value.to_binary(attr_scratch);
            }
        }
        for (index, slot) in component.attributes().iter().enumerate().skip(static_count) {
            if let Some(attribute) = slot {
                if attribute.dynamic {
                    attr_scratch.write_byte(index as u8);
                    attr_scratch.write_byte(attribute.type_id());
                    attr_scratch.write_string(&attribute.name);
                    attribute.value.to_binary(attr_scratch);
                }
            }
        }

        let block = attr_scratch.to_bytes();
        writer.write_vle_u32(block.len() as u32);
        writer.write_bytes(&block);
    }

    fn send_create_entity(
        &mut self,
        scene: &Scene,
        connection: &mut UserConnection,
        id: EntityId,
    ) {
        let Some(entity) = scene.entity(id) else { return };

        let mut writer = std::mem::take(&mut self.scratch.create_entity);
        let mut attr_scratch = std::mem::take(&mut self.scratch.attr_data);
        writer.reset();
        writer.write_vle_u32(SCENE_ID);
        writer.write_vle_u32(id & LAST_REPLICATED_ID);
        // A byte rather than a bit keeps the remainder byte-aligned for the
        // data that follows.
        writer.write_byte(u8::from(entity.is_temporary()));

        if connection.protocol_version() >= ProtocolVersion::HierarchicScene {
            // Full 32-bit id to cover the unacked range.
            let parent = match entity.parent() {
                Some(parent) if crate::types::is_local_id(parent) => {
                    warn!(
                        "replicated entity {id} is parented to a local entity, dropping the link on the wire"
                    );
                    0
                }
                Some(parent) => parent,
                None => 0,
            };
            writer.write_bits(parent, 32);
        }

        writer.write_vle_u32(entity.num_replicated_components() as u32);
        let mut sent_components = Vec::new();
        for component in entity.components() {
            if !component.replicated {
                continue;
            }
            Self::write_component_full_update(&mut attr_scratch, &mut writer, component);
            sent_components.push(component.id());
        }

        connection.send(messages::CREATE_ENTITY, true, true, &writer.to_bytes());
        self.scratch.create_entity = writer;
        self.scratch.attr_data = attr_scratch;

        for component in sent_components {
            connection.sync_state.mark_component_processed(id, component);
        }
        connection.sync_state.mark_entity_processed(id);
        connection.sync_state.entity_state_mut(id).touch_send_time();
    }

    fn send_incremental_update(
        &mut self,
        scene: &Scene,
        connection: &mut UserConnection,
        id: EntityId,
    ) {
        let Some(entity) = scene.entity(id) else { return };
        let legacy_peer =
            connection.protocol_version() < ProtocolVersion::WebClientRigidBodyMessage;

        let mut remove_comps = std::mem::take(&mut self.scratch.remove_comps);
        let mut remove_attrs = std::mem::take(&mut self.scratch.remove_attrs);
        let mut create_comps = std::mem::take(&mut self.scratch.create_comps);
        let mut create_attrs = std::mem::take(&mut self.scratch.create_attrs);
        let mut edit_attrs = std::mem::take(&mut self.scratch.edit_attrs);
        let mut attr_scratch = std::mem::take(&mut self.scratch.attr_data);
        remove_comps.reset();
        remove_attrs.reset();
        create_comps.reset();
        create_attrs.reset();
        edit_attrs.reset();

        fn header(writer: &mut BitWriter, id: EntityId) {
            if writer.is_empty() {
                writer.write_vle_u32(SCENE_ID);
                writer.write_vle_u32(id & LAST_REPLICATED_ID);
            }
        }

        let entity_state = connection.sync_state.entity_state_mut(id);
        while let Some(component_id) = entity_state.pop_dirty_component() {
            let Some(component_state) = entity_state.components.get_mut(&component_id) else {
                continue;
            };
            component_state.is_in_queue = false;

            let component = entity.component(component_id);
            let mut remove_component_state = false;
            match component {
                None => {
                    if !component_state.removed {
                        warn!(
                            "component {component_id} of entity {id} went missing without a removal signal"
                        );
                    }
                    component_state.is_new = false;
                    remove_component_state = true;
                }
                Some(component) => {
                    if component.is_local() || (!component_state.is_new && component.is_unacked()) {
                        continue;
                    }
                }
            }

            if component_state.removed {
                remove_component_state = true;
                header(&mut remove_comps, id);
                remove_comps.write_vle_u32(component_id & LAST_REPLICATED_ID);
            } else if component_state.is_new {
                if let Some(component) = component {
                    header(&mut create_comps, id);
                    Self::write_component_full_update(&mut attr_scratch, &mut create_comps, component);
                    component_state.dirty_processed();
                }
            } else if let Some(component) = component {
                // Pending attribute creations and removals first; their
                // dirty bits are cleared so edits are not sent redundantly.
                let pending = std::mem::take(&mut component_state.new_and_removed_attributes);
                for index in pending.keys() {
                    component_state.clear_attribute_dirty(*index);
                }

                // Remaining dirty bits become an edit message; the majority
                // of steady-state traffic.
                let mut changed: Vec<u8> = Vec::new();
                for index in component_state.dirty_attribute_indices() {
                    if component.attribute(index).is_some() {
                        changed.push(index);
                    } else {
                        warn!(
                            "attribute change queued for nonexistent index {index} of component {component_id}, discarding"
                        );
                    }
                }
                component_state.clear_all_dirty_attributes();

                for (index, created) in pending {
                    if created {
                        match component.attribute(index) {
                            Some(attribute) if attribute.dynamic => {
                                header(&mut create_attrs, id);
                                create_attrs.write_vle_u32(component_id & LAST_REPLICATED_ID);
                                create_attrs.write_byte(index);
                                create_attrs.write_byte(attribute.type_id());
                                create_attrs.write_string(&attribute.name);
                                attribute.value.to_binary(&mut create_attrs);
                            }
                            Some(_) => {
                                warn!(
                                    "attribute create queued for static index {index} of component {component_id}, discarding"
                                );
                            }
                            None => {
                                warn!(
                                    "attribute create queued for nonexistent index {index} of component {component_id}, discarding"
                                );
                            }
                        }
                    } else {
                        header(&mut remove_attrs, id);
                        remove_attrs.write_vle_u32(component_id & LAST_REPLICATED_ID);
                        remove_attrs.write_byte(index);
                    }
                }

                if !changed.is_empty() {
                    let mut send_changes = true;
                    // Peers without the compact motion channel would be
                    // spammed by sub-threshold transform motion; filter it.
                    if legacy_peer
                        && component.type_id() == PLACEABLE_TYPE_ID
                        && changed == [0]
                    {
                        if let Some(transform) = crate::scene::registry::transform_of(component) {
                            let pos_changed = transform
                                .pos
                                .distance_squared(entity_state.transform.pos)
                                > 1e-3;
                            let rot_changed = transform
                                .rot
                                .distance_squared(entity_state.transform.rot)
                                > 1e-1;
                            let scale_changed = transform
                                .scale
                                .distance_squared(entity_state.transform.scale)
                                > 1e-3;
                            if !pos_changed && !rot_changed && !scale_changed {
                                send_changes = false;
                            } else {
                                entity_state.transform = transform;
                            }
                        }
                    }

                    if send_changes {
                        header(&mut edit_attrs, id);
                        edit_attrs.write_vle_u32(component_id & LAST_REPLICATED_ID);

                        attr_scratch.reset();
                        let total_slots = component.attributes().len() as u32;
                        let bits_index_list = changed.len() as u32 * 8 + 8;
                        if bits_index_list <= total_slots {
                            attr_scratch.write_bit(false);
                            attr_scratch.write_byte(changed.len() as u8);
                            for index in &changed {
                                attr_scratch.write_byte(*index);
                                if let Some(attribute) = component.attribute(*index) {
                                    attribute.value.to_binary(&mut attr_scratch);
                                }
                            }
                        } else {
                            attr_scratch.write_bit(true);
                            for (slot_index, slot) in component.attributes().iter().enumerate() {
                                let index = slot_index as u8;
                                let dirty = changed.contains(&index);
                                match slot {
                                    Some(attribute) if dirty => {
                                        attr_scratch.write_bit(true);
                                        attribute.value.to_binary(&mut attr_scratch);
                                    }
                                    _ => attr_scratch.write_bit(false),
                                }
                            }
                        }

                        let block = attr_scratch.to_bytes();
                        edit_attrs.write_vle_u32(block.len() as u32);
                        edit_attrs.write_bytes(&block);
                    }
                }
            }

            if remove_component_state {
                entity_state.components.remove(&component_id);
            }
        }

        let has_property_changes = entity_state.has_property_changes;
        let has_parent_change = entity_state.has_parent_change;

        // Flush in the fixed per-tick order.
        for (writer, message_id) in [
            (&mut remove_comps, messages::REMOVE_COMPONENTS),
            (&mut remove_attrs, messages::REMOVE_ATTRIBUTES),
            (&mut create_comps, messages::CREATE_COMPONENTS),
            (&mut create_attrs, messages::CREATE_ATTRIBUTES),
            (&mut edit_attrs, messages::EDIT_ATTRIBUTES),
        ] {
            if !writer.is_empty() {
                connection.send(message_id, true, true, &writer.to_bytes());
            }
        }

        if has_property_changes {
            let mut writer = std::mem::take(&mut self.scratch.misc);
            writer.reset();
            writer.write_vle_u32(SCENE_ID);
            writer.write_vle_u32(id & LAST_REPLICATED_ID);
            writer.write_byte(u8::from(entity.is_temporary()));
            connection.send(messages::EDIT_ENTITY_PROPERTIES, true, true, &writer.to_bytes());
            self.scratch.misc = writer;
        }
        if has_parent_change && connection.protocol_version() >= ProtocolVersion::HierarchicScene {
            let mut writer = std::mem::take(&mut self.scratch.misc);
            writer.reset();
            writer.write_vle_u32(SCENE_ID);
            writer.write_bits(id, 32);
            writer.write_bits(entity.parent().unwrap_or(0), 32);
            connection.send(messages::SET_ENTITY_PARENT, true, true, &writer.to_bytes());
            self.scratch.misc = writer;
        }

        connection.sync_state.mark_entity_processed(id);
        connection.sync_state.entity_state_mut(id).touch_send_time();

        self.scratch.remove_comps = remove_comps;
        self.scratch.remove_attrs = remove_attrs;
        self.scratch.create_comps = create_comps;
        self.scratch.create_attrs = create_attrs;
        self.scratch.edit_attrs = edit_attrs;
        self.scratch.attr_data = attr_scratch;
    }

    // Observer position (client)

    fn send_observer_position(&mut self, scene: &Scene, connection: &mut UserConnection) {
        let Some(observer) = self.observer_entity else { return };
        let Some(world) = scene.world_transform(observer) else { return };
        let pos = world.pos;
        let rot = world.orientation();

        let (pos_changed, rot_changed) = match connection.sync_state.last_sent_observer {
            Some((last_pos, last_rot)) => (pos != last_pos, rot != last_rot),
            None => (true, true),
        };
        if !pos_changed && !rot_changed {
            return;
        }
        connection.sync_state.last_sent_observer = Some((pos, rot));

        let rot3 = Mat3::from_quat(rot);
        let pos_send_type = detect_pos_send_type(pos_changed, pos);
        let rot_send_type = detect_rot_send_type(rot_changed, &rot3);

        let mut writer = std::mem::take(&mut self.scratch.misc);
        writer.reset();
        writer.write_vle_u32(SCENE_ID);
        writer.write_arithmetic_encoded(8, &[(pos_send_type, 3), (rot_send_type, 4)]);
        write_optimized_pos_rot(&mut writer, pos_send_type, pos, rot_send_type, &rot3);
        connection.send(messages::OBSERVER_POSITION, false, false, &writer.to_bytes());
        self.scratch.misc = writer;
    }

    /// Server side: resolves an id in the unacked range through the
    /// sender's reconciliation map. `None` means the id is unknown and the
    /// message must be dropped.
    pub(crate) fn resolve_entity_id(
        &self,
        connection: &UserConnection,
        id: EntityId,
    ) -> Option<EntityId> {
        if self.host == HostType::Server && crate::types::is_unacked_id(id) {
            match connection.sync_state.unacked_to_real_ids.get(&id) {
                Some(real) => Some(*real),
                None => {
                    warn!("connection {} referenced unknown unacked id {id}", connection.id());
                    None
                }
            }
        } else {
            Some(id)
        }
    }

    /// The change kind applied to inbound mutations: a server re-replicates
    /// them to its other peers, a client applies them locally only.
    pub(crate) fn inbound_change_kind(&self) -> ChangeKind {
        match self.host {
            HostType::Server => ChangeKind::Replicate,
            HostType::Client => ChangeKind::LocalOnly,
        }
    }
}
