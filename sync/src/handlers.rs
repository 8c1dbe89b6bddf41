//! Inbound message dispatch: parse, authorize, apply to the scene, and
//! clear the sender's dirty bits so nothing echoes back.

use glam::Vec3;
use log::warn;

use undine_serde::{BitReader, BitWrite, SerdeErr, SerdeResult};

use crate::{
    connection::ConnectionRegistry,
    error::SyncError,
    manager::SyncManager,
    messages::{self, message_name, EntityActionMsg},
    rigid_body::{
        self, current_curve_velocity, entity_transform, read_optimized_pos_rot,
        read_quat_axis_angle,
    },
    scene::{
        registry::{
            vec3_attribute, RIGID_BODY_ANGULAR_VELOCITY_INDEX, RIGID_BODY_LINEAR_VELOCITY_INDEX,
            RIGID_BODY_MASS_INDEX,
        },
        AttributeSpec, AttributeValue, ComponentTypeDescriptor, Scene, RIGID_BODY_TYPE_ID,
    },
    sync_state::RigidBodyInterpolationState,
    types::{
        ChangeKind, ComponentId, ConnectionId, EntityId, ExecType, HostType, MessageId, PacketId,
        ProtocolVersion, FIRST_UNACKED_ID,
    },
    wrapping::sequence_greater_than,
};

impl SyncManager {
    /// Dispatches one received message. Unknown ids are warned about and
    /// skipped. `Err` means the stream was malformed: partially applied
    /// changes were rolled back and the caller must disconnect the peer.
    pub fn handle_message(
        &mut self,
        scene: &mut Scene,
        connections: &mut ConnectionRegistry,
        source: ConnectionId,
        packet_id: PacketId,
        message_id: MessageId,
        data: &[u8],
    ) -> Result<(), SyncError> {
        if connections.get(source).is_none() {
            return Ok(());
        }

        let result = match message_id {
            messages::OBSERVER_POSITION => self.handle_observer_position(connections, source, data),
            messages::EDIT_ENTITY_PROPERTIES => {
                self.handle_edit_entity_properties(scene, connections, source, data)
            }
            messages::CREATE_ENTITY => self.handle_create_entity(scene, connections, source, data),
            messages::CREATE_COMPONENTS => {
                self.handle_create_components(scene, connections, source, data)
            }
            messages::CREATE_ATTRIBUTES => {
                self.handle_create_attributes(scene, connections, source, data)
            }
            messages::EDIT_ATTRIBUTES => {
                self.handle_edit_attributes(scene, connections, source, data)
            }
            messages::REMOVE_ATTRIBUTES => {
                self.handle_remove_attributes(scene, connections, source, data)
            }
            messages::REMOVE_COMPONENTS => {
                self.handle_remove_components(scene, connections, source, data)
            }
            messages::REMOVE_ENTITY => self.handle_remove_entity(scene, connections, source, data),
            messages::CREATE_ENTITY_REPLY => {
                self.handle_create_entity_reply(scene, connections, source, data)
            }
            messages::CREATE_COMPONENTS_REPLY => {
                self.handle_create_components_reply(scene, connections, source, data)
            }
            messages::RIGID_BODY_UPDATE => {
                self.handle_rigid_body_update(scene, connections, source, packet_id, data)
            }
            messages::ENTITY_ACTION => self.handle_entity_action(scene, connections, source, data),
            messages::REGISTER_COMPONENT_TYPE => {
                self.handle_register_component_type(scene, connections, source, data)
            }
            messages::SET_ENTITY_PARENT => {
                self.handle_set_entity_parent(scene, connections, source, data)
            }
            other => {
                if (messages::FIRST_MESSAGE_ID..=messages::LAST_MESSAGE_ID).contains(&other) {
                    warn!("ignoring message with unallocated id {other} from connection {source}");
                } else {
                    warn!("ignoring message with out-of-range id {other} from connection {source}");
                }
                Ok(())
            }
        };

        result.map_err(|source_err| SyncError::MalformedMessage {
            message: message_name(message_id),
            connection: source,
            source: source_err,
        })
    }

    /// Scene mutations from clients require an authenticated peer.
    fn validate_action(&self, connections: &ConnectionRegistry, source: ConnectionId) -> bool {
        if self.host() != HostType::Server {
            return true;
        }
        connections
            .get(source)
            .map(|c| c.is_authenticated())
            .unwrap_or(false)
    }

    fn allow_modify(
        &self,
        scene: &Scene,
        source: ConnectionId,
        entity: Option<EntityId>,
    ) -> bool {
        if self.host() != HostType::Server {
            return true;
        }
        scene.allow_modify_entity(source, entity.and_then(|id| scene.entity(id)))
    }

    // 105

    fn handle_observer_position(
        &mut self,
        connections: &mut ConnectionRegistry,
        source: ConnectionId,
        data: &[u8],
    ) -> SerdeResult<()> {
        let mut reader = BitReader::new(data);
        let _scene_id = reader.read_vle_u32()?;
        let [pos_send_type, rot_send_type] = reader.read_arithmetic_encoded(8, [3, 4])?;
        let (pos, rot) = read_optimized_pos_rot(&mut reader, pos_send_type, rot_send_type)?;

        let Some(connection) = connections.get_mut(source) else { return Ok(()) };
        // Pose saved always; priorities recompute on their own interval.
        if let Some(pos) = pos {
            connection.sync_state.observer_pos = pos;
        }
        if let Some(rot) = rot {
            connection.sync_state.observer_rot = rot;
        }
        Ok(())
    }

    // 109

    fn handle_edit_entity_properties(
        &mut self,
        scene: &mut Scene,
        connections: &mut ConnectionRegistry,
        source: ConnectionId,
        data: &[u8],
    ) -> SerdeResult<()> {
        let mut reader = BitReader::new(data);
        let _scene_id = reader.read_vle_u32()?;
        let entity_id = reader.read_vle_u32()?;
        let temporary = reader.read_byte()? != 0;

        if !self.validate_action(connections, source) {
            return Ok(());
        }
        let Some(connection) = connections.get(source) else { return Ok(()) };
        let Some(entity_id) = self.resolve_entity_id(connection, entity_id) else {
            return Ok(());
        };
        if !self.allow_modify(scene, source, Some(entity_id)) {
            return Ok(());
        }
        if scene.entity(entity_id).is_none() {
            warn!("entity {entity_id} not found for EditEntityProperties message");
            return Ok(());
        }

        let change = self.inbound_change_kind();
        let _ = scene.set_temporary(entity_id, temporary, change);
        self.pump_scene_events(scene, connections);
        // Clear the dirty bit so the change is not echoed to the sender.
        if let Some(connection) = connections.get_mut(source) {
            connection.sync_state.entity_state_mut(entity_id).has_property_changes = false;
        }
        Ok(())
    }

    // 124

    fn handle_set_entity_parent(
        &mut self,
        scene: &mut Scene,
        connections: &mut ConnectionRegistry,
        source: ConnectionId,
        data: &[u8],
    ) -> SerdeResult<()> {
        let mut reader = BitReader::new(data);
        let _scene_id = reader.read_vle_u32()?;
        let entity_id = reader.read_bits(32)?;
        let parent_id = reader.read_bits(32)?;

        if !self.validate_action(connections, source) {
            return Ok(());
        }
        let Some(connection) = connections.get(source) else { return Ok(()) };
        let Some(entity_id) = self.resolve_entity_id(connection, entity_id) else {
            return Ok(());
        };
        let parent_id = if parent_id == 0 {
            0
        } else {
            match self.resolve_entity_id(connection, parent_id) {
                Some(id) => id,
                None => return Ok(()),
            }
        };
        if !self.allow_modify(scene, source, Some(entity_id)) {
            return Ok(());
        }
        if scene.entity(entity_id).is_none() {
            warn!("entity {entity_id} not found for SetEntityParent message");
            return Ok(());
        }
        if parent_id != 0 && scene.entity(parent_id).is_none() {
            warn!("parent entity {parent_id} not found for SetEntityParent message");
            return Ok(());
        }

        let change = self.inbound_change_kind();
        let parent = (parent_id != 0).then_some(parent_id);
        let _ = scene.set_parent(entity_id, parent, change);
        self.pump_scene_events(scene, connections);
        if let Some(connection) = connections.get_mut(source) {
            connection.sync_state.entity_state_mut(entity_id).has_parent_change = false;
        }
        Ok(())
    }

    // 110

    fn handle_create_entity(
        &mut self,
        scene: &mut Scene,
        connections: &mut ConnectionRegistry,
        source: ConnectionId,
        data: &[u8],
    ) -> SerdeResult<()> {
        let is_server = self.host() == HostType::Server;
        let change = self.inbound_change_kind();

        let mut reader = BitReader::new(data);
        let scene_id = reader.read_vle_u32()?;
        let wire_entity_id = reader.read_vle_u32()?;
        let sender_entity_id = wire_entity_id;

        if !self.validate_action(connections, source) {
            return Ok(());
        }
        if !self.allow_modify(scene, source, None) {
            return Ok(());
        }

        let entity_id = if is_server {
            // The sender's optimistic id is never used; remember the mapping
            // for later messages that still reference it.
            let real = scene.next_free_id();
            if let Some(connection) = connections.get_mut(source) {
                connection
                    .sync_state
                    .unacked_to_real_ids
                    .insert(sender_entity_id | FIRST_UNACKED_ID, real);
            }
            real
        } else {
            if wire_entity_id == 0 {
                warn!("received CreateEntity with the reserved entity id 0, disregarding");
                return Ok(());
            }
            if scene.entity(wire_entity_id).is_some() {
                warn!(
                    "received entity creation for existing entity {wire_entity_id}, removing the old one"
                );
                let _ = scene.remove_entity(wire_entity_id, ChangeKind::LocalOnly);
            }
            wire_entity_id
        };

        if scene.create_entity(entity_id, ChangeKind::Disconnected).is_err() {
            warn!("could not create entity {entity_id}, disregarding CreateEntity message");
            return Ok(());
        }

        let mut component_id_rewrites: Vec<(ComponentId, ComponentId)> = Vec::new();
        let result = self.parse_create_entity_body(
            scene,
            connections,
            source,
            &mut reader,
            entity_id,
            &mut component_id_rewrites,
        );
        if let Err(err) = result {
            // Partially crafted entity: roll back silently, then surface the
            // malformed stream to disconnect the offender.
            warn!("failed to deserialize entity creation, deleting the partial entity");
            let _ = scene.remove_entity(entity_id, ChangeKind::Disconnected);
            return Err(err);
        }

        // One coherent whole-entity signal after everything is in place.
        scene.emit_entity_created(entity_id, change);
        self.pump_scene_events(scene, connections);

        if let Some(connection) = connections.get_mut(source) {
            if is_server {
                let mut writer = std::mem::take(&mut self.scratch.misc);
                writer.reset();
                writer.write_vle_u32(scene_id);
                writer.write_vle_u32(sender_entity_id & crate::types::LAST_REPLICATED_ID);
                writer.write_vle_u32(entity_id & crate::types::LAST_REPLICATED_ID);
                writer.write_vle_u32(component_id_rewrites.len() as u32);
                for (sender_comp, real_comp) in &component_id_rewrites {
                    writer.write_vle_u32(sender_comp & crate::types::LAST_REPLICATED_ID);
                    writer.write_vle_u32(real_comp & crate::types::LAST_REPLICATED_ID);
                }
                connection.send(messages::CREATE_ENTITY_REPLY, true, true, &writer.to_bytes());
                self.scratch.misc = writer;
            }
            // Mark the entity and every received component processed in the
            // sender's state, so the create is not echoed back and later
            // local edits go out as increments rather than creates.
            for (_, real_component) in &component_id_rewrites {
                connection.sync_state.mark_component_processed(entity_id, *real_component);
            }
            connection.sync_state.mark_entity_processed(entity_id);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_create_entity_body(
        &mut self,
        scene: &mut Scene,
        connections: &ConnectionRegistry,
        source: ConnectionId,
        reader: &mut BitReader,
        entity_id: EntityId,
        component_id_rewrites: &mut Vec<(ComponentId, ComponentId)>,
    ) -> SerdeResult<()> {
        let is_server = self.host() == HostType::Server;
        let temporary = reader.read_byte()? != 0;
        let _ = scene.set_temporary(entity_id, temporary, ChangeKind::Disconnected);

        let version = connections
            .get(source)
            .map(|c| c.protocol_version())
            .unwrap_or(ProtocolVersion::Original);
        if version >= ProtocolVersion::HierarchicScene {
            let mut parent_id = reader.read_bits(32)?;
            if is_server && crate::types::is_unacked_id(parent_id) {
                if let Some(connection) = connections.get(source) {
                    match connection.sync_state.unacked_to_real_ids.get(&parent_id) {
                        Some(real) => parent_id = *real,
                        None => warn!(
                            "connection {source} sent unknown unacked parent id {parent_id} in CreateEntity"
                        ),
                    }
                }
            }
            if parent_id != 0 {
                if scene.entity(parent_id).is_some() {
                    // Silent apply; the whole-entity creation event emitted
                    // after parsing carries the link to the other peers.
                    let _ = scene.set_parent(entity_id, Some(parent_id), ChangeKind::Disconnected);
                } else {
                    warn!("parent entity {parent_id} not found while handling CreateEntity");
                }
            }
        }

        let component_count = reader.read_vle_u32()?;
        for _ in 0..component_count {
            self.parse_component_full_update(
                scene,
                source,
                reader,
                entity_id,
                is_server,
                component_id_rewrites,
            )?;
        }
        Ok(())
    }

    /// Parses one component full update and instantiates it on the entity.
    /// Unknown component types are warned about and skipped; a truncated
    /// stream is an error for the whole message.
    fn parse_component_full_update(
        &mut self,
        scene: &mut Scene,
        _source: ConnectionId,
        reader: &mut BitReader,
        entity_id: EntityId,
        is_server: bool,
        component_id_rewrites: &mut Vec<(ComponentId, ComponentId)>,
    ) -> SerdeResult<()> {
        let wire_component_id = reader.read_vle_u32()?;
        let sender_component_id = wire_component_id;
        let type_id = reader.read_vle_u32()?;
        let name = reader.read_string()?;
        let attr_block_size = reader.read_vle_u32()? as usize;
        let attr_block = reader.read_bytes(attr_block_size)?;
        let mut attr_reader = BitReader::new(&attr_block);

        // The server never trusts the sender's component id.
        let component_id = if is_server { 0 } else { wire_component_id };

        if !is_server
            && scene
                .entity(entity_id)
                .map(|e| e.component(component_id).is_some())
                .unwrap_or(false)
        {
            warn!(
                "received component creation for existing component {component_id} in entity {entity_id}, removing the old one"
            );
            let _ = scene.remove_component(entity_id, component_id, ChangeKind::LocalOnly);
        }

        let component_id = match scene.create_component_with_id(
            entity_id,
            component_id,
            type_id,
            &name,
            ChangeKind::Disconnected,
        ) {
            Ok(id) => id,
            Err(err) => {
                warn!("failed to create component of type {type_id} in entity {entity_id}: {err}");
                return Ok(());
            }
        };
        component_id_rewrites.push((sender_component_id, component_id));

        self.apply_component_attribute_block(scene, entity_id, component_id, &mut attr_reader)
    }

    /// Fills a freshly created component from its nested attribute block:
    /// the static prefix back-to-back, then dynamic attribute records until
    /// end-of-block. Static-layout mismatches are tolerated once per type.
    fn apply_component_attribute_block(
        &mut self,
        scene: &mut Scene,
        entity_id: EntityId,
        component_id: ComponentId,
        attr_reader: &mut BitReader,
    ) -> SerdeResult<()> {
        let (static_count, supports_dynamic, type_id) = {
            let component = scene
                .entity(entity_id)
                .and_then(|e| e.component(component_id))
                .ok_or(SerdeErr::InvalidValue { context: "component vanished during create" })?;
            (
                component.num_static_attributes(),
                component.supports_dynamic_attributes(),
                component.type_id(),
            )
        };

        for index in 0..static_count {
            // Tolerate a sender with a shorter static list (every attribute
            // is at least 8 bits); warn once per type.
            if attr_reader.bits_left() >= 8 {
                scene.set_attribute_from_binary(entity_id, component_id, index as u8, attr_reader)?;
            } else {
                if self.mismatching_component_types.insert(type_id) {
                    warn!("not enough static attribute data for component type {type_id} (version mismatch)");
                }
                return Ok(());
            }
        }

        if supports_dynamic {
            while attr_reader.bits_left() > 2 * 8 {
                let index = attr_reader.read_byte()?;
                let attr_type = attr_reader.read_byte()?;
                let name = attr_reader.read_string()?;
                if let Err(err) = scene.create_attribute(
                    entity_id,
                    component_id,
                    index,
                    attr_type,
                    &name,
                    ChangeKind::Disconnected,
                ) {
                    warn!("failed to create dynamic attribute {index}: {err}, skipping the rest");
                    return Ok(());
                }
                scene.set_attribute_from_binary(entity_id, component_id, index, attr_reader)?;
            }
        } else if attr_reader.bits_left() > 0 && self.mismatching_component_types.insert(type_id) {
            warn!("extra static attribute data for component type {type_id} (version mismatch)");
        }
        Ok(())
    }

    // 111

    fn handle_create_components(
        &mut self,
        scene: &mut Scene,
        connections: &mut ConnectionRegistry,
        source: ConnectionId,
        data: &[u8],
    ) -> SerdeResult<()> {
        let is_server = self.host() == HostType::Server;
        let change = self.inbound_change_kind();

        let mut reader = BitReader::new(data);
        let scene_id = reader.read_vle_u32()?;
        let entity_id = reader.read_vle_u32()?;

        if !self.validate_action(connections, source) {
            return Ok(());
        }
        let Some(connection) = connections.get(source) else { return Ok(()) };
        let Some(entity_id) = self.resolve_entity_id(connection, entity_id) else {
            return Ok(());
        };
        if scene.entity(entity_id).is_none() {
            warn!("entity {entity_id} not found for CreateComponents message");
            return Ok(());
        }
        if !self.allow_modify(scene, source, Some(entity_id)) {
            return Ok(());
        }

        let mut component_id_rewrites: Vec<(ComponentId, ComponentId)> = Vec::new();
        let mut result = Ok(());
        while reader.bits_left() > 2 * 8 {
            result = self.parse_component_full_update(
                scene,
                source,
                &mut reader,
                entity_id,
                is_server,
                &mut component_id_rewrites,
            );
            if result.is_err() {
                break;
            }
        }
        if let Err(err) = result {
            warn!("failed to deserialize component creation, deleting the partial components");
            for (_, component_id) in &component_id_rewrites {
                let _ = scene.remove_component(entity_id, *component_id, ChangeKind::Disconnected);
            }
            return Err(err);
        }

        // Emit coherent creations last, then clear the sender's bits.
        let created: Vec<ComponentId> =
            component_id_rewrites.iter().map(|(_, real)| *real).collect();
        for component_id in &created {
            scene.emit_component_added(entity_id, *component_id, change);
        }
        self.pump_scene_events(scene, connections);

        if let Some(connection) = connections.get_mut(source) {
            for component_id in &created {
                connection.sync_state.mark_component_processed(entity_id, *component_id);
            }
            if is_server {
                let mut writer = std::mem::take(&mut self.scratch.misc);
                writer.reset();
                writer.write_vle_u32(scene_id);
                writer.write_vle_u32(entity_id & crate::types::LAST_REPLICATED_ID);
                writer.write_vle_u32(component_id_rewrites.len() as u32);
                for (sender_comp, real_comp) in &component_id_rewrites {
                    writer.write_vle_u32(sender_comp & crate::types::LAST_REPLICATED_ID);
                    writer.write_vle_u32(real_comp & crate::types::LAST_REPLICATED_ID);
                }
                connection.send(messages::CREATE_COMPONENTS_REPLY, true, true, &writer.to_bytes());
                self.scratch.misc = writer;
            }
        }
        Ok(())
    }

    // 112

    fn handle_create_attributes(
        &mut self,
        scene: &mut Scene,
        connections: &mut ConnectionRegistry,
        source: ConnectionId,
        data: &[u8],
    ) -> SerdeResult<()> {
        let is_server = self.host() == HostType::Server;
        let change = self.inbound_change_kind();

        let mut reader = BitReader::new(data);
        let _scene_id = reader.read_vle_u32()?;
        let entity_id = reader.read_vle_u32()?;

        if !self.validate_action(connections, source) {
            return Ok(());
        }
        let Some(connection) = connections.get(source) else { return Ok(()) };
        let Some(entity_id) = self.resolve_entity_id(connection, entity_id) else {
            return Ok(());
        };
        if scene.entity(entity_id).is_none() {
            warn!("entity {entity_id} not found for CreateAttributes message");
            return Ok(());
        }
        if !self.allow_modify(scene, source, None) {
            return Ok(());
        }

        let mut added: Vec<(ComponentId, u8)> = Vec::new();
        while reader.bits_left() >= 3 * 8 {
            let component_id = reader.read_vle_u32()?;
            let index = reader.read_byte()?;
            let attr_type = reader.read_byte()?;
            let name = reader.read_string()?;

            let Some(component) = scene.entity(entity_id).and_then(|e| e.component(component_id))
            else {
                warn!(
                    "component {component_id} not found in entity {entity_id} for CreateAttributes message, aborting"
                );
                return Ok(());
            };
            if is_server && component.attribute(index).is_some() {
                // Clients may not overwrite existing attributes.
                warn!(
                    "client attempted to overwrite attribute {index} of component {component_id}, aborting CreateAttributes"
                );
                return Ok(());
            }

            if let Err(err) =
                scene.create_attribute(entity_id, component_id, index, attr_type, &name, change)
            {
                warn!("could not create attribute into component {component_id}: {err}, aborting");
                return Ok(());
            }
            if let Err(err) =
                scene.set_attribute_from_binary(entity_id, component_id, index, &mut reader)
            {
                // Roll the attribute back before surfacing the bad stream.
                let _ =
                    scene.remove_attribute(entity_id, component_id, index, ChangeKind::Disconnected);
                return Err(err);
            }
            added.push((component_id, index));
        }

        // Signal values after creating and reading all of them.
        for (component_id, index) in &added {
            scene.emit_attribute_changed(entity_id, *component_id, *index, change);
        }
        self.pump_scene_events(scene, connections);
        if let Some(connection) = connections.get_mut(source) {
            let entity_state = connection.sync_state.entity_state_mut(entity_id);
            for (component_id, index) in &added {
                let component_state = entity_state.component_state_mut(*component_id);
                component_state.new_and_removed_attributes.remove(index);
                component_state.clear_attribute_dirty(*index);
            }
        }
        Ok(())
    }

    // 114

    fn handle_remove_attributes(
        &mut self,
        scene: &mut Scene,
        connections: &mut ConnectionRegistry,
        source: ConnectionId,
        data: &[u8],
    ) -> SerdeResult<()> {
        let change = self.inbound_change_kind();

        let mut reader = BitReader::new(data);
        let _scene_id = reader.read_vle_u32()?;
        let entity_id = reader.read_vle_u32()?;

        if !self.validate_action(connections, source) {
            return Ok(());
        }
        let Some(connection) = connections.get(source) else { return Ok(()) };
        let Some(entity_id) = self.resolve_entity_id(connection, entity_id) else {
            return Ok(());
        };
        if !self.allow_modify(scene, source, Some(entity_id)) {
            return Ok(());
        }
        if scene.entity(entity_id).is_none() {
            warn!("entity {entity_id} not found for RemoveAttributes message");
            return Ok(());
        }

        let mut removed: Vec<(ComponentId, u8)> = Vec::new();
        while reader.bits_left() >= 8 {
            let component_id = reader.read_vle_u32()?;
            let index = reader.read_byte()?;
            if let Err(err) = scene.remove_attribute(entity_id, component_id, index, change) {
                warn!("RemoveAttributes: {err}, disregarding");
                continue;
            }
            removed.push((component_id, index));
        }

        self.pump_scene_events(scene, connections);
        if let Some(connection) = connections.get_mut(source) {
            let entity_state = connection.sync_state.entity_state_mut(entity_id);
            for (component_id, index) in &removed {
                entity_state
                    .component_state_mut(*component_id)
                    .new_and_removed_attributes
                    .remove(index);
            }
        }
        Ok(())
    }

    // 115

    fn handle_remove_components(
        &mut self,
        scene: &mut Scene,
        connections: &mut ConnectionRegistry,
        source: ConnectionId,
        data: &[u8],
    ) -> SerdeResult<()> {
        let change = self.inbound_change_kind();

        let mut reader = BitReader::new(data);
        let _scene_id = reader.read_vle_u32()?;
        let entity_id = reader.read_vle_u32()?;

        if !self.validate_action(connections, source) {
            return Ok(());
        }
        let Some(connection) = connections.get(source) else { return Ok(()) };
        let Some(entity_id) = self.resolve_entity_id(connection, entity_id) else {
            return Ok(());
        };
        if !self.allow_modify(scene, source, Some(entity_id)) {
            return Ok(());
        }
        if scene.entity(entity_id).is_none() {
            warn!("entity {entity_id} not found for RemoveComponents message");
            return Ok(());
        }

        let mut removed: Vec<ComponentId> = Vec::new();
        while reader.bits_left() >= 8 {
            let component_id = reader.read_vle_u32()?;
            if let Err(err) = scene.remove_component(entity_id, component_id, change) {
                warn!("RemoveComponents: {err}, disregarding");
                continue;
            }
            removed.push(component_id);
        }

        self.pump_scene_events(scene, connections);
        if let Some(connection) = connections.get_mut(source) {
            if let Some(entity_state) = connection.sync_state.entities.get_mut(&entity_id) {
                for component_id in &removed {
                    entity_state.remove_component_from_queue(*component_id);
                    entity_state.components.remove(component_id);
                }
            }
        }
        Ok(())
    }

    // 116

    fn handle_remove_entity(
        &mut self,
        scene: &mut Scene,
        connections: &mut ConnectionRegistry,
        source: ConnectionId,
        data: &[u8],
    ) -> SerdeResult<()> {
        let change = self.inbound_change_kind();

        let mut reader = BitReader::new(data);
        let _scene_id = reader.read_vle_u32()?;
        let entity_id = reader.read_vle_u32()?;

        if !self.validate_action(connections, source) {
            return Ok(());
        }
        let Some(connection) = connections.get(source) else { return Ok(()) };
        let Some(entity_id) = self.resolve_entity_id(connection, entity_id) else {
            return Ok(());
        };
        if !self.allow_modify(scene, source, Some(entity_id)) {
            return Ok(());
        }
        if scene.entity(entity_id).is_none() {
            warn!("missing entity {entity_id} for RemoveEntity message");
            return Ok(());
        }

        let _ = scene.remove_entity(entity_id, change);
        self.pump_scene_events(scene, connections);
        if let Some(connection) = connections.get_mut(source) {
            // Erase, not just unqueue, so the delete is not echoed back.
            connection.sync_state.remove_entity_state(entity_id);
        }
        Ok(())
    }

    // 113

    fn handle_edit_attributes(
        &mut self,
        scene: &mut Scene,
        connections: &mut ConnectionRegistry,
        source: ConnectionId,
        data: &[u8],
    ) -> SerdeResult<()> {
        let is_server = self.host() == HostType::Server;
        let change = self.inbound_change_kind();

        let mut reader = BitReader::new(data);
        let _scene_id = reader.read_vle_u32()?;
        let entity_id = reader.read_vle_u32()?;

        if !self.validate_action(connections, source) {
            return Ok(());
        }
        let Some(connection) = connections.get(source) else { return Ok(()) };
        let Some(entity_id) = self.resolve_entity_id(connection, entity_id) else {
            return Ok(());
        };
        if !self.allow_modify(scene, source, Some(entity_id)) {
            return Ok(());
        }
        if scene.entity(entity_id).is_none() {
            warn!("entity {entity_id} not found for EditAttributes message");
            return Ok(());
        }

        // Interpolation length follows the measured update interval, with
        // headroom for receive jitter.
        let mut update_interval = self.update_period();
        if let Some(connection) = connections.get_mut(source) {
            if let Some(entity_state) = connection.sync_state.entities.get_mut(&entity_id) {
                entity_state.refresh_avg_update_interval();
                if entity_state.avg_update_interval > 0.0 {
                    update_interval = entity_state.avg_update_interval;
                }
            }
        }
        update_interval *= 1.25;

        let mut changed: Vec<(ComponentId, u8)> = Vec::new();
        while reader.bits_left() >= 8 {
            let component_id = reader.read_vle_u32()?;
            let block_size = reader.read_vle_u32()? as usize;
            let block = reader.read_bytes(block_size)?;
            let mut attr_reader = BitReader::new(&block);

            if scene.entity(entity_id).and_then(|e| e.component(component_id)).is_none() {
                warn!(
                    "component {component_id} not found in entity {entity_id} for EditAttributes, skipping"
                );
                continue;
            }

            let bitmask_method = attr_reader.read_bit()?;
            if !bitmask_method {
                let count = attr_reader.read_byte()?;
                for _ in 0..count {
                    let index = attr_reader.read_byte()?;
                    if !self.apply_attribute_edit(
                        scene,
                        entity_id,
                        component_id,
                        index,
                        &mut attr_reader,
                        is_server,
                        update_interval,
                        &mut changed,
                    )? {
                        break;
                    }
                }
            } else {
                let slot_count = scene
                    .entity(entity_id)
                    .and_then(|e| e.component(component_id))
                    .map(|c| c.attributes().len())
                    .unwrap_or(0);
                for index in 0..slot_count {
                    // A shorter sender layout simply runs out of bits.
                    if attr_reader.bits_left() == 0 {
                        break;
                    }
                    if attr_reader.read_bit()?
                        && !self.apply_attribute_edit(
                            scene,
                            entity_id,
                            component_id,
                            index as u8,
                            &mut attr_reader,
                            is_server,
                            update_interval,
                            &mut changed,
                        )?
                    {
                        break;
                    }
                }
            }
        }

        // Signal after reading everything, then clear the sender's bits.
        for (component_id, index) in &changed {
            scene.emit_attribute_changed(entity_id, *component_id, *index, change);
        }
        self.pump_scene_events(scene, connections);
        if let Some(connection) = connections.get_mut(source) {
            let entity_state = connection.sync_state.entity_state_mut(entity_id);
            for (component_id, index) in &changed {
                entity_state.component_state_mut(*component_id).clear_attribute_dirty(*index);
            }
        }
        Ok(())
    }

    /// Applies one attribute edit, either directly or through metadata-driven
    /// interpolation on clients. Returns false when the record should stop
    /// the current component block (missing attribute).
    #[allow(clippy::too_many_arguments)]
    fn apply_attribute_edit(
        &mut self,
        scene: &mut Scene,
        entity_id: EntityId,
        component_id: ComponentId,
        index: u8,
        attr_reader: &mut BitReader,
        is_server: bool,
        update_interval: f32,
        changed: &mut Vec<(ComponentId, u8)>,
    ) -> SerdeResult<bool> {
        let Some(attribute) = scene
            .entity(entity_id)
            .and_then(|e| e.component(component_id))
            .and_then(|c| c.attribute(index))
        else {
            warn!("nonexistent attribute {index} in EditAttributes message, skipping component");
            return Ok(false);
        };

        let interpolate = !is_server && attribute.metadata.interpolate;
        if interpolate {
            let end = AttributeValue::from_binary(attribute.type_id(), attr_reader)?;
            let _ = scene.start_attribute_interpolation(
                entity_id,
                component_id,
                index,
                end,
                update_interval,
            );
        } else {
            scene.set_attribute_from_binary(entity_id, component_id, index, attr_reader)?;
            changed.push((component_id, index));
        }
        Ok(true)
    }

    // 117

    fn handle_create_entity_reply(
        &mut self,
        scene: &mut Scene,
        connections: &mut ConnectionRegistry,
        source: ConnectionId,
        data: &[u8],
    ) -> SerdeResult<()> {
        if self.host() == HostType::Server {
            warn!("discarding CreateEntityReply message on server");
            return Ok(());
        }

        let mut reader = BitReader::new(data);
        let _scene_id = reader.read_vle_u32()?;
        let sender_entity_id = reader.read_vle_u32()? | FIRST_UNACKED_ID;
        let entity_id = reader.read_vle_u32()?;

        if let Err(err) = scene.change_entity_id(sender_entity_id, entity_id) {
            warn!("CreateEntityReply: failed to rebind entity id: {err}");
            return Ok(());
        }

        let Some(connection) = connections.get_mut(source) else { return Ok(()) };
        let state = &mut connection.sync_state;
        // The queue must not keep the stale id.
        state.remove_from_queue(sender_entity_id);
        if let Some(mut entity_state) = state.entities.remove(&sender_entity_id) {
            entity_state.id = entity_id;
            state.entities.insert(entity_id, entity_state);
        }

        let rewrite_count = reader.read_vle_u32()?;
        for _ in 0..rewrite_count {
            let sender_component_id = reader.read_vle_u32()? | FIRST_UNACKED_ID;
            let component_id = reader.read_vle_u32()?;
            if let Err(err) = scene.change_component_id(entity_id, sender_component_id, component_id)
            {
                warn!("CreateEntityReply: failed to rebind component id: {err}");
                continue;
            }
            let entity_state = connections
                .get_mut(source)
                .map(|c| c.sync_state.entity_state_mut(entity_id));
            if let Some(entity_state) = entity_state {
                if let Some(mut component_state) =
                    entity_state.components.remove(&sender_component_id)
                {
                    component_state.id = component_id;
                    entity_state.components.insert(component_id, component_state);
                }
            }
        }

        // Everything under its final id gets re-inspected next tick.
        if let Some(connection) = connections.get_mut(source) {
            let component_ids: Vec<ComponentId> = connection
                .sync_state
                .entity_state_mut(entity_id)
                .components
                .keys()
                .copied()
                .collect();
            for component_id in component_ids {
                connection.sync_state.mark_component_dirty(entity_id, component_id);
            }
        }
        Ok(())
    }

    // 118

    fn handle_create_components_reply(
        &mut self,
        scene: &mut Scene,
        connections: &mut ConnectionRegistry,
        source: ConnectionId,
        data: &[u8],
    ) -> SerdeResult<()> {
        if self.host() == HostType::Server {
            warn!("discarding CreateComponentsReply message on server");
            return Ok(());
        }

        let mut reader = BitReader::new(data);
        let _scene_id = reader.read_vle_u32()?;
        let entity_id = reader.read_vle_u32()?;

        if scene.entity(entity_id).is_none() {
            warn!("entity {entity_id} not found for CreateComponentsReply");
            return Ok(());
        }
        if let Some(connection) = connections.get_mut(source) {
            connection.sync_state.remove_from_queue(entity_id);
        }

        let rewrite_count = reader.read_vle_u32()?;
        for _ in 0..rewrite_count {
            let sender_component_id = reader.read_vle_u32()? | FIRST_UNACKED_ID;
            let component_id = reader.read_vle_u32()?;
            if let Err(err) = scene.change_component_id(entity_id, sender_component_id, component_id)
            {
                warn!("CreateComponentsReply: failed to rebind component id: {err}");
                continue;
            }
            if let Some(connection) = connections.get_mut(source) {
                let entity_state = connection.sync_state.entity_state_mut(entity_id);
                if let Some(mut component_state) =
                    entity_state.components.remove(&sender_component_id)
                {
                    component_state.id = component_id;
                    entity_state.components.insert(component_id, component_state);
                }
            }
        }

        if let Some(connection) = connections.get_mut(source) {
            let component_ids: Vec<ComponentId> = connection
                .sync_state
                .entity_state_mut(entity_id)
                .components
                .keys()
                .copied()
                .collect();
            for component_id in component_ids {
                connection.sync_state.mark_component_dirty(entity_id, component_id);
            }
        }
        Ok(())
    }

    // 120

    fn handle_entity_action(
        &mut self,
        scene: &mut Scene,
        connections: &mut ConnectionRegistry,
        source: ConnectionId,
        data: &[u8],
    ) -> SerdeResult<()> {
        let is_server = self.host() == HostType::Server;

        let mut reader = BitReader::new(data);
        let msg = EntityActionMsg::read(&mut reader)?;

        if !self.validate_action(connections, source) {
            return Ok(());
        }
        if scene.entity(msg.entity_id).is_none() {
            warn!(
                "entity {} not found for EntityAction message \"{}\"",
                msg.entity_id, msg.name
            );
            return Ok(());
        }

        // Make the sender queryable for the duration of local execution.
        if is_server {
            self.action_sender = Some(source);
        }

        let mut handled = false;
        if msg.exec_type.contains(ExecType::LOCAL)
            || (is_server && msg.exec_type.contains(ExecType::SERVER))
        {
            // Executed directly so it does not propagate back to the wire.
            scene.exec_local(msg.entity_id, &msg.name, &msg.params);
            handled = true;
        }

        if is_server && msg.exec_type.contains(ExecType::PEERS) {
            let forwarded = EntityActionMsg { exec_type: ExecType::LOCAL, ..msg.clone() };
            for connection in connections.iter_mut() {
                // Never back to the originator.
                if connection.id() != source && connection.is_authenticated() {
                    connection.sync_state.queued_actions.push_back(forwarded.clone());
                }
            }
            handled = true;
        }

        if !handled {
            warn!(
                "received EntityAction \"{}\" went unhandled, type={}",
                msg.name, msg.exec_type.0
            );
        }
        self.action_sender = None;
        Ok(())
    }

    // 123

    fn handle_register_component_type(
        &mut self,
        scene: &mut Scene,
        connections: &mut ConnectionRegistry,
        source: ConnectionId,
        data: &[u8],
    ) -> SerdeResult<()> {
        let is_server = self.host() == HostType::Server;
        let change = self.inbound_change_kind();

        if !self.validate_action(connections, source) {
            return Ok(());
        }

        let mut reader = BitReader::new(data);
        let type_id = reader.read_vle_u32()?;
        let type_name = reader.read_string()?;

        // Remember what the server announced so it is not echoed back in
        // the initial placeholder batch.
        if !is_server {
            self.note_component_type_from_server(type_id);
        }

        let attr_count = reader.read_vle_u32()?;
        let mut attributes = Vec::with_capacity(attr_count.min(256) as usize);
        for _ in 0..attr_count {
            let attr_type = reader.read_byte()?;
            let id = reader.read_string()?;
            let name = reader.read_string()?;
            attributes.push(AttributeSpec { type_id: attr_type, id, name, interpolate: false });
        }

        let descriptor = ComponentTypeDescriptor {
            type_id,
            type_name,
            attributes,
            supports_dynamic_attributes: false,
            placeholder: true,
        };

        // The registration event fans the description out to the other
        // peers; the sender itself is suppressed.
        self.component_type_sender = Some(source);
        scene.register_placeholder_component_type(descriptor, change);
        self.pump_scene_events(scene, connections);
        self.component_type_sender = None;
        Ok(())
    }

    // 119

    fn handle_rigid_body_update(
        &mut self,
        scene: &mut Scene,
        connections: &mut ConnectionRegistry,
        source: ConnectionId,
        packet_id: PacketId,
        data: &[u8],
    ) -> SerdeResult<()> {
        let update_period = self.update_period();

        let mut reader = BitReader::new(data);
        while reader.bits_left() >= 9 {
            let entity_id = reader.read_vle_u32()?;
            let [pos_send_type, rot_send_type, scale_send_type, vel_send_type, ang_vel_send_type] =
                reader.read_arithmetic_encoded(8, [3, 4, 3, 3, 2])?;

            let (new_pos, new_rot) =
                read_optimized_pos_rot(&mut reader, pos_send_type, rot_send_type)?;

            let new_scale = match scale_send_type {
                1 => Some(Vec3::splat(f32::from_bits(reader.read_bits(32)?))),
                2 => Some(Vec3::new(
                    f32::from_bits(reader.read_bits(32)?),
                    f32::from_bits(reader.read_bits(32)?),
                    f32::from_bits(reader.read_bits(32)?),
                )),
                _ => None,
            };

            let new_vel = match vel_send_type {
                1 => {
                    let (x, y, z) = reader.read_vec3(11, 10, 3, 8)?;
                    Some(Vec3::new(x, y, z))
                }
                2 => {
                    let (x, y, z) = reader.read_vec3(11, 10, 10, 8)?;
                    Some(Vec3::new(x, y, z))
                }
                _ => None,
            };

            let new_ang_vel = if ang_vel_send_type == 1 {
                Some(rigid_body::quat_to_ang_vel(read_quat_axis_angle(&mut reader)?))
            } else {
                None
            };

            // Fields are parsed above even when the entity is unknown, so
            // the stream stays in sync for the remaining records.
            let Some(transform) = entity_transform(scene, entity_id) else { continue };
            let rigid_body_comp = scene
                .entity(entity_id)
                .and_then(|e| e.component_of_type(RIGID_BODY_TYPE_ID));
            let mass = rigid_body_comp
                .and_then(|c| crate::scene::registry::real_attribute(c, RIGID_BODY_MASS_INDEX))
                .unwrap_or(0.0);
            let body_vel = rigid_body_comp
                .and_then(|c| vec3_attribute(c, RIGID_BODY_LINEAR_VELOCITY_INDEX))
                .unwrap_or(Vec3::ZERO);
            let body_ang_vel = rigid_body_comp
                .and_then(|c| vec3_attribute(c, RIGID_BODY_ANGULAR_VELOCITY_INDEX))
                .unwrap_or(Vec3::ZERO);
            let has_rigid_body = rigid_body_comp.is_some();
            let is_newtonian = has_rigid_body && mass > 0.0;

            if pos_send_type == 0
                && rot_send_type == 0
                && scale_send_type == 0
                && vel_send_type == 0
                && ang_vel_send_type == 0
            {
                continue;
            }

            let Some(connection) = connections.get_mut(source) else { continue };
            let interpolations = &mut connection.sync_state.interpolations;

            match interpolations.get_mut(&entity_id) {
                Some(interp) => {
                    // Latest-data guarantee: drop stale packets, with
                    // wraparound-aware comparison.
                    if sequence_greater_than(interp.last_received_packet_counter, packet_id) {
                        continue;
                    }
                    interp.last_received_packet_counter = packet_id;

                    // When the sender omitted velocity, keep steering toward
                    // the last received one.
                    let carried_vel = interp.interp_end.vel;
                    let cur_vel = current_curve_velocity(
                        interp.interp_start.pos,
                        interp.interp_start.vel,
                        interp.interp_end.pos,
                        interp.interp_end.vel,
                        interp.interp_time,
                        update_period,
                    );

                    interp.interp_start.pos = transform.pos;
                    interp.interp_start.rot = transform.orientation();
                    interp.interp_start.scale = transform.scale;
                    interp.interp_start.vel = cur_vel;
                    interp.interp_start.ang_vel = Vec3::ZERO;
                    if let Some(pos) = new_pos {
                        interp.interp_end.pos = pos;
                    }
                    if let Some(rot) = new_rot {
                        interp.interp_end.rot = rot;
                    }
                    if let Some(scale) = new_scale {
                        interp.interp_end.scale = scale;
                    }
                    interp.interp_end.vel = new_vel.unwrap_or(carried_vel);
                    if let Some(ang_vel) = new_ang_vel {
                        interp.interp_end.ang_vel = ang_vel;
                    }
                    interp.interp_time = 0.0;
                    interp.interpolator_active = true;

                    if !is_newtonian {
                        interp.interp_start.vel = Vec3::ZERO;
                        interp.interp_end.vel = Vec3::ZERO;
                    }
                }
                None => {
                    let mut interp = RigidBodyInterpolationState {
                        interp_time: 0.0,
                        interpolator_active: true,
                        last_received_packet_counter: packet_id,
                        client_extrapolating: false,
                        ..Default::default()
                    };
                    interp.interp_start.pos = transform.pos;
                    interp.interp_start.rot = transform.orientation();
                    interp.interp_start.scale = transform.scale;
                    interp.interp_start.vel = body_vel;
                    interp.interp_start.ang_vel = body_ang_vel;
                    interp.interp_end.pos = new_pos.unwrap_or(transform.pos);
                    interp.interp_end.rot = new_rot.unwrap_or_else(|| transform.orientation());
                    interp.interp_end.scale = new_scale.unwrap_or(transform.scale);
                    interp.interp_end.vel = new_vel.unwrap_or(body_vel);
                    interp.interp_end.ang_vel = new_ang_vel.unwrap_or(body_ang_vel);
                    if !is_newtonian {
                        interp.interp_start.vel = Vec3::ZERO;
                        interp.interp_end.vel = Vec3::ZERO;
                    }
                    interpolations.insert(entity_id, interp);
                }
            }
        }
        Ok(())
    }
}
