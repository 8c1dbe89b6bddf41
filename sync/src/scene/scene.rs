use std::collections::BTreeMap;

use log::warn;

use undine_serde::{BitReader, SerdeResult};

use crate::{
    error::SceneError,
    math::Transform,
    scene::{
        attribute::AttributeValue,
        event::SceneEvent,
        registry::{transform_of, ComponentTypeDescriptor, ComponentTypeRegistry, PLACEABLE_TYPE_ID},
    },
    scene::entity::Entity,
    types::{
        is_local_id, AttributeIndex, ChangeKind, ComponentId, ConnectionId, EntityId, ExecType,
        HostType, FIRST_LOCAL_ID, FIRST_REPLICATED_ID, FIRST_UNACKED_ID, LAST_REPLICATED_ID,
    },
};

/// Server-side authorization predicate: may `connection` modify `entity`
/// (`None` = create new entities)?
pub type ModifyFilter = Box<dyn Fn(ConnectionId, Option<&Entity>) -> bool>;

/// Invoked for every locally executed entity action.
pub type ActionHandler = Box<dyn FnMut(EntityId, &str, &[String])>;

struct AttributeInterpolation {
    entity: EntityId,
    component: ComponentId,
    index: AttributeIndex,
    start: AttributeValue,
    end: AttributeValue,
    time: f32,
    length: f32,
}

/// The replicated scene graph: entities, components, typed attributes,
/// parent links, and the change bus the sync core drains.
pub struct Scene {
    host: HostType,
    entities: BTreeMap<EntityId, Entity>,
    registry: ComponentTypeRegistry,
    next_replicated_id: u32,
    next_unacked_id: u32,
    next_local_id: u32,
    next_replicated_component_id: u32,
    next_unacked_component_id: u32,
    events: Vec<SceneEvent>,
    interpolations: Vec<AttributeInterpolation>,
    applying_interpolation: bool,
    modify_filter: Option<ModifyFilter>,
    action_handler: Option<ActionHandler>,
}

impl Scene {
    /// A server scene allocates final replicated ids; a client scene
    /// allocates optimistic ids from the unacked range.
    pub fn new(host: HostType) -> Self {
        Self {
            host,
            entities: BTreeMap::new(),
            registry: ComponentTypeRegistry::with_builtins(),
            next_replicated_id: FIRST_REPLICATED_ID,
            // The optimistic ranges start one past their floor so the
            // masked wire form of an allocated id is never the reserved 0.
            next_unacked_id: FIRST_UNACKED_ID | 1,
            next_local_id: FIRST_LOCAL_ID,
            next_replicated_component_id: FIRST_REPLICATED_ID,
            next_unacked_component_id: FIRST_UNACKED_ID | 1,
            events: Vec::new(),
            interpolations: Vec::new(),
            applying_interpolation: false,
            modify_filter: None,
            action_handler: None,
        }
    }

    pub fn registry(&self) -> &ComponentTypeRegistry {
        &self.registry
    }

    pub fn set_modify_filter(&mut self, filter: ModifyFilter) {
        self.modify_filter = Some(filter);
    }

    pub fn set_action_handler(&mut self, handler: ActionHandler) {
        self.action_handler = Some(handler);
    }

    /// Server-side authorization hook consulted before applying a client
    /// mutation. Defaults to allow.
    pub fn allow_modify_entity(&self, connection: ConnectionId, entity: Option<&Entity>) -> bool {
        match &self.modify_filter {
            Some(filter) => filter(connection, entity),
            None => true,
        }
    }

    // Ids

    /// Next free server-assigned replicated id.
    pub fn next_free_id(&mut self) -> EntityId {
        while self.entities.contains_key(&self.next_replicated_id)
            || self.next_replicated_id > LAST_REPLICATED_ID
        {
            if self.next_replicated_id > LAST_REPLICATED_ID {
                self.next_replicated_id = FIRST_REPLICATED_ID;
            } else {
                self.next_replicated_id += 1;
            }
        }
        self.next_replicated_id
    }

    pub fn next_unacked_id(&mut self) -> EntityId {
        while self.entities.contains_key(&self.next_unacked_id)
            || self.next_unacked_id >= FIRST_LOCAL_ID
        {
            if self.next_unacked_id >= FIRST_LOCAL_ID {
                self.next_unacked_id = FIRST_UNACKED_ID | 1;
            } else {
                self.next_unacked_id += 1;
            }
        }
        self.next_unacked_id
    }

    pub fn next_local_id(&mut self) -> EntityId {
        while self.entities.contains_key(&self.next_local_id) {
            self.next_local_id = self.next_local_id.wrapping_add(1) | FIRST_LOCAL_ID;
        }
        self.next_local_id
    }

    fn allocate_entity_id(&mut self) -> EntityId {
        match self.host {
            HostType::Server => self.next_free_id(),
            HostType::Client => self.next_unacked_id(),
        }
    }

    fn allocate_component_id(&mut self) -> ComponentId {
        let (next, limit) = match self.host {
            HostType::Server => (&mut self.next_replicated_component_id, LAST_REPLICATED_ID),
            HostType::Client => (&mut self.next_unacked_component_id, FIRST_LOCAL_ID - 1),
        };
        let id = *next;
        *next = if id >= limit {
            match self.host {
                HostType::Server => FIRST_REPLICATED_ID,
                HostType::Client => FIRST_UNACKED_ID | 1,
            }
        } else {
            id + 1
        };
        id
    }

    // Entities

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    /// Creates an entity. Id 0 allocates: final ids on a server, optimistic
    /// unacked ids on a client.
    pub fn create_entity(&mut self, id: EntityId, change: ChangeKind) -> Result<EntityId, SceneError> {
        let id = if id == 0 { self.allocate_entity_id() } else { id };
        if self.entities.contains_key(&id) {
            return Err(SceneError::EntityExists(id));
        }
        self.entities.insert(id, Entity::new(id));
        self.emit_entity_created(id, change);
        Ok(id)
    }

    /// Emits the creation event for an already-built entity. Used to signal
    /// one coherent whole-entity state after inbound deserialization.
    pub fn emit_entity_created(&mut self, id: EntityId, change: ChangeKind) {
        if change.resolve() == ChangeKind::Replicate && !is_local_id(id) {
            self.events.push(SceneEvent::EntityCreated { entity: id });
        }
    }

    pub fn remove_entity(&mut self, id: EntityId, change: ChangeKind) -> Result<(), SceneError> {
        if self.entities.remove(&id).is_none() {
            return Err(SceneError::EntityNotFound(id));
        }
        self.interpolations.retain(|i| i.entity != id);
        if change.resolve() == ChangeKind::Replicate && !is_local_id(id) {
            self.events.push(SceneEvent::EntityRemoved { entity: id });
        }
        Ok(())
    }

    /// Rebinds an entity to a new id, preserving parent links in children.
    pub fn change_entity_id(&mut self, old: EntityId, new: EntityId) -> Result<(), SceneError> {
        if new == 0 {
            return Err(SceneError::ReservedId);
        }
        let mut entity = self.entities.remove(&old).ok_or(SceneError::EntityNotFound(old))?;
        if self.entities.contains_key(&new) {
            self.entities.insert(old, entity);
            return Err(SceneError::EntityExists(new));
        }
        entity.set_id(new);
        self.entities.insert(new, entity);
        for other in self.entities.values_mut() {
            if other.parent() == Some(old) {
                other.set_parent(Some(new));
            }
        }
        for interp in &mut self.interpolations {
            if interp.entity == old {
                interp.entity = new;
            }
        }
        Ok(())
    }

    pub fn set_temporary(&mut self, id: EntityId, temporary: bool, change: ChangeKind) -> Result<(), SceneError> {
        let entity = self.entity_mut(id).ok_or(SceneError::EntityNotFound(id))?;
        let local = entity.is_local();
        entity.set_temporary(temporary);
        if change.resolve() == ChangeKind::Replicate && !local {
            self.events.push(SceneEvent::EntityPropertiesChanged { entity: id });
        }
        Ok(())
    }

    /// Reparents an entity (`None` = unparented). A replicated entity linked
    /// under a local parent keeps the link in the scene but the change is
    /// never replicated.
    pub fn set_parent(
        &mut self,
        id: EntityId,
        parent: Option<EntityId>,
        change: ChangeKind,
    ) -> Result<(), SceneError> {
        if let Some(parent_id) = parent {
            if !self.entities.contains_key(&parent_id) {
                return Err(SceneError::EntityNotFound(parent_id));
            }
        }
        let entity = self.entity_mut(id).ok_or(SceneError::EntityNotFound(id))?;
        let local = entity.is_local();
        entity.set_parent(parent);
        let parent_is_local = parent.map(is_local_id).unwrap_or(false);
        if !local && parent_is_local {
            warn!("replicated entity {id} is parented to a local entity, cannot replicate the link");
            return Ok(());
        }
        if change.resolve() == ChangeKind::Replicate && !local {
            self.events.push(SceneEvent::EntityParentChanged { entity: id });
        }
        Ok(())
    }

    // Components

    /// Creates a component on an entity. Component id 0 allocates.
    pub fn create_component_with_id(
        &mut self,
        entity_id: EntityId,
        component_id: ComponentId,
        type_id: u32,
        name: &str,
        change: ChangeKind,
    ) -> Result<ComponentId, SceneError> {
        let component_id = if component_id == 0 {
            self.allocate_component_id()
        } else {
            component_id
        };
        let component = self
            .registry
            .instantiate(component_id, type_id, name)
            .ok_or(SceneError::UnknownComponentType(type_id))?;
        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(SceneError::EntityNotFound(entity_id))?;
        if entity.component(component_id).is_some() {
            return Err(SceneError::ComponentExists { entity: entity_id, component: component_id });
        }
        let entity_local = entity.is_local();
        let component_local = component.is_local();
        entity.insert_component(component);
        if change.resolve() == ChangeKind::Replicate && !entity_local && !component_local {
            self.events.push(SceneEvent::ComponentAdded {
                entity: entity_id,
                component: component_id,
            });
        }
        Ok(component_id)
    }

    pub fn remove_component(
        &mut self,
        entity_id: EntityId,
        component_id: ComponentId,
        change: ChangeKind,
    ) -> Result<(), SceneError> {
        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(SceneError::EntityNotFound(entity_id))?;
        let entity_local = entity.is_local();
        let component = entity
            .take_component(component_id)
            .ok_or(SceneError::ComponentNotFound { entity: entity_id, component: component_id })?;
        self.interpolations
            .retain(|i| !(i.entity == entity_id && i.component == component_id));
        if change.resolve() == ChangeKind::Replicate && !entity_local && !component.is_local() {
            self.events.push(SceneEvent::ComponentRemoved {
                entity: entity_id,
                component: component_id,
            });
        }
        Ok(())
    }

    pub fn change_component_id(
        &mut self,
        entity_id: EntityId,
        old: ComponentId,
        new: ComponentId,
    ) -> Result<(), SceneError> {
        if new == 0 {
            return Err(SceneError::ReservedId);
        }
        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(SceneError::EntityNotFound(entity_id))?;
        if entity.change_component_id(old, new) {
            for interp in &mut self.interpolations {
                if interp.entity == entity_id && interp.component == old {
                    interp.component = new;
                }
            }
            Ok(())
        } else {
            Err(SceneError::ComponentNotFound { entity: entity_id, component: old })
        }
    }

    // Attributes

    fn is_replicated_attribute_target(&self, entity_id: EntityId, component_id: ComponentId) -> bool {
        match self.entity(entity_id) {
            Some(entity) if !entity.is_local() => entity
                .component(component_id)
                .map(|c| !c.is_local())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Sets an attribute value. A local write to an attribute currently
    /// interpolating on a client immediately ends that interpolation.
    pub fn set_attribute(
        &mut self,
        entity_id: EntityId,
        component_id: ComponentId,
        index: AttributeIndex,
        value: AttributeValue,
        change: ChangeKind,
    ) -> Result<(), SceneError> {
        if !self.applying_interpolation {
            self.end_attribute_interpolation(entity_id, component_id, index);
        }
        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(SceneError::EntityNotFound(entity_id))?;
        let component = entity
            .component_mut(component_id)
            .ok_or(SceneError::ComponentNotFound { entity: entity_id, component: component_id })?;
        let attribute = component
            .attribute_mut(index)
            .ok_or(SceneError::InvalidAttributeIndex { component: component_id, index })?;
        if attribute.value.type_id() != value.type_id() {
            return Err(SceneError::UnknownAttributeType(value.type_id()));
        }
        attribute.value = value;
        self.emit_attribute_changed(entity_id, component_id, index, change);
        Ok(())
    }

    /// Deserializes an attribute value in place, silently (the wire apply
    /// path; the coherent change event is emitted afterwards by the caller).
    pub fn set_attribute_from_binary(
        &mut self,
        entity_id: EntityId,
        component_id: ComponentId,
        index: AttributeIndex,
        reader: &mut BitReader,
    ) -> SerdeResult<()> {
        let Some(attribute) = self
            .entities
            .get_mut(&entity_id)
            .and_then(|e| e.component_mut(component_id))
            .and_then(|c| c.attribute_mut(index))
        else {
            return Err(undine_serde::SerdeErr::InvalidValue { context: "missing attribute target" });
        };
        attribute.value = AttributeValue::from_binary(attribute.value.type_id(), reader)?;
        Ok(())
    }

    /// Emits the creation event for an already-built component, for the
    /// same deferred coherent-state signaling as entity creation.
    pub fn emit_component_added(
        &mut self,
        entity_id: EntityId,
        component_id: ComponentId,
        change: ChangeKind,
    ) {
        if change.resolve() == ChangeKind::Replicate
            && self.is_replicated_attribute_target(entity_id, component_id)
        {
            self.events.push(SceneEvent::ComponentAdded {
                entity: entity_id,
                component: component_id,
            });
        }
    }

    pub fn emit_attribute_changed(
        &mut self,
        entity_id: EntityId,
        component_id: ComponentId,
        index: AttributeIndex,
        change: ChangeKind,
    ) {
        if change.resolve() == ChangeKind::Replicate
            && self.is_replicated_attribute_target(entity_id, component_id)
        {
            self.events.push(SceneEvent::AttributeChanged {
                entity: entity_id,
                component: component_id,
                index,
            });
        }
    }

    /// Creates a dynamic attribute. Creation and removal of attributes on a
    /// replicated component always replicate (both ends must agree on the
    /// attribute count to exchange bitmasks); only `Disconnected` stays
    /// silent.
    pub fn create_attribute(
        &mut self,
        entity_id: EntityId,
        component_id: ComponentId,
        index: AttributeIndex,
        type_id: u8,
        name: &str,
        change: ChangeKind,
    ) -> Result<(), SceneError> {
        let replicated = self.is_replicated_attribute_target(entity_id, component_id);
        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(SceneError::EntityNotFound(entity_id))?;
        let component = entity
            .component_mut(component_id)
            .ok_or(SceneError::ComponentNotFound { entity: entity_id, component: component_id })?;
        component.create_attribute(index, type_id, name)?;
        if change != ChangeKind::Disconnected && replicated {
            self.events.push(SceneEvent::AttributeAdded {
                entity: entity_id,
                component: component_id,
                index,
            });
        }
        Ok(())
    }

    pub fn remove_attribute(
        &mut self,
        entity_id: EntityId,
        component_id: ComponentId,
        index: AttributeIndex,
        change: ChangeKind,
    ) -> Result<(), SceneError> {
        let replicated = self.is_replicated_attribute_target(entity_id, component_id);
        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(SceneError::EntityNotFound(entity_id))?;
        let component = entity
            .component_mut(component_id)
            .ok_or(SceneError::ComponentNotFound { entity: entity_id, component: component_id })?;
        component.remove_attribute(index)?;
        self.interpolations.retain(|i| {
            !(i.entity == entity_id && i.component == component_id && i.index == index)
        });
        if change != ChangeKind::Disconnected && replicated {
            self.events.push(SceneEvent::AttributeRemoved {
                entity: entity_id,
                component: component_id,
                index,
            });
        }
        Ok(())
    }

    // Component types

    /// Registers a placeholder component type described by schema. Returns
    /// true if the registry changed.
    pub fn register_placeholder_component_type(
        &mut self,
        descriptor: ComponentTypeDescriptor,
        change: ChangeKind,
    ) -> bool {
        let type_id = descriptor.type_id;
        let changed = self.registry.register_placeholder(descriptor);
        if changed && change.resolve() == ChangeKind::Replicate {
            self.events.push(SceneEvent::ComponentTypeRegistered { type_id });
        }
        changed
    }

    // Actions

    /// Triggers an entity action. The `Local` bit executes here and now;
    /// `Server` and `Peers` routing is performed by the sync core.
    pub fn trigger_action(
        &mut self,
        entity_id: EntityId,
        name: &str,
        params: &[String],
        exec_type: ExecType,
    ) -> Result<(), SceneError> {
        if !self.entities.contains_key(&entity_id) {
            return Err(SceneError::EntityNotFound(entity_id));
        }
        if exec_type.contains(ExecType::LOCAL) {
            self.exec_local(entity_id, name, params);
        }
        self.events.push(SceneEvent::ActionTriggered {
            entity: entity_id,
            name: name.to_string(),
            params: params.to_vec(),
            exec_type,
        });
        Ok(())
    }

    /// Executes an action locally without re-entering the network path.
    pub fn exec_local(&mut self, entity_id: EntityId, name: &str, params: &[String]) {
        if let Some(handler) = &mut self.action_handler {
            handler(entity_id, name, params);
        }
    }

    // Attribute interpolation (metadata-driven, client side)

    /// Begins interpolating an attribute toward `end` over `length` seconds.
    /// If an interpolation is already live for the slot it continues from
    /// the current interpolated value.
    pub fn start_attribute_interpolation(
        &mut self,
        entity_id: EntityId,
        component_id: ComponentId,
        index: AttributeIndex,
        end: AttributeValue,
        length: f32,
    ) -> Result<(), SceneError> {
        let start = self
            .entity(entity_id)
            .and_then(|e| e.component(component_id))
            .and_then(|c| c.attribute(index))
            .map(|a| a.value.clone())
            .ok_or(SceneError::InvalidAttributeIndex { component: component_id, index })?;
        self.end_attribute_interpolation(entity_id, component_id, index);
        self.interpolations.push(AttributeInterpolation {
            entity: entity_id,
            component: component_id,
            index,
            start,
            end,
            time: 0.0,
            length: length.max(1e-4),
        });
        Ok(())
    }

    /// Stops a live interpolation. Returns whether one was active.
    pub fn end_attribute_interpolation(
        &mut self,
        entity_id: EntityId,
        component_id: ComponentId,
        index: AttributeIndex,
    ) -> bool {
        let before = self.interpolations.len();
        self.interpolations.retain(|i| {
            !(i.entity == entity_id && i.component == component_id && i.index == index)
        });
        before != self.interpolations.len()
    }

    /// True while the scene itself is applying interpolated values.
    pub fn is_interpolating(&self) -> bool {
        self.applying_interpolation
    }

    /// Advances all attribute interpolations by `dt` seconds.
    pub fn update_interpolations(&mut self, dt: f32) {
        let mut interpolations = std::mem::take(&mut self.interpolations);
        self.applying_interpolation = true;
        interpolations.retain_mut(|interp| {
            interp.time += dt;
            let t = (interp.time / interp.length).clamp(0.0, 1.0);
            let value = interp.start.lerp(&interp.end, t);
            let applied = self
                .set_attribute(interp.entity, interp.component, interp.index, value, ChangeKind::LocalOnly)
                .is_ok();
            applied && t < 1.0
        });
        self.applying_interpolation = false;
        // New interpolations may have been scheduled from the action handler
        // while applying; keep both sets.
        interpolations.append(&mut self.interpolations);
        self.interpolations = interpolations;
    }

    // Spatial helpers

    /// World transform of an entity, composed through its parent chain via
    /// `Placeable` components.
    pub fn world_transform(&self, entity_id: EntityId) -> Option<Transform> {
        let entity = self.entity(entity_id)?;
        let local = transform_of(entity.component_of_type(PLACEABLE_TYPE_ID)?)?;
        let mut world = local;
        let mut current = entity.parent();
        let mut depth = 0;
        while let Some(parent_id) = current {
            // Defend against parent cycles introduced by a misbehaving peer.
            depth += 1;
            if depth > 64 {
                break;
            }
            let Some(parent) = self.entity(parent_id) else { break };
            if let Some(parent_transform) =
                parent.component_of_type(PLACEABLE_TYPE_ID).and_then(transform_of)
            {
                world = parent_transform.compose(&world);
            }
            current = parent.parent();
        }
        Some(world)
    }

    /// Drains the pending change events in emission order.
    pub fn drain_events(&mut self) -> Vec<SceneEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }
}
