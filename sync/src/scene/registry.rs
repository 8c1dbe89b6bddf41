//! The component type registry: schemas for natively known component types
//! plus placeholder types described over the wire.

use std::collections::BTreeMap;

use glam::Vec3;

use crate::{
    math::Transform,
    scene::{
        attribute::{attr_type, Attribute, AttributeMetadata, AttributeValue},
        component::Component,
    },
    types::{ComponentId, ComponentTypeId},
};

pub const PLACEABLE_TYPE_ID: ComponentTypeId = 20;
pub const RIGID_BODY_TYPE_ID: ComponentTypeId = 23;
pub const DYNAMIC_COMPONENT_TYPE_ID: ComponentTypeId = 25;
pub const NAME_TYPE_ID: ComponentTypeId = 26;

/// Attribute index of the transform on a `Placeable`.
pub const PLACEABLE_TRANSFORM_INDEX: u8 = 0;
/// Attribute indices on a `RigidBody`.
pub const RIGID_BODY_MASS_INDEX: u8 = 0;
pub const RIGID_BODY_LINEAR_VELOCITY_INDEX: u8 = 5;
pub const RIGID_BODY_ANGULAR_VELOCITY_INDEX: u8 = 6;

/// One attribute slot in a component type schema.
#[derive(Clone, Debug, PartialEq)]
pub struct AttributeSpec {
    pub type_id: u8,
    /// Machine id of the attribute, sent in type descriptions.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    pub interpolate: bool,
}

impl AttributeSpec {
    fn new(type_id: u8, id: &str, name: &str) -> Self {
        Self {
            type_id,
            id: id.into(),
            name: name.into(),
            interpolate: false,
        }
    }

    fn interpolated(mut self) -> Self {
        self.interpolate = true;
        self
    }
}

/// Schema of a component type: what its static attribute prefix looks like
/// and whether it accepts dynamic attributes.
#[derive(Clone, Debug, PartialEq)]
pub struct ComponentTypeDescriptor {
    pub type_id: ComponentTypeId,
    pub type_name: String,
    pub attributes: Vec<AttributeSpec>,
    pub supports_dynamic_attributes: bool,
    /// Described by schema rather than natively known. Only placeholder
    /// descriptors are announced to peers.
    pub placeholder: bool,
}

#[derive(Clone, Debug)]
pub struct ComponentTypeRegistry {
    types: BTreeMap<ComponentTypeId, ComponentTypeDescriptor>,
}

impl Default for ComponentTypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ComponentTypeRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self { types: BTreeMap::new() };
        registry.register_native(ComponentTypeDescriptor {
            type_id: PLACEABLE_TYPE_ID,
            type_name: "Placeable".into(),
            attributes: vec![
                AttributeSpec::new(attr_type::TRANSFORM, "transform", "Transform").interpolated(),
                AttributeSpec::new(attr_type::BOOL, "visible", "Visible"),
            ],
            supports_dynamic_attributes: false,
            placeholder: false,
        });
        registry.register_native(ComponentTypeDescriptor {
            type_id: RIGID_BODY_TYPE_ID,
            type_name: "RigidBody".into(),
            attributes: vec![
                AttributeSpec::new(attr_type::REAL, "mass", "Mass"),
                AttributeSpec::new(attr_type::REAL, "friction", "Friction"),
                AttributeSpec::new(attr_type::REAL, "restitution", "Restitution"),
                AttributeSpec::new(attr_type::REAL, "linearDamping", "Linear damping"),
                AttributeSpec::new(attr_type::REAL, "angularDamping", "Angular damping"),
                AttributeSpec::new(attr_type::FLOAT3, "linearVelocity", "Linear velocity"),
                AttributeSpec::new(attr_type::FLOAT3, "angularVelocity", "Angular velocity"),
            ],
            supports_dynamic_attributes: false,
            placeholder: false,
        });
        registry.register_native(ComponentTypeDescriptor {
            type_id: DYNAMIC_COMPONENT_TYPE_ID,
            type_name: "DynamicComponent".into(),
            attributes: Vec::new(),
            supports_dynamic_attributes: true,
            placeholder: false,
        });
        registry.register_native(ComponentTypeDescriptor {
            type_id: NAME_TYPE_ID,
            type_name: "Name".into(),
            attributes: vec![
                AttributeSpec::new(attr_type::STRING, "name", "Name"),
                AttributeSpec::new(attr_type::STRING, "description", "Description"),
            ],
            supports_dynamic_attributes: false,
            placeholder: false,
        });
        registry
    }

    fn register_native(&mut self, descriptor: ComponentTypeDescriptor) {
        self.types.insert(descriptor.type_id, descriptor);
    }

    /// Registers or updates a placeholder type description. A natively known
    /// type is never overwritten. Returns true if the registry changed.
    pub fn register_placeholder(&mut self, descriptor: ComponentTypeDescriptor) -> bool {
        match self.types.get(&descriptor.type_id) {
            Some(existing) if !existing.placeholder => false,
            Some(existing) if *existing == descriptor => false,
            _ => {
                self.types.insert(
                    descriptor.type_id,
                    ComponentTypeDescriptor { placeholder: true, ..descriptor },
                );
                true
            }
        }
    }

    pub fn descriptor(&self, type_id: ComponentTypeId) -> Option<&ComponentTypeDescriptor> {
        self.types.get(&type_id)
    }

    pub fn placeholder_type_ids(&self) -> Vec<ComponentTypeId> {
        self.types
            .values()
            .filter(|d| d.placeholder)
            .map(|d| d.type_id)
            .collect()
    }

    /// Builds a component of `type_id` with its static attribute prefix at
    /// default values. Returns `None` for unknown types.
    pub fn instantiate(
        &self,
        component_id: ComponentId,
        type_id: ComponentTypeId,
        name: &str,
    ) -> Option<Component> {
        let descriptor = self.types.get(&type_id)?;
        let mut static_attributes = Vec::with_capacity(descriptor.attributes.len());
        for spec in &descriptor.attributes {
            // Unknown attribute types in a (possibly hostile) placeholder
            // schema were rejected at registration.
            let value = AttributeValue::default_for(spec.type_id).ok()?;
            let mut attribute = Attribute::new_static(spec.id.clone(), value);
            attribute.metadata = AttributeMetadata { interpolate: spec.interpolate };
            static_attributes.push(attribute);
        }
        Some(Component::new(
            component_id,
            type_id,
            descriptor.type_name.clone(),
            name.into(),
            descriptor.supports_dynamic_attributes,
            static_attributes,
        ))
    }
}

/// Typed views over the built-in component schemas, used by the rigid-body
/// channel.
pub fn transform_of(component: &Component) -> Option<Transform> {
    match component.attribute_value(PLACEABLE_TRANSFORM_INDEX) {
        Some(AttributeValue::Transform(t)) => Some(*t),
        _ => None,
    }
}

pub fn vec3_attribute(component: &Component, index: u8) -> Option<Vec3> {
    match component.attribute_value(index) {
        Some(AttributeValue::Float3(v)) => Some(*v),
        _ => None,
    }
}

pub fn real_attribute(component: &Component, index: u8) -> Option<f32> {
    match component.attribute_value(index) {
        Some(AttributeValue::Real(v)) => Some(*v),
        _ => None,
    }
}
