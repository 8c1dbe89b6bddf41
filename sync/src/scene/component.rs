use crate::{
    error::SceneError,
    scene::attribute::{Attribute, AttributeValue},
    types::{is_local_id, is_unacked_id, AttributeIndex, ComponentId, ComponentTypeId},
};

/// A typed bag of attributes owned by an entity.
///
/// The attribute list is an index-stable vector: the static prefix comes
/// from the component type, dynamic attributes follow, and removal leaves a
/// hole instead of renumbering.
#[derive(Clone, Debug)]
pub struct Component {
    id: ComponentId,
    type_id: ComponentTypeId,
    type_name: String,
    pub name: String,
    pub replicated: bool,
    supports_dynamic_attributes: bool,
    static_count: usize,
    attributes: Vec<Option<Attribute>>,
}

impl Component {
    pub(crate) fn new(
        id: ComponentId,
        type_id: ComponentTypeId,
        type_name: String,
        name: String,
        supports_dynamic_attributes: bool,
        static_attributes: Vec<Attribute>,
    ) -> Self {
        let static_count = static_attributes.len();
        Self {
            id,
            type_id,
            type_name,
            name,
            replicated: !is_local_id(id),
            supports_dynamic_attributes,
            static_count,
            attributes: static_attributes.into_iter().map(Some).collect(),
        }
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: ComponentId) {
        self.id = id;
        self.replicated = !is_local_id(id);
    }

    pub fn type_id(&self) -> ComponentTypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_local(&self) -> bool {
        is_local_id(self.id) || !self.replicated
    }

    pub fn is_unacked(&self) -> bool {
        is_unacked_id(self.id)
    }

    pub fn supports_dynamic_attributes(&self) -> bool {
        self.supports_dynamic_attributes
    }

    pub fn num_static_attributes(&self) -> usize {
        self.static_count
    }

    /// All attribute slots, holes included.
    pub fn attributes(&self) -> &[Option<Attribute>] {
        &self.attributes
    }

    pub fn attribute(&self, index: AttributeIndex) -> Option<&Attribute> {
        self.attributes.get(index as usize)?.as_ref()
    }

    pub fn attribute_mut(&mut self, index: AttributeIndex) -> Option<&mut Attribute> {
        self.attributes.get_mut(index as usize)?.as_mut()
    }

    /// Convenience typed accessors used by the rigid-body channel.
    pub fn attribute_value(&self, index: AttributeIndex) -> Option<&AttributeValue> {
        self.attribute(index).map(|a| &a.value)
    }

    /// Creates a dynamic attribute at `index`. The slot must be free and at
    /// or past the static prefix.
    pub(crate) fn create_attribute(
        &mut self,
        index: AttributeIndex,
        type_id: u8,
        name: &str,
    ) -> Result<(), SceneError> {
        if !self.supports_dynamic_attributes {
            return Err(SceneError::DynamicAttributesUnsupported(self.id));
        }
        if (index as usize) < self.static_count {
            return Err(SceneError::InvalidAttributeIndex { component: self.id, index });
        }
        if self.attribute(index).is_some() {
            return Err(SceneError::InvalidAttributeIndex { component: self.id, index });
        }
        let value = AttributeValue::default_for(type_id)?;
        if self.attributes.len() <= index as usize {
            self.attributes.resize(index as usize + 1, None);
        }
        self.attributes[index as usize] = Some(Attribute::new_dynamic(name, value));
        Ok(())
    }

    /// Clears a dynamic attribute slot. Indices of other attributes do not
    /// shift.
    pub(crate) fn remove_attribute(&mut self, index: AttributeIndex) -> Result<(), SceneError> {
        if (index as usize) < self.static_count || self.attribute(index).is_none() {
            return Err(SceneError::InvalidAttributeIndex { component: self.id, index });
        }
        self.attributes[index as usize] = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::attribute::attr_type;
    use crate::types::FIRST_LOCAL_ID;

    fn dynamic_component(id: ComponentId) -> Component {
        Component::new(id, 25, "DynamicComponent".into(), String::new(), true, Vec::new())
    }

    #[test]
    fn removal_does_not_renumber() {
        let mut comp = dynamic_component(1);
        comp.create_attribute(0, attr_type::INT, "a").unwrap();
        comp.create_attribute(1, attr_type::INT, "b").unwrap();
        comp.create_attribute(2, attr_type::INT, "c").unwrap();
        comp.remove_attribute(1).unwrap();
        assert!(comp.attribute(1).is_none());
        assert_eq!(comp.attribute(2).unwrap().name, "c");
    }

    #[test]
    fn static_prefix_is_protected() {
        let mut comp = Component::new(
            1,
            20,
            "Placeable".into(),
            String::new(),
            false,
            vec![Attribute::new_static("transform", AttributeValue::Int(0))],
        );
        assert!(comp.create_attribute(1, attr_type::INT, "x").is_err());
        assert!(comp.remove_attribute(0).is_err());
    }

    #[test]
    fn locality_follows_id_range() {
        assert!(!dynamic_component(5).is_local());
        assert!(dynamic_component(FIRST_LOCAL_ID | 5).is_local());
    }
}
