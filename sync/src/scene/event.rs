use crate::types::{AttributeIndex, ComponentId, ComponentTypeId, EntityId, ExecType};

/// Change notifications emitted by the scene and drained by the sync core.
///
/// Observers see events in emission order. Events are emitted only for
/// replicated targets and `Replicate`-kind changes; `Disconnected` mutations
/// stay silent and `LocalOnly` ones never reach this queue.
#[derive(Clone, Debug, PartialEq)]
pub enum SceneEvent {
    AttributeChanged {
        entity: EntityId,
        component: ComponentId,
        index: AttributeIndex,
    },
    AttributeAdded {
        entity: EntityId,
        component: ComponentId,
        index: AttributeIndex,
    },
    AttributeRemoved {
        entity: EntityId,
        component: ComponentId,
        index: AttributeIndex,
    },
    ComponentAdded {
        entity: EntityId,
        component: ComponentId,
    },
    ComponentRemoved {
        entity: EntityId,
        component: ComponentId,
    },
    EntityCreated {
        entity: EntityId,
    },
    EntityRemoved {
        entity: EntityId,
    },
    /// The temporary flag toggled.
    EntityPropertiesChanged {
        entity: EntityId,
    },
    EntityParentChanged {
        entity: EntityId,
    },
    ActionTriggered {
        entity: EntityId,
        name: String,
        params: Vec<String>,
        exec_type: ExecType,
    },
    ComponentTypeRegistered {
        type_id: ComponentTypeId,
    },
}
