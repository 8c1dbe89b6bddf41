use thiserror::Error;

use undine_serde::SerdeErr;

use crate::types::{ComponentId, ComponentTypeId, ConnectionId, EntityId};

/// Scene mutation failures. Most are recoverable; inbound handlers log and
/// skip the offending record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SceneError {
    #[error("entity {0} already exists")]
    EntityExists(EntityId),

    #[error("entity {0} not found")]
    EntityNotFound(EntityId),

    #[error("component {component} not found in entity {entity}")]
    ComponentNotFound { entity: EntityId, component: ComponentId },

    #[error("component {component} already exists in entity {entity}")]
    ComponentExists { entity: EntityId, component: ComponentId },

    #[error("component type {0} is not registered")]
    UnknownComponentType(ComponentTypeId),

    #[error("unknown attribute type id {0}")]
    UnknownAttributeType(u8),

    #[error("attribute index {index} is invalid for component {component}")]
    InvalidAttributeIndex { component: ComponentId, index: u8 },

    #[error("component {0} does not support dynamic attributes")]
    DynamicAttributesUnsupported(ComponentId),

    #[error("id 0 is reserved")]
    ReservedId,
}

/// Failure while handling an inbound protocol message. Partial state has
/// been rolled back; the caller must disconnect the offending peer.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("malformed {message} message from connection {connection}")]
    MalformedMessage {
        message: &'static str,
        connection: ConnectionId,
        #[source]
        source: SerdeErr,
    },
}
