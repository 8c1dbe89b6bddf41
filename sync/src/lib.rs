//! # Undine Sync
//! Scene synchronization core of a networked entity-component virtual-world
//! runtime. Replicates a shared hierarchical scene graph between one
//! authoritative server and many clients over an unreliable-datagram
//! transport: a bit-compact wire protocol, per-connection dirty tracking,
//! rigid-body motion smoothing on the receiver, server-assigned id
//! reconciliation, and optional interest-management prioritization.
//!
//! The transport is an external collaborator behind [`MessageSink`]; the
//! core assumes a message-oriented connection with reliable/unreliable and
//! in-order flags per send, and synchronous single-threaded dispatch of
//! received messages on the scene thread.
//!
//! A minimal server looks like:
//!
//! ```ignore
//! let mut scene = Scene::new(HostType::Server);
//! let mut manager = SyncManager::new(HostType::Server, &SyncConfig::default());
//! let mut connections = ConnectionRegistry::new();
//! // on authenticated connect:
//! //   connections.insert(UserConnection::new(id, transport_endpoint));
//! //   manager.on_connection_added(&scene, connections.get_mut(id).unwrap());
//! // per frame:
//! //   manager.update(frametime, &mut scene, &mut connections);
//! // per received message:
//! //   manager.handle_message(&mut scene, &mut connections, id, packet, msg, data)?;
//! ```

mod config;
mod connection;
mod error;
mod handlers;
mod manager;
mod math;
mod messages;
mod prioritizer;
mod rigid_body;
mod scene;
mod sync_state;
mod types;
mod wrapping;

pub use config::{SyncArgs, SyncConfig};
pub use connection::{ConnectionRegistry, MessageSink, UserConnection};
pub use error::{SceneError, SyncError};
pub use manager::SyncManager;
pub use math::{hermite_derivative, hermite_interpolate, Transform};
pub use messages::{
    message_name, EntityActionMsg, CREATE_ATTRIBUTES, CREATE_COMPONENTS, CREATE_COMPONENTS_REPLY,
    CREATE_ENTITY, CREATE_ENTITY_REPLY, EDIT_ATTRIBUTES, EDIT_ENTITY_PROPERTIES, ENTITY_ACTION,
    FIRST_MESSAGE_ID, LAST_MESSAGE_ID, OBSERVER_POSITION, REGISTER_COMPONENT_TYPE,
    REMOVE_ATTRIBUTES, REMOVE_COMPONENTS, REMOVE_ENTITY, RIGID_BODY_UPDATE, SET_ENTITY_PARENT,
};
pub use prioritizer::{DefaultEntityPrioritizer, EntityPrioritizer};
pub use rigid_body::interpolate_rigid_bodies;
pub use scene::{
    attr_type, ActionHandler, Attribute, AttributeMetadata, AttributeSpec, AttributeValue,
    Component, ComponentTypeDescriptor, ComponentTypeRegistry, Entity, ModifyFilter, Scene,
    SceneEvent, DYNAMIC_COMPONENT_TYPE_ID, NAME_TYPE_ID, PLACEABLE_TRANSFORM_INDEX,
    PLACEABLE_TYPE_ID, RIGID_BODY_ANGULAR_VELOCITY_INDEX, RIGID_BODY_LINEAR_VELOCITY_INDEX,
    RIGID_BODY_MASS_INDEX, RIGID_BODY_TYPE_ID,
};
pub use sync_state::{
    ComponentSyncState, EntitySyncState, RigidBodyInterpolationState, RigidBodyState,
    SceneSyncState,
};
pub use types::{
    is_local_id, is_unacked_id, AttributeIndex, AttributeTypeId, ChangeKind, ComponentId,
    ComponentTypeId, ConnectionId, EntityId, ExecType, HostType, MessageId, PacketId,
    ProtocolVersion, SceneId, FIRST_LOCAL_ID, FIRST_REPLICATED_ID, FIRST_UNACKED_ID,
    LAST_REPLICATED_ID,
};
pub use wrapping::{sequence_greater_than, sequence_less_than};
