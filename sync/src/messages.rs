//! The fixed wire message registry and the entity action message body.

use undine_serde::{BitReader, BitWrite, SerdeResult};

use crate::types::{EntityId, ExecType, MessageId};

pub const OBSERVER_POSITION: MessageId = 105;
pub const EDIT_ENTITY_PROPERTIES: MessageId = 109;
pub const CREATE_ENTITY: MessageId = 110;
pub const CREATE_COMPONENTS: MessageId = 111;
pub const CREATE_ATTRIBUTES: MessageId = 112;
pub const EDIT_ATTRIBUTES: MessageId = 113;
pub const REMOVE_ATTRIBUTES: MessageId = 114;
pub const REMOVE_COMPONENTS: MessageId = 115;
pub const REMOVE_ENTITY: MessageId = 116;
pub const CREATE_ENTITY_REPLY: MessageId = 117;
pub const CREATE_COMPONENTS_REPLY: MessageId = 118;
pub const RIGID_BODY_UPDATE: MessageId = 119;
pub const ENTITY_ACTION: MessageId = 120;
pub const REGISTER_COMPONENT_TYPE: MessageId = 123;
pub const SET_ENTITY_PARENT: MessageId = 124;

/// Allocated message id range; ids outside it are rejected with a warning.
pub const FIRST_MESSAGE_ID: MessageId = 100;
pub const LAST_MESSAGE_ID: MessageId = 124;

/// Name of a message id for log lines.
pub fn message_name(id: MessageId) -> &'static str {
    match id {
        OBSERVER_POSITION => "ObserverPosition",
        EDIT_ENTITY_PROPERTIES => "EditEntityProperties",
        CREATE_ENTITY => "CreateEntity",
        CREATE_COMPONENTS => "CreateComponents",
        CREATE_ATTRIBUTES => "CreateAttributes",
        EDIT_ATTRIBUTES => "EditAttributes",
        REMOVE_ATTRIBUTES => "RemoveAttributes",
        REMOVE_COMPONENTS => "RemoveComponents",
        REMOVE_ENTITY => "RemoveEntity",
        CREATE_ENTITY_REPLY => "CreateEntityReply",
        CREATE_COMPONENTS_REPLY => "CreateComponentsReply",
        RIGID_BODY_UPDATE => "RigidBodyUpdate",
        ENTITY_ACTION => "EntityAction",
        REGISTER_COMPONENT_TYPE => "RegisterComponentType",
        SET_ENTITY_PARENT => "SetEntityParent",
        _ => "Unknown",
    }
}

/// Reliable entity action dispatch (message 120).
#[derive(Clone, Debug, PartialEq)]
pub struct EntityActionMsg {
    pub entity_id: EntityId,
    pub exec_type: ExecType,
    pub name: String,
    pub params: Vec<String>,
}

impl EntityActionMsg {
    pub fn write(&self, writer: &mut dyn BitWrite) {
        writer.write_bits(self.entity_id, 32);
        writer.write_byte(self.exec_type.0);
        writer.write_string(&self.name);
        writer.write_vle_u32(self.params.len() as u32);
        for param in &self.params {
            writer.write_string(param);
        }
    }

    pub fn read(reader: &mut BitReader) -> SerdeResult<Self> {
        let entity_id = reader.read_bits(32)?;
        let exec_type = ExecType(reader.read_byte()?);
        let name = reader.read_string()?;
        let count = reader.read_vle_u32()?;
        let mut params = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            params.push(reader.read_string()?);
        }
        Ok(Self { entity_id, exec_type, name, params })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use undine_serde::BitWriter;

    #[test]
    fn entity_action_roundtrip() {
        let msg = EntityActionMsg {
            entity_id: 42,
            exec_type: ExecType::SERVER.union(ExecType::PEERS),
            name: "Hello".into(),
            params: vec!["world".into(), "again".into()],
        };
        let mut writer = BitWriter::new();
        msg.write(&mut writer);
        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);
        assert_eq!(EntityActionMsg::read(&mut reader).unwrap(), msg);
    }
}
