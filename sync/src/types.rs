pub type EntityId = u32;
pub type ComponentId = u32;
pub type ComponentTypeId = u32;
pub type AttributeIndex = u8;
pub type AttributeTypeId = u8;
pub type ConnectionId = u32;
pub type PacketId = u16;
pub type MessageId = u32;
pub type SceneId = u32;

/// Lowest server-assigned replicated id. Id 0 is reserved.
pub const FIRST_REPLICATED_ID: u32 = 1;
/// Start of the optimistic client-side range, pending server ack.
pub const FIRST_UNACKED_ID: u32 = 0x4000_0000;
/// Start of the local, never-replicated range.
pub const FIRST_LOCAL_ID: u32 = 0x8000_0000;
/// Mask applied to ids on the wire.
pub const LAST_REPLICATED_ID: u32 = 0x3FFF_FFFF;

pub fn is_unacked_id(id: u32) -> bool {
    (FIRST_UNACKED_ID..FIRST_LOCAL_ID).contains(&id)
}

pub fn is_local_id(id: u32) -> bool {
    id >= FIRST_LOCAL_ID
}

/// How a scene mutation propagates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// Emit change events so the mutation replicates to peers.
    Replicate,
    /// Apply and signal locally, never replicate (used on clients for
    /// server-originated changes).
    LocalOnly,
    /// Apply silently; used while deserializing inbound changes so they do
    /// not echo back. Coherent whole-object events are emitted afterwards.
    Disconnected,
    /// Resolves to `Replicate` for replicated targets.
    Default,
}

impl ChangeKind {
    pub fn resolve(self) -> ChangeKind {
        match self {
            ChangeKind::Default => ChangeKind::Replicate,
            other => other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostType {
    Server,
    Client,
}

impl HostType {
    pub fn is_server(self) -> bool {
        self == HostType::Server
    }
}

/// Peer protocol capability level, advertised at handshake. Later versions
/// are supersets of earlier ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ProtocolVersion {
    Original = 1,
    HierarchicScene = 2,
    CustomComponents = 3,
    WebClientRigidBodyMessage = 4,
}

/// Entity action execution target bitmask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecType(pub u8);

impl ExecType {
    pub const LOCAL: ExecType = ExecType(1);
    pub const SERVER: ExecType = ExecType(2);
    pub const PEERS: ExecType = ExecType(4);

    pub fn contains(self, other: ExecType) -> bool {
        self.0 & other.0 != 0
    }

    pub fn without(self, other: ExecType) -> ExecType {
        ExecType(self.0 & !other.0)
    }

    pub fn union(self, other: ExecType) -> ExecType {
        ExecType(self.0 | other.0)
    }
}
