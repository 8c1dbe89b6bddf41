//! The connection boundary: the sync core requires a message-oriented
//! duplex endpoint per peer and owns a sync state slot on each.

use std::collections::BTreeMap;

use crate::{
    sync_state::SceneSyncState,
    types::{ConnectionId, MessageId, ProtocolVersion},
};

/// Transport endpoint for one peer. The adapter behind this trait is
/// responsible for marshalling inbound messages onto the scene thread;
/// the core calls `send` synchronously from its tick.
pub trait MessageSink {
    /// Posts one message. `reliable` and `in_order` are per-send flags the
    /// transport must honor on its channels.
    fn send(&mut self, message_id: MessageId, reliable: bool, in_order: bool, data: &[u8]);

    /// Peer capability level negotiated at handshake.
    fn protocol_version(&self) -> ProtocolVersion;

    /// Whether the peer has completed authentication. Unauthenticated peers
    /// are neither synced to nor allowed to mutate the scene.
    fn is_authenticated(&self) -> bool;
}

/// One peer: its transport endpoint plus the sync state the core keeps for
/// it. On the server there is one per client; on a client, exactly one,
/// targeting the server.
pub struct UserConnection {
    id: ConnectionId,
    pub sink: Box<dyn MessageSink>,
    pub sync_state: SceneSyncState,
}

impl UserConnection {
    pub fn new(id: ConnectionId, sink: Box<dyn MessageSink>) -> Self {
        Self {
            id,
            sink,
            sync_state: SceneSyncState::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.sink.protocol_version()
    }

    pub fn is_authenticated(&self) -> bool {
        self.sink.is_authenticated()
    }

    pub fn send(&mut self, message_id: MessageId, reliable: bool, in_order: bool, data: &[u8]) {
        self.sink.send(message_id, reliable, in_order, data);
    }
}

/// The set of live peers, keyed by connection id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: BTreeMap<ConnectionId, UserConnection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, connection: UserConnection) {
        self.connections.insert(connection.id(), connection);
    }

    /// Drops a peer and its entire sync state.
    pub fn remove(&mut self, id: ConnectionId) -> Option<UserConnection> {
        self.connections.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&UserConnection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut UserConnection> {
        self.connections.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut UserConnection> {
        self.connections.values_mut()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
