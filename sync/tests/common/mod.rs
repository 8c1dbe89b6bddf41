//! Shared harness: a server and client engine pair wired through in-memory
//! message queues.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use undine_sync::{
    ConnectionRegistry, ConnectionId, HostType, MessageSink, ProtocolVersion, Scene, SyncConfig,
    SyncManager, UserConnection,
};

pub const TICK: f32 = 0.05;

pub type SentMessage = (u32, bool, bool, Vec<u8>);
pub type Outbox = Rc<RefCell<VecDeque<SentMessage>>>;

pub struct TestSink {
    pub outbox: Outbox,
    pub version: ProtocolVersion,
    pub authenticated: bool,
}

impl MessageSink for TestSink {
    fn send(&mut self, message_id: u32, reliable: bool, in_order: bool, data: &[u8]) {
        self.outbox
            .borrow_mut()
            .push_back((message_id, reliable, in_order, data.to_vec()));
    }

    fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }
}

pub struct Host {
    pub scene: Scene,
    pub manager: SyncManager,
    pub connections: ConnectionRegistry,
}

impl Host {
    pub fn new(host_type: HostType) -> Self {
        Self {
            scene: Scene::new(host_type),
            manager: SyncManager::new(host_type, &SyncConfig::default()),
            connections: ConnectionRegistry::new(),
        }
    }

    pub fn tick(&mut self) {
        self.manager.update(TICK, &mut self.scene, &mut self.connections);
    }

    pub fn frame(&mut self, dt: f32) {
        self.manager.update(dt, &mut self.scene, &mut self.connections);
    }
}

pub fn server_host() -> Host {
    Host::new(HostType::Server)
}

pub fn client_host() -> Host {
    Host::new(HostType::Client)
}

/// Connects a client host to a server host. Returns the outboxes
/// (server-to-client, client-to-server).
pub fn link(
    server: &mut Host,
    server_side_id: ConnectionId,
    client: &mut Host,
    version: ProtocolVersion,
) -> (Outbox, Outbox) {
    let to_client: Outbox = Rc::new(RefCell::new(VecDeque::new()));
    let to_server: Outbox = Rc::new(RefCell::new(VecDeque::new()));

    server.connections.insert(UserConnection::new(
        server_side_id,
        Box::new(TestSink {
            outbox: to_client.clone(),
            version,
            authenticated: true,
        }),
    ));
    let connection = server.connections.get_mut(server_side_id).unwrap();
    server.manager.on_connection_added(&server.scene, connection);

    client.connections.insert(UserConnection::new(
        1,
        Box::new(TestSink {
            outbox: to_server.clone(),
            version,
            authenticated: true,
        }),
    ));

    (to_client, to_server)
}

/// Drains an outbox into a host, assigning ascending packet ids. Returns the
/// delivered messages for inspection.
pub fn deliver(
    outbox: &Outbox,
    to: &mut Host,
    source: ConnectionId,
    packet_counter: &mut u16,
) -> Vec<SentMessage> {
    let messages: Vec<SentMessage> = outbox.borrow_mut().drain(..).collect();
    for (message_id, _, _, data) in &messages {
        *packet_counter = packet_counter.wrapping_add(1);
        to.manager
            .handle_message(
                &mut to.scene,
                &mut to.connections,
                source,
                *packet_counter,
                *message_id,
                data,
            )
            .expect("message handling failed");
    }
    messages
}

/// Drops the pending messages without delivering them.
pub fn discard(outbox: &Outbox) -> Vec<SentMessage> {
    outbox.borrow_mut().drain(..).collect()
}

/// Structural equality of the replicated parts of two scenes.
pub fn assert_scenes_match(a: &Scene, b: &Scene) {
    let a_ids: Vec<u32> = a.entities().filter(|e| !e.is_local()).map(|e| e.id()).collect();
    let b_ids: Vec<u32> = b.entities().filter(|e| !e.is_local()).map(|e| e.id()).collect();
    assert_eq!(a_ids, b_ids, "replicated entity id sets differ");

    for id in a_ids {
        let ea = a.entity(id).unwrap();
        let eb = b.entity(id).unwrap();
        assert_eq!(ea.parent(), eb.parent(), "parent mismatch for entity {id}");
        assert_eq!(
            ea.is_temporary(),
            eb.is_temporary(),
            "temporary flag mismatch for entity {id}"
        );
        assert_eq!(
            ea.component_ids(),
            eb.component_ids(),
            "component id sets differ for entity {id}"
        );
        for comp_id in ea.component_ids() {
            let ca = ea.component(comp_id).unwrap();
            let cb = eb.component(comp_id).unwrap();
            assert_eq!(ca.type_id(), cb.type_id(), "type mismatch for component {comp_id}");
            assert_eq!(ca.name, cb.name, "name mismatch for component {comp_id}");
            assert_eq!(
                ca.attributes().len(),
                cb.attributes().len(),
                "attribute count mismatch for component {comp_id}"
            );
            for (index, (sa, sb)) in ca.attributes().iter().zip(cb.attributes()).enumerate() {
                match (sa, sb) {
                    (None, None) => {}
                    (Some(aa), Some(ab)) => {
                        assert_eq!(
                            aa.value, ab.value,
                            "value mismatch at attribute {index} of component {comp_id}"
                        );
                    }
                    _ => panic!("attribute slot {index} of component {comp_id} differs"),
                }
            }
        }
    }
}
