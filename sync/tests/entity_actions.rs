//! Entity action dispatch across the wire: local/server/peers execution
//! modes and fan-out to other authenticated clients.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{client_host, deliver, link, server_host, Host};

use undine_sync::{ChangeKind, EntityId, ExecType, ProtocolVersion, Scene, ENTITY_ACTION};

type ActionLog = Rc<RefCell<Vec<(EntityId, String, Vec<String>)>>>;

fn record_actions(scene: &mut Scene) -> ActionLog {
    let log: ActionLog = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    scene.set_action_handler(Box::new(move |entity, name, params| {
        sink.borrow_mut().push((entity, name.to_string(), params.to_vec()));
    }));
    log
}

struct World {
    server: Host,
    c1: Host,
    c2: Host,
    s_to_c1: common::Outbox,
    c1_to_s: common::Outbox,
    s_to_c2: common::Outbox,
    c2_to_s: common::Outbox,
}

fn two_client_world() -> (World, EntityId) {
    let mut server = server_host();
    let entity = server.scene.create_entity(0, ChangeKind::Replicate).unwrap();

    let mut c1 = client_host();
    let mut c2 = client_host();
    let (s_to_c1, c1_to_s) = link(&mut server, 1, &mut c1, ProtocolVersion::WebClientRigidBodyMessage);
    let (s_to_c2, c2_to_s) = link(&mut server, 2, &mut c2, ProtocolVersion::WebClientRigidBodyMessage);

    server.tick();
    let mut packets = 0;
    deliver(&s_to_c1, &mut c1, 1, &mut packets);
    let mut packets = 0;
    deliver(&s_to_c2, &mut c2, 1, &mut packets);

    (World { server, c1, c2, s_to_c1, c1_to_s, s_to_c2, c2_to_s }, entity)
}

#[test]
fn client_action_fans_out_to_server_and_peers() {
    let (mut world, entity) = two_client_world();
    let server_log = record_actions(&mut world.server.scene);
    let c1_log = record_actions(&mut world.c1.scene);
    let c2_log = record_actions(&mut world.c2.scene);

    // C1 requests server + peers execution; without the Local bit it does
    // not run on C1 itself.
    world
        .c1
        .scene
        .trigger_action(entity, "Hello", &["world".to_string()], ExecType::SERVER.union(ExecType::PEERS))
        .unwrap();
    world.c1.tick();
    assert!(c1_log.borrow().is_empty());

    let mut c1_packets = 0;
    let sent = deliver(&world.c1_to_s, &mut world.server, 1, &mut c1_packets);
    assert!(sent.iter().any(|(id, reliable, _, _)| *id == ENTITY_ACTION && *reliable));

    // The server executed it locally.
    assert_eq!(
        server_log.borrow().as_slice(),
        &[(entity, "Hello".to_string(), vec!["world".to_string()])]
    );

    // The queued peer copies flush after the next sync pass, to every
    // authenticated client except the originator.
    world.server.tick();
    let mut s2c1 = 0;
    let back_to_sender = deliver(&world.s_to_c1, &mut world.c1, 1, &mut s2c1);
    assert!(
        back_to_sender.iter().all(|(id, _, _, _)| *id != ENTITY_ACTION),
        "action was echoed to its originator"
    );
    assert!(c1_log.borrow().is_empty());

    let mut s2c2 = 0;
    let to_peer = deliver(&world.s_to_c2, &mut world.c2, 1, &mut s2c2);
    assert!(to_peer.iter().any(|(id, _, _, _)| *id == ENTITY_ACTION));
    assert_eq!(
        c2_log.borrow().as_slice(),
        &[(entity, "Hello".to_string(), vec!["world".to_string()])]
    );

    // The Local-typed execution on C2 must not re-enter the network.
    world.c2.tick();
    let forwarded = common::discard(&world.c2_to_s);
    assert!(forwarded.iter().all(|(id, _, _, _)| *id != ENTITY_ACTION));
}

#[test]
fn server_action_with_peers_reaches_all_clients() {
    let (mut world, entity) = two_client_world();
    let server_log = record_actions(&mut world.server.scene);
    let c1_log = record_actions(&mut world.c1.scene);
    let c2_log = record_actions(&mut world.c2.scene);

    world
        .server
        .scene
        .trigger_action(entity, "Spawn", &[], ExecType::SERVER.union(ExecType::PEERS))
        .unwrap();
    world.server.tick();
    assert_eq!(server_log.borrow().len(), 1);

    let mut s2c1 = 0;
    deliver(&world.s_to_c1, &mut world.c1, 1, &mut s2c1);
    let mut s2c2 = 0;
    deliver(&world.s_to_c2, &mut world.c2, 1, &mut s2c2);
    assert_eq!(c1_log.borrow().len(), 1);
    assert_eq!(c2_log.borrow().len(), 1);
}

#[test]
fn local_bit_executes_immediately_at_the_trigger_site() {
    let (mut world, entity) = two_client_world();
    let c1_log = record_actions(&mut world.c1.scene);

    world
        .c1
        .scene
        .trigger_action(entity, "Ping", &[], ExecType::LOCAL)
        .unwrap();
    assert_eq!(c1_log.borrow().len(), 1);

    // A purely local action never reaches the wire.
    world.c1.tick();
    let sent = common::discard(&world.c1_to_s);
    assert!(sent.iter().all(|(id, _, _, _)| *id != ENTITY_ACTION));
}

#[test]
fn action_sender_is_cleared_after_execution() {
    let (mut world, entity) = two_client_world();

    world
        .c1
        .scene
        .trigger_action(entity, "WhoAmI", &[], ExecType::SERVER)
        .unwrap();
    world.c1.tick();

    // Deliver manually so the sender can be inspected right after handling;
    // it is cleared once execution finishes.
    let messages = common::discard(&world.c1_to_s);
    for (message_id, _, _, data) in messages {
        world
            .server
            .manager
            .handle_message(
                &mut world.server.scene,
                &mut world.server.connections,
                1,
                1,
                message_id,
                &data,
            )
            .unwrap();
    }
    assert_eq!(world.server.manager.action_sender(), None);
}
