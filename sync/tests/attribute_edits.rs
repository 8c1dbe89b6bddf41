//! The attribute-edit layout decision: index list for sparse changes on
//! wide components, bitmask for dense ones, identical results either way.

mod common;

use common::{client_host, deliver, discard, link, server_host, Host};

use undine_serde::BitReader;
use undine_sync::{
    attr_type, AttributeValue, ChangeKind, EntityId, ProtocolVersion, DYNAMIC_COMPONENT_TYPE_ID,
    EDIT_ATTRIBUTES,
};

const SLOTS: u8 = 20;

fn wide_component(server: &mut Host) -> (EntityId, u32) {
    let entity = server.scene.create_entity(0, ChangeKind::Replicate).unwrap();
    let comp = server
        .scene
        .create_component_with_id(entity, 0, DYNAMIC_COMPONENT_TYPE_ID, "", ChangeKind::Replicate)
        .unwrap();
    for index in 0..SLOTS {
        server
            .scene
            .create_attribute(entity, comp, index, attr_type::REAL, "v", ChangeKind::Replicate)
            .unwrap();
    }
    (entity, comp)
}

/// Reads the indexing-method bit of the first component block of an
/// EditAttributes message.
fn indexing_method(data: &[u8]) -> bool {
    let mut reader = BitReader::new(data);
    reader.read_vle_u32().unwrap(); // scene id
    reader.read_vle_u32().unwrap(); // entity id
    reader.read_vle_u32().unwrap(); // component id
    let size = reader.read_vle_u32().unwrap() as usize;
    let block = reader.read_bytes(size).unwrap();
    let mut block_reader = BitReader::new(&block);
    block_reader.read_bit().unwrap()
}

#[test]
fn sparse_changes_use_the_index_list() {
    let mut server = server_host();
    let (entity, comp) = wide_component(&mut server);

    let mut client = client_host();
    let (to_client, _to_server) = link(
        &mut server,
        1,
        &mut client,
        ProtocolVersion::WebClientRigidBodyMessage,
    );
    let mut packets = 0;
    server.tick();
    deliver(&to_client, &mut client, 1, &mut packets);

    server
        .scene
        .set_attribute(entity, comp, 7, AttributeValue::Real(1.5), ChangeKind::Replicate)
        .unwrap();
    server.tick();

    let sent = discard(&to_client);
    let edit = sent
        .iter()
        .find(|(id, _, _, _)| *id == EDIT_ATTRIBUTES)
        .expect("an edit must be sent");
    assert!(!indexing_method(&edit.3), "one change in twenty slots must use the index list");

    for (message_id, _, _, data) in &sent {
        packets += 1;
        client
            .manager
            .handle_message(&mut client.scene, &mut client.connections, 1, packets, *message_id, data)
            .unwrap();
    }
    assert_eq!(
        client.scene.entity(entity).unwrap().component(comp).unwrap().attribute_value(7),
        Some(&AttributeValue::Real(1.5))
    );
}

#[test]
fn dense_changes_use_the_bitmask() {
    let mut server = server_host();
    let (entity, comp) = wide_component(&mut server);

    let mut client = client_host();
    let (to_client, _to_server) = link(
        &mut server,
        1,
        &mut client,
        ProtocolVersion::WebClientRigidBodyMessage,
    );
    let mut packets = 0;
    server.tick();
    deliver(&to_client, &mut client, 1, &mut packets);

    for index in 0..15u8 {
        server
            .scene
            .set_attribute(
                entity,
                comp,
                index,
                AttributeValue::Real(index as f32 * 0.5),
                ChangeKind::Replicate,
            )
            .unwrap();
    }
    server.tick();

    let sent = discard(&to_client);
    let edit = sent
        .iter()
        .find(|(id, _, _, _)| *id == EDIT_ATTRIBUTES)
        .expect("an edit must be sent");
    assert!(indexing_method(&edit.3), "fifteen changes in twenty slots must use the bitmask");

    for (message_id, _, _, data) in &sent {
        packets += 1;
        client
            .manager
            .handle_message(&mut client.scene, &mut client.connections, 1, packets, *message_id, data)
            .unwrap();
    }
    for index in 0..15u8 {
        assert_eq!(
            client.scene.entity(entity).unwrap().component(comp).unwrap().attribute_value(index),
            Some(&AttributeValue::Real(index as f32 * 0.5)),
            "attribute {index} mismatch after bitmask decode"
        );
    }
}

#[test]
fn both_layouts_decode_to_the_same_scene() {
    let mut server = server_host();
    let (entity, comp) = wide_component(&mut server);

    let mut client = client_host();
    let (to_client, _to_server) = link(
        &mut server,
        1,
        &mut client,
        ProtocolVersion::WebClientRigidBodyMessage,
    );
    let mut packets = 0;
    server.tick();
    deliver(&to_client, &mut client, 1, &mut packets);

    // Sparse edit, then dense edit, applied in sequence.
    server
        .scene
        .set_attribute(entity, comp, 19, AttributeValue::Real(-9.0), ChangeKind::Replicate)
        .unwrap();
    server.tick();
    deliver(&to_client, &mut client, 1, &mut packets);

    for index in 0..SLOTS {
        server
            .scene
            .set_attribute(
                entity,
                comp,
                index,
                AttributeValue::Real(f32::from(index) + 100.0),
                ChangeKind::Replicate,
            )
            .unwrap();
    }
    server.tick();
    deliver(&to_client, &mut client, 1, &mut packets);

    common::assert_scenes_match(&server.scene, &client.scene);
}
