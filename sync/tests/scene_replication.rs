//! End-to-end replication of entities, components, and attributes from the
//! authoritative server to a client.

mod common;

use common::{assert_scenes_match, client_host, deliver, link, server_host};
use glam::{Quat, Vec2, Vec3, Vec4};

use undine_sync::{
    attr_type, AttributeValue, ChangeKind, ProtocolVersion, Transform, CREATE_ENTITY,
    DYNAMIC_COMPONENT_TYPE_ID, EDIT_ATTRIBUTES, NAME_TYPE_ID, PLACEABLE_TYPE_ID, REMOVE_ENTITY,
    SET_ENTITY_PARENT,
};

#[test]
fn initial_scene_replicates_to_new_client() {
    let mut server = server_host();
    let entity = server.scene.create_entity(0, ChangeKind::Replicate).unwrap();
    assert_eq!(entity, 1);
    let placeable = server
        .scene
        .create_component_with_id(entity, 0, PLACEABLE_TYPE_ID, "p", ChangeKind::Replicate)
        .unwrap();
    server
        .scene
        .set_attribute(
            entity,
            placeable,
            0,
            AttributeValue::Transform(Transform::from_pos(Vec3::new(3.5, 0.0, -2.0))),
            ChangeKind::Replicate,
        )
        .unwrap();

    let mut client = client_host();
    let (to_client, _to_server) = link(
        &mut server,
        1,
        &mut client,
        ProtocolVersion::WebClientRigidBodyMessage,
    );

    server.tick();
    let mut packets = 0;
    let sent = deliver(&to_client, &mut client, 1, &mut packets);
    assert!(sent.iter().any(|(id, reliable, _, _)| *id == CREATE_ENTITY && *reliable));

    let received = client.scene.entity(entity).expect("entity must exist on client");
    assert_eq!(received.component(placeable).unwrap().type_id(), PLACEABLE_TYPE_ID);
    match received.component(placeable).unwrap().attribute_value(0) {
        Some(AttributeValue::Transform(t)) => {
            assert_eq!(t.pos, Vec3::new(3.5, 0.0, -2.0));
        }
        other => panic!("unexpected transform attribute: {other:?}"),
    }
    assert_scenes_match(&server.scene, &client.scene);
}

#[test]
fn every_attribute_kind_survives_the_create_block() {
    let mut server = server_host();
    let entity = server.scene.create_entity(0, ChangeKind::Replicate).unwrap();
    let comp = server
        .scene
        .create_component_with_id(entity, 0, DYNAMIC_COMPONENT_TYPE_ID, "bag", ChangeKind::Replicate)
        .unwrap();

    let values: Vec<(u8, AttributeValue)> = vec![
        (attr_type::STRING, AttributeValue::String("hello".into())),
        (attr_type::INT, AttributeValue::Int(-5)),
        (attr_type::REAL, AttributeValue::Real(2.25)),
        (attr_type::COLOR, AttributeValue::Color(Vec4::new(0.1, 0.2, 0.3, 1.0))),
        (attr_type::FLOAT2, AttributeValue::Float2(Vec2::new(-4.0, 8.0))),
        (attr_type::FLOAT3, AttributeValue::Float3(Vec3::new(1.0, 2.0, 3.0))),
        (attr_type::FLOAT4, AttributeValue::Float4(Vec4::new(1.0, -2.0, 3.0, -4.0))),
        (attr_type::QUAT, AttributeValue::Quat(Quat::from_xyzw(0.0, 0.0, 0.0, 1.0))),
        (attr_type::BOOL, AttributeValue::Bool(true)),
        (attr_type::UINT, AttributeValue::UInt(42)),
        (attr_type::DOUBLE, AttributeValue::Double(6.5e3)),
        (attr_type::ENTITY_REF, AttributeValue::EntityRef(entity)),
        (attr_type::BYTE_BUFFER, AttributeValue::ByteBuffer(vec![9, 8, 7])),
        (
            attr_type::TRANSFORM,
            AttributeValue::Transform(Transform::from_pos(Vec3::new(-1.0, 0.5, 0.0))),
        ),
    ];
    for (index, (type_id, value)) in values.iter().enumerate() {
        server
            .scene
            .create_attribute(entity, comp, index as u8, *type_id, "v", ChangeKind::Replicate)
            .unwrap();
        server
            .scene
            .set_attribute(entity, comp, index as u8, value.clone(), ChangeKind::Replicate)
            .unwrap();
    }

    let mut client = client_host();
    let (to_client, _to_server) = link(
        &mut server,
        1,
        &mut client,
        ProtocolVersion::WebClientRigidBodyMessage,
    );
    server.tick();
    let mut packets = 0;
    deliver(&to_client, &mut client, 1, &mut packets);

    assert_scenes_match(&server.scene, &client.scene);
}

#[test]
fn incremental_edit_and_echo_suppression() {
    let mut server = server_host();
    let entity = server.scene.create_entity(0, ChangeKind::Replicate).unwrap();
    let name = server
        .scene
        .create_component_with_id(entity, 0, NAME_TYPE_ID, "", ChangeKind::Replicate)
        .unwrap();

    let mut client = client_host();
    let (to_client, to_server) = link(
        &mut server,
        1,
        &mut client,
        ProtocolVersion::WebClientRigidBodyMessage,
    );
    server.tick();
    let mut s2c = 0;
    let mut c2s = 0;
    deliver(&to_client, &mut client, 1, &mut s2c);

    // Server edits the name; the client receives exactly that attribute.
    server
        .scene
        .set_attribute(entity, name, 0, AttributeValue::String("lamp".into()), ChangeKind::Replicate)
        .unwrap();
    server.tick();
    let sent = deliver(&to_client, &mut client, 1, &mut s2c);
    assert!(sent.iter().any(|(id, _, _, _)| *id == EDIT_ATTRIBUTES));
    assert_eq!(
        client.scene.entity(entity).unwrap().component(name).unwrap().attribute_value(0),
        Some(&AttributeValue::String("lamp".into()))
    );

    // Applying the inbound change must not produce an outbound change back
    // to the server on the next tick.
    client.tick();
    let echoed = deliver(&to_server, &mut server, 1, &mut c2s);
    assert!(
        echoed.iter().all(|(id, _, _, _)| *id != EDIT_ATTRIBUTES),
        "client echoed an attribute edit back: {echoed:?}"
    );

    // And the same in the other direction: a client-authored edit applied on
    // the server is not sent back to that client.
    client
        .scene
        .set_attribute(entity, name, 1, AttributeValue::String("desk".into()), ChangeKind::Replicate)
        .unwrap();
    client.tick();
    deliver(&to_server, &mut server, 1, &mut c2s);
    assert_eq!(
        server.scene.entity(entity).unwrap().component(name).unwrap().attribute_value(1),
        Some(&AttributeValue::String("desk".into()))
    );
    server.tick();
    let back = deliver(&to_client, &mut client, 1, &mut s2c);
    assert!(
        back.iter().all(|(id, _, _, _)| *id != EDIT_ATTRIBUTES),
        "server echoed the client's edit back: {back:?}"
    );
}

#[test]
fn parent_links_replicate_and_unparent() {
    let mut server = server_host();
    let parent = server.scene.create_entity(0, ChangeKind::Replicate).unwrap();
    let child = server.scene.create_entity(0, ChangeKind::Replicate).unwrap();

    let mut client = client_host();
    let (to_client, _to_server) = link(
        &mut server,
        1,
        &mut client,
        ProtocolVersion::WebClientRigidBodyMessage,
    );
    server.tick();
    let mut packets = 0;
    deliver(&to_client, &mut client, 1, &mut packets);

    server.scene.set_parent(child, Some(parent), ChangeKind::Replicate).unwrap();
    server.tick();
    let sent = deliver(&to_client, &mut client, 1, &mut packets);
    assert!(sent.iter().any(|(id, _, _, _)| *id == SET_ENTITY_PARENT));
    assert_eq!(client.scene.entity(child).unwrap().parent(), Some(parent));

    server.scene.set_parent(child, None, ChangeKind::Replicate).unwrap();
    server.tick();
    deliver(&to_client, &mut client, 1, &mut packets);
    assert_eq!(client.scene.entity(child).unwrap().parent(), None);
}

#[test]
fn temporary_flag_and_removal_replicate() {
    let mut server = server_host();
    let entity = server.scene.create_entity(0, ChangeKind::Replicate).unwrap();

    let mut client = client_host();
    let (to_client, _to_server) = link(
        &mut server,
        1,
        &mut client,
        ProtocolVersion::WebClientRigidBodyMessage,
    );
    server.tick();
    let mut packets = 0;
    deliver(&to_client, &mut client, 1, &mut packets);

    server.scene.set_temporary(entity, true, ChangeKind::Replicate).unwrap();
    server.tick();
    deliver(&to_client, &mut client, 1, &mut packets);
    assert!(client.scene.entity(entity).unwrap().is_temporary());

    server.scene.remove_entity(entity, ChangeKind::Replicate).unwrap();
    server.tick();
    let sent = deliver(&to_client, &mut client, 1, &mut packets);
    assert!(sent.iter().any(|(id, _, _, _)| *id == REMOVE_ENTITY));
    assert!(client.scene.entity(entity).is_none());
}

#[test]
fn entity_created_and_removed_between_syncs_never_reaches_the_wire() {
    let mut server = server_host();
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

    // Created and deleted within one tick: the state carries both the new
    // and removed flags, the removal is dropped, and the entity is requeued
    // as new; the peer hears nothing.
    let entity = server.scene.create_entity(0, ChangeKind::Replicate).unwrap();
    server.scene.remove_entity(entity, ChangeKind::Replicate).unwrap();
    server.tick();
    let first = deliver(&to_client, &mut client, 1, &mut packets);
    assert!(
        first
            .iter()
            .all(|(id, _, _, _)| *id != CREATE_ENTITY && *id != REMOVE_ENTITY),
        "conflicted entity leaked to the wire: {first:?}"
    );

    // The requeued state finds the entity gone and drains on the next tick.
    server.tick();
    let second = deliver(&to_client, &mut client, 1, &mut packets);
    assert!(
        second
            .iter()
            .all(|(id, _, _, _)| *id != CREATE_ENTITY && *id != REMOVE_ENTITY),
        "conflicted entity leaked to the wire: {second:?}"
    );
    assert!(
        !server
            .connections
            .get(1)
            .unwrap()
            .sync_state
            .entities
            .contains_key(&entity),
        "stale sync state survived the conflict"
    );
    assert!(client.scene.entity(entity).is_none());
}

#[test]
fn component_created_and_removed_between_syncs_never_reaches_the_wire() {
    let mut server = server_host();
    let entity = server.scene.create_entity(0, ChangeKind::Replicate).unwrap();

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

    // An unsent component's removal drops its record outright; neither the
    // create nor the remove is transmitted.
    let comp = server
        .scene
        .create_component_with_id(entity, 0, NAME_TYPE_ID, "", ChangeKind::Replicate)
        .unwrap();
    server.scene.remove_component(entity, comp, ChangeKind::Replicate).unwrap();
    server.tick();
    let sent = deliver(&to_client, &mut client, 1, &mut packets);
    assert!(
        sent.iter().all(|(id, _, _, _)| {
            *id != undine_sync::CREATE_COMPONENTS && *id != undine_sync::REMOVE_COMPONENTS
        }),
        "conflicted component leaked to the wire: {sent:?}"
    );
    assert!(
        !server
            .connections
            .get(1)
            .unwrap()
            .sync_state
            .entities
            .get(&entity)
            .unwrap()
            .components
            .contains_key(&comp),
        "stale component sync state survived the conflict"
    );
    assert!(client.scene.entity(entity).unwrap().component(comp).is_none());
}

#[test]
fn local_entities_stay_local() {
    let mut server = server_host();
    let replicated = server.scene.create_entity(0, ChangeKind::Replicate).unwrap();
    let local_id = server.scene.next_local_id();
    server.scene.create_entity(local_id, ChangeKind::Replicate).unwrap();

    let mut client = client_host();
    let (to_client, _to_server) = link(
        &mut server,
        1,
        &mut client,
        ProtocolVersion::WebClientRigidBodyMessage,
    );
    server.tick();
    let mut packets = 0;
    deliver(&to_client, &mut client, 1, &mut packets);

    assert!(client.scene.entity(replicated).is_some());
    assert!(client.scene.entity(local_id).is_none());
}

#[test]
fn dynamic_attribute_create_and_remove_replicate() {
    let mut server = server_host();
    let entity = server.scene.create_entity(0, ChangeKind::Replicate).unwrap();
    let comp = server
        .scene
        .create_component_with_id(entity, 0, DYNAMIC_COMPONENT_TYPE_ID, "", ChangeKind::Replicate)
        .unwrap();

    let mut client = client_host();
    let (to_client, _to_server) = link(
        &mut server,
        1,
        &mut client,
        ProtocolVersion::WebClientRigidBodyMessage,
    );
    server.tick();
    let mut packets = 0;
    deliver(&to_client, &mut client, 1, &mut packets);

    // Create after the initial sync: goes through CreateAttributes.
    server
        .scene
        .create_attribute(entity, comp, 0, attr_type::REAL, "health", ChangeKind::Replicate)
        .unwrap();
    server
        .scene
        .set_attribute(entity, comp, 0, AttributeValue::Real(0.75), ChangeKind::Replicate)
        .unwrap();
    server.tick();
    deliver(&to_client, &mut client, 1, &mut packets);
    let attr = client
        .scene
        .entity(entity)
        .unwrap()
        .component(comp)
        .unwrap()
        .attribute(0)
        .expect("dynamic attribute must exist on client");
    assert_eq!(attr.name, "health");
    assert_eq!(attr.value, AttributeValue::Real(0.75));

    // Removal does not renumber; the slot just empties.
    server
        .scene
        .create_attribute(entity, comp, 1, attr_type::INT, "lives", ChangeKind::Replicate)
        .unwrap();
    server.tick();
    deliver(&to_client, &mut client, 1, &mut packets);
    server.scene.remove_attribute(entity, comp, 0, ChangeKind::Replicate).unwrap();
    server.tick();
    deliver(&to_client, &mut client, 1, &mut packets);

    let component = client.scene.entity(entity).unwrap().component(comp).unwrap();
    assert!(component.attribute(0).is_none());
    assert_eq!(component.attribute(1).unwrap().name, "lives");
}
