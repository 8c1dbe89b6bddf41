//! The rigid-body motion channel: compact pose/velocity encoding on the
//! sender and interpolation, extrapolation, and physics hand-off on the
//! receiver.

use std::f32::consts::PI;

use glam::{EulerRot, Mat3, Quat, Vec3};

use undine_serde::{BitReader, BitWrite, SerdeResult};

use crate::{
    math::{hermite_derivative, hermite_interpolate},
    math::Transform,
    scene::{
        registry::{
            RIGID_BODY_ANGULAR_VELOCITY_INDEX, RIGID_BODY_LINEAR_VELOCITY_INDEX,
            RIGID_BODY_MASS_INDEX,
        },
        registry::{real_attribute, transform_of},
        AttributeValue, Scene, PLACEABLE_TYPE_ID, RIGID_BODY_TYPE_ID,
    },
    sync_state::SceneSyncState,
    types::{ChangeKind, EntityId},
};

/// Velocities below this are treated as rest.
pub const REST_VELOCITY_SQ: f32 = 1e-4;

/// Don't send: 0. Compact: 1. Full: 2.
pub fn detect_pos_send_type(changed: bool, pos: Vec3) -> u32 {
    if changed {
        // The compact signed fixed point covers roughly [-1024, 1024).
        if pos.abs().max_element() >= 1023.0 {
            2
        } else {
            1
        }
    } else {
        0
    }
}

/// Don't send: 0. Yaw only: 1. Yaw and pitch: 2. Full 3-DOF: 3.
pub fn detect_rot_send_type(changed: bool, rot: &Mat3) -> u32 {
    if !changed {
        return 0;
    }
    let forward = rot.z_axis;
    let up = rot.y_axis;
    let plane_normal = Vec3::Y.cross(forward);
    let d = plane_normal.dot(up);

    if up.dot(Vec3::Y) >= 0.999 {
        1 // Looking upright, 1 DOF.
    } else if d.abs() <= 0.001 && forward.dot(Vec3::Y).abs() < 0.95 && up.dot(Vec3::Y) > 0.0 {
        // No roll. Avoided near the +Y axis due to precision issues, and
        // only when the object's up is toward world up.
        2
    } else {
        3
    }
}

/// Don't send: 0. Uniform: 1. Non-uniform: 2.
pub fn detect_scale_send_type(changed: bool, scale: Vec3) -> u32 {
    if changed {
        let s = scale.abs();
        if s.max_element() - s.min_element() <= 1e-3 {
            1
        } else {
            2
        }
    } else {
        0
    }
}

/// Writes a quaternion as a 10-bit quantized angle in `[0, pi]` followed,
/// iff the quantized angle is nonzero, by the axis as an (11, 10) spherical
/// unit vector. The axis flips when needed to keep the angle in range.
pub fn write_quat_axis_angle(writer: &mut dyn BitWrite, q: Quat) {
    let (mut axis, mut angle) = q.normalize().to_axis_angle();
    if angle >= PI {
        axis = -axis;
        angle = 2.0 * PI - angle;
    }
    let quantized = writer.write_quantized_float(0.0, PI, 10, angle);
    if quantized != 0 {
        writer.write_normalized_vec3(axis.x, axis.y, axis.z, 11, 10);
    }
}

/// Mirror of [`write_quat_axis_angle`]. The raw angle pattern is inspected
/// before reconstruction so the zero sentinel is bit-exact.
pub fn read_quat_axis_angle(reader: &mut BitReader) -> SerdeResult<Quat> {
    let quantized = reader.read_bits(10)?;
    if quantized == 0 {
        return Ok(Quat::IDENTITY);
    }
    let angle = BitReader::dequantize_float(0.0, PI, 10, quantized);
    let (x, y, z) = reader.read_normalized_vec3(11, 10)?;
    let axis = Vec3::new(x, y, z).normalize_or(Vec3::X);
    Ok(Quat::from_axis_angle(axis, angle))
}

/// Orientation looking along `forward` with up as close to world +Y as the
/// forward direction permits.
fn look_rotation(forward: Vec3) -> Quat {
    let z = forward.normalize_or(Vec3::Z);
    let mut x = Vec3::Y.cross(z);
    if x.length_squared() < 1e-8 {
        x = Vec3::X;
    }
    let x = x.normalize();
    let y = z.cross(x);
    Quat::from_mat3(&Mat3::from_cols(x, y, z))
}

/// Writes the position and orientation portion of a motion record, as
/// selected by the already-encoded send types.
pub fn write_optimized_pos_rot(
    writer: &mut dyn BitWrite,
    pos_send_type: u32,
    pos: Vec3,
    rot_send_type: u32,
    rot: &Mat3,
) {
    match pos_send_type {
        1 => {
            // Fixed 57 bits.
            writer.write_signed_fixed_point(11, 8, pos.x);
            writer.write_signed_fixed_point(11, 8, pos.y);
            writer.write_signed_fixed_point(11, 8, pos.z);
        }
        2 => {
            // Fixed 96 bits.
            writer.write_bits(pos.x.to_bits(), 32);
            writer.write_bits(pos.y.to_bits(), 32);
            writer.write_bits(pos.z.to_bits(), 32);
        }
        _ => {}
    }

    match rot_send_type {
        1 => {
            // Upright: the forward vector has y == 0, send (x, z) as 2D.
            writer.write_normalized_vec2(rot.z_axis.x, rot.z_axis.z, 8);
        }
        2 => {
            let forward = rot.z_axis.normalize_or(Vec3::Z);
            writer.write_normalized_vec3(forward.x, forward.y, forward.z, 9, 8);
        }
        3 => {
            write_quat_axis_angle(writer, Quat::from_mat3(rot));
        }
        _ => {}
    }
}

/// Mirror of [`write_optimized_pos_rot`]. Omitted fields come back as
/// `None` so the receiver carries its previous values forward.
pub fn read_optimized_pos_rot(
    reader: &mut BitReader,
    pos_send_type: u32,
    rot_send_type: u32,
) -> SerdeResult<(Option<Vec3>, Option<Quat>)> {
    let pos = match pos_send_type {
        1 => Some(Vec3::new(
            reader.read_signed_fixed_point(11, 8)?,
            reader.read_signed_fixed_point(11, 8)?,
            reader.read_signed_fixed_point(11, 8)?,
        )),
        2 => Some(Vec3::new(
            f32::from_bits(reader.read_bits(32)?),
            f32::from_bits(reader.read_bits(32)?),
            f32::from_bits(reader.read_bits(32)?),
        )),
        _ => None,
    };

    let rot = match rot_send_type {
        1 => {
            let (x, z) = reader.read_normalized_vec2(8)?;
            Some(look_rotation(Vec3::new(x, 0.0, z)))
        }
        2 => {
            let (x, y, z) = reader.read_normalized_vec3(9, 8)?;
            Some(look_rotation(Vec3::new(x, y, z)))
        }
        3 => Some(read_quat_axis_angle(reader)?),
        _ => None,
    };

    Ok((pos, rot))
}

/// Degrees-per-second ZYX Euler rate as a quaternion, for the axis-angle
/// wire form. Stored state is degrees; the wire carries radians.
pub fn ang_vel_to_quat(deg_per_sec: Vec3) -> Quat {
    Quat::from_euler(
        EulerRot::ZYX,
        deg_per_sec.z.to_radians(),
        deg_per_sec.y.to_radians(),
        deg_per_sec.x.to_radians(),
    )
}

pub fn quat_to_ang_vel(q: Quat) -> Vec3 {
    let (z, y, x) = q.to_euler(EulerRot::ZYX);
    Vec3::new(x.to_degrees(), y.to_degrees(), z.to_degrees())
}

/// Receiver-side motion pass: advances every active interpolation state by
/// `frametime`, drives the placeable transform, and hands long-silent
/// newtonian bodies to local physics.
pub fn interpolate_rigid_bodies(
    frametime: f32,
    scene: &mut Scene,
    state: &mut SceneSyncState,
    update_period: f32,
    max_lin_extrap_time: f32,
    no_client_physics_handoff: bool,
) {
    let ids: Vec<EntityId> = state.interpolations.keys().copied().collect();
    for id in ids {
        let Some(placeable_id) = scene
            .entity(id)
            .and_then(|e| e.component_of_type(PLACEABLE_TYPE_ID))
            .map(|c| c.id())
        else {
            state.interpolations.remove(&id);
            continue;
        };
        let rigid_body = scene
            .entity(id)
            .and_then(|e| e.component_of_type(RIGID_BODY_TYPE_ID))
            .map(|c| (c.id(), real_attribute(c, RIGID_BODY_MASS_INDEX).unwrap_or(0.0)));

        let Some(interp) = state.interpolations.get_mut(&id) else { continue };
        if !interp.interpolator_active {
            continue;
        }

        interp.interp_time += frametime / update_period;
        let t = interp.interp_time;

        // Bodies without a rigid body, or with mass 0, never extrapolate
        // (mass 0 is stationary for the physics engine).
        let is_newtonian = matches!(rigid_body, Some((_, mass)) if mass > 0.0);

        let pos = if t < 1.0 {
            if is_newtonian {
                hermite_interpolate(
                    interp.interp_start.pos,
                    interp.interp_start.vel * update_period,
                    interp.interp_end.pos,
                    interp.interp_end.vel * update_period,
                    t,
                )
            } else {
                hermite_interpolate(
                    interp.interp_start.pos,
                    Vec3::ZERO,
                    interp.interp_end.pos,
                    Vec3::ZERO,
                    t,
                )
            }
        } else if is_newtonian && max_lin_extrap_time > 1.0 {
            interp.interp_end.pos + interp.interp_end.vel * (t - 1.0) * update_period
        } else {
            interp.interp_end.pos
        };

        let clamped = t.clamp(0.0, 1.0);
        let rot = interp.interp_start.rot.slerp(interp.interp_end.rot, clamped);
        let scale = interp.interp_start.scale.lerp(interp.interp_end.scale, clamped);

        let mut transform = Transform { pos, rot: Vec3::ZERO, scale };
        transform.set_orientation(rot);

        let end_vel = interp.interp_end.vel;
        let end_ang_vel = interp.interp_end.ang_vel;
        let cur_vel = interp.interp_start.vel.lerp(interp.interp_end.vel, clamped);

        let handoff = t >= max_lin_extrap_time;
        if handoff {
            interp.interpolator_active = false;
            if rigid_body.is_some() && !no_client_physics_handoff {
                // Local physics takes over, but only for a moving object; a
                // stationary one waits for the server-side wake-up signal.
                let at_rest = end_vel.length_squared() < REST_VELOCITY_SQ
                    && end_ang_vel.length_squared() < REST_VELOCITY_SQ;
                interp.client_extrapolating = !at_rest;
            }
        } else {
            // Local physics must not drive the entity while interpolating.
            interp.client_extrapolating = false;
        }

        let _ = scene.set_attribute(
            id,
            placeable_id,
            0,
            AttributeValue::Transform(transform),
            ChangeKind::LocalOnly,
        );

        if let Some((rigid_body_id, _)) = rigid_body {
            if handoff {
                if !no_client_physics_handoff {
                    // Seed the local simulation.
                    let _ = scene.set_attribute(
                        id,
                        rigid_body_id,
                        RIGID_BODY_LINEAR_VELOCITY_INDEX,
                        AttributeValue::Float3(end_vel),
                        ChangeKind::LocalOnly,
                    );
                    let _ = scene.set_attribute(
                        id,
                        rigid_body_id,
                        RIGID_BODY_ANGULAR_VELOCITY_INDEX,
                        AttributeValue::Float3(end_ang_vel),
                        ChangeKind::LocalOnly,
                    );
                }
            } else {
                // The interpolator owns motion; these only feed collision
                // response of locally simulated neighbors.
                let _ = scene.set_attribute(
                    id,
                    rigid_body_id,
                    RIGID_BODY_LINEAR_VELOCITY_INDEX,
                    AttributeValue::Float3(cur_vel),
                    ChangeKind::LocalOnly,
                );
                let _ = scene.set_attribute(
                    id,
                    rigid_body_id,
                    RIGID_BODY_ANGULAR_VELOCITY_INDEX,
                    AttributeValue::Float3(Vec3::ZERO),
                    ChangeKind::LocalOnly,
                );
            }
        }
    }
}

/// Tangent of the live Hermite segment at the current curve time; used to
/// re-anchor the interpolation when a fresh update arrives.
pub fn current_curve_velocity(
    interp_start_pos: Vec3,
    interp_start_vel: Vec3,
    interp_end_pos: Vec3,
    interp_end_vel: Vec3,
    interp_time: f32,
    update_period: f32,
) -> Vec3 {
    if interp_time < 1.0 {
        hermite_derivative(
            interp_start_pos,
            interp_start_vel * update_period,
            interp_end_pos,
            interp_end_vel * update_period,
            interp_time,
        )
    } else {
        interp_end_vel
    }
}

/// Placeable transform of an entity, if it has one.
pub fn entity_transform(scene: &Scene, id: EntityId) -> Option<Transform> {
    scene
        .entity(id)
        .and_then(|e| e.component_of_type(PLACEABLE_TYPE_ID))
        .and_then(transform_of)
}
