//! Spatial types for the replicated transform attribute and the rigid-body
//! motion channel.

use glam::{EulerRot, Mat3, Quat, Vec3};

/// Position, orientation, and scale of a placeable entity.
///
/// Rotation is stored as ZYX Euler angles in degrees, matching the wire
/// attribute layout; [`orientation`](Self::orientation) gives the quaternion
/// form.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub pos: Vec3,
    pub rot: Vec3,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            pos: Vec3::ZERO,
            rot: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn from_pos(pos: Vec3) -> Self {
        Self { pos, ..Self::default() }
    }

    pub fn orientation(&self) -> Quat {
        Quat::from_euler(
            EulerRot::ZYX,
            self.rot.z.to_radians(),
            self.rot.y.to_radians(),
            self.rot.x.to_radians(),
        )
    }

    pub fn orientation_mat3(&self) -> Mat3 {
        Mat3::from_quat(self.orientation())
    }

    pub fn set_orientation(&mut self, q: Quat) {
        let (z, y, x) = q.to_euler(EulerRot::ZYX);
        self.rot = Vec3::new(x.to_degrees(), y.to_degrees(), z.to_degrees());
    }

    /// Composes a child transform under this one (translation rotated and
    /// scaled by the parent; orientations multiplied; scales componentwise).
    pub fn compose(&self, child: &Transform) -> Transform {
        let orientation = self.orientation();
        let mut out = Transform {
            pos: self.pos + orientation * (self.scale * child.pos),
            rot: Vec3::ZERO,
            scale: self.scale * child.scale,
        };
        out.set_orientation(orientation * child.orientation());
        out
    }
}

/// Interpolates from `(pos0, vel0)` to `(pos1, vel1)` with a C1 curve
/// (continuous in position and velocity). Tangents are velocities scaled to
/// the curve's unit-time parameterization.
pub fn hermite_interpolate(pos0: Vec3, vel0: Vec3, pos1: Vec3, vel1: Vec3, t: f32) -> Vec3 {
    let tt = t * t;
    let ttt = tt * t;
    let h1 = 2.0 * ttt - 3.0 * tt + 1.0;
    let h2 = 1.0 - h1;
    let h3 = ttt - 2.0 * tt + t;
    let h4 = ttt - tt;

    h1 * pos0 + h2 * pos1 + h3 * vel0 + h4 * vel1
}

/// Tangent (derivative) of the Hermite curve, w.r.t. curve time `t` in
/// `[0, 1]`, not wall-clock time.
pub fn hermite_derivative(pos0: Vec3, vel0: Vec3, pos1: Vec3, vel1: Vec3, t: f32) -> Vec3 {
    let tt = t * t;
    let h1 = 6.0 * (tt - t);
    let h2 = -h1;
    let h3 = 3.0 * tt - 4.0 * t + 1.0;
    let h4 = 3.0 * tt - 2.0 * t;

    h1 * pos0 + h2 * pos1 + h3 * vel0 + h4 * vel1
}
