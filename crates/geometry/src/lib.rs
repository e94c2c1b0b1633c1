//! Vector and orientation math used by the route compiler.
//!
//! Coordinates follow the route world convention:
//!     X points to the right of the initial heading,
//!     Y points up,
//!     and Z points along the initial heading.
//! Headings in the horizontal plane are stored as [Vector2] values
//!     whose `x` component maps to world X and whose `y` component maps to world Z.

use std::ops::{Add, AddAssign, Mul, Neg, Sub};

/// A two dimensional vector.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Vector2 {
    pub x: f64,
    pub y: f64,
}

impl Vector2 {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub const ZERO: Self = Self::new(0.0, 0.0);

    /// The heading of a route that has not turned yet.
    pub const FORWARD: Self = Self::new(0.0, 1.0);

    pub fn norm(self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Returns the unit vector in the same direction.
    ///
    /// The zero vector is returned unchanged.
    pub fn normalize(self) -> Self {
        let n = self.norm();
        if n == 0.0 {
            return self;
        }
        Self::new(self.x / n, self.y / n)
    }

    /// Rotates the vector counter-clockwise by the angle whose cosine and sine are given.
    pub fn rotate(self, cos: f64, sin: f64) -> Self {
        Self::new(self.x * cos - self.y * sin, self.x * sin + self.y * cos)
    }

    /// Rotates the vector by the given angle in radians.
    pub fn rotate_by(self, angle: f64) -> Self {
        self.rotate(angle.cos(), angle.sin())
    }
}

/// A three dimensional vector.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);
    pub const UP: Self = Self::new(0.0, 1.0, 0.0);
    pub const DOWN: Self = Self::new(0.0, -1.0, 0.0);
    pub const RIGHT: Self = Self::new(1.0, 0.0, 0.0);
    pub const FORWARD: Self = Self::new(0.0, 0.0, 1.0);

    /// Builds a unit world direction from a planar heading and a pitch ratio.
    ///
    /// The pitch is the rise per unit of horizontal distance,
    ///     so a pitch of `0.01` is a gradient of 10 per mille.
    pub fn from_heading(heading: Vector2, pitch: f64) -> Self {
        Self::new(heading.x, pitch, heading.y).normalize()
    }

    pub fn norm(self) -> f64 {
        self.norm_squared().sqrt()
    }

    pub fn norm_squared(self) -> f64 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// Returns the unit vector in the same direction.
    ///
    /// The zero vector is returned unchanged.
    pub fn normalize(self) -> Self {
        let n = self.norm();
        if n == 0.0 {
            return self;
        }
        self * (1.0 / n)
    }

    pub fn dot(self, other: Self) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(self, other: Self) -> Self {
        Self::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    /// Rotates the vector about an arbitrary axis.
    ///
    /// The axis does not need to be normalized.
    pub fn rotate_about(self, axis: Vector3, cos: f64, sin: f64) -> Self {
        let d = axis.normalize();
        let oc = 1.0 - cos;
        let xy = oc * d.x * d.y;
        let yz = oc * d.y * d.z;
        let xz = oc * d.x * d.z;
        let sx = sin * d.x;
        let sy = sin * d.y;
        let sz = sin * d.z;
        Self::new(
            (cos + oc * d.x * d.x) * self.x + (xy - sz) * self.y + (xz + sy) * self.z,
            (cos + oc * d.y * d.y) * self.y + (xy + sz) * self.x + (yz - sx) * self.z,
            (cos + oc * d.z * d.z) * self.z + (xz - sy) * self.x + (yz + sx) * self.y,
        )
    }

    /// Rotates the horizontal (X, Z) part of the vector, leaving Y untouched.
    pub fn rotate_plane(self, cos: f64, sin: f64) -> Self {
        Self::new(
            self.x * cos - self.z * sin,
            self.y,
            self.x * sin + self.z * cos,
        )
    }

    pub fn is_zero(self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }
}

impl Add for Vector3 {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl AddAssign for Vector3 {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl Sub for Vector3 {
    type Output = Self;
    fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl Mul<f64> for Vector3 {
    type Output = Self;
    fn mul(self, scalar: f64) -> Self {
        Self::new(self.x * scalar, self.y * scalar, self.z * scalar)
    }
}

impl Neg for Vector3 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

/// An orthonormal basis: side (`x`), up (`y`) and direction (`z`).
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Transformation {
    pub x: Vector3,
    pub y: Vector3,
    pub z: Vector3,
}

impl Default for Transformation {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transformation {
    pub const IDENTITY: Self = Self {
        x: Vector3::RIGHT,
        y: Vector3::UP,
        z: Vector3::FORWARD,
    };

    /// Builds the basis obtained by applying yaw, then pitch, then roll to the identity.
    ///
    /// All angles are in radians.
    pub fn new(yaw: f64, pitch: f64, roll: f64) -> Self {
        if yaw == 0.0 && pitch == 0.0 && roll == 0.0 {
            return Self::IDENTITY;
        }
        if pitch == 0.0 && roll == 0.0 {
            let (sin, cos) = yaw.sin_cos();
            return Self {
                x: Vector3::new(cos, 0.0, -sin),
                y: Vector3::UP,
                z: Vector3::new(sin, 0.0, cos),
            };
        }
        Self::IDENTITY.rotated(yaw, -pitch, -roll)
    }

    /// Builds the basis obtained by applying yaw, pitch and roll on top of another basis.
    pub fn compose(base: Transformation, yaw: f64, pitch: f64, roll: f64) -> Self {
        base.rotated(yaw, -pitch, roll)
    }

    fn rotated(self, yaw: f64, pitch: f64, roll: f64) -> Self {
        let Transformation {
            x: mut s,
            y: mut u,
            z: mut d,
        } = self;
        let (sin_yaw, cos_yaw) = yaw.sin_cos();
        let (sin_pitch, cos_pitch) = pitch.sin_cos();
        let (sin_roll, cos_roll) = roll.sin_cos();
        s = s.rotate_about(u, cos_yaw, sin_yaw);
        d = d.rotate_about(u, cos_yaw, sin_yaw);
        u = u.rotate_about(s, cos_pitch, sin_pitch);
        d = d.rotate_about(s, cos_pitch, sin_pitch);
        s = s.rotate_about(d, cos_roll, sin_roll);
        u = u.rotate_about(d, cos_roll, sin_roll);
        Self { x: s, y: u, z: d }
    }

    /// Builds a basis whose direction points from one point to another.
    ///
    /// The side vector is kept horizontal.
    pub fn looking_along(direction: Vector3) -> Self {
        let z = direction.normalize();
        let x = Vector3::new(z.z, 0.0, -z.x).normalize();
        let y = z.cross(x);
        Self { x, y, z }
    }

    /// Expresses a local offset in world coordinates.
    pub fn apply(&self, dx: f64, dy: f64, dz: f64) -> Vector3 {
        self.x * dx + self.y * dy + self.z * dz
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn vector2_rotate_quarter_turn() {
        let v = Vector2::FORWARD.rotate_by(FRAC_PI_2);
        assert_relative_eq!(v.x, -1.0, epsilon = 1e-12);
        assert_relative_eq!(v.y, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn vector3_cross_is_right_handed() {
        let c = Vector3::RIGHT.cross(Vector3::UP);
        assert_relative_eq!(c.z, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn vector3_normalize_zero_is_zero() {
        assert_eq!(Vector3::ZERO.normalize(), Vector3::ZERO);
    }

    #[test]
    fn from_heading_with_pitch() {
        let v = Vector3::from_heading(Vector2::FORWARD, 1.0);
        assert_relative_eq!(v.y, std::f64::consts::FRAC_1_SQRT_2, epsilon = 1e-12);
        assert_relative_eq!(v.z, std::f64::consts::FRAC_1_SQRT_2, epsilon = 1e-12);
        assert_relative_eq!(v.norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn rotate_about_up_matches_plane_rotation() {
        let v = Vector3::new(0.3, 0.5, 0.8);
        let angle: f64 = 0.4;
        let a = v.rotate_about(Vector3::UP, angle.cos(), angle.sin());
        let b = v.rotate_plane(angle.cos(), -angle.sin());
        assert_relative_eq!(a.x, b.x, epsilon = 1e-12);
        assert_relative_eq!(a.y, b.y, epsilon = 1e-12);
        assert_relative_eq!(a.z, b.z, epsilon = 1e-12);
    }

    #[test]
    fn transformation_yaw_only() {
        let t = Transformation::new(FRAC_PI_2, 0.0, 0.0);
        assert_relative_eq!(t.z.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(t.x.z, -1.0, epsilon = 1e-12);
    }

    #[test]
    fn transformation_general_path_agrees_with_yaw_shortcut() {
        let yaw = 0.7;
        let fast = Transformation::new(yaw, 0.0, 0.0);
        let slow = Transformation::IDENTITY.rotated(yaw, 0.0, 0.0);
        assert_relative_eq!(fast.x.x, slow.x.x, epsilon = 1e-12);
        assert_relative_eq!(fast.x.z, slow.x.z, epsilon = 1e-12);
        assert_relative_eq!(fast.z.x, slow.z.x, epsilon = 1e-12);
        assert_relative_eq!(fast.z.z, slow.z.z, epsilon = 1e-12);
    }

    #[test]
    fn transformation_stays_orthonormal() {
        let t = Transformation::new(0.3, 0.2, -0.1);
        assert_relative_eq!(t.x.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(t.y.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(t.z.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(t.x.dot(t.y), 0.0, epsilon = 1e-12);
        assert_relative_eq!(t.y.dot(t.z), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn looking_along_keeps_side_horizontal() {
        let t = Transformation::looking_along(Vector3::new(1.0, 0.5, 1.0));
        assert_relative_eq!(t.x.y, 0.0, epsilon = 1e-12);
        assert_relative_eq!(t.z.norm(), 1.0, epsilon = 1e-12);
    }
}
