// 2D geometry primitives shared by kinematics and odometry
//
// Conventions: x forward, y left, angles counter-clockwise positive, radians.

use std::f64::consts::{PI, TAU};
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

/// Wrap an angle into (-PI, PI]
pub fn wrap_angle(radians: f64) -> f64 {
    let wrapped = radians.rem_euclid(TAU);
    if wrapped > PI { wrapped - TAU } else { wrapped }
}

/// A heading in the continuous rotation group.
///
/// The stored value is never wrapped, so headings can be accumulated across
/// many turns. Use [`Rotation2d::wrapped`] when a bounded angle is needed.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rotation2d {
    radians: f64,
}

impl Rotation2d {
    pub const ZERO: Rotation2d = Rotation2d { radians: 0.0 };

    pub const fn from_radians(radians: f64) -> Self {
        Self { radians }
    }

    pub fn from_degrees(degrees: f64) -> Self {
        Self::from_radians(degrees.to_radians())
    }

    /// Unwrapped angle in radians
    pub fn radians(self) -> f64 {
        self.radians
    }

    /// Angle in (-PI, PI]
    pub fn wrapped(self) -> f64 {
        wrap_angle(self.radians)
    }

    pub fn cos(self) -> f64 {
        self.radians.cos()
    }

    pub fn sin(self) -> f64 {
        self.radians.sin()
    }

    /// Compose two rotations
    pub fn rotate_by(self, other: Rotation2d) -> Self {
        self + other
    }

    /// Signed shortest turn from `self` to `target`, in (-PI, PI]
    pub fn shortest_to(self, target: Rotation2d) -> f64 {
        wrap_angle(target.radians - self.radians)
    }
}

impl Add for Rotation2d {
    type Output = Rotation2d;

    fn add(self, rhs: Rotation2d) -> Rotation2d {
        Rotation2d::from_radians(self.radians + rhs.radians)
    }
}

impl Sub for Rotation2d {
    type Output = Rotation2d;

    fn sub(self, rhs: Rotation2d) -> Rotation2d {
        Rotation2d::from_radians(self.radians - rhs.radians)
    }
}

impl Neg for Rotation2d {
    type Output = Rotation2d;

    fn neg(self) -> Rotation2d {
        Rotation2d::from_radians(-self.radians)
    }
}

impl fmt::Display for Rotation2d {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}°", self.wrapped().to_degrees())
    }
}

/// A 2D offset in metres
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Translation2d {
    pub x: f64,
    pub y: f64,
}

impl Translation2d {
    pub const ZERO: Translation2d = Translation2d { x: 0.0, y: 0.0 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Build a translation from a length along a direction
    pub fn from_polar(distance: f64, angle: Rotation2d) -> Self {
        Self::new(distance * angle.cos(), distance * angle.sin())
    }

    pub fn norm(self) -> f64 {
        self.x.hypot(self.y)
    }

    /// Direction of the vector, measured from the x axis
    pub fn angle(self) -> Rotation2d {
        Rotation2d::from_radians(self.y.atan2(self.x))
    }

    /// Rotate the vector counter-clockwise about the origin
    pub fn rotate_by(self, rotation: Rotation2d) -> Self {
        let (sin, cos) = rotation.radians().sin_cos();
        Self::new(self.x * cos - self.y * sin, self.x * sin + self.y * cos)
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl Add for Translation2d {
    type Output = Translation2d;

    fn add(self, rhs: Translation2d) -> Translation2d {
        Translation2d::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Translation2d {
    type Output = Translation2d;

    fn sub(self, rhs: Translation2d) -> Translation2d {
        Translation2d::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Neg for Translation2d {
    type Output = Translation2d;

    fn neg(self) -> Translation2d {
        Translation2d::new(-self.x, -self.y)
    }
}

impl Mul<f64> for Translation2d {
    type Output = Translation2d;

    fn mul(self, rhs: f64) -> Translation2d {
        Translation2d::new(self.x * rhs, self.y * rhs)
    }
}

/// A displacement expressed in the robot's own frame over one interval
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Twist2d {
    pub dx: f64,
    pub dy: f64,
    pub dtheta: f64,
}

impl Twist2d {
    pub const fn new(dx: f64, dy: f64, dtheta: f64) -> Self {
        Self { dx, dy, dtheta }
    }

    pub fn scaled(self, factor: f64) -> Self {
        Self::new(self.dx * factor, self.dy * factor, self.dtheta * factor)
    }
}

/// Robot position and heading in the field frame
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose2d {
    pub translation: Translation2d,
    pub rotation: Rotation2d,
}

impl Pose2d {
    pub const fn new(translation: Translation2d, rotation: Rotation2d) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn from_xy_theta(x: f64, y: f64, theta: f64) -> Self {
        Self::new(Translation2d::new(x, y), Rotation2d::from_radians(theta))
    }

    pub fn x(&self) -> f64 {
        self.translation.x
    }

    pub fn y(&self) -> f64 {
        self.translation.y
    }

    /// Apply a robot-frame twist, following a constant-curvature arc.
    ///
    /// For `dtheta == 0` this reduces to rotating `(dx, dy)` by the current
    /// heading and adding it to the translation.
    pub fn exp(&self, twist: Twist2d) -> Pose2d {
        let theta = twist.dtheta;
        let (sin_theta, cos_theta) = theta.sin_cos();

        // Series expansion near zero avoids dividing by a vanishing angle
        let (s, c) = if theta.abs() < 1e-9 {
            (1.0 - theta * theta / 6.0, 0.5 * theta)
        } else {
            (sin_theta / theta, (1.0 - cos_theta) / theta)
        };

        let local = Translation2d::new(twist.dx * s - twist.dy * c, twist.dx * c + twist.dy * s);

        Pose2d::new(
            self.translation + local.rotate_by(self.rotation),
            self.rotation + Rotation2d::from_radians(theta),
        )
    }
}

impl fmt::Display for Pose2d {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(x: {:.3} m, y: {:.3} m, θ: {})",
            self.translation.x, self.translation.y, self.rotation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_wrap_angle_range() {
        assert_abs_diff_eq!(wrap_angle(0.0), 0.0);
        assert_abs_diff_eq!(wrap_angle(PI), PI);
        assert_abs_diff_eq!(wrap_angle(-PI), PI);
        assert_abs_diff_eq!(wrap_angle(3.0 * PI / 2.0), -FRAC_PI_2, epsilon = 1e-12);
        assert_abs_diff_eq!(wrap_angle(5.0 * TAU + 0.25), 0.25, epsilon = 1e-9);
    }

    #[test]
    fn test_rotation_accumulates_without_wrapping() {
        let mut heading = Rotation2d::ZERO;
        for _ in 0..8 {
            heading = heading.rotate_by(Rotation2d::from_radians(FRAC_PI_2));
        }
        assert_abs_diff_eq!(heading.radians(), 4.0 * PI, epsilon = 1e-12);
        assert_abs_diff_eq!(heading.wrapped(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_shortest_turn_crosses_pi() {
        let a = Rotation2d::from_degrees(170.0);
        let b = Rotation2d::from_degrees(-170.0);
        assert_abs_diff_eq!(a.shortest_to(b), 20f64.to_radians(), epsilon = 1e-12);
        assert_abs_diff_eq!(b.shortest_to(a), -20f64.to_radians(), epsilon = 1e-12);
    }

    #[test]
    fn test_translation_rotate_by() {
        let t = Translation2d::new(1.0, 0.0).rotate_by(Rotation2d::from_radians(FRAC_PI_2));
        assert_abs_diff_eq!(t.x, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t.y, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(Translation2d::new(3.0, 4.0).norm(), 5.0);
    }

    #[test]
    fn test_exp_straight_line_uses_heading() {
        let pose = Pose2d::from_xy_theta(1.0, 1.0, FRAC_PI_2);
        let next = pose.exp(Twist2d::new(2.0, 0.0, 0.0));
        assert_abs_diff_eq!(next.x(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(next.y(), 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(next.rotation.radians(), FRAC_PI_2);
    }

    #[test]
    fn test_exp_quarter_arc() {
        // Quarter circle of radius 1 driven forward while turning left
        let next = Pose2d::default().exp(Twist2d::new(FRAC_PI_2, 0.0, FRAC_PI_2));
        assert_abs_diff_eq!(next.x(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(next.y(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(next.rotation.radians(), FRAC_PI_2, epsilon = 1e-12);
    }

    #[test]
    fn test_exp_zero_twist_is_identity() {
        let pose = Pose2d::from_xy_theta(-2.0, 0.5, 1.2);
        assert_eq!(pose.exp(Twist2d::default()), pose);
    }
}
