// Swerve drive kinematics
//
// Converts chassis velocities into per-module (speed, angle) targets and
// reconstructs chassis motion from per-module measurements. Both directions
// go through the same linear operator built from the module offsets:
//
//   [v_ix]   [1  0  -r_i.y]   [vx   ]
//   [v_iy] = [0  1   r_i.x] * [vy   ]
//                             [omega]
//
// Forward kinematics uses the operator's pseudo-inverse (least squares).

use std::f64::consts::FRAC_PI_2;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::{Rotation2d, Translation2d, Twist2d};

/// Below this wheel speed (m/s) the direction is undefined and the previous angle is held
pub const MIN_MODULE_SPEED: f64 = 1e-9;

/// Singular values below this are treated as zero
const RANK_EPSILON: f64 = 1e-9;

/// Error types for kinematics construction and evaluation
#[derive(Debug, thiserror::Error)]
pub enum KinematicsError {
    #[error("Swerve kinematics needs at least 2 modules, got {0}")]
    TooFewModules(usize),

    #[error("Module offset {index} is not finite: {offset:?}")]
    InvalidOffset { index: usize, offset: Translation2d },

    #[error("Module layout cannot observe rotation (operator rank {rank} < 3)")]
    DegenerateGeometry { rank: usize },

    #[error("Pseudo-inverse failed: {0}")]
    PseudoInverse(&'static str),

    #[error("Expected {expected} module values, got {actual}")]
    ModuleCountMismatch { expected: usize, actual: usize },
}

/// Desired whole-body velocity in the robot frame
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ChassisSpeeds {
    /// Forward velocity (m/s)
    pub vx: f64,
    /// Leftward velocity (m/s)
    pub vy: f64,
    /// Counter-clockwise angular velocity (rad/s)
    pub omega: f64,
}

impl ChassisSpeeds {
    pub const fn new(vx: f64, vy: f64, omega: f64) -> Self {
        Self { vx, vy, omega }
    }

    /// Convert a field-frame request into the robot frame given the robot heading
    pub fn from_field_relative(vx: f64, vy: f64, omega: f64, heading: Rotation2d) -> Self {
        let robot = Translation2d::new(vx, vy).rotate_by(-heading);
        Self::new(robot.x, robot.y, omega)
    }

    pub fn is_zero(&self) -> bool {
        self.vx == 0.0 && self.vy == 0.0 && self.omega == 0.0
    }
}

/// Target actuation for one module
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleState {
    /// Wheel surface speed (m/s)
    pub speed: f64,
    pub angle: Rotation2d,
}

impl ModuleState {
    pub const fn new(speed: f64, angle: Rotation2d) -> Self {
        Self { speed, angle }
    }

    /// Same heading, zero speed
    pub fn stopped(angle: Rotation2d) -> Self {
        Self::new(0.0, angle)
    }

    /// Minimise steering travel from `current`.
    ///
    /// If the target is more than 90° away, the wheel is pointed the opposite
    /// way and driven in reverse instead. Adapters call this after
    /// desaturation, so the engine's non-negative speed convention holds up to
    /// that point.
    pub fn optimize(self, current: Rotation2d) -> Self {
        if current.shortest_to(self.angle).abs() > FRAC_PI_2 {
            Self::new(
                -self.speed,
                Rotation2d::from_radians(self.angle.wrapped() + std::f64::consts::PI),
            )
        } else {
            self
        }
    }
}

/// Cumulative drive distance and current steer angle of one module
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SwerveModulePosition {
    /// Metres travelled since the encoder was zeroed
    pub distance: f64,
    pub angle: Rotation2d,
}

impl SwerveModulePosition {
    pub const fn new(distance: f64, angle: Rotation2d) -> Self {
        Self { distance, angle }
    }
}

/// Distance from the robot centre to the farthest module
pub fn max_module_radius(offsets: &[Translation2d]) -> f64 {
    offsets
        .iter()
        .map(|offset| offset.norm())
        .fold(0.0f64, f64::max)
}

/// Scale every module speed by the same factor so none exceeds `max_speed`.
///
/// Ratios between modules, and so the path curvature, are preserved.
pub fn desaturate_wheel_speeds(states: &mut [ModuleState], max_speed: f64) {
    let fastest = states
        .iter()
        .map(|state| state.speed.abs())
        .fold(0.0f64, f64::max);

    if fastest > max_speed {
        let scale = max_speed / fastest;
        for state in states.iter_mut() {
            state.speed *= scale;
        }
    }
}

/// Swerve kinematics for an ordered list of module offsets
#[derive(Debug, Clone)]
pub struct SwerveKinematics {
    offsets: Vec<Translation2d>,
    /// 2N x 3: chassis velocity -> stacked module velocity vectors
    inverse: DMatrix<f64>,
    /// 3 x 2N: least-squares inverse of `inverse`
    forward: DMatrix<f64>,
}

impl SwerveKinematics {
    /// Build the kinematics operator for modules mounted at `offsets` from the robot centre
    pub fn new(offsets: Vec<Translation2d>) -> Result<Self, KinematicsError> {
        if offsets.len() < 2 {
            return Err(KinematicsError::TooFewModules(offsets.len()));
        }
        if let Some((index, &offset)) = offsets.iter().enumerate().find(|(_, o)| !o.is_finite()) {
            return Err(KinematicsError::InvalidOffset { index, offset });
        }

        let inverse = DMatrix::from_fn(offsets.len() * 2, 3, |row, col| {
            let offset = offsets[row / 2];
            match (row % 2, col) {
                (0, 0) => 1.0,
                (0, 2) => -offset.y,
                (1, 1) => 1.0,
                (1, 2) => offset.x,
                _ => 0.0,
            }
        });

        let rank = inverse.rank(RANK_EPSILON);
        if rank < 3 {
            return Err(KinematicsError::DegenerateGeometry { rank });
        }

        let forward = inverse
            .clone()
            .pseudo_inverse(RANK_EPSILON)
            .map_err(KinematicsError::PseudoInverse)?;

        debug!("Built swerve kinematics for {} modules", offsets.len());
        Ok(Self {
            offsets,
            inverse,
            forward,
        })
    }

    pub fn num_modules(&self) -> usize {
        self.offsets.len()
    }

    pub fn offsets(&self) -> &[Translation2d] {
        &self.offsets
    }

    /// Inverse kinematics: chassis velocity -> module states.
    ///
    /// A module whose required velocity is (numerically) zero keeps the angle
    /// in `previous_angles` so the wheel does not snap back to 0. Missing
    /// entries in `previous_angles` default to zero.
    pub fn to_module_states(
        &self,
        speeds: &ChassisSpeeds,
        previous_angles: &[Rotation2d],
    ) -> Vec<ModuleState> {
        let chassis = DVector::from_column_slice(&[speeds.vx, speeds.vy, speeds.omega]);
        let module_velocities = &self.inverse * chassis;

        (0..self.num_modules())
            .map(|i| {
                let velocity =
                    Translation2d::new(module_velocities[2 * i], module_velocities[2 * i + 1]);
                let speed = velocity.norm();

                if speed < MIN_MODULE_SPEED {
                    let held = previous_angles.get(i).copied().unwrap_or(Rotation2d::ZERO);
                    ModuleState::stopped(held)
                } else {
                    ModuleState::new(speed, velocity.angle())
                }
            })
            .collect()
    }

    /// Forward kinematics over one interval: module displacements -> robot-frame twist
    pub fn to_twist(&self, deltas: &[SwerveModulePosition]) -> Result<Twist2d, KinematicsError> {
        let solved = self.solve(deltas.iter().map(|d| (d.distance, d.angle)), deltas.len())?;
        Ok(Twist2d::new(solved[0], solved[1], solved[2]))
    }

    /// Forward kinematics on velocities: module states -> chassis speeds
    pub fn to_chassis_speeds(&self, states: &[ModuleState]) -> Result<ChassisSpeeds, KinematicsError> {
        let solved = self.solve(states.iter().map(|s| (s.speed, s.angle)), states.len())?;
        Ok(ChassisSpeeds::new(solved[0], solved[1], solved[2]))
    }

    fn solve(
        &self,
        vectors: impl Iterator<Item = (f64, Rotation2d)>,
        len: usize,
    ) -> Result<DVector<f64>, KinematicsError> {
        if len != self.num_modules() {
            return Err(KinematicsError::ModuleCountMismatch {
                expected: self.num_modules(),
                actual: len,
            });
        }

        let stacked: Vec<f64> = vectors
            .flat_map(|(magnitude, angle)| {
                let v = Translation2d::from_polar(magnitude, angle);
                [v.x, v.y]
            })
            .collect();

        Ok(&self.forward * DVector::from_vec(stacked))
    }
}
