// Swerve odometry
//
// Integrates per-module travel since the previous update into a field-frame
// pose. The orientation sensor is authoritative for heading; the wheels only
// supply translation, unless the sensor is unavailable for a tick.

use std::sync::Arc;

use tracing::{debug, info};

use crate::geometry::{Pose2d, Rotation2d};
use crate::kinematics::{KinematicsError, SwerveKinematics, SwerveModulePosition};

/// Pose estimate and the integration state behind it
#[derive(Debug, Clone)]
pub struct SwerveOdometry {
    kinematics: Arc<SwerveKinematics>,
    pose: Pose2d,
    /// Pose heading minus sensor heading at the last reset
    gyro_offset: Rotation2d,
    /// Reset happened without a sensor reading; the offset is taken from the next one
    offset_pending: bool,
    previous_positions: Vec<SwerveModulePosition>,
}

impl SwerveOdometry {
    /// Start integrating from `initial_pose`, using the current sensor readings as the baseline
    pub fn new(
        kinematics: Arc<SwerveKinematics>,
        heading: Rotation2d,
        positions: &[SwerveModulePosition],
        initial_pose: Pose2d,
    ) -> Result<Self, KinematicsError> {
        check_len(&kinematics, positions)?;
        Ok(Self {
            gyro_offset: initial_pose.rotation - heading,
            offset_pending: false,
            pose: initial_pose,
            previous_positions: positions.to_vec(),
            kinematics,
        })
    }

    pub fn pose(&self) -> Pose2d {
        self.pose
    }

    /// Replace the pose and re-baseline on the given readings.
    ///
    /// The next [`update`](Self::update) with the same heading and positions
    /// leaves the pose at exactly `pose`.
    pub fn reset(
        &mut self,
        pose: Pose2d,
        heading: Rotation2d,
        positions: &[SwerveModulePosition],
    ) -> Result<(), KinematicsError> {
        check_len(&self.kinematics, positions)?;
        self.pose = pose;
        self.gyro_offset = pose.rotation - heading;
        self.offset_pending = false;
        self.previous_positions.clear();
        self.previous_positions.extend_from_slice(positions);
        info!("Odometry reset to {}", pose);
        Ok(())
    }

    /// Reset while the orientation sensor is unreadable.
    ///
    /// Wheels-only updates continue from `pose`. The first [`update`](Self::update)
    /// after this pins the gyro offset to the pose heading at that moment.
    pub fn reset_without_heading(
        &mut self,
        pose: Pose2d,
        positions: &[SwerveModulePosition],
    ) -> Result<(), KinematicsError> {
        check_len(&self.kinematics, positions)?;
        self.pose = pose;
        self.offset_pending = true;
        self.previous_positions.clear();
        self.previous_positions.extend_from_slice(positions);
        info!("Odometry reset to {}, heading offset deferred", pose);
        Ok(())
    }

    /// Integrate one tick of module travel, taking heading from the orientation sensor
    pub fn update(
        &mut self,
        heading: Rotation2d,
        positions: &[SwerveModulePosition],
    ) -> Result<Pose2d, KinematicsError> {
        let deltas = self.deltas(positions)?;
        if self.offset_pending {
            self.gyro_offset = self.pose.rotation - heading;
            self.offset_pending = false;
            debug!("Heading offset fixed at {}", self.gyro_offset);
        }

        let angle = heading + self.gyro_offset;
        let mut twist = self.kinematics.to_twist(&deltas)?;
        twist.dtheta = self.pose.rotation.shortest_to(angle);

        let advanced = self.pose.exp(twist);
        self.pose = Pose2d::new(advanced.translation, angle);
        self.previous_positions.copy_from_slice(positions);
        Ok(self.pose)
    }

    /// Integrate one tick using the wheel-derived rotation.
    ///
    /// Used when the orientation sensor could not be read this tick. Once the
    /// sensor comes back, [`update`](Self::update) snaps the heading back to it.
    pub fn update_wheels_only(
        &mut self,
        positions: &[SwerveModulePosition],
    ) -> Result<Pose2d, KinematicsError> {
        let twist = self.kinematics.to_twist(&self.deltas(positions)?)?;
        debug!("Wheel-only odometry update, dtheta={:.4}", twist.dtheta);

        self.pose = self.pose.exp(twist);
        self.previous_positions.copy_from_slice(positions);
        Ok(self.pose)
    }

    fn deltas(
        &self,
        positions: &[SwerveModulePosition],
    ) -> Result<Vec<SwerveModulePosition>, KinematicsError> {
        check_len(&self.kinematics, positions)?;
        Ok(positions
            .iter()
            .zip(&self.previous_positions)
            .map(|(now, before)| SwerveModulePosition::new(now.distance - before.distance, now.angle))
            .collect())
    }
}

fn check_len(
    kinematics: &SwerveKinematics,
    positions: &[SwerveModulePosition],
) -> Result<(), KinematicsError> {
    if positions.len() == kinematics.num_modules() {
        Ok(())
    } else {
        Err(KinematicsError::ModuleCountMismatch {
            expected: kinematics.num_modules(),
            actual: positions.len(),
        })
    }
}
