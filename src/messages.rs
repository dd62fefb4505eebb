// Define message types for the runtime

use serde::{Deserialize, Serialize};

use crate::drive::TickReport;
use crate::geometry::{Pose2d, Rotation2d};
use crate::kinematics::ChassisSpeeds;

// Command from teleop/autonomous -> runtime
// Units: m/s and rad/s. Field-relative commands are rotated by the current pose heading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChassisCommand {
    pub vx: f64,
    pub vy: f64,
    pub omega: f64,
    #[serde(default)]
    pub field_relative: bool,
}

impl ChassisCommand {
    pub fn to_chassis_speeds(&self, heading: Rotation2d) -> ChassisSpeeds {
        if self.field_relative {
            ChassisSpeeds::from_field_relative(self.vx, self.vy, self.omega, heading)
        } else {
            ChassisSpeeds::new(self.vx, self.vy, self.omega)
        }
    }
}

// Re-localisation request -> runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResetPose {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

impl From<ResetPose> for Pose2d {
    fn from(reset: ResetPose) -> Self {
        Pose2d::from_xy_theta(reset.x, reset.y, reset.theta)
    }
}

// Heading sample from the IMU publisher (radians, counter-clockwise positive)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HeadingSample {
    pub yaw: f64,
}

// Pose estimate published by runtime
// theta is wrapped to (-pi, pi]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct PoseReport {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

impl From<Pose2d> for PoseReport {
    fn from(pose: Pose2d) -> Self {
        Self {
            x: pose.x(),
            y: pose.y(),
            theta: pose.rotation.wrapped(),
        }
    }
}

// Module setpoints published by runtime, one entry per module in config order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleSetpoint {
    pub speed: f64,
    pub angle: f64,
}

impl ModuleSetpoint {
    pub fn from_report(report: &TickReport) -> Vec<Self> {
        report
            .states
            .iter()
            .map(|state| ModuleSetpoint {
                speed: state.speed,
                angle: state.angle.wrapped(),
            })
            .collect()
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    Degraded,
}
