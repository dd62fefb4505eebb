// Module actuation adapters for the swerve base
//
// Provides:
// - The capability traits the drive loop talks to (module + heading sensor)
// - Feetech STS3215 serial protocol and a servo-backed swerve module
// - A simulated drivetrain for running without hardware
// - A heading latched from an external IMU publisher

pub mod feetech;
mod heading;
pub mod sim;
mod swerve_module;

use std::time::Duration;

use crate::geometry::Rotation2d;
use crate::kinematics::{ModuleState, SwerveModulePosition};

pub use feetech::{FeetechBus, FeetechError};
pub use heading::LatchedHeading;
pub use sim::{SharedSim, SimChassis, SimGyro, SimModule};
pub use swerve_module::{FeetechSwerveModule, SharedBus};

/// Failures reported by hardware adapters
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("Servo bus error: {0}")]
    Bus(#[from] FeetechError),

    #[error("{0} is not responding")]
    Unavailable(String),

    #[error("No heading sample received yet")]
    NoHeading,

    #[error("Heading sample is stale ({0:?} old)")]
    StaleHeading(Duration),

    #[error("Injected fault on {0}")]
    Injected(String),
}

/// One steerable wheel: drive + steer actuators and their encoders
pub trait SwerveModuleIo {
    /// Command a wheel speed (m/s) and steer angle
    fn set_target(&mut self, state: ModuleState) -> Result<(), HardwareError>;

    /// Cumulative drive distance (m) and current steer angle
    fn read_position(&mut self) -> Result<SwerveModulePosition, HardwareError>;

    /// Stop the drive motor, leaving the wheel where it points
    fn stop(&mut self) -> Result<(), HardwareError>;
}

/// Absolute robot heading, drift-corrected by the sensor itself
pub trait HeadingSensor {
    fn read_heading(&mut self) -> Result<Rotation2d, HardwareError>;

    /// Make the current heading read as zero from now on
    fn zero(&mut self) -> Result<(), HardwareError>;
}
