// Timeouts, topics, chassis configuration
use std::f64::consts::PI;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::geometry::{Rotation2d, Translation2d};
use crate::kinematics::max_module_radius;

// Runtime loop frequency
pub const LOOP_HZ: u64 = 50;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// An IMU heading older than this is treated as a failed read
pub const HEADING_TIMEOUT: Duration = Duration::from_millis(100);

// Zenoh topics
pub const TOPIC_CMD_BASE: &str = "swerve/cmd/base"; // chassis velocity commands
pub const TOPIC_CMD_RESET_POSE: &str = "swerve/cmd/reset_pose"; // re-localisation
pub const TOPIC_CMD_ZERO_HEADING: &str = "swerve/cmd/zero_heading"; // gyro zero
pub const TOPIC_SENSOR_HEADING: &str = "swerve/sensor/heading"; // external IMU
pub const TOPIC_STATE_POSE: &str = "swerve/state/pose"; // odometry estimate
pub const TOPIC_RT_MODULES: &str = "swerve/rt/modules"; // module setpoints
pub const TOPIC_HEALTH: &str = "swerve/state/health"; // health status

// Serial port for the Feetech servo bus
pub const MOTOR_PORT: &str = "/dev/ttyACM0";

/// Errors raised while loading or validating a [`DriveConfig`]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{name} must be positive and finite, got {value}")]
    NonPositive { name: &'static str, value: f64 },

    #[error("speed_limit must be in (0, 1], got {0}")]
    SpeedLimitOutOfRange(f64),

    #[error("At least 2 modules are required, got {0}")]
    TooFewModules(usize),

    #[error("Module {0} has a non-finite mounting offset")]
    InvalidOffset(String),
}

/// Mounting and wiring of one swerve module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    /// Offset from the robot centre, x forward (m)
    pub x: f64,
    /// Offset from the robot centre, y left (m)
    pub y: f64,
    /// Servo ID of the drive motor
    pub drive_id: u8,
    /// Servo ID of the steer motor
    pub steer_id: u8,
    /// Steer encoder reading (degrees) when the wheel points forward
    #[serde(default)]
    pub steer_offset_deg: f64,
}

impl ModuleConfig {
    pub fn offset(&self) -> Translation2d {
        Translation2d::new(self.x, self.y)
    }

    pub fn steer_offset(&self) -> Rotation2d {
        Rotation2d::from_degrees(self.steer_offset_deg)
    }
}

/// Chassis geometry and limits, fixed for the lifetime of the drivetrain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Maximum achievable wheel speed (m/s)
    pub max_velocity: f64,
    /// Maximum chassis rotation rate (rad/s); derived from the geometry when unset
    pub max_angular_velocity: Option<f64>,
    /// Actuator output commanded at `max_velocity` (raw servo units)
    pub max_output: f64,
    /// Global multiplier applied to every wheel speed, in (0, 1]
    pub speed_limit: f64,
    /// Wheel diameter (m)
    pub wheel_diameter: f64,
    /// Motor revolutions per wheel revolution
    pub drive_gear_ratio: f64,
    /// Encoder counts per motor revolution
    pub encoder_resolution: f64,
    pub modules: Vec<ModuleConfig>,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            max_velocity: 0.3,
            max_angular_velocity: None,
            max_output: 3000.0,
            speed_limit: 1.0,
            wheel_diameter: 0.06,
            drive_gear_ratio: 1.0,
            encoder_resolution: 4096.0,
            modules: Self::rectangular_modules(0.2, 0.2),
        }
    }
}

impl DriveConfig {
    /// Four modules at the corners of a rectangle: front-left, front-right, back-left, back-right
    pub fn rectangular_modules(track_width: f64, wheelbase: f64) -> Vec<ModuleConfig> {
        let (hx, hy) = (wheelbase / 2.0, track_width / 2.0);
        [
            ("front_left", hx, hy, 1, 2),
            ("front_right", hx, -hy, 3, 4),
            ("back_left", -hx, hy, 5, 6),
            ("back_right", -hx, -hy, 7, 8),
        ]
        .into_iter()
        .map(|(name, x, y, drive_id, steer_id)| ModuleConfig {
            name: name.to_string(),
            x,
            y,
            drive_id,
            steer_id,
            steer_offset_deg: 0.0,
        })
        .collect()
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading drive config from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: DriveConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the control loop cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_velocity", self.max_velocity),
            ("max_output", self.max_output),
            ("wheel_diameter", self.wheel_diameter),
            ("drive_gear_ratio", self.drive_gear_ratio),
            ("encoder_resolution", self.encoder_resolution),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::NonPositive { name, value });
            }
        }

        if let Some(value) = self.max_angular_velocity {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::NonPositive {
                    name: "max_angular_velocity",
                    value,
                });
            }
        }

        if !(self.speed_limit > 0.0 && self.speed_limit <= 1.0) {
            return Err(ConfigError::SpeedLimitOutOfRange(self.speed_limit));
        }

        if self.modules.len() < 2 {
            return Err(ConfigError::TooFewModules(self.modules.len()));
        }
        if let Some(module) = self.modules.iter().find(|m| !m.offset().is_finite()) {
            return Err(ConfigError::InvalidOffset(module.name.clone()));
        }

        Ok(())
    }

    pub fn module_offsets(&self) -> Vec<Translation2d> {
        self.modules.iter().map(ModuleConfig::offset).collect()
    }

    /// Configured rotation limit, or the rate at which the farthest module reaches `max_velocity`
    pub fn max_angular_velocity(&self) -> f64 {
        self.max_angular_velocity
            .unwrap_or_else(|| self.max_velocity / max_module_radius(&self.module_offsets()))
    }

    /// Wheel travel per encoder count (m)
    pub fn distance_per_count(&self) -> f64 {
        self.wheel_diameter * PI / (self.drive_gear_ratio * self.encoder_resolution)
    }
}
