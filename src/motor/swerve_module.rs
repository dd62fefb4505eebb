// Swerve module built from two Feetech servos
//
// The drive servo runs in velocity mode and its shaft position is unwrapped
// into a cumulative wheel distance. The steer servo runs in position mode and
// points the wheel directly.

use std::f64::consts::TAU;
use std::io::{Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use serialport::SerialPort;
use tracing::{debug, info, warn};

use super::feetech::{FeetechBus, MAX_VELOCITY_MAGNITUDE, OperatingMode, STEPS_PER_REVOLUTION};
use super::{HardwareError, SwerveModuleIo};
use crate::config::{DriveConfig, ModuleConfig};
use crate::geometry::Rotation2d;
use crate::kinematics::{ModuleState, SwerveModulePosition};

/// One serial bus shared by every module on the base
pub type SharedBus<P = Box<dyn SerialPort>> = Arc<Mutex<FeetechBus<P>>>;

const HALF_TURN_STEPS: i32 = STEPS_PER_REVOLUTION as i32 / 2;

pub struct FeetechSwerveModule<P: Read + Write = Box<dyn SerialPort>> {
    name: String,
    bus: SharedBus<P>,
    drive_id: u8,
    steer_id: u8,
    steer_offset: Rotation2d,
    distance_per_count: f64,
    max_velocity: f64,
    max_output: f64,
    /// Unwrapped drive encoder count since construction
    drive_counts: i64,
    last_drive_raw: Option<u16>,
    last_angle: Rotation2d,
}

impl<P: Read + Write> FeetechSwerveModule<P> {
    pub fn new(bus: SharedBus<P>, module: &ModuleConfig, drive: &DriveConfig) -> Self {
        Self {
            name: module.name.clone(),
            bus,
            drive_id: module.drive_id,
            steer_id: module.steer_id,
            steer_offset: module.steer_offset(),
            distance_per_count: drive.distance_per_count(),
            max_velocity: drive.max_velocity,
            max_output: drive.max_output,
            drive_counts: 0,
            last_drive_raw: None,
            last_angle: Rotation2d::ZERO,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Put the drive servo in velocity mode and the steer servo in position mode.
    ///
    /// Must be called before the module is driven.
    pub fn initialize(&mut self) -> Result<(), HardwareError> {
        info!(
            "Initializing module {} (drive={}, steer={})",
            self.name, self.drive_id, self.steer_id
        );
        let mut bus = self.bus.lock();

        for id in [self.drive_id, self.steer_id] {
            if !bus.ping(id)? {
                warn!("Servo {} on module {} not responding to ping", id, self.name);
                return Err(HardwareError::Unavailable(format!("servo {}", id)));
            }
            // Mode changes need torque off
            bus.disable_torque(id)?;
        }

        bus.set_operating_mode(self.drive_id, OperatingMode::Velocity)?;
        bus.set_operating_mode(self.steer_id, OperatingMode::Position)?;
        bus.enable_torque(self.drive_id)?;
        bus.enable_torque(self.steer_id)?;
        drop(bus);

        self.read_position()?;
        debug!("Module {} initialized", self.name);
        Ok(())
    }

    /// Raw velocity command for a wheel speed, scaled so `max_velocity` maps to `max_output`
    fn drive_output(&self, speed: f64) -> i16 {
        let raw = speed / self.max_velocity * self.max_output;
        raw.round()
            .clamp(-(MAX_VELOCITY_MAGNITUDE as f64), MAX_VELOCITY_MAGNITUDE as f64) as i16
    }

    fn angle_to_steps(&self, angle: Rotation2d) -> u16 {
        let shaft = (angle + self.steer_offset).radians().rem_euclid(TAU);
        let steps = (shaft / TAU * STEPS_PER_REVOLUTION as f64).round() as u32;
        (steps % STEPS_PER_REVOLUTION as u32) as u16
    }

    fn steps_to_angle(&self, steps: u16) -> Rotation2d {
        let shaft = steps as f64 / STEPS_PER_REVOLUTION as f64 * TAU;
        Rotation2d::from_radians(shaft) - self.steer_offset
    }

    /// Fold a new 12-bit reading into the running count, taking the short way round
    fn accumulate_drive(&mut self, raw: u16) {
        if let Some(previous) = self.last_drive_raw {
            let mut delta = raw as i32 - previous as i32;
            if delta > HALF_TURN_STEPS {
                delta -= STEPS_PER_REVOLUTION as i32;
            } else if delta < -HALF_TURN_STEPS {
                delta += STEPS_PER_REVOLUTION as i32;
            }
            self.drive_counts += delta as i64;
        }
        self.last_drive_raw = Some(raw);
    }
}

impl<P: Read + Write> SwerveModuleIo for FeetechSwerveModule<P> {
    fn set_target(&mut self, state: ModuleState) -> Result<(), HardwareError> {
        let state = state.optimize(self.last_angle);
        let velocity = self.drive_output(state.speed);
        let steps = self.angle_to_steps(state.angle);

        let mut bus = self.bus.lock();
        bus.set_goal_position(self.steer_id, steps)?;
        bus.set_goal_velocity(self.drive_id, velocity)?;
        Ok(())
    }

    fn read_position(&mut self) -> Result<SwerveModulePosition, HardwareError> {
        let (drive_raw, steer_raw) = {
            let mut bus = self.bus.lock();
            (
                bus.present_position(self.drive_id)?,
                bus.present_position(self.steer_id)?,
            )
        };

        self.accumulate_drive(drive_raw);
        self.last_angle = self.steps_to_angle(steer_raw);

        Ok(SwerveModulePosition::new(
            self.drive_counts as f64 * self.distance_per_count,
            self.last_angle,
        ))
    }

    fn stop(&mut self) -> Result<(), HardwareError> {
        self.bus.lock().set_goal_velocity(self.drive_id, 0)?;
        Ok(())
    }
}

impl<P: Read + Write> Drop for FeetechSwerveModule<P> {
    fn drop(&mut self) {
        // Try to stop the wheel when the module is dropped (safety measure)
        if let Err(e) = self.stop() {
            warn!("Failed to stop module {} on drop: {}", self.name, e);
        }
    }
}
