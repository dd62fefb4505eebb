// Periodic drive control loop
//
// One tick: held command -> inverse kinematics -> desaturate -> command
// modules -> read back positions + heading -> odometry. Nothing in a tick
// blocks on a missing command and no per-tick fault escapes as an error.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, DriveConfig};
use crate::geometry::{Pose2d, Rotation2d};
use crate::kinematics::{
    ChassisSpeeds, KinematicsError, ModuleState, SwerveKinematics, SwerveModulePosition,
    desaturate_wheel_speeds,
};
use crate::motor::{HardwareError, HeadingSensor, SwerveModuleIo};
use crate::odometry::SwerveOdometry;

/// Fatal errors, only raised while building the drivetrain
#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error("Invalid drive configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid chassis geometry: {0}")]
    Kinematics(#[from] KinematicsError),

    #[error("Configured {configured} modules but {provided} adapters were provided")]
    ModuleCount { configured: usize, provided: usize },
}

/// A non-fatal hardware problem seen during one tick
#[derive(Debug)]
pub enum ModuleFault {
    /// Target rejected; the module was told to stop for this tick
    Write { index: usize, error: HardwareError },
    /// Position unreadable; the last known position was used
    Read { index: usize, error: HardwareError },
    /// Heading unreadable; odometry used wheel-derived rotation
    Heading { error: HardwareError },
}

/// Outcome of one control tick
#[derive(Debug)]
pub struct TickReport {
    /// States sent to the modules, after desaturation and speed limit
    pub states: Vec<ModuleState>,
    pub pose: Pose2d,
    pub faults: Vec<ModuleFault>,
}

impl TickReport {
    pub fn is_degraded(&self) -> bool {
        !self.faults.is_empty()
    }
}

/// Read-only view of the pose for other tasks; every read is a consistent copy
#[derive(Debug, Clone, Default)]
pub struct PoseHandle(Arc<RwLock<Pose2d>>);

impl PoseHandle {
    pub fn get(&self) -> Pose2d {
        *self.0.read()
    }

    fn publish(&self, pose: Pose2d) {
        *self.0.write() = pose;
    }
}

pub type BoxedModule = Box<dyn SwerveModuleIo + Send>;
pub type BoxedHeading = Box<dyn HeadingSensor + Send>;

/// Swerve drivetrain: actuation and pose estimation driven by one periodic tick
pub struct Drivetrain {
    config: DriveConfig,
    kinematics: Arc<SwerveKinematics>,
    odometry: SwerveOdometry,
    modules: Vec<BoxedModule>,
    heading_sensor: BoxedHeading,
    /// Held until replaced (zero-order hold)
    command: ChassisSpeeds,
    commanded_angles: Vec<Rotation2d>,
    last_positions: Vec<SwerveModulePosition>,
    heading_available: bool,
    pose: PoseHandle,
}

impl Drivetrain {
    /// Validate the configuration and start odometry at the origin
    pub fn new(
        config: DriveConfig,
        modules: Vec<BoxedModule>,
        heading_sensor: BoxedHeading,
    ) -> Result<Self, DriveError> {
        config.validate()?;
        if modules.len() != config.modules.len() {
            return Err(DriveError::ModuleCount {
                configured: config.modules.len(),
                provided: modules.len(),
            });
        }

        let kinematics = Arc::new(SwerveKinematics::new(config.module_offsets())?);
        let count = modules.len();
        let placeholder = SwerveOdometry::new(
            kinematics.clone(),
            Rotation2d::ZERO,
            &vec![SwerveModulePosition::default(); count],
            Pose2d::default(),
        )?;

        let mut drivetrain = Self {
            config,
            kinematics,
            odometry: placeholder,
            modules,
            heading_sensor,
            command: ChassisSpeeds::default(),
            commanded_angles: vec![Rotation2d::ZERO; count],
            last_positions: vec![SwerveModulePosition::default(); count],
            heading_available: true,
            pose: PoseHandle::default(),
        };

        // Baseline on whatever the hardware reports right now
        let (heading, faults) = drivetrain.read_snapshot();
        for fault in &faults {
            warn!("Startup read fault: {:?}", fault);
        }
        drivetrain.commanded_angles = drivetrain.last_positions.iter().map(|p| p.angle).collect();
        drivetrain.reset_odometry(Pose2d::default(), heading);

        info!(
            "Drivetrain ready: {} modules, max {:.2} m/s, {:.2} rad/s",
            count,
            drivetrain.config.max_velocity,
            drivetrain.config.max_angular_velocity()
        );
        Ok(drivetrain)
    }

    pub fn config(&self) -> &DriveConfig {
        &self.config
    }

    pub fn kinematics(&self) -> &Arc<SwerveKinematics> {
        &self.kinematics
    }

    /// Replace the held chassis command
    pub fn set_command(&mut self, speeds: ChassisSpeeds) {
        self.command = speeds;
    }

    pub fn command(&self) -> ChassisSpeeds {
        self.command
    }

    pub fn pose(&self) -> Pose2d {
        self.pose.get()
    }

    pub fn pose_handle(&self) -> PoseHandle {
        self.pose.clone()
    }

    /// Run one control cycle
    pub fn tick(&mut self) -> TickReport {
        let mut faults = Vec::new();

        let mut states = self
            .kinematics
            .to_module_states(&self.command, &self.commanded_angles);
        desaturate_wheel_speeds(&mut states, self.config.max_velocity);
        for state in &mut states {
            state.speed *= self.config.speed_limit;
        }

        for (index, (module, state)) in self.modules.iter_mut().zip(&mut states).enumerate() {
            match module.set_target(*state) {
                Ok(()) => self.commanded_angles[index] = state.angle,
                Err(error) => {
                    warn!("Module {} rejected target, stopping it: {}", index, error);
                    if let Err(stop_error) = module.stop() {
                        warn!("Module {} also failed to stop: {}", index, stop_error);
                    }
                    state.speed = 0.0;
                    faults.push(ModuleFault::Write { index, error });
                }
            }
        }

        let (heading, read_faults) = self.read_snapshot();
        faults.extend(read_faults);

        let estimate = match heading {
            Some(heading) => self.odometry.update(heading, &self.last_positions),
            None => self.odometry.update_wheels_only(&self.last_positions),
        };
        if let Err(e) = estimate {
            error!("Odometry update failed: {}", e);
        }

        let pose = self.odometry.pose();
        self.pose.publish(pose);
        debug!("Tick: cmd={:?} pose={}", self.command, pose);

        TickReport {
            states,
            pose,
            faults,
        }
    }

    /// Re-localise: the pose becomes `pose` and the current readings become the baseline
    pub fn reset_pose(&mut self, pose: Pose2d) -> Vec<ModuleFault> {
        let (heading, faults) = self.read_snapshot();
        self.reset_odometry(pose, heading);
        faults
    }

    /// Zero the orientation sensor and the pose heading, keeping the position
    pub fn zero_heading(&mut self) -> Result<(), HardwareError> {
        self.heading_sensor.zero()?;
        let translation = self.odometry.pose().translation;
        self.reset_pose(Pose2d::new(translation, Rotation2d::ZERO));
        info!("Heading zeroed");
        Ok(())
    }

    /// Hold zero velocity and stop every drive motor now
    pub fn stop(&mut self) {
        self.command = ChassisSpeeds::default();
        for (index, module) in self.modules.iter_mut().enumerate() {
            if let Err(e) = module.stop() {
                warn!("Failed to stop module {}: {}", index, e);
            }
        }
    }

    /// Read every position and the heading back to back.
    ///
    /// Failed module reads keep their last known position. Returns the fresh
    /// heading, or `None` when the sensor could not be read.
    fn read_snapshot(&mut self) -> (Option<Rotation2d>, Vec<ModuleFault>) {
        let mut faults = Vec::new();

        for (index, module) in self.modules.iter_mut().enumerate() {
            match module.read_position() {
                Ok(position) => self.last_positions[index] = position,
                Err(error) => {
                    warn!("Module {} position unavailable, holding last value: {}", index, error);
                    faults.push(ModuleFault::Read { index, error });
                }
            }
        }

        let heading = match self.heading_sensor.read_heading() {
            Ok(heading) => {
                if !self.heading_available {
                    info!("Heading available again");
                }
                self.heading_available = true;
                Some(heading)
            }
            Err(error) => {
                // Only log the transition; a missing IMU would otherwise warn every tick
                if self.heading_available {
                    warn!("Heading unavailable, using wheel rotation: {}", error);
                }
                self.heading_available = false;
                faults.push(ModuleFault::Heading { error });
                None
            }
        };

        (heading, faults)
    }

    /// Without a fresh heading the gyro offset waits for the next good read
    fn reset_odometry(&mut self, pose: Pose2d, heading: Option<Rotation2d>) {
        let result = match heading {
            Some(heading) => self.odometry.reset(pose, heading, &self.last_positions),
            None => self.odometry.reset_without_heading(pose, &self.last_positions),
        };
        if let Err(e) = result {
            error!("Odometry reset failed: {}", e);
        }
        self.pose.publish(self.odometry.pose());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::{SharedSim, SimChassis};
    use approx::assert_abs_diff_eq;

    const DT: f64 = 0.02;

    fn config() -> DriveConfig {
        DriveConfig {
            max_velocity: 2.0,
            ..DriveConfig::default()
        }
    }

    fn sim_drivetrain(config: DriveConfig) -> (Drivetrain, SharedSim) {
        let kinematics = Arc::new(SwerveKinematics::new(config.module_offsets()).unwrap());
        let sim = SimChassis::new(kinematics).into_shared();
        let modules = SimChassis::modules(&sim)
            .into_iter()
            .map(|m| Box::new(m) as BoxedModule)
            .collect();
        let gyro = Box::new(SimChassis::gyro(&sim));
        (Drivetrain::new(config, modules, gyro).unwrap(), sim)
    }

    fn run(drivetrain: &mut Drivetrain, sim: &SharedSim, ticks: usize) -> TickReport {
        let mut report = drivetrain.tick();
        for _ in 1..ticks {
            sim.lock().step(DT);
            report = drivetrain.tick();
        }
        report
    }

    #[test]
    fn test_zero_max_velocity_is_fatal() {
        let bad = DriveConfig {
            max_velocity: 0.0,
            ..DriveConfig::default()
        };
        let sim = SimChassis::new(Arc::new(SwerveKinematics::new(bad.module_offsets()).unwrap())).into_shared();
        let modules = SimChassis::modules(&sim)
            .into_iter()
            .map(|m| Box::new(m) as BoxedModule)
            .collect();
        let result = Drivetrain::new(bad, modules, Box::new(SimChassis::gyro(&sim)));
        assert!(matches!(result, Err(DriveError::Config(_))));
    }

    #[test]
    fn test_module_count_must_match_config() {
        let config = config();
        let sim = SimChassis::new(Arc::new(SwerveKinematics::new(config.module_offsets()).unwrap())).into_shared();
        let modules: Vec<BoxedModule> = SimChassis::modules(&sim)
            .into_iter()
            .take(3)
            .map(|m| Box::new(m) as BoxedModule)
            .collect();
        let result = Drivetrain::new(config, modules, Box::new(SimChassis::gyro(&sim)));
        assert!(matches!(
            result,
            Err(DriveError::ModuleCount {
                configured: 4,
                provided: 3
            })
        ));
    }

    #[test]
    fn test_command_is_held_between_ticks() {
        let (mut drivetrain, sim) = sim_drivetrain(config());
        drivetrain.set_command(ChassisSpeeds::new(1.0, 0.0, 0.0));

        // 51 ticks: 50 sim steps of 20 ms at 1 m/s
        let report = run(&mut drivetrain, &sim, 51);
        assert!(!report.is_degraded());
        assert!(report.states.iter().all(|s| (s.speed - 1.0).abs() < 1e-9));
        assert_abs_diff_eq!(report.pose.x(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(sim.lock().pose().x(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_odometry_tracks_simulated_motion() {
        let (mut drivetrain, sim) = sim_drivetrain(config());
        drivetrain.set_command(ChassisSpeeds::new(0.5, 0.3, 0.8));

        let report = run(&mut drivetrain, &sim, 101);
        let truth = sim.lock().pose();
        assert_abs_diff_eq!(report.pose.x(), truth.x(), epsilon = 1e-6);
        assert_abs_diff_eq!(report.pose.y(), truth.y(), epsilon = 1e-6);
        assert_abs_diff_eq!(report.pose.rotation.radians(), truth.rotation.radians(), epsilon = 1e-9);
    }

    #[test]
    fn test_desaturation_and_speed_limit() {
        let config = DriveConfig {
            speed_limit: 0.5,
            ..config()
        };
        let (mut drivetrain, _sim) = sim_drivetrain(config);
        drivetrain.set_command(ChassisSpeeds::new(3.0, 0.0, 4.0));

        let report = drivetrain.tick();
        let fastest = report.states.iter().map(|s| s.speed).fold(0.0, f64::max);
        assert_abs_diff_eq!(fastest, 2.0 * 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_angles_held_when_stopping() {
        let (mut drivetrain, sim) = sim_drivetrain(config());
        drivetrain.set_command(ChassisSpeeds::new(0.0, 1.0, 0.0));
        run(&mut drivetrain, &sim, 3);

        drivetrain.set_command(ChassisSpeeds::default());
        let report = drivetrain.tick();
        for state in &report.states {
            assert_eq!(state.speed, 0.0);
            assert_abs_diff_eq!(state.angle.radians(), std::f64::consts::FRAC_PI_2, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_write_fault_stops_module_and_tick_completes() {
        let (mut drivetrain, sim) = sim_drivetrain(config());
        drivetrain.set_command(ChassisSpeeds::new(1.0, 0.0, 0.0));
        run(&mut drivetrain, &sim, 2);

        sim.lock().set_write_fault(2, true);
        sim.lock().step(DT);
        let report = drivetrain.tick();

        assert!(matches!(report.faults.as_slice(), [ModuleFault::Write { index: 2, .. }]));
        assert_eq!(report.states[2].speed, 0.0);
        assert_eq!(sim.lock().target(2).map(|s| s.speed), Some(0.0));
        assert!(report.states[0].speed > 0.0);
        // Odometry still advanced this tick
        assert!(report.pose.x() > 0.0);
    }

    #[test]
    fn test_read_fault_holds_last_position() {
        let (mut drivetrain, sim) = sim_drivetrain(config());
        drivetrain.set_command(ChassisSpeeds::new(1.0, 0.0, 0.0));
        run(&mut drivetrain, &sim, 2);

        sim.lock().set_read_fault(0, true);
        sim.lock().step(DT);
        let report = drivetrain.tick();

        assert!(matches!(report.faults.as_slice(), [ModuleFault::Read { index: 0, .. }]));
        // Three of four modules saw motion, so the pose still moved forward
        assert!(report.pose.x() > 0.02);
    }

    #[test]
    fn test_heading_fault_falls_back_to_wheels() {
        let (mut drivetrain, sim) = sim_drivetrain(config());
        drivetrain.set_command(ChassisSpeeds::new(0.0, 0.0, 1.0));
        run(&mut drivetrain, &sim, 2);

        sim.lock().set_heading_fault(true);
        let report = run(&mut drivetrain, &sim, 11);
        assert!(report
            .faults
            .iter()
            .any(|f| matches!(f, ModuleFault::Heading { .. })));

        let truth = sim.lock().pose();
        assert_abs_diff_eq!(report.pose.rotation.radians(), truth.rotation.radians(), epsilon = 1e-6);
    }

    #[test]
    fn test_reset_pose_and_handle_snapshot() {
        let (mut drivetrain, sim) = sim_drivetrain(config());
        let handle = drivetrain.pose_handle();
        drivetrain.set_command(ChassisSpeeds::new(1.0, 0.0, 0.0));
        run(&mut drivetrain, &sim, 5);

        let target = Pose2d::from_xy_theta(3.0, -1.0, 0.5);
        assert!(drivetrain.reset_pose(target).is_empty());
        assert_eq!(handle.get(), target);

        // No motion since the reset: the next tick reports the reset pose
        drivetrain.set_command(ChassisSpeeds::default());
        let report = drivetrain.tick();
        assert_abs_diff_eq!(report.pose.x(), 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(report.pose.y(), -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(report.pose.rotation.radians(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_reset_during_heading_outage_keeps_reset_heading() {
        let (mut drivetrain, sim) = sim_drivetrain(config());
        drivetrain.set_command(ChassisSpeeds::new(0.0, 0.0, 1.0));
        run(&mut drivetrain, &sim, 2);

        sim.lock().set_heading_fault(true);
        run(&mut drivetrain, &sim, 10);
        drivetrain.set_command(ChassisSpeeds::default());
        drivetrain.tick();

        let target = Pose2d::from_xy_theta(1.0, 2.0, 0.0);
        let faults = drivetrain.reset_pose(target);
        assert!(faults.iter().any(|f| matches!(f, ModuleFault::Heading { .. })));
        let truth_at_reset = sim.lock().pose().rotation;

        sim.lock().set_heading_fault(false);
        let report = drivetrain.tick();
        assert!(report.pose.rotation.radians().abs() < 1e-6);
        assert_abs_diff_eq!(report.pose.x(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(report.pose.y(), 2.0, epsilon = 1e-9);

        // Turning afterwards is measured from the reset heading
        drivetrain.set_command(ChassisSpeeds::new(0.0, 0.0, 1.0));
        let report = run(&mut drivetrain, &sim, 11);
        let turned = sim.lock().pose().rotation - truth_at_reset;
        assert_abs_diff_eq!(report.pose.rotation.radians(), turned.radians(), epsilon = 1e-9);
    }

    #[test]
    fn test_zero_heading_keeps_translation() {
        let (mut drivetrain, sim) = sim_drivetrain(config());
        drivetrain.set_command(ChassisSpeeds::new(0.5, 0.0, 1.0));
        run(&mut drivetrain, &sim, 20);
        let before = drivetrain.pose();

        drivetrain.zero_heading().unwrap();
        let after = drivetrain.pose();
        assert_eq!(after.translation, before.translation);
        assert_eq!(after.rotation, Rotation2d::ZERO);
    }

    #[test]
    fn test_stop_zeroes_command_and_modules() {
        let (mut drivetrain, sim) = sim_drivetrain(config());
        drivetrain.set_command(ChassisSpeeds::new(1.0, 0.0, 0.0));
        drivetrain.tick();

        drivetrain.stop();
        assert!(drivetrain.command().is_zero());
        for index in 0..4 {
            assert_eq!(sim.lock().target(index).map(|s| s.speed), Some(0.0));
        }
    }
}
