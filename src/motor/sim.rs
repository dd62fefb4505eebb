// Simulated swerve drivetrain
//
// Ideal modules: steering is instant and wheels never slip. The chassis
// motion each step is whatever the commanded module states imply through the
// kinematics, so the sim doubles as ground truth for odometry tests.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{HardwareError, HeadingSensor, SwerveModuleIo};
use crate::geometry::{Pose2d, Rotation2d, Twist2d};
use crate::kinematics::{ModuleState, SwerveKinematics, SwerveModulePosition};

pub type SharedSim = Arc<Mutex<SimChassis>>;

#[derive(Debug, Clone, Default)]
struct SimWheel {
    target: ModuleState,
    position: SwerveModulePosition,
    fail_writes: bool,
    fail_reads: bool,
}

/// Ground-truth state of the simulated base
#[derive(Debug)]
pub struct SimChassis {
    kinematics: Arc<SwerveKinematics>,
    wheels: Vec<SimWheel>,
    pose: Pose2d,
    gyro_zero: Rotation2d,
    fail_heading: bool,
}

impl SimChassis {
    pub fn new(kinematics: Arc<SwerveKinematics>) -> Self {
        Self {
            wheels: vec![SimWheel::default(); kinematics.num_modules()],
            kinematics,
            pose: Pose2d::default(),
            gyro_zero: Rotation2d::ZERO,
            fail_heading: false,
        }
    }

    pub fn into_shared(self) -> SharedSim {
        Arc::new(Mutex::new(self))
    }

    /// Adapter handles for every module, in kinematics order
    pub fn modules(sim: &SharedSim) -> Vec<SimModule> {
        let count = sim.lock().wheels.len();
        (0..count)
            .map(|index| SimModule {
                sim: Arc::clone(sim),
                index,
            })
            .collect()
    }

    pub fn gyro(sim: &SharedSim) -> SimGyro {
        SimGyro {
            sim: Arc::clone(sim),
        }
    }

    /// Advance the simulation by `dt` seconds using the current targets
    pub fn step(&mut self, dt: f64) {
        let targets: Vec<ModuleState> = self.wheels.iter().map(|w| w.target).collect();

        for wheel in &mut self.wheels {
            wheel.position.distance += wheel.target.speed * dt;
            wheel.position.angle = wheel.target.angle;
        }

        match self.kinematics.to_chassis_speeds(&targets) {
            Ok(speeds) => {
                let twist = Twist2d::new(speeds.vx, speeds.vy, speeds.omega);
                self.pose = self.pose.exp(twist.scaled(dt));
            }
            Err(e) => debug!("Sim step skipped chassis update: {}", e),
        }
    }

    /// True pose of the simulated robot
    pub fn pose(&self) -> Pose2d {
        self.pose
    }

    pub fn set_write_fault(&mut self, index: usize, failing: bool) {
        if let Some(wheel) = self.wheels.get_mut(index) {
            wheel.fail_writes = failing;
        }
    }

    pub fn set_read_fault(&mut self, index: usize, failing: bool) {
        if let Some(wheel) = self.wheels.get_mut(index) {
            wheel.fail_reads = failing;
        }
    }

    pub fn set_heading_fault(&mut self, failing: bool) {
        self.fail_heading = failing;
    }

    /// Last target accepted by a module
    pub fn target(&self, index: usize) -> Option<ModuleState> {
        self.wheels.get(index).map(|w| w.target)
    }
}

/// Handle to one simulated module
pub struct SimModule {
    sim: SharedSim,
    index: usize,
}

impl SwerveModuleIo for SimModule {
    fn set_target(&mut self, state: ModuleState) -> Result<(), HardwareError> {
        let mut sim = self.sim.lock();
        let wheel = &mut sim.wheels[self.index];
        if wheel.fail_writes {
            return Err(HardwareError::Injected(format!("sim module {} write", self.index)));
        }
        wheel.target = state;
        Ok(())
    }

    fn read_position(&mut self) -> Result<SwerveModulePosition, HardwareError> {
        let sim = self.sim.lock();
        let wheel = &sim.wheels[self.index];
        if wheel.fail_reads {
            return Err(HardwareError::Injected(format!("sim module {} read", self.index)));
        }
        Ok(wheel.position)
    }

    fn stop(&mut self) -> Result<(), HardwareError> {
        // A stop always reaches the sim so write faults can be observed as a halted wheel
        let mut sim = self.sim.lock();
        let wheel = &mut sim.wheels[self.index];
        wheel.target = ModuleState::stopped(wheel.target.angle);
        Ok(())
    }
}

/// Simulated orientation sensor reading the true heading
pub struct SimGyro {
    sim: SharedSim,
}

impl HeadingSensor for SimGyro {
    fn read_heading(&mut self) -> Result<Rotation2d, HardwareError> {
        let sim = self.sim.lock();
        if sim.fail_heading {
            return Err(HardwareError::Injected("sim gyro".to_string()));
        }
        Ok(sim.pose.rotation - sim.gyro_zero)
    }

    fn zero(&mut self) -> Result<(), HardwareError> {
        let mut sim = self.sim.lock();
        sim.gyro_zero = sim.pose.rotation;
        Ok(())
    }
}
