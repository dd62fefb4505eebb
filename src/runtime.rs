// Fixed-rate swerve loop over zenoh
//
// Each tick drains heading samples, chassis commands, pose resets and heading
// zero requests, then drives the held command through the drivetrain. A command
// older than CMD_TIMEOUT is replaced by zero velocity until a new one arrives.
// Pose, module setpoints and health go out after every tick; a failed publish
// is logged and the loop keeps driving.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::{
    CMD_TIMEOUT, DriveConfig, HEADING_TIMEOUT, LOOP_HZ, TOPIC_CMD_BASE, TOPIC_CMD_RESET_POSE,
    TOPIC_CMD_ZERO_HEADING, TOPIC_HEALTH, TOPIC_RT_MODULES, TOPIC_SENSOR_HEADING,
    TOPIC_STATE_POSE,
};
use crate::drive::{BoxedHeading, BoxedModule, Drivetrain, TickReport};
use crate::geometry::{Pose2d, Rotation2d};
use crate::kinematics::{ChassisSpeeds, SwerveKinematics};
use crate::messages::{
    ChassisCommand, HeadingSample, ModuleSetpoint, PoseReport, ResetPose, RuntimeHealth,
};
use crate::motor::{FeetechBus, FeetechSwerveModule, LatchedHeading, SharedSim, SimChassis};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outgoing state topic
trait StateSink {
    async fn send(&self, payload: String) -> Result<(), BoxError>;
}

impl StateSink for zenoh::pubsub::Publisher<'_> {
    async fn send(&self, payload: String) -> Result<(), BoxError> {
        Ok(self.put(payload).await?)
    }
}

struct StatePublishers<S> {
    pose: S,
    modules: S,
    health: S,
}

impl<S: StateSink> StatePublishers<S> {
    /// Publish one tick's state; failures are logged per topic and never abort the loop
    async fn publish(&self, report: &TickReport, health: RuntimeHealth) {
        publish_json(&self.pose, TOPIC_STATE_POSE, &PoseReport::from(report.pose)).await;
        publish_json(&self.modules, TOPIC_RT_MODULES, &ModuleSetpoint::from_report(report)).await;
        publish_json(&self.health, TOPIC_HEALTH, &health).await;
    }
}

async fn publish_json<S: StateSink, T: Serialize>(sink: &S, topic: &str, message: &T) {
    let payload = match serde_json::to_string(message) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Failed to encode {}: {}", topic, e);
            return;
        }
    };
    if let Err(e) = sink.send(payload).await {
        warn!("Failed to publish {}: {}", topic, e);
    }
}

/// Where module commands go
#[derive(Debug, Clone)]
pub enum Backend {
    /// Simulated chassis stepped by the loop
    Sim,
    /// Feetech servos on one serial bus, heading from the IMU topic
    Feetech { port: String },
}

pub struct Runtime {
    latest_cmd: Option<ChassisCommand>,
    cmd_received_at: Instant,
    health: RuntimeHealth,
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            latest_cmd: None,
            cmd_received_at: Instant::now(),
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    /// Process incoming command
    fn on_command(&mut self, cmd: ChassisCommand, at: Instant) {
        debug!("Received command: {:?}", &cmd);
        self.latest_cmd = Some(cmd);
        self.cmd_received_at = at;
    }

    /// Chassis speeds to hold this tick, after the watchdog
    fn compute_speeds(&mut self, heading: Rotation2d, now: Instant) -> ChassisSpeeds {
        let cmd_age = now.saturating_duration_since(self.cmd_received_at);

        match self.latest_cmd {
            Some(ref cmd) if cmd_age <= CMD_TIMEOUT => {
                if self.health == RuntimeHealth::CmdStale {
                    info!("Commands resumed");
                }
                self.health = RuntimeHealth::Ok;
                cmd.to_chassis_speeds(heading)
            }
            _ => {
                // Watchdog triggered (or no command ever received) - stop the robot
                if self.health != RuntimeHealth::CmdStale {
                    warn!("Command stale ({:?} old), stopping robot", cmd_age);
                }
                self.health = RuntimeHealth::CmdStale;
                ChassisSpeeds::default()
            }
        }
    }

    /// Fold the outcome of a tick into the published health
    fn on_tick(&mut self, report: &TickReport) {
        if self.health == RuntimeHealth::CmdStale {
            return;
        }
        self.health = if report.is_degraded() {
            RuntimeHealth::Degraded
        } else {
            RuntimeHealth::Ok
        };
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the drivetrain for a backend. Returns the sim handle when simulating
/// and the heading feed when the heading comes from the IMU topic.
fn build_drivetrain(
    config: DriveConfig,
    backend: &Backend,
) -> Result<(Drivetrain, Option<SharedSim>, Option<LatchedHeading>), BoxError> {
    config.validate()?;

    match backend {
        Backend::Sim => {
            let kinematics = Arc::new(SwerveKinematics::new(config.module_offsets())?);
            let sim = SimChassis::new(kinematics).into_shared();
            let modules: Vec<BoxedModule> = SimChassis::modules(&sim)
                .into_iter()
                .map(|m| Box::new(m) as BoxedModule)
                .collect();
            let heading: BoxedHeading = Box::new(SimChassis::gyro(&sim));

            info!("Using simulated chassis");
            let drivetrain = Drivetrain::new(config, modules, heading)?;
            Ok((drivetrain, Some(sim), None))
        }
        Backend::Feetech { port } => {
            info!("Opening servo bus on {}...", port);
            let bus = Arc::new(Mutex::new(FeetechBus::open(port)?));

            let mut modules: Vec<BoxedModule> = Vec::with_capacity(config.modules.len());
            for module_config in &config.modules {
                let mut module = FeetechSwerveModule::new(bus.clone(), module_config, &config);
                module.initialize()?;
                info!("Module {} ready", module.name());
                modules.push(Box::new(module));
            }

            let feed = LatchedHeading::new(HEADING_TIMEOUT);
            let drivetrain = Drivetrain::new(config, modules, Box::new(feed.clone()))?;
            Ok((drivetrain, None, Some(feed)))
        }
    }
}

pub async fn run(config: DriveConfig, backend: Backend) -> Result<(), BoxError> {
    let (mut drivetrain, sim, heading_feed) = build_drivetrain(config, &backend)?;

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let sub_cmd = session.declare_subscriber(TOPIC_CMD_BASE).await?;
    let sub_reset = session.declare_subscriber(TOPIC_CMD_RESET_POSE).await?;
    let sub_zero = session.declare_subscriber(TOPIC_CMD_ZERO_HEADING).await?;
    let sub_heading = session.declare_subscriber(TOPIC_SENSOR_HEADING).await?;
    let publishers = StatePublishers {
        pose: session.declare_publisher(TOPIC_STATE_POSE).await?,
        modules: session.declare_publisher(TOPIC_RT_MODULES).await?,
        health: session.declare_publisher(TOPIC_HEALTH).await?,
    };

    let mut runtime = Runtime::new();
    let period = Duration::from_millis(1000 / LOOP_HZ);
    let dt = period.as_secs_f64();
    let mut tick = interval(period);

    info!(
        "Runtime started: {}Hz loop, {}ms watchdog timeout",
        LOOP_HZ,
        CMD_TIMEOUT.as_millis()
    );
    info!(
        "Subscribed to: {}, {}, {}, {}",
        TOPIC_CMD_BASE, TOPIC_CMD_RESET_POSE, TOPIC_CMD_ZERO_HEADING, TOPIC_SENSOR_HEADING
    );
    info!(
        "Publishing to: {}, {}, {}",
        TOPIC_STATE_POSE, TOPIC_RT_MODULES, TOPIC_HEALTH
    );

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down, stopping modules");
                drivetrain.stop();
                return Ok(());
            }
        }

        // 1. Drain all pending messages (non-blocking), keep latest command
        while let Ok(Some(sample)) = sub_heading.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<HeadingSample>(&payload) {
                Ok(heading) => match &heading_feed {
                    Some(feed) => feed.push(Rotation2d::from_radians(heading.yaw), Instant::now()),
                    None => debug!("Ignoring external heading in sim mode"),
                },
                Err(e) => warn!("Failed to parse heading: {}", e),
            }
        }

        while let Ok(Some(sample)) = sub_cmd.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<ChassisCommand>(&payload) {
                Ok(cmd) => runtime.on_command(cmd, Instant::now()),
                Err(e) => warn!("Failed to parse command: {}", e),
            }
        }

        while let Ok(Some(sample)) = sub_reset.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<ResetPose>(&payload) {
                Ok(reset) => {
                    let pose = Pose2d::from(reset);
                    info!("Resetting pose to {}", pose);
                    for fault in drivetrain.reset_pose(pose) {
                        warn!("Fault during pose reset: {:?}", fault);
                    }
                }
                Err(e) => warn!("Failed to parse pose reset: {}", e),
            }
        }

        while let Ok(Some(_)) = sub_zero.try_recv() {
            if let Err(e) = drivetrain.zero_heading() {
                warn!("Failed to zero heading: {}", e);
            }
        }

        // 2. Watchdog picks the command to hold
        let was_stale = runtime.health() == RuntimeHealth::CmdStale;
        let speeds = runtime.compute_speeds(drivetrain.pose().rotation, Instant::now());
        if runtime.health() == RuntimeHealth::CmdStale && !was_stale {
            drivetrain.stop();
        }
        drivetrain.set_command(speeds);

        // 3. Drive + odometry
        let report = drivetrain.tick();
        if let Some(sim) = &sim {
            sim.lock().step(dt);
        }
        runtime.on_tick(&report);

        // 4. Publish state
        publishers.publish(&report, runtime.health()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::ModuleFault;
    use crate::kinematics::ModuleState;
    use crate::motor::HardwareError;
    use approx::assert_abs_diff_eq;

    fn forward(vx: f64) -> ChassisCommand {
        ChassisCommand {
            vx,
            vy: 0.0,
            omega: 0.0,
            field_relative: false,
        }
    }

    fn report(faults: Vec<ModuleFault>) -> TickReport {
        TickReport {
            states: vec![ModuleState::default(); 4],
            pose: Pose2d::default(),
            faults,
        }
    }

    #[test]
    fn test_starts_stale() {
        let mut runtime = Runtime::new();
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);

        let speeds = runtime.compute_speeds(Rotation2d::ZERO, Instant::now());
        assert!(speeds.is_zero());
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);
    }

    #[test]
    fn test_command_held_until_timeout() {
        let mut runtime = Runtime::new();
        let received = Instant::now();
        runtime.on_command(forward(0.2), received);

        // Held across ticks with no new message
        for ms in [0, 20, 100, 240] {
            let speeds =
                runtime.compute_speeds(Rotation2d::ZERO, received + Duration::from_millis(ms));
            assert_eq!(speeds, ChassisSpeeds::new(0.2, 0.0, 0.0));
            assert_eq!(runtime.health(), RuntimeHealth::Ok);
        }

        let speeds = runtime.compute_speeds(Rotation2d::ZERO, received + CMD_TIMEOUT * 2);
        assert!(speeds.is_zero());
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);
    }

    #[test]
    fn test_fresh_command_recovers_from_stale() {
        let mut runtime = Runtime::new();
        let start = Instant::now();
        runtime.on_command(forward(0.1), start);
        runtime.compute_speeds(Rotation2d::ZERO, start + CMD_TIMEOUT * 2);
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);

        let later = start + CMD_TIMEOUT * 3;
        runtime.on_command(forward(0.3), later);
        let speeds = runtime.compute_speeds(Rotation2d::ZERO, later);
        assert_abs_diff_eq!(speeds.vx, 0.3);
        assert_eq!(runtime.health(), RuntimeHealth::Ok);
    }

    #[test]
    fn test_field_relative_uses_heading() {
        let mut runtime = Runtime::new();
        let now = Instant::now();
        runtime.on_command(
            ChassisCommand {
                vx: 1.0,
                vy: 0.0,
                omega: 0.0,
                field_relative: true,
            },
            now,
        );

        // Facing +y, field +x is to the robot's right
        let speeds = runtime.compute_speeds(Rotation2d::from_degrees(90.0), now);
        assert_abs_diff_eq!(speeds.vx, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(speeds.vy, -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_faults_mark_degraded() {
        let mut runtime = Runtime::new();
        let now = Instant::now();
        runtime.on_command(forward(0.1), now);
        runtime.compute_speeds(Rotation2d::ZERO, now);

        runtime.on_tick(&report(vec![ModuleFault::Heading {
            error: HardwareError::NoHeading,
        }]));
        assert_eq!(runtime.health(), RuntimeHealth::Degraded);

        runtime.on_tick(&report(Vec::new()));
        assert_eq!(runtime.health(), RuntimeHealth::Ok);
    }

    #[test]
    fn test_stale_wins_over_degraded() {
        let mut runtime = Runtime::new();
        runtime.compute_speeds(Rotation2d::ZERO, Instant::now());
        runtime.on_tick(&report(vec![ModuleFault::Heading {
            error: HardwareError::NoHeading,
        }]));
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);
    }

    #[test]
    fn test_sim_drivetrain_builds() {
        let (mut drivetrain, sim, feed) =
            build_drivetrain(DriveConfig::default(), &Backend::Sim).unwrap();
        assert!(sim.is_some());
        assert!(feed.is_none());
        assert!(!drivetrain.tick().is_degraded());
    }

    #[test]
    fn test_invalid_config_rejected_before_hardware() {
        let config = DriveConfig {
            max_velocity: 0.0,
            ..DriveConfig::default()
        };
        let backend = Backend::Feetech {
            port: "/dev/does-not-exist".to_string(),
        };
        assert!(build_drivetrain(config, &backend).is_err());
    }

    #[derive(Default)]
    struct RecordingSink {
        failing: bool,
        sent: Mutex<Vec<String>>,
    }

    impl StateSink for RecordingSink {
        async fn send(&self, payload: String) -> Result<(), BoxError> {
            if self.failing {
                return Err("session closed".into());
            }
            self.sent.lock().push(payload);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_publish_does_not_block_other_topics() {
        let publishers = StatePublishers {
            pose: RecordingSink {
                failing: true,
                ..RecordingSink::default()
            },
            modules: RecordingSink::default(),
            health: RecordingSink::default(),
        };

        publishers.publish(&report(vec![]), RuntimeHealth::Ok).await;
        publishers.publish(&report(vec![]), RuntimeHealth::Degraded).await;

        assert!(publishers.pose.sent.lock().is_empty());
        assert_eq!(publishers.modules.sent.lock().len(), 2);
        let health = publishers.health.sent.lock();
        assert_eq!(
            health.as_slice(),
            [
                serde_json::to_string(&RuntimeHealth::Ok).unwrap(),
                serde_json::to_string(&RuntimeHealth::Degraded).unwrap(),
            ]
        );
    }
}
