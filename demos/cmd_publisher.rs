// Keyboard teleop: WASD move, Z/X rotate, R/F speed, G field-relative toggle,
// P reset pose to origin, H zero heading, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::{Duration, Instant};
use swerve_zenoh_runtime::config::{TOPIC_CMD_BASE, TOPIC_CMD_RESET_POSE, TOPIC_CMD_ZERO_HEADING};
use swerve_zenoh_runtime::messages::{ChassisCommand, ResetPose};
use tracing::info;

const SPEEDS: [f64; 3] = [0.05, 0.15, 0.3]; // m/s
const OMEGA_SPEEDS: [f64; 3] = [0.25, 0.75, 1.5]; // rad/s
const INPUT_TIMEOUT_MS: u64 = 100; // Reset velocities after this much time with no input

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publishers = Publishers {
        cmd: session.declare_publisher(TOPIC_CMD_BASE).await?,
        reset: session.declare_publisher(TOPIC_CMD_RESET_POSE).await?,
        zero: session.declare_publisher(TOPIC_CMD_ZERO_HEADING).await?,
    };

    info!("Controls: WASD=move, Z/X=rotate, R/F=speed, G=field-relative, P=reset pose, H=zero heading, Q=quit");
    info!("Speed: LOW, robot-relative");

    enable_raw_mode()?;
    let result = run_teleop(&publishers).await;
    disable_raw_mode()?;

    result
}

struct Publishers<'a> {
    cmd: zenoh::pubsub::Publisher<'a>,
    reset: zenoh::pubsub::Publisher<'a>,
    zero: zenoh::pubsub::Publisher<'a>,
}

/// Velocity held while keys are pressed, published every loop
#[derive(Default)]
struct Teleop {
    speed_idx: usize,
    field_relative: bool,
    cmd: (f64, f64, f64),
    last_movement_input: Option<Instant>,
}

/// What a key press asks the publisher to do besides updating velocity
enum Action {
    None,
    ResetPose,
    ZeroHeading,
    Quit,
}

impl Teleop {
    fn on_key(&mut self, code: KeyCode, first_press: bool) -> Action {
        let linear = SPEEDS[self.speed_idx];
        let angular = OMEGA_SPEEDS[self.speed_idx];
        let axis = match code {
            KeyCode::Char('w') => Some((&mut self.cmd.0, linear)),
            KeyCode::Char('s') => Some((&mut self.cmd.0, -linear)),
            KeyCode::Char('a') => Some((&mut self.cmd.1, linear)),
            KeyCode::Char('d') => Some((&mut self.cmd.1, -linear)),
            KeyCode::Char('z') => Some((&mut self.cmd.2, angular)),
            KeyCode::Char('x') => Some((&mut self.cmd.2, -angular)),
            _ => None,
        };
        if let Some((velocity, value)) = axis {
            *velocity = value;
            self.last_movement_input = Some(Instant::now());
            return Action::None;
        }

        match code {
            KeyCode::Char('r') => {
                self.speed_idx = (self.speed_idx + 1).min(SPEEDS.len() - 1);
                print_speed(self.speed_idx);
            }
            KeyCode::Char('f') => {
                self.speed_idx = self.speed_idx.saturating_sub(1);
                print_speed(self.speed_idx);
            }
            KeyCode::Char('g') if first_press => {
                self.field_relative = !self.field_relative;
                info!("Field-relative: {}", self.field_relative);
            }
            KeyCode::Char('p') if first_press => return Action::ResetPose,
            KeyCode::Char('h') if first_press => return Action::ZeroHeading,
            KeyCode::Char('q') | KeyCode::Esc => return Action::Quit,
            _ => {}
        }
        Action::None
    }

    /// Current command; velocities drop to zero once keys are released
    fn command(&mut self) -> ChassisCommand {
        let idle = self
            .last_movement_input
            .is_none_or(|at| at.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS));
        if idle {
            self.cmd = (0.0, 0.0, 0.0);
        }

        let (vx, vy, omega) = self.cmd;
        ChassisCommand {
            vx,
            vy,
            omega,
            field_relative: self.field_relative,
        }
    }
}

async fn run_teleop(
    publishers: &Publishers<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut teleop = Teleop::default();

    loop {
        // 20ms poll keeps publishing at ~50Hz
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()?
                && kind != KeyEventKind::Release
            {
                match teleop.on_key(code, kind == KeyEventKind::Press) {
                    Action::None => {}
                    Action::ResetPose => {
                        let origin = ResetPose {
                            x: 0.0,
                            y: 0.0,
                            theta: 0.0,
                        };
                        publishers.reset.put(serde_json::to_string(&origin)?).await?;
                        info!("Pose reset to origin");
                    }
                    Action::ZeroHeading => {
                        publishers.zero.put("{}").await?;
                        info!("Heading zero requested");
                    }
                    Action::Quit => break,
                }
            }
        }

        let cmd = teleop.command();
        publishers.cmd.put(serde_json::to_string(&cmd)?).await?;
    }

    Ok(())
}

fn print_speed(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Speed: {}", label);
}
