use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use swerve_zenoh_runtime::config::{DriveConfig, MOTOR_PORT};
use swerve_zenoh_runtime::runtime::{self, Backend};

/// Swerve base runtime: zenoh commands in, module setpoints and odometry out
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Drive configuration (JSON). Defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against the simulated chassis instead of the servo bus
    #[arg(long)]
    sim: bool,

    /// Serial port of the servo bus
    #[arg(long, default_value = MOTOR_PORT)]
    port: String,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match DriveConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Config error: {}", e);
                std::process::exit(1);
            }
        },
        None => DriveConfig::default(),
    };

    let backend = if args.sim {
        Backend::Sim
    } else {
        Backend::Feetech { port: args.port }
    };

    if let Err(e) = runtime::run(config, backend).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
