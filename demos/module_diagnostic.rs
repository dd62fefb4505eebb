// Module diagnostic: READ-ONLY check of every drive and steer servo
//
// This tool does NOT write anything to the servos - it's completely safe.
// Run it before the runtime to confirm wiring, IDs and steer offsets.
//
// Usage: cargo run --example module_diagnostic -- [port] [config.json]
// Example: cargo run --example module_diagnostic -- /dev/ttyACM0 config/swerve.json

use std::io::{self, Write};
use std::path::Path;

use swerve_zenoh_runtime::config::{DriveConfig, MOTOR_PORT};
use swerve_zenoh_runtime::motor::feetech::{FeetechBus, Register, STEPS_PER_REVOLUTION};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let port = args.next().unwrap_or_else(|| MOTOR_PORT.to_string());
    let config = match args.next() {
        Some(path) => DriveConfig::load(Path::new(&path))?,
        None => DriveConfig::default(),
    };
    config.validate()?;

    println!("Swerve module diagnostic (READ-ONLY)");
    println!("Serial port: {}", port);
    println!();

    println!("Step 1: Opening serial port...");
    let mut bus = match FeetechBus::open(&port) {
        Ok(bus) => {
            println!("  ✓ Serial port opened");
            bus
        }
        Err(e) => {
            println!("  ✗ Failed to open serial port: {}", e);
            println!("  - Check the port path and USB cable");
            return Err(e.into());
        }
    };
    println!();

    println!("Step 2: Pinging servos...");
    let mut all_found = true;
    for module in &config.modules {
        for (role, id) in [("drive", module.drive_id), ("steer", module.steer_id)] {
            print!("  {} {} (ID {}): ", module.name, role, id);
            io::stdout().flush()?;
            match bus.ping(id) {
                Ok(true) => println!("✓ RESPONDING"),
                Ok(false) => {
                    println!("✗ NO RESPONSE");
                    all_found = false;
                }
                Err(e) => {
                    println!("✗ ERROR: {}", e);
                    all_found = false;
                }
            }
        }
    }
    println!();
    if !all_found {
        println!("⚠ Not all servos responded. Check power, wiring and IDs in the config.");
        println!();
    }

    println!("Step 3: Reading module state...");
    for module in &config.modules {
        println!("  === {} ===", module.name);

        match bus.read_u8(module.drive_id, Register::OperatingMode) {
            Ok(mode) => println!("    Drive mode:       {} (expect 1 = velocity)", mode),
            Err(e) => println!("    Drive mode:       ERROR - {}", e),
        }
        match bus.present_velocity(module.drive_id) {
            Ok(vel) => println!("    Drive velocity:   {} (raw)", vel),
            Err(e) => println!("    Drive velocity:   ERROR - {}", e),
        }

        match bus.read_u8(module.steer_id, Register::OperatingMode) {
            Ok(mode) => println!("    Steer mode:       {} (expect 0 = position)", mode),
            Err(e) => println!("    Steer mode:       ERROR - {}", e),
        }
        match bus.read_u8(module.steer_id, Register::TorqueEnable) {
            Ok(val) => println!("    Steer torque:     {}", if val == 1 { "ENABLED" } else { "disabled" }),
            Err(e) => println!("    Steer torque:     ERROR - {}", e),
        }
        match bus.present_position(module.steer_id) {
            Ok(steps) => {
                let raw = f64::from(steps) * 360.0 / f64::from(STEPS_PER_REVOLUTION);
                let wheel = raw - module.steer_offset_deg;
                println!("    Steer position:   {} ({:.1}° raw, {:.1}° from forward)", steps, raw, wheel);
            }
            Err(e) => println!("    Steer position:   ERROR - {}", e),
        }
        println!();
    }

    println!("Diagnostic complete.");
    println!("With the wheels pointing forward, 'from forward' should read near 0°;");
    println!("otherwise set steer_offset_deg to the raw reading.");

    Ok(())
}
