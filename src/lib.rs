pub mod config;
pub mod drive;
pub mod geometry;
pub mod kinematics;
pub mod messages;
pub mod motor;
pub mod odometry;
pub mod runtime;
