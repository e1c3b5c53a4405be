//! Control-plane server for a fleet of EDMO robots: dual-transport fusion
//! (serial + UDP) behind one per-robot identity, a framed binary wire
//! protocol, per-robot sessions with dynamic player/motor assignment, and
//! a 40 Hz tick loop that reconciles motor state and solicits telemetry.

pub mod backend;
pub mod codec;
pub mod config;
pub mod console;
pub mod error;
pub mod http;
pub mod imu;
pub mod logger;
pub mod motor;
pub mod player;
pub mod session;
pub mod transport;
