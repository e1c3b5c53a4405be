use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Runtime configuration threaded from `main` into every subsystem.
///
/// No subsystem reaches for a process-wide constant or singleton; every
/// tunable lives here and is passed down explicitly.
#[derive(Debug, Clone, Parser)]
#[command(name = "edmo-backend", about = "Control-plane server for an EDMO fleet")]
pub struct Config {
    /// Baud rate used for every discovered serial port.
    #[arg(long, default_value_t = 115_200)]
    pub serial_baud: u32,

    /// Local UDP port the discovery/telemetry socket binds to.
    #[arg(long, default_value_t = 2123)]
    pub udp_bind_port: u16,

    /// Broadcast destination for the IDENTIFY discovery datagram.
    #[arg(long, default_value = "255.255.255.255:2121")]
    pub udp_broadcast_addr: SocketAddr,

    /// Seconds of silence after which a UDP peer is considered stale.
    #[arg(long, default_value_t = 5)]
    pub udp_stale_after_secs: u64,

    /// Target tick rate of the control loop.
    #[arg(long, default_value_t = 40)]
    pub tick_hz: u32,

    /// Motor count used for sessions created ahead of the first player
    /// (falls back to 3 when a robot identifies before any player has
    /// requested a particular motor count).
    #[arg(long, default_value_t = 3)]
    pub default_motor_count: usize,

    /// Root directory for per-session CSV logs.
    #[arg(long, default_value = "./SessionLogs")]
    pub log_root: PathBuf,

    /// Bind address for the player-onboarding HTTP/WebSocket endpoint.
    #[arg(long, default_value = "0.0.0.0:8787")]
    pub http_bind: SocketAddr,
}

impl Config {
    pub fn udp_stale_after(&self) -> Duration {
        Duration::from_secs(self.udp_stale_after_secs)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_hz as f64)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial_baud: 115_200,
            udp_bind_port: 2123,
            udp_broadcast_addr: "255.255.255.255:2121".parse().unwrap(),
            udp_stale_after_secs: 5,
            tick_hz: 40,
            default_motor_count: 3,
            log_root: PathBuf::from("./SessionLogs"),
            http_bind: "0.0.0.0:8787".parse().unwrap(),
        }
    }
}
