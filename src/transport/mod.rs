//! Transport layer: serial (C2), UDP (C3), and the fused per-identity
//! router (C4) that sits above both.

pub mod fused;
pub mod serial;
pub mod udp;

pub use fused::{Endpoint, FusedLink, FusedRegistry, TransportKind};
