//! C7 — player-facing channel abstraction. Session admission and the
//! player/motor-assignment state machine live in `crate::session`, which
//! treats a player as "whatever implements `PlayerChannel`".

pub mod channel;

pub use channel::{ChannelEvent, MemoryChannel, MemoryChannelHandle, PlayerChannel, WebRtcDataChannel};
