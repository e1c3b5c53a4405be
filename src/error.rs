use thiserror::Error;

/// Errors raised by the session/logger/transport layer.
///
/// These propagate with `?` up to the backend or the axum handler, never
/// panic. See spec §7 for which of these are ever fatal to the process
/// (none are — `TransportBind` on the UDP socket is the one exception,
/// handled by `main` refusing to start).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no session exists for identity {0:?}")]
    UnknownIdentity(String),

    #[error("session for {identity:?} has no free motor slots")]
    SessionFull { identity: String },

    #[error("log channel {channel:?} has no such column schema: expected {expected} fields, got {got}")]
    LogSchemaMismatch {
        channel: String,
        expected: usize,
        got: usize,
    },

    #[error("log channel {0:?} was never created")]
    UnknownLogChannel(String),

    #[error("failed to bind transport: {0}")]
    TransportBind(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, BackendError>;
