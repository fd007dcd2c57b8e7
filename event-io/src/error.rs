use std::io;

/// Failure surface of every state-changing operation on an [`crate::Io`].
///
/// `WouldBlock` is not an error: it means "retry once the loop reports
/// readiness again" and never transitions state. Everything else on a
/// connected io moves it to [`IoState::Error`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    #[error("operation would block, retry later")]
    WouldBlock,

    #[error("peer closed the connection")]
    Disconnect,

    #[error("operation timed out")]
    TimedOut,

    #[error("connection refused")]
    ConnRefused,

    #[error("destination unreachable")]
    Unreachable,

    #[error("name or resource not found")]
    NotFound,

    #[error("invalid use or parameter")]
    Invalid,

    #[error("out of system resources")]
    NoSysResources,

    #[error("protocol not supported")]
    ProtoNotSupported,

    #[error("TLS required but not configured")]
    TlsRequired,

    #[error("TLS setup failure")]
    TlsSetupFailure,

    #[error("i/o error: {0:?}")]
    Error(io::ErrorKind),

    #[error("internal error")]
    Internal,
}

impl IoError {
    /// Collapse an OS-level error into the wire-facing taxonomy.
    pub fn from_io(err: &io::Error) -> IoError {
        match err.kind() {
            io::ErrorKind::WouldBlock => IoError::WouldBlock,
            io::ErrorKind::ConnectionRefused => IoError::ConnRefused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => IoError::Disconnect,
            io::ErrorKind::NotFound => IoError::NotFound,
            io::ErrorKind::TimedOut => IoError::TimedOut,
            io::ErrorKind::AddrNotAvailable => IoError::Unreachable,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => IoError::Invalid,
            kind => IoError::Error(kind),
        }
    }

    /// True for conditions that should be retried rather than reported.
    pub fn is_wouldblock(&self) -> bool {
        matches!(self, IoError::WouldBlock)
    }
}

/// Lifecycle of an io. Transitions are monotonic: once `Connected`, the
/// only exits are `Disconnecting`/`Disconnected` or `Error`, both
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    Init,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
    Listening,
}

impl IoState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IoState::Disconnected | IoState::Error)
    }
}

/// What the event loop is telling an io's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Connected,
    Read,
    Write,
    Disconnected,
    Error,
    Accept,
    Other,
}
