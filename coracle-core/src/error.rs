//! Error types shared across the coracle workspace.

use std::io;
use thiserror::Error;

/// Main error type for coracle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error from a socket or pipe operation.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The peer has gone away. Connection resets, broken pipes and reads on
    /// closed connections are all normalised to this at the framer boundary.
    #[error("EOF")]
    Eof,

    /// Protocol violation while decoding framed data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Handshake failed before the connection became usable.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Operation on a connection or listener that was already closed.
    #[error("use of closed network connection")]
    Closed,

    /// No listener at the dialled address.
    #[error("connection refused")]
    ConnectionRefused,

    /// A listener already owns the address.
    #[error("address already in use")]
    AddrInUse,

    /// The operation is not supported by this transport.
    #[error("not supported")]
    NotSupported,

    /// No kernel poller is available on this platform.
    #[error("system not supported")]
    SystemNotSupported,

    /// The network scheme is not one of the supported ones.
    #[error("network is not supported")]
    Network,

    /// Invalid constructor arguments.
    #[error("{0}")]
    Config(String),
}

/// Result type alias for coracle operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a protocol error with a message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a handshake error with a message.
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    /// True for `EAGAIN`-class errors: the operation would have blocked and
    /// should be retried on the next readiness event.
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    /// True when the connection is finished and must be torn down:
    /// EOF, closed-connection errors, and the IO kinds that mean the peer
    /// is gone.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Eof | Self::Closed => true,
            Self::Io(e) => is_terminal_kind(e.kind()),
            _ => false,
        }
    }

    /// Normalise an IO error the way the framer surfaces it: terminal kinds
    /// become [`Error::Eof`], everything else bubbles up unchanged.
    #[must_use]
    pub fn from_read(err: io::Error) -> Self {
        if is_terminal_kind(err.kind()) {
            Self::Eof
        } else {
            Self::Io(err)
        }
    }
}

fn is_terminal_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
