//! Socket transport seam for the push channel
//!
//! The pub/sub client talks to the broker through three small traits so the
//! WebSocket implementation can be swapped for an in-memory one in tests.
//! A [`Connector`] opens a connection and hands back independent write and
//! read halves.

use std::fmt;
use std::io;
use thiserror::Error;

pub mod websocket;

pub use websocket::WebSocketConnector;

/// Close code for an orderly shutdown
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when the stream ends without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Opens socket connections
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError>;
}

/// Write half of an open connection
#[async_trait::async_trait]
pub trait FrameSink: Send {
    /// Send one text frame
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Send a close frame and shut the write half down
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Read half of an open connection
#[async_trait::async_trait]
pub trait FrameSource: Send {
    /// Next event from the socket. `None` once the stream has ended.
    async fn next_event(&mut self) -> Option<SocketEvent>;
}

/// Inbound socket events
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Text(String),
    Binary(Vec<u8>),
    Closed { code: u16, reason: String },
    Failed(TransportError),
}

/// What went wrong at the socket layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ConnectionReset,
    ConnectionAborted,
    Unreachable,
    InvalidUrl,
    Tls,
    Handshake,
    Protocol,
    Io,
}

impl TransportErrorKind {
    /// Transient network conditions worth retrying
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            TransportErrorKind::Timeout
                | TransportErrorKind::ConnectionReset
                | TransportErrorKind::ConnectionAborted
                | TransportErrorKind::Unreachable
        )
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::ConnectionReset => "connection reset",
            TransportErrorKind::ConnectionAborted => "connection aborted",
            TransportErrorKind::Unreachable => "unreachable",
            TransportErrorKind::InvalidUrl => "invalid url",
            TransportErrorKind::Tls => "tls",
            TransportErrorKind::Handshake => "handshake rejected",
            TransportErrorKind::Protocol => "protocol violation",
            TransportErrorKind::Io => "i/o",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new<S: Into<String>>(kind: TransportErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn connection_reset<S: Into<String>>(message: S) -> Self {
        Self::new(TransportErrorKind::ConnectionReset, message)
    }

    pub fn unreachable<S: Into<String>>(message: S) -> Self {
        Self::new(TransportErrorKind::Unreachable, message)
    }

    pub fn fatal<S: Into<String>>(kind: TransportErrorKind, message: S) -> Self {
        debug_assert!(!kind.is_recoverable());
        Self::new(kind, message)
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }

    /// Classify an I/O error
    pub fn from_io(err: &io::Error) -> Self {
        let message = err.to_string();
        let kind = match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportErrorKind::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransportErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted => TransportErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable => TransportErrorKind::Unreachable,
            _ => classify_io_message(&message),
        };
        Self::new(kind, message)
    }
}

/// Some platforms only surface unreachable networks and DNS failures
/// through the error text.
fn classify_io_message(message: &str) -> TransportErrorKind {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("unreachable")
        || lowered.contains("no route to host")
        || lowered.contains("failed to lookup address")
        || lowered.contains("name or service not known")
    {
        TransportErrorKind::Unreachable
    } else if lowered.contains("timed out") {
        TransportErrorKind::Timeout
    } else {
        TransportErrorKind::Io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_allow_list() {
        assert!(TransportError::timeout("t").is_recoverable());
        assert!(TransportError::connection_reset("r").is_recoverable());
        assert!(TransportError::unreachable("u").is_recoverable());
        assert!(TransportError::new(TransportErrorKind::ConnectionAborted, "a").is_recoverable());

        assert!(!TransportError::fatal(TransportErrorKind::Tls, "bad cert").is_recoverable());
        assert!(!TransportError::fatal(TransportErrorKind::Handshake, "401").is_recoverable());
        assert!(!TransportError::fatal(TransportErrorKind::Io, "disk").is_recoverable());
    }

    #[test]
    fn test_io_classification() {
        let cases = vec![
            (io::ErrorKind::TimedOut, TransportErrorKind::Timeout),
            (io::ErrorKind::ConnectionReset, TransportErrorKind::ConnectionReset),
            (io::ErrorKind::BrokenPipe, TransportErrorKind::ConnectionReset),
            (io::ErrorKind::ConnectionAborted, TransportErrorKind::ConnectionAborted),
            (io::ErrorKind::ConnectionRefused, TransportErrorKind::Unreachable),
            (io::ErrorKind::PermissionDenied, TransportErrorKind::Io),
        ];

        for (io_kind, expected) in cases {
            let err = io::Error::new(io_kind, "boom");
            assert_eq!(TransportError::from_io(&err).kind, expected, "{io_kind:?}");
        }
    }

    #[test]
    fn test_io_message_classification() {
        let err = io::Error::new(io::ErrorKind::Other, "Network is unreachable (os error 101)");
        assert_eq!(
            TransportError::from_io(&err).kind,
            TransportErrorKind::Unreachable
        );

        let err = io::Error::new(
            io::ErrorKind::Other,
            "failed to lookup address information: Name or service not known",
        );
        assert!(TransportError::from_io(&err).is_recoverable());
    }

    #[test]
    fn test_error_display_includes_kind() {
        let err = TransportError::timeout("connect took too long");
        assert_eq!(err.to_string(), "timeout: connect took too long");
    }
}
