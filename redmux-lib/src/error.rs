//!
//! Error types surfaced by the connection and its loops.
//!

use std::error;
use std::fmt;
use std::io;

/// Classifies every failure the client can report.
///
/// All kinds except [`ExecError`](ErrorKind::ExecError) and
/// [`NotConnected`](ErrorKind::NotConnected) are fatal to the connection and
/// complete [`Connection::run`](crate::Connection::run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Name resolution did not finish within `resolve_timeout`.
    ResolveTimeout,
    /// Name resolution failed or produced no endpoint.
    ResolveError,
    /// The TCP connect did not finish within `connect_timeout`.
    ConnectTimeout,
    /// Every resolved endpoint refused the connection.
    ConnectError,
    /// The server rejected the `HELLO` handshake.
    HandshakeFailed,
    /// No bytes arrived within twice the ping interval.
    IdleTimeout,
    /// Writing to the socket failed.
    WriteError,
    /// Reading from the socket failed, or the peer closed the stream.
    ReadError,
    /// The byte stream violated RESP3 framing.
    ProtocolError,
    /// A single response grew past `max_read_size`.
    ResponseTooLarge,
    /// The server answered a command with an error reply. This fails only the
    /// request that received it; the connection stays usable.
    ExecError,
    /// The operation was cancelled by `close` or connection shutdown.
    OperationAborted,
    /// The request required a live connection and there is none.
    NotConnected,
}

impl ErrorKind {
    fn description(self) -> &'static str {
        match self {
            ErrorKind::ResolveTimeout => "name resolution timed out",
            ErrorKind::ResolveError => "name resolution failed",
            ErrorKind::ConnectTimeout => "connect timed out",
            ErrorKind::ConnectError => "connect failed",
            ErrorKind::HandshakeFailed => "server rejected the handshake",
            ErrorKind::IdleTimeout => "connection idle timeout",
            ErrorKind::WriteError => "socket write failed",
            ErrorKind::ReadError => "socket read failed",
            ErrorKind::ProtocolError => "RESP3 protocol violation",
            ErrorKind::ResponseTooLarge => "response exceeded the configured size limit",
            ErrorKind::ExecError => "server returned an error reply",
            ErrorKind::OperationAborted => "operation aborted",
            ErrorKind::NotConnected => "not connected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// The error type used throughout the crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    detail: Option<String>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Error { kind, detail: None }
    }

    pub(crate) fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Error {
        Error {
            kind,
            detail: Some(detail.into()),
        }
    }

    pub(crate) fn io(kind: ErrorKind, err: &io::Error) -> Error {
        Error::with_detail(kind, err.to_string())
    }

    pub(crate) fn aborted() -> Error {
        Error::new(ErrorKind::OperationAborted)
    }

    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// An additional human readable detail, when one is available. For
    /// `ExecError` this is the verbatim server error line.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// `true` when this error terminates the connection.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self.kind, ErrorKind::ExecError | ErrorKind::NotConnected)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.kind, detail),
            None => self.kind.fmt(f),
        }
    }
}

impl error::Error for Error {}
