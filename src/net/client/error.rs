//! Error types for the QUIC client transport.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use bytes::Bytes;
use std::error;
use std::fmt::{Display, Formatter};
use std::io;
use std::sync::Arc;

//------------ ConnectionError -----------------------------------------------

/// A failure reported by the QUIC transport.
///
/// This is a closed set: every transport error the client can observe is
/// mapped onto one of these variants, and [`is_retryable`] decides based on
/// the variant alone whether a fresh connection may help.
///
/// [`is_retryable`]: ConnectionError::is_retryable
#[derive(Clone, Debug)]
pub enum ConnectionError {
    /// The peer closed the connection with an application close code.
    ApplicationClosed {
        /// The application error code.
        code: u64,

        /// The reason phrase sent by the peer.
        reason: Bytes,
    },

    /// The connection was closed with a transport error code.
    ///
    /// Code `0` is the transport's `NO_ERROR`.
    TransportClosed {
        /// The transport error code.
        code: u64,

        /// The reason phrase.
        reason: Bytes,
    },

    /// The connection was dropped after being idle for too long.
    IdleTimeout,

    /// The peer sent a stateless reset.
    StatelessReset,

    /// The peer rejected the 0-RTT data sent on this connection.
    ZeroRttRejected,

    /// The connection was closed locally.
    LocallyClosed,

    /// The peer reset or stopped the stream.
    StreamReset {
        /// The application error code of the reset.
        code: u64,
    },

    /// The stream was already finished or reset by us.
    StreamClosed,

    /// Socket level I/O error.
    Io(Arc<io::Error>),

    /// Anything else the transport reports, like a version mismatch or an
    /// invalid configuration.
    Protocol(Arc<str>),
}

impl ConnectionError {
    /// Returns whether re-creating the connection may resolve the error.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Shows up after a server restart when the old connection
            // handle is still used.
            ConnectionError::ApplicationClosed { code: 0, .. } => true,

            ConnectionError::IdleTimeout => true,

            // The server could not decrypt our packets, usually because it
            // was rebooted.
            ConnectionError::StatelessReset => true,

            // Graceful close by the server, e.g. "max connection age".
            ConnectionError::TransportClosed { code: 0, .. } => true,

            // Stale resumption ticket. The store is reset before the
            // connection is closed.
            ConnectionError::ZeroRttRejected => true,

            _ => false,
        }
    }
}

impl From<quinn::ConnectionError> for ConnectionError {
    fn from(err: quinn::ConnectionError) -> Self {
        match err {
            quinn::ConnectionError::ApplicationClosed(close) => {
                ConnectionError::ApplicationClosed {
                    code: close.error_code.into_inner(),
                    reason: close.reason,
                }
            }
            quinn::ConnectionError::ConnectionClosed(close) => {
                ConnectionError::TransportClosed {
                    code: u64::from(close.error_code),
                    reason: close.reason,
                }
            }
            quinn::ConnectionError::TransportError(err) => {
                ConnectionError::TransportClosed {
                    code: u64::from(err.code),
                    reason: Bytes::from(err.reason),
                }
            }
            quinn::ConnectionError::TimedOut => ConnectionError::IdleTimeout,
            quinn::ConnectionError::Reset => ConnectionError::StatelessReset,
            quinn::ConnectionError::LocallyClosed => {
                ConnectionError::LocallyClosed
            }
            other => ConnectionError::Protocol(other.to_string().into()),
        }
    }
}

impl From<quinn::ConnectError> for ConnectionError {
    fn from(err: quinn::ConnectError) -> Self {
        ConnectionError::Protocol(err.to_string().into())
    }
}

impl From<quinn::WriteError> for ConnectionError {
    fn from(err: quinn::WriteError) -> Self {
        match err {
            quinn::WriteError::ConnectionLost(err) => err.into(),
            quinn::WriteError::ZeroRttRejected => {
                ConnectionError::ZeroRttRejected
            }
            quinn::WriteError::Stopped(code) => ConnectionError::StreamReset {
                code: code.into_inner(),
            },
            quinn::WriteError::ClosedStream => ConnectionError::StreamClosed,
        }
    }
}

impl From<quinn::ReadError> for ConnectionError {
    fn from(err: quinn::ReadError) -> Self {
        match err {
            quinn::ReadError::ConnectionLost(err) => err.into(),
            quinn::ReadError::ZeroRttRejected => {
                ConnectionError::ZeroRttRejected
            }
            quinn::ReadError::Reset(code) => ConnectionError::StreamReset {
                code: code.into_inner(),
            },
            quinn::ReadError::ClosedStream => ConnectionError::StreamClosed,
            other => ConnectionError::Protocol(other.to_string().into()),
        }
    }
}

impl From<quinn::ClosedStream> for ConnectionError {
    fn from(_: quinn::ClosedStream) -> Self {
        ConnectionError::StreamClosed
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        ConnectionError::Io(Arc::new(err))
    }
}

impl Display for ConnectionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            ConnectionError::ApplicationClosed { code, reason } => write!(
                f,
                "closed by peer: application code {code} ({})",
                String::from_utf8_lossy(reason)
            ),
            ConnectionError::TransportClosed { code, reason } => write!(
                f,
                "closed by transport: code {code:#x} ({})",
                String::from_utf8_lossy(reason)
            ),
            ConnectionError::IdleTimeout => {
                write!(f, "connection timed out due to inactivity")
            }
            ConnectionError::StatelessReset => {
                write!(f, "connection reset by peer (stateless reset)")
            }
            ConnectionError::ZeroRttRejected => {
                write!(f, "0-RTT rejected by peer")
            }
            ConnectionError::LocallyClosed => write!(f, "closed locally"),
            ConnectionError::StreamReset { code } => {
                write!(f, "stream reset by peer: code {code}")
            }
            ConnectionError::StreamClosed => {
                write!(f, "stream already closed")
            }
            ConnectionError::Io(err) => write!(f, "I/O error: {err}"),
            ConnectionError::Protocol(msg) => write!(f, "{msg}"),
        }
    }
}

impl error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ConnectionError::Io(err) => Some(err),
            _ => None,
        }
    }
}

//------------ CodecError ----------------------------------------------------

/// Error packing or unpacking a DNS message.
#[derive(Clone, Debug)]
pub struct CodecError(Arc<dyn error::Error + Send + Sync>);

impl CodecError {
    /// Wraps the error reported by a message codec.
    pub fn new(err: impl Into<Box<dyn error::Error + Send + Sync>>) -> Self {
        CodecError(Arc::from(err.into()))
    }
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        Display::fmt(&self.0, f)
    }
}

impl error::Error for CodecError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

//------------ ErrorKind -----------------------------------------------------

/// The stage of an exchange that failed.
#[derive(Clone, Debug)]
pub enum ErrorKind {
    /// The dialer could not provide a reachable address.
    Bootstrap(Arc<io::Error>),

    /// Dialing or the QUIC handshake failed.
    Connect(ConnectionError),

    /// Dialing or the QUIC handshake did not finish in time.
    ConnectTimeout,

    /// Opening a stream failed, even on a fresh connection.
    StreamOpen(ConnectionError),

    /// Writing the request to the stream failed.
    StreamWrite(ConnectionError),

    /// Reading the response from the stream failed.
    StreamRead(ConnectionError),

    /// Opening, writing or reading the stream did not finish in time.
    Timeout,

    /// The request could not be serialized.
    MessagePack(CodecError),

    /// The response could not be parsed.
    MessageUnpack(CodecError),

    /// The response was too short to carry a length prefix.
    ShortMessage,

    /// The client was closed explicitly.
    Closed,
}

impl ErrorKind {
    /// Returns the transport failure behind this error, if any.
    pub fn connection_error(&self) -> Option<&ConnectionError> {
        match self {
            ErrorKind::Connect(err)
            | ErrorKind::StreamOpen(err)
            | ErrorKind::StreamWrite(err)
            | ErrorKind::StreamRead(err) => Some(err),
            _ => None,
        }
    }
}

//------------ Error ---------------------------------------------------------

/// Error type for the QUIC client transport.
///
/// Carries the stage that failed and the upstream it was talking to.
#[derive(Clone, Debug)]
pub struct Error {
    /// What went wrong.
    kind: ErrorKind,

    /// The upstream address, `quic://host:port`.
    upstream: Arc<str>,
}

impl Error {
    /// Creates a new error for the given upstream.
    pub fn new(kind: ErrorKind, upstream: impl Into<Arc<str>>) -> Self {
        Error {
            kind,
            upstream: upstream.into(),
        }
    }

    /// Returns the stage that failed.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Returns the upstream address the error concerns.
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Returns whether re-creating the connection may resolve the error.
    pub fn is_retryable(&self) -> bool {
        self.kind
            .connection_error()
            .map(ConnectionError::is_retryable)
            .unwrap_or(false)
    }

    /// Returns whether the error signals a rejected 0-RTT attempt.
    pub fn is_zero_rtt_rejected(&self) -> bool {
        matches!(
            self.kind.connection_error(),
            Some(ConnectionError::ZeroRttRejected)
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        let upstream = &self.upstream;
        match &self.kind {
            ErrorKind::Bootstrap(err) => {
                write!(f, "bootstrapping connection to {upstream}: {err}")
            }
            ErrorKind::Connect(err) => {
                write!(f, "opening QUIC connection to {upstream}: {err}")
            }
            ErrorKind::ConnectTimeout => {
                write!(f, "opening QUIC connection to {upstream}: timed out")
            }
            ErrorKind::StreamOpen(err) => {
                write!(f, "opening stream to {upstream}: {err}")
            }
            ErrorKind::StreamWrite(err) => {
                write!(f, "writing request to {upstream}: {err}")
            }
            ErrorKind::StreamRead(err) => {
                write!(f, "reading response from {upstream}: {err}")
            }
            ErrorKind::Timeout => {
                write!(f, "exchange with {upstream}: timed out")
            }
            ErrorKind::MessagePack(err) => {
                write!(f, "packing message for {upstream}: {err}")
            }
            ErrorKind::MessageUnpack(err) => {
                write!(f, "unpacking response from {upstream}: {err}")
            }
            ErrorKind::ShortMessage => {
                write!(f, "response from {upstream} too short")
            }
            ErrorKind::Closed => write!(f, "client for {upstream} is closed"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Bootstrap(err) => Some(err),
            ErrorKind::Connect(err)
            | ErrorKind::StreamOpen(err)
            | ErrorKind::StreamWrite(err)
            | ErrorKind::StreamRead(err) => Some(err),
            ErrorKind::MessagePack(err) | ErrorKind::MessageUnpack(err) => {
                Some(err)
            }
            ErrorKind::ConnectTimeout
            | ErrorKind::Timeout
            | ErrorKind::ShortMessage
            | ErrorKind::Closed => None,
        }
    }
}

//============ Tests =========================================================
