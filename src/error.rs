//! `pglane` error types.
use std::{fmt, io, sync::Arc};

use crate::{
    config::ParseError,
    postgres::{ProtocolError, ServerError},
    row::DecodeError,
};

/// A specialized [`Result`] type for `pglane` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from the `pglane` library.
#[derive(Clone)]
pub struct Error {
    context: &'static str,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    /// Attach a short phase description, e.g. `"startup"`.
    pub(crate) fn context(mut self, context: &'static str) -> Self {
        self.context = context;
        self
    }

    /// The connection died mid-protocol without a close from either side.
    pub(crate) fn unclean_shutdown() -> Self {
        ErrorKind::UncleanShutdown.into()
    }

    /// The connection (or its driver) is gone; no more work is accepted.
    pub(crate) fn closed() -> Self {
        ErrorKind::ConnectionClosed.into()
    }
}

/// All possible error kind from the `pglane` library.
///
/// Cloneable so one connection-fatal error can settle every queued task.
#[derive(Clone)]
pub enum ErrorKind {
    /// Invalid connection configuration.
    Config(ParseError),
    /// The server broke the wire protocol, e.g. an unexpected message.
    Protocol(ProtocolError),
    /// Transport level failure.
    Io(Arc<io::Error>),
    /// An `ErrorResponse` from the server.
    Server(ServerError),
    /// TLS setup failure.
    Tls(TlsError),
    /// The socket closed mid-protocol.
    UncleanShutdown,
    /// The connection is closed; the task can never run.
    ConnectionClosed,
    /// More parameters than the Bind message can carry.
    TooManyParameters { given: usize },
    /// The server demanded an authentication method this client does not
    /// speak.
    UnsupportedAuth { method: &'static str },
    /// The server demanded a password but none is configured.
    AuthRequiresPassword,
    /// Row-local decoding failure; never fatal to the connection.
    Decode(DecodeError),
    /// The query string was empty.
    EmptyQuery,
}

/// TLS setup failures.
#[derive(Debug, Clone)]
pub enum TlsError {
    /// TLS was required but the server answered the SSLRequest with `N`.
    ServerRefused,
    /// The TLS handshake itself failed.
    Handshake(Arc<io::Error>),
    /// The configured or derived SNI name is not a valid server name.
    InvalidServerName,
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerRefused => f.write_str("server refused the requested TLS upgrade"),
            Self::Handshake(e) => write!(f, "TLS handshake failed: {e}"),
            Self::InvalidServerName => f.write_str("invalid TLS server name"),
        }
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                Self { context: "", kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(Arc::new(e)));
from!(<ServerError>e => ErrorKind::Server(e));
from!(<TlsError>e => ErrorKind::Tls(e));
from!(<DecodeError>e => ErrorKind::Decode(e));

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }
        fmt::Display::fmt(&self.kind, f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind {}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Server(e) => e.fmt(f),
            Self::Tls(e) => e.fmt(f),
            Self::UncleanShutdown => f.write_str("connection closed mid-protocol"),
            Self::ConnectionClosed => f.write_str("connection is closed"),
            Self::TooManyParameters { given } => {
                write!(f, "cannot bind {given} parameters, the limit is {}", i16::MAX)
            },
            Self::UnsupportedAuth { method } => {
                write!(f, "unsupported authentication method: {method}")
            },
            Self::AuthRequiresPassword => {
                f.write_str("server demands a password but none is configured")
            },
            Self::Decode(e) => e.fmt(f),
            Self::EmptyQuery => f.write_str("empty query string"),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
