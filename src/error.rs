//! The error type for protocol, exchange and transport failures.

use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by the server in an ERR packet.
///
/// Carries the vendor error code and, when the server sends the
/// `#` marker, the five-character SQL state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.sql_state.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] ({}) {}", self.code, self.sql_state, self.message)
        }
    }
}

/// Errors surfaced by the connection engine.
///
/// Cloneable so one drain error can terminate every pending exchange.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The peer sent bytes the protocol does not allow here.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An ERR packet; terminates its exchange, the connection stays up.
    #[error("server error: {0}")]
    Server(ServerError),

    /// An exchange was attempted on a closing or closed client.
    #[error("cannot exchange messages because the connection is closed")]
    ExchangeClosed,

    /// The peer closed the transport mid-command.
    #[error("connection unexpectedly closed by peer")]
    UnexpectedClosed,

    /// The transport closed after an Exit was sent.
    #[error("connection closed after exit request")]
    ExpectedClosed,

    /// TLS upgrade failed, or was required but unsupported.
    #[error("TLS negotiation failed: {0}")]
    TlsNegotiation(String),

    /// The login did not complete, either because the server rejected
    /// it or because the plugin flow cannot proceed.
    #[error("authentication failed: {message}")]
    AuthFailed {
        message: String,
        /// Present when the server answered with an ERR packet.
        server: Option<ServerError>,
    },

    /// The outbound buffer was full; the message was not sent.
    #[error("outbound buffer overflow, request dropped")]
    BackpressureOverflow,

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] Arc<std::io::Error>),
}

impl Error {
    pub(crate) fn io(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }

    /// The server error details, for [`Error::Server`] and
    /// [`Error::AuthFailed`].
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Error::Server(e) => Some(e),
            Error::AuthFailed { server, .. } => server.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn auth_rejected(server: ServerError) -> Self {
        Error::AuthFailed {
            message: server.to_string(),
            server: Some(server),
        }
    }

    pub(crate) fn auth_impossible(message: impl Into<String>) -> Self {
        Error::AuthFailed {
            message: message.into(),
            server: None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::io(value)
    }
}
