//! Error type shared by every layer of the engine.

use crate::status::close_code;
use thiserror::Error;

/// Errors produced while establishing, running or closing a WebSocket connection.
///
/// Protocol and transport failures never escape a connection's tasks; they are
/// recorded in the connection [`WsStatus`](crate::WsStatus) and reported through
/// [`WsHandler::on_error`](crate::WsHandler::on_error).
#[derive(Error, Debug)]
pub enum WsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported extension")]
    UnsupportedExtension,

    #[error("Message too big: {length} bytes exceeds the limit of {limit} bytes")]
    MessageTooBig { length: u64, limit: u64 },

    #[error("Timeout")]
    Timeout,

    #[error("WebSocket is not open")]
    NotOpen,

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("DNS resolution failed: {0}")]
    Resolve(#[from] hickory_resolver::error::ResolveError),

    #[error("No addresses found for host: {0}")]
    NoAddressesFound(String),

    #[error("Invalid message data: {0}")]
    InvalidData(String),

    #[error("Handler error: {0}")]
    Handler(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WsError {
    /// Close code a connection terminates with when this error ends it.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Handshake(_) | Self::Protocol(_) => close_code::PROTOCOL_ERROR,
            Self::UnsupportedExtension => close_code::UNSUPPORTED_EXTENSION,
            Self::MessageTooBig { .. } => close_code::MESSAGE_TOO_BIG,
            Self::InvalidData(_) => close_code::INVALID_DATA,
            Self::Io(_) | Self::Timeout | Self::NotOpen => close_code::ABNORMAL_CLOSURE,
            Self::Handler(_) | Self::Internal(_) => close_code::INTERNAL_ERROR,
            Self::InvalidUri(_)
            | Self::InvalidParameters(_)
            | Self::Tls(_)
            | Self::Resolve(_)
            | Self::NoAddressesFound(_) => close_code::PROTOCOL_ERROR,
        }
    }

    pub(crate) fn unexpected_eof() -> Self {
        Self::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "Unexpected EOF",
        ))
    }

    pub(crate) fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
            || matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::TimedOut)
    }
}
