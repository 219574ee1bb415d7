//! The `error` module defines the error type shared by every layer of the router.
//!
//! Each variant corresponds to one error kind that can travel over the wire.
//! `name()` gives the stable identifier written into the `error.name` field of
//! response messages, so clients can branch on it without parsing text.

use thiserror::Error;

use crate::protocol::ErrorInfo;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessageRouterError {
    /// The connection was torn down (normally or by cancellation).
    #[error("the connection is closed")]
    ConnectionClosed,

    /// The transport failed unexpectedly.
    #[error("the connection was aborted: {0}")]
    ConnectionAborted(String),

    /// The access token validator refused the handshake.
    #[error("access token rejected: {0}")]
    AccessTokenRejected(String),

    /// A request arrived before a successful `Connect`.
    #[error("the client has not completed the connect handshake")]
    NotConnected,

    #[error("endpoint '{0}' is already registered")]
    DuplicateEndpoint(String),

    #[error("'{0}' is not a valid endpoint name")]
    InvalidEndpoint(String),

    #[error("unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    #[error("unknown client '{0}'")]
    UnknownClient(String),

    /// A generated service request id collided with a live one.
    #[error("duplicate service request id '{0}'")]
    DuplicateRequestId(String),

    #[error("malformed message: {0}")]
    MessageParse(String),

    /// Anything raised while handling one message that nothing else caught.
    #[error("message handler failed: {0}")]
    Handler(String),

    /// An error reported by the other side of a connection.
    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    #[error("i/o error: {0}")]
    Io(String),
}

impl MessageRouterError {
    /// Stable wire name of the error kind.
    pub fn name(&self) -> &str {
        match self {
            Self::ConnectionClosed => "ConnectionClosed",
            Self::ConnectionAborted(_) => "ConnectionAborted",
            Self::AccessTokenRejected(_) => "AccessTokenRejected",
            Self::NotConnected => "NotConnected",
            Self::DuplicateEndpoint(_) => "DuplicateEndpoint",
            Self::InvalidEndpoint(_) => "InvalidEndpoint",
            Self::UnknownEndpoint(_) => "UnknownEndpoint",
            Self::UnknownClient(_) => "UnknownClient",
            Self::DuplicateRequestId(_) => "DuplicateRequestId",
            Self::MessageParse(_) => "MessageParseError",
            Self::Handler(_) => "HandlerException",
            Self::Remote { name, .. } => name.as_str(),
            Self::Io(_) => "IoError",
        }
    }

    /// True for the two kinds that mean the connection is gone for good.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::ConnectionAborted(_))
    }
}

impl From<ErrorInfo> for MessageRouterError {
    fn from(info: ErrorInfo) -> Self {
        Self::Remote {
            name: info.name,
            message: info.message.unwrap_or_default(),
        }
    }
}

impl From<serde_json::Error> for MessageRouterError {
    fn from(err: serde_json::Error) -> Self {
        Self::MessageParse(err.to_string())
    }
}

impl From<tungstenite::Error> for MessageRouterError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::ConnectionClosed
            }
            other => Self::ConnectionAborted(other.to_string()),
        }
    }
}

impl From<std::io::Error> for MessageRouterError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MessageRouterError>;
