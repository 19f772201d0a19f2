//! Error types for the BOSH transport and dispatcher.

use core::time::Duration;

use futures::channel::oneshot;
use thiserror::Error;

use crate::body::ResponseBody;

/// Problem while decoding XML from the wire.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The XML was not well formed.
    #[error("malformed XML: {0}")]
    Xml(String),

    /// An attribute could not be parsed.
    #[error("malformed attribute: {0}")]
    Attribute(String),

    /// The document ended before the root element was closed.
    #[error("unexpected end of document")]
    UnexpectedEof,

    /// The document contained no root element.
    #[error("empty document")]
    Empty,

    /// The root element was not a BOSH `<body/>`.
    #[error("unexpected root element <{0}>")]
    UnexpectedRoot(String),
}

impl From<quick_xml::Error> for CodecError {
    fn from(e: quick_xml::Error) -> Self {
        Self::Xml(e.to_string())
    }
}

/// A single HTTP exchange failed.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The server answered with a non-2xx status.
    #[error("unexpected HTTP status {status}")]
    Status {
        /// The HTTP status code.
        status: u16,
        /// The response envelope, if the error body was one.
        body: Option<ResponseBody>,
        /// Delay requested through `Retry-After`, in whole seconds.
        retry_after: Option<Duration>,
    },

    /// A 2xx response did not contain a usable envelope.
    #[error("malformed response: {0}")]
    Malformed(#[from] CodecError),

    /// The request could not be completed.
    #[error("request failed: {0}")]
    Request(String),

    /// No response within the request timeout.
    #[error("request timed out")]
    Timeout,
}

impl TransportError {
    /// The terminate condition this failure carries, if it is fatal.
    ///
    /// A terminate envelope is always fatal. Without one, the legacy
    /// XEP-0124 status codes for binding errors (400, 403, 404) are mapped
    /// to their conditions. Everything else is retryable.
    #[must_use]
    pub fn terminate_condition(&self) -> Option<String> {
        let Self::Status { status, body, .. } = self else {
            return None;
        };

        if let Some(body) = body.as_ref().filter(|b| b.is_terminate()) {
            return Some(body.condition().unwrap_or("undefined-condition").to_owned());
        }

        match status {
            400 => Some("bad-request".into()),
            403 => Some("policy-violation".into()),
            404 => Some("item-not-found".into()),
            _ => None,
        }
    }

    /// How long the server asked the client to back off, if it did.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// The session has shut down; nothing more can be queued.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("session closed")]
pub struct SendError;

/// Problem while waiting for a correlated response.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum CallError {
    /// The pending entry was dropped before a matching stanza arrived,
    /// either because the session terminated or another caller registered
    /// the same key.
    #[error("response dropped")]
    ResponseDropped(oneshot::Canceled),

    /// Timed out waiting for the response.
    #[error("timed out waiting for response")]
    Timeout,

    /// The stanza could not be queued because the session is closed.
    #[error("session closed")]
    SessionClosed,

    /// The caller cancelled the wait.
    #[error("cancelled")]
    Cancelled,
}

impl From<SendError> for CallError {
    fn from(_: SendError) -> Self {
        Self::SessionClosed
    }
}

/// Errors surfaced while establishing or waiting on a connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The configuration cannot be used to open a session.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Authentication or resource binding failed.
    #[error("login failed: {reason}")]
    LoginFailed {
        /// The decoded error condition.
        reason: String,
    },

    /// The session ended before becoming active.
    #[error("session terminated: {}", reason.as_deref().unwrap_or("closed"))]
    Terminated {
        /// The terminate condition, if the server supplied one.
        reason: Option<String>,
    },
}

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The TOML document could not be parsed.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config file could not be read.
    #[error("config read error: {0}")]
    Io(#[from] std::io::Error),

    /// A value is out of range or unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
