//! Error types shared by every layer of the client.
//!
//! The transport and protocol layers never surface these across the reactor
//! thread boundary; they are turned into resolved call outcomes or logged.
//! Caller-facing operations return them directly.

use std::time::Duration;

use thiserror::Error;

/// Coarse classification used by [`ClientPolicy`](crate::rpc::ClientPolicy)
/// to decide whether a failure is eligible for retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Socket-level failure (refused, reset, unreachable, connect timeout).
    Io,
    /// Encrypted transport handshake or record failure.
    Tls,
    /// The peer stopped sending heartbeats.
    Heartbeat,
    /// The link was closed underneath an operation.
    Closed,
    /// Malformed frame or protocol violation.
    Protocol,
    /// A deadline elapsed.
    Timeout,
    /// Programming error on the caller side.
    Misuse,
}

/// Client error taxonomy.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Failed to reach the remote endpoint.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// I/O error on an established link.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// Encrypted transport failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// No heartbeat (or any other byte) arrived within the tolerated window.
    #[error("Heartbeat not received within {0:?}")]
    HeartbeatExpired(Duration),

    /// The link is closed.
    #[error("Connection closed")]
    Closed,

    /// Bytes that cannot be parsed into a frame.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A well-formed frame or envelope that breaks the protocol contract.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A wait or handshake exceeded its bound.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The pending call was cancelled by the caller.
    #[error("Call cancelled")]
    Cancelled,

    /// The operation is not valid in the current state.
    #[error("Invalid operation: {0}")]
    Misuse(String),

    /// A response payload could not be converted to the requested shape.
    #[error("Response decomposition failed: {0}")]
    Decomposition(#[source] serde_json::Error),

    /// An event subscriber panicked while handling an event.
    #[error("Subscriber failed: {0}")]
    SubscriberFailed(String),

    /// The reactor loop is no longer running.
    #[error("Reactor stopped")]
    ReactorStopped,
}

impl ClientError {
    /// Classify the error for retry decisions.
    pub fn kind(&self) -> FailureKind {
        match self {
            ClientError::ConnectionFailed(_) | ClientError::Io(_) => FailureKind::Io,
            ClientError::Tls(_) => FailureKind::Tls,
            ClientError::HeartbeatExpired(_) => FailureKind::Heartbeat,
            ClientError::Closed | ClientError::ReactorStopped => FailureKind::Closed,
            ClientError::MalformedFrame(_)
            | ClientError::Protocol(_)
            | ClientError::Decomposition(_) => FailureKind::Protocol,
            ClientError::Timeout(_) => FailureKind::Timeout,
            ClientError::Cancelled | ClientError::Misuse(_) | ClientError::SubscriberFailed(_) => {
                FailureKind::Misuse
            }
        }
    }

    /// Rebuild an equivalent error; `std::io::Error` is not `Clone`.
    pub(crate) fn duplicate(&self) -> ClientError {
        match self {
            ClientError::ConnectionFailed(e) => {
                ClientError::ConnectionFailed(std::io::Error::new(e.kind(), e.to_string()))
            }
            ClientError::Io(e) => ClientError::Io(std::io::Error::new(e.kind(), e.to_string())),
            ClientError::Tls(m) => ClientError::Tls(m.clone()),
            ClientError::HeartbeatExpired(d) => ClientError::HeartbeatExpired(*d),
            ClientError::Closed => ClientError::Closed,
            ClientError::MalformedFrame(m) => ClientError::MalformedFrame(m.clone()),
            ClientError::Protocol(m) => ClientError::Protocol(m.clone()),
            ClientError::Timeout(d) => ClientError::Timeout(*d),
            ClientError::Cancelled => ClientError::Cancelled,
            ClientError::Misuse(m) => ClientError::Misuse(m.clone()),
            ClientError::Decomposition(e) => ClientError::Protocol(e.to_string()),
            ClientError::SubscriberFailed(m) => ClientError::SubscriberFailed(m.clone()),
            ClientError::ReactorStopped => ClientError::ReactorStopped,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                ClientError::ConnectionFailed(err)
            }
            _ => ClientError::Io(err),
        }
    }
}
