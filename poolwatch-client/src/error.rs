//! Error types for clients.

use std::io;

use thiserror::Error;

/// Errors that can occur while opening the streams of a core.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection failed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Timeout waiting for the connection to be established.
    #[error("Connection timed out")]
    Timeout,

    /// TLS handshake or configuration failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The certificate referenced by the credential could not be used.
    #[error("Invalid credential: {0}")]
    Credentials(String),

    /// Failed to send the stream request.
    #[error("Request failed: {0}")]
    Request(String),
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            ClientError::Timeout
        } else {
            ClientError::Connection(err.to_string())
        }
    }
}

/// Terminal errors of an open stream.
///
/// Every error ends the stream. [`StreamError::is_expected_closure`] separates
/// the normal endings from the ones worth reporting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The peer closed the stream cleanly.
    #[error("Stream closed by peer")]
    Closed,

    /// The stream was cancelled locally.
    #[error("Stream cancelled")]
    Cancelled,

    /// The connection broke.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A message could not be decoded.
    #[error("Failed to decode message: {0}")]
    Decode(String),
}

impl StreamError {
    /// Whether this is a normal end of stream rather than a failure.
    pub fn is_expected_closure(&self) -> bool {
        matches!(self, StreamError::Closed | StreamError::Cancelled)
    }
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            StreamError::Closed
        } else {
            StreamError::Transport(err.to_string())
        }
    }
}
