use std::time::Duration;

use crate::payload::ChannelId;

/// Errors raised by a [`Connection`](crate::Connection).
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] chanmux_transport::TransportError),

    /// Frame-level error, including write failures on the stream.
    #[error("frame error: {0}")]
    Frame(#[from] chanmux_frame::FrameError),

    /// The read-loop thread could not be spawned.
    #[error("failed to spawn read loop: {0}")]
    Spawn(std::io::Error),

    /// The connection is closing or closed.
    #[error("connection closed")]
    Closed,

    /// Operation not valid in the connection's current state.
    #[error("illegal connection state: {0}")]
    IllegalState(String),

    /// A bounded wait elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Secure transport negotiation failed.
    #[cfg(feature = "secure")]
    #[error("secure handshake failed: {0}")]
    Secure(#[from] SecureError),
}

/// Errors raised by the [`Multiplexer`](crate::Multiplexer) and [`Channel`](crate::Channel).
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The underlying connection failed or is closed.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// An envelope or payload could not be (de)serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer declined the channel open request.
    #[error(
        "channel {id} declined by peer: {}",
        .reason.as_deref().unwrap_or("no reason given")
    )]
    Declined {
        id: ChannelId,
        reason: Option<String>,
    },

    /// The peer did not answer within the deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection closed while the operation was waiting.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// Operation not valid in the current state (programmer error).
    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl MuxError {
    /// True for failures of the transport underneath the multiplexer.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, MuxError::Connection(_) | MuxError::Disconnected(_))
    }
}

/// Errors raised during secure transport negotiation.
#[cfg(feature = "secure")]
#[derive(Debug, thiserror::Error)]
pub enum SecureError {
    /// Frame-level error while exchanging handshake messages.
    #[error("frame error: {0}")]
    Frame(#[from] chanmux_frame::FrameError),

    /// The peer did not complete the handshake in time.
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    /// The peer closed the stream mid-handshake.
    #[error("peer disconnected during handshake")]
    Disconnected,

    /// The peer sent something that is not a valid handshake message.
    #[error("handshake protocol violation: {0}")]
    Protocol(String),

    /// A cryptographic operation failed.
    #[error("crypto failure: {0}")]
    Crypto(String),
}

pub type Result<T> = std::result::Result<T, MuxError>;
