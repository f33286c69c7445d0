//! Error taxonomy for the telemetry and media client.
//!
//! Transport and protocol errors are absorbed by the connection task and only
//! show up as state transitions or log lines. Media and command errors are the
//! ones that reach the caller, as plain values.

use thiserror::Error;

/// Connection drop, timeout or handshake failure on the telemetry stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection attempt timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(String),
}

impl From<async_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: async_tungstenite::tungstenite::Error) -> Self {
        use async_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            other => TransportError::Io(other.to_string()),
        }
    }
}

/// A frame that could not be understood. Logged and dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message has no type discriminant")]
    MissingType,

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("invalid payload for '{kind}': {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures starting or running a media session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    /// Microphone or other capture device unavailable.
    #[error("capture unavailable: {0}")]
    Acquisition(String),

    /// The outbound channel could not be opened.
    #[error("channel failed: {0}")]
    Channel(String),

    #[error("channel did not open within {0:?}")]
    ChannelTimeout(std::time::Duration),

    #[error("device is not reachable")]
    Unreachable,

    /// A push-to-talk session is already starting or streaming.
    #[error("push-to-talk is already active")]
    AlreadyActive,

    #[error("media transport error: {0}")]
    Transport(String),

    /// Resampling, Opus encoding or WebM muxing of captured audio failed.
    #[error("audio encoding failed: {0}")]
    Encoding(String),

    #[error("playback sink error: {0}")]
    Sink(String),

    #[error("session start was cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for MediaError {
    fn from(err: reqwest::Error) -> Self {
        MediaError::Transport(err.to_string())
    }
}

#[cfg(feature = "native-audio")]
impl From<ac_ffmpeg::Error> for MediaError {
    fn from(err: ac_ffmpeg::Error) -> Self {
        MediaError::Encoding(err.to_string())
    }
}

impl From<std::io::Error> for MediaError {
    fn from(err: std::io::Error) -> Self {
        MediaError::Sink(err.to_string())
    }
}

/// Display command submission failure. Never retried.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("command rejected with status {status}")]
    Rejected { status: u16 },
}
