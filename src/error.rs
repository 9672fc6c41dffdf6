//! Error taxonomy for the breath pipeline.
//!
//! Capture and channel failures are fatal to a session and reported once;
//! server-reported errors are forwarded and the session keeps running.
//! Malformed inbound messages never leave the channel (see [`ProtocolError`]).

use thiserror::Error;

/// Microphone acquisition and recording failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("microphone access denied")]
    PermissionDenied,
    #[error("no usable capture device: {0}")]
    DeviceUnavailable(String),
    #[error("capture stream failed: {0}")]
    Stream(String),
}

impl CaptureError {
    /// Classify an OS error code returned while opening the device.
    pub fn from_errno(errno: i32, context: &str) -> Self {
        match std::io::Error::from_raw_os_error(errno.abs()).kind() {
            std::io::ErrorKind::PermissionDenied => CaptureError::PermissionDenied,
            _ => CaptureError::DeviceUnavailable(format!("{} (errno {})", context, errno)),
        }
    }
}

/// Transport-level failures of the duplex channel. No retry is attempted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("invalid channel url: {0}")]
    InvalidUrl(String),
    #[error("failed to open channel: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to encode control message: {0}")]
    Encode(String),
    #[error("channel closed unexpectedly{}", closed_reason(.0))]
    Closed(Option<String>),
}

fn closed_reason(reason: &Option<String>) -> String {
    match reason {
        Some(r) if !r.is_empty() => format!(": {}", r),
        _ => String::new(),
    }
}

/// An inbound message that could not be decoded. Dropped, never surfaced.
#[derive(Debug, Error)]
#[error("malformed inbound message: {0}")]
pub struct ProtocolError(#[from] pub serde_json::Error);

/// Everything a session reports to its observer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("analysis service error: {0}")]
    ServerReported(String),
}

impl SessionError {
    /// Fatal errors end the session; server-reported ones do not.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::ServerReported(_))
    }
}

/// Session service (REST) failures.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid service url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },
}
