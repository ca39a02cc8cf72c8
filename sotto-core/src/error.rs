use thiserror::Error;

/// All errors produced by sotto-core.
#[derive(Debug, Error)]
pub enum SottoError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no usable input device found")]
    NoInputDevice,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("network unreachable")]
    NetworkUnavailable,

    #[error("malformed server frame: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SottoError>;
