use std::io;
use thiserror::Error;

/// Framing errors produced while decoding or re-encoding a packet
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough bytes buffered yet; retry after the next read
    #[error("incomplete frame: need {needed} bytes, have {available}")]
    IncompleteFrame { needed: usize, available: usize },

    /// First byte is not a recognized magic, the stream is desynchronized
    #[error("invalid magic byte 0x{0:02x}")]
    InvalidMagic(u8),

    /// Declared extras + key lengths exceed the total body length
    #[error("inconsistent lengths: extras {extras} + key {key} > body {body}")]
    InconsistentLength { extras: usize, key: usize, body: usize },

    /// Declared body is larger than the configured limit
    #[error("frame body of {body} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { body: usize, limit: usize },

    /// Re-encoding could not reproduce the declared frame length
    #[error("encode mismatch: {0}")]
    EncodeMismatch(String),
}

impl FrameError {
    /// Whether the connection must be closed after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FrameError::InvalidMagic(_)
                | FrameError::InconsistentLength { .. }
                | FrameError::FrameTooLarge { .. }
        )
    }
}

/// Unified error type for the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Fatal framing error on a connection
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Hook file could not be loaded
    #[error("Hook file error: {0}")]
    HookFile(String),

    /// Backend connection error
    #[error("Backend connection error: {0}")]
    Backend(String),

    /// Outbound writer went away before the pipeline finished
    #[error("Connection closed: {0}")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        ProxyError::HookFile(format!("TOML parse error: {}", err))
    }
}
