//! Receiver error types.
//!
//! [`DecoderError`] covers decoder configuration and command failures;
//! [`ReceiverError`] wraps everything the RX thread and controller can hit
//! while setting up sockets, shared buffers and decoders.

use odin_common::{IpcError, ShmError};
use thiserror::Error;

/// Errors raised by frame decoders.
#[derive(Error, Debug)]
pub enum DecoderError {
    /// The decoder has no command of this name.
    #[error("Submitted command not supported: {0}")]
    UnsupportedCommand(String),

    /// Shared buffers cannot hold a frame.
    #[error("Shared buffer size {buffer_size} is smaller than the frame buffer size {required}")]
    BufferTooSmall {
        /// Size of each shared buffer
        buffer_size: usize,
        /// Bytes the decoder needs per frame
        required: usize,
    },

    /// No decoder is registered under this name.
    #[error("Unknown decoder type: {0}")]
    UnknownDecoder(String),

    /// A configuration value is present but unusable.
    #[error("Invalid decoder configuration: {0}")]
    InvalidConfig(String),

    /// A configuration parameter has the wrong type.
    #[error(transparent)]
    Param(#[from] IpcError),
}

/// Errors raised while running the receiver.
#[derive(Error, Debug)]
pub enum ReceiverError {
    /// Decoder setup or command failure.
    #[error(transparent)]
    Decoder(#[from] DecoderError),

    /// IPC transport or protocol failure.
    #[error(transparent)]
    Ipc(#[from] IpcError),

    /// Shared buffer failure.
    #[error(transparent)]
    Shm(#[from] ShmError),

    /// Socket or runtime I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The receiver configuration is not usable.
    #[error("Invalid receiver configuration: {0}")]
    Config(String),

    /// The RX thread could not be started or exited during startup.
    #[error("RX thread failed: {0}")]
    RxThread(String),
}

/// Result alias for decoder operations.
pub type DecoderResult<T> = std::result::Result<T, DecoderError>;

/// Result alias for receiver operations.
pub type Result<T> = std::result::Result<T, ReceiverError>;
