//! Error types shared by the receiver and processor.
//!
//! - [`IpcError`]: transport failures and protocol violations on IPC channels
//! - [`ShmError`]: shared buffer creation, attachment and addressing failures
//!
//! Transport variants carry the underlying zmq reason string so callers can
//! log it and carry on; protocol variants carry the offending value so it
//! can be echoed back in a nack.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by [`IpcMessage`](crate::IpcMessage) and
/// [`IpcChannel`](crate::IpcChannel).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IpcError {
    /// Socket creation or socket option failure.
    #[error("Socket error: {0}")]
    Socket(String),

    /// Binding to an endpoint failed.
    #[error("Failed to bind {endpoint}: {reason}")]
    Bind {
        /// Endpoint the channel tried to bind
        endpoint: String,
        /// Underlying transport reason
        reason: String,
    },

    /// The channel is already bound to this endpoint.
    #[error("Channel already bound to {0}")]
    AlreadyBound(String),

    /// Unbind requested for an endpoint that was never bound.
    #[error("Channel not bound to {0}")]
    NotBound(String),

    /// Connecting to an endpoint failed.
    #[error("Failed to connect to {endpoint}: {reason}")]
    Connect {
        /// Endpoint the channel tried to connect to
        endpoint: String,
        /// Underlying transport reason
        reason: String,
    },

    /// Sending a message failed.
    #[error("Send failed: {0}")]
    Send(String),

    /// Receiving a message failed.
    #[error("Receive failed: {0}")]
    Receive(String),

    /// Polling the channel failed.
    #[error("Poll failed: {0}")]
    Poll(String),

    /// The text could not be decoded as an IPC message.
    #[error("Malformed IPC message: {0}")]
    Malformed(String),

    /// A required parameter is absent.
    #[error("Missing parameter: {0}")]
    MissingParam(String),

    /// A parameter exists but holds a different type than requested.
    #[error("Parameter {path} has wrong type: {reason}")]
    ParamType {
        /// Slash-separated parameter path
        path: String,
        /// Decoder explanation of the mismatch
        reason: String,
    },
}

/// Errors raised by [`SharedBufferManager`](crate::SharedBufferManager).
#[derive(Error, Debug)]
pub enum ShmError {
    /// Filesystem or mapping failure on the backing file.
    #[error("Shared buffer I/O error on {path:?}: {source}")]
    Io {
        /// Backing file path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The requested region cannot hold a single buffer.
    #[error("Shared memory size {shared_mem_size} too small for buffers of {buffer_size} bytes")]
    TooSmall {
        /// Requested total size
        shared_mem_size: usize,
        /// Requested per-buffer size
        buffer_size: usize,
    },

    /// The region header is not a valid shared buffer header.
    #[error("Invalid shared buffer header: {0}")]
    BadHeader(String),

    /// A buffer id outside `0..num_buffers`.
    #[error("Buffer {id} out of range, manager has {num_buffers} buffers")]
    InvalidBuffer {
        /// Requested buffer id
        id: usize,
        /// Number of buffers in the region
        num_buffers: usize,
    },
}

/// Result alias for IPC operations.
pub type IpcResult<T> = std::result::Result<T, IpcError>;

/// Result alias for shared buffer operations.
pub type ShmResult<T> = std::result::Result<T, ShmError>;
