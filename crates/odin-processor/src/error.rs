//! Processor error types.

use crate::meta_data::DataType;
use odin_common::{IpcError, ShmError};
use odin_pool::PoolError;
use thiserror::Error;

/// Errors raised by frame accessors.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The frame body is shared with other owners or is read-only memory.
    #[error("Frame {frame} is not writable")]
    NotWritable {
        /// Frame number
        frame: i64,
    },

    /// The image window lies outside the frame body.
    #[error("Image of {size} bytes at offset {offset} exceeds frame body of {len} bytes")]
    ImageOutOfRange {
        /// Image offset into the body
        offset: usize,
        /// Image size
        size: usize,
        /// Body length
        len: usize,
    },

    /// The frame carries no data.
    #[error("End of acquisition frame has no data")]
    NoData,

    /// Pool block failure.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Shared buffer failure.
    #[error(transparent)]
    Shm(#[from] ShmError),
}

/// Errors raised by metadata parameter access.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetaDataError {
    /// No parameter of this name.
    #[error("Frame parameter '{0}' does not exist")]
    MissingParameter(String),

    /// The parameter holds another type.
    #[error("Frame parameter '{name}' is {found}, not {expected}")]
    TypeMismatch {
        /// Parameter name
        name: String,
        /// Requested type
        expected: &'static str,
        /// Stored type
        found: &'static str,
    },
}

/// Errors raised by plugins.
#[derive(Error, Debug)]
pub enum PluginError {
    /// No plugin class of this name is registered.
    #[error("Unknown plugin class: {0}")]
    UnknownClass(String),

    /// A configuration value is present but unusable.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The plugin has no command of this name.
    #[error("Submitted command not supported: {0}")]
    UnsupportedCommand(String),

    /// The plugin cannot process frames of this data type.
    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(DataType),

    /// A frame could not be processed.
    #[error("{0}")]
    Processing(String),

    /// Configuration parameter has the wrong type.
    #[error(transparent)]
    Param(#[from] IpcError),

    /// Frame access failure.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Metadata access failure.
    #[error(transparent)]
    MetaData(#[from] MetaDataError),

    /// File or socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the processor controllers.
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Plugin load or configuration failure.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// IPC transport or protocol failure.
    #[error(transparent)]
    Ipc(#[from] IpcError),

    /// Shared buffer failure.
    #[error(transparent)]
    Shm(#[from] ShmError),

    /// Thread spawn failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No loaded plugin or callback of this name.
    #[error("No plugin or connection named '{0}'")]
    NoSuchConnection(String),

    /// The processor configuration is not usable.
    #[error("Invalid processor configuration: {0}")]
    Config(String),
}

/// Result alias for plugin operations.
pub type PluginResult<T> = std::result::Result<T, PluginError>;

/// Result alias for processor operations.
pub type Result<T> = std::result::Result<T, ProcessorError>;
