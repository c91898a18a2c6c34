//! Frame processor.
//!
//! Frames announced by a frame receiver are wrapped as shared [`Frame`]s and
//! pushed through a graph of plugins, each running on its own worker thread
//! behind a [`WorkQueue`]. Dropping the last reference to a shared frame
//! releases its buffer back to the receiver.
//!
//! - [`frame`]: frames, frame bodies and buffer release
//! - [`meta_data`]: per-frame metadata and typed parameters
//! - [`plugin`]: plugin trait, callback fan-out and the worker runner
//! - [`plugins`]: bundled plugins
//! - [`registry`]: plugin classes and loaded instances
//! - [`shared_memory`]: frame source fed by the receiver
//! - [`controller`]: the control loop

pub mod controller;
pub mod error;
pub mod frame;
pub mod meta_data;
pub mod plugin;
pub mod plugins;
pub mod registry;
pub mod shared_memory;
pub mod work_queue;

pub use controller::{FrameProcessorController, StopHandle, CONTROLLER};
pub use error::{FrameError, MetaDataError, PluginError, PluginResult, ProcessorError, Result};
pub use frame::{ChannelReleaseNotifier, Frame, FramePtr, ReleaseNotifier};
pub use meta_data::{CompressionType, DataType, FrameMetaData, ParamValue};
pub use plugin::{FrameCallback, FrameProcessorPlugin, PluginContext, PluginRunner, ProcessTiming};
pub use registry::{PluginEnv, PluginFactory, PluginRegistry};
pub use shared_memory::{SharedMemoryController, FRAME_RECEIVER, RAW_DATASET};
pub use work_queue::{Closed, WorkQueue};
