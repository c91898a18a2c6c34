//! # odin-data
//!
//! Detector data acquisition in two processes:
//!
//! - **frame receiver** ([`odin_receiver`]): assembles UDP packets into frames
//!   in shared memory and announces them with `frame_ready` notifications
//! - **frame processor** ([`odin_processor`]): wraps announced buffers as
//!   frames, runs them through a chain of plugins and releases the buffers
//!
//! This crate holds what both subcommands of `odin-data` share at startup: [`config`] loads
//! the TOML and environment settings and [`logging`] installs tracing output.

pub mod config;
pub mod logging;

pub use config::{LogSettings, PluginSettings, ProcessorSettings, ReceiverSettings, Settings};
pub use logging::{OutputFormat, TracingConfig};
