//! Pass-through plugin that counts frames.

use crate::error::{PluginError, PluginResult};
use crate::frame::FramePtr;
use crate::plugin::{FrameProcessorPlugin, PluginContext};
use odin_common::IpcMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Passes every frame on unchanged.
#[derive(Debug, Default)]
pub struct DummyPlugin {
    frames: AtomicU64,
}

impl DummyPlugin {
    /// Registered class name.
    pub const NAME: &'static str = "DummyPlugin";

    /// Frames seen since the last reset.
    #[must_use]
    pub fn frames_processed(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl FrameProcessorPlugin for DummyPlugin {
    fn process_frame(&self, frame: FramePtr, ctx: &PluginContext) -> PluginResult<()> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        ctx.push(frame);
        Ok(())
    }

    fn status(&self, prefix: &str, status: &mut IpcMessage) {
        status.set_param(&format!("{prefix}frames_processed"), self.frames_processed());
    }

    fn request_commands(&self) -> Vec<String> {
        vec!["print".to_string()]
    }

    fn execute(&self, command: &str, _reply: &mut IpcMessage) -> PluginResult<()> {
        match command {
            "print" => {
                info!(frames = self.frames_processed(), "Dummy plugin frame count");
                Ok(())
            }
            _ => Err(PluginError::UnsupportedCommand(command.to_string())),
        }
    }

    fn reset_statistics(&self) -> bool {
        self.frames.store(0, Ordering::Relaxed);
        true
    }
}
