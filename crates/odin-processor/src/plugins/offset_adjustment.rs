//! Frame offset adjustment from a configured frame onward.

use crate::error::PluginResult;
use crate::frame::FramePtr;
use crate::plugin::{FrameProcessorPlugin, PluginContext};
use odin_common::IpcMessage;
use parking_lot::Mutex;
use tracing::info;

#[derive(Debug, Default)]
struct OffsetState {
    offset_adjustment: i64,
    first_frame_number: u64,
    current_adjustment: i64,
}

/// Adds an adjustment to each frame's offset.
///
/// A configured `offset_adjustment` takes effect when the frame numbered
/// `first_frame_number` passes through; earlier frames keep the previous
/// adjustment.
#[derive(Debug, Default)]
pub struct OffsetAdjustmentPlugin {
    state: Mutex<OffsetState>,
}

impl OffsetAdjustmentPlugin {
    /// Registered class name.
    pub const NAME: &'static str = "OffsetAdjustmentPlugin";
}

impl FrameProcessorPlugin for OffsetAdjustmentPlugin {
    fn process_frame(&self, frame: FramePtr, ctx: &PluginContext) -> PluginResult<()> {
        let adjustment = {
            let mut state = self.state.lock();
            if u64::try_from(frame.frame_number()).ok() == Some(state.first_frame_number)
                && state.current_adjustment != state.offset_adjustment
            {
                info!(
                    frame = frame.frame_number(),
                    adjustment = state.offset_adjustment,
                    "Applying new offset adjustment"
                );
                state.current_adjustment = state.offset_adjustment;
            }
            state.current_adjustment
        };
        frame.meta_mut().adjust_frame_offset(adjustment);
        ctx.push(frame);
        Ok(())
    }

    fn process_end_of_acquisition(&self, _ctx: &PluginContext) {
        self.state.lock().current_adjustment = 0;
    }

    fn configure(&self, config: &IpcMessage, _reply: &mut IpcMessage) -> PluginResult<()> {
        let mut state = self.state.lock();
        state.offset_adjustment = config.get_param_or("offset_adjustment", state.offset_adjustment)?;
        state.first_frame_number =
            config.get_param_or("first_frame_number", state.first_frame_number)?;
        Ok(())
    }

    fn request_configuration(&self, prefix: &str, reply: &mut IpcMessage) {
        let state = self.state.lock();
        reply.set_param(&format!("{prefix}offset_adjustment"), state.offset_adjustment);
        reply.set_param(&format!("{prefix}first_frame_number"), state.first_frame_number);
    }

    fn status(&self, prefix: &str, status: &mut IpcMessage) {
        status.set_param(
            &format!("{prefix}current_adjustment"),
            self.state.lock().current_adjustment,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::meta_data::{CompressionType, DataType, FrameMetaData};
    use odin_common::{MsgType, MsgVal};
    use odin_pool::PoolRegistry;
    use std::sync::Arc;

    fn offset_after(plugin: &OffsetAdjustmentPlugin, pools: &PoolRegistry, number: i64) -> i64 {
        let meta = FrameMetaData::new(number, "data", DataType::Raw8, "", vec![1], CompressionType::None);
        let frame = Arc::new(Frame::from_bytes(pools, "offset", meta, &[0]).unwrap());
        plugin
            .process_frame(Arc::clone(&frame), &PluginContext::new("offset"))
            .unwrap();
        frame.frame_offset()
    }

    #[test]
    fn test_adjustment_starts_at_first_frame() {
        let pools = PoolRegistry::new();
        let plugin = OffsetAdjustmentPlugin::default();
        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        config.set_param("offset_adjustment", 100i64);
        config.set_param("first_frame_number", 2u64);
        plugin
            .configure(&config, &mut IpcMessage::reply_to(&config, MsgType::Ack))
            .unwrap();

        assert_eq!(offset_after(&plugin, &pools, 0), 0);
        assert_eq!(offset_after(&plugin, &pools, 1), 0);
        assert_eq!(offset_after(&plugin, &pools, 2), 100);
        assert_eq!(offset_after(&plugin, &pools, 3), 100);
    }
}
