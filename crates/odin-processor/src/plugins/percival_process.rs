//! Splits a raw Percival frame buffer into `data` and `reset` image frames.

use crate::error::{FrameError, PluginError, PluginResult};
use crate::frame::{Frame, FramePtr};
use crate::meta_data::{CompressionType, DataType, FrameMetaData};
use crate::plugin::{FrameProcessorPlugin, PluginContext};
use odin_common::{FrameHeader, FrameState, IpcMessage, PacketLayout, PacketType};
use odin_pool::PoolRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{trace, warn};

const POOL_ID: &str = "percival";
const DEFAULT_HEIGHT: u64 = 1484;
const DEFAULT_WIDTH: u64 = 1408;

#[derive(Debug, Clone)]
struct PercivalConfig {
    layout: PacketLayout,
    height: u64,
    width: u64,
}

impl PercivalConfig {
    fn image_bytes(&self) -> usize {
        usize::try_from(self.height * self.width)
            .unwrap_or(usize::MAX)
            .saturating_mul(DataType::Raw16.size())
    }

    fn validate(&self) -> PluginResult<()> {
        if self.height == 0 || self.width == 0 {
            return Err(PluginError::Config("image height and width must be nonzero".into()));
        }
        if self.image_bytes() > self.layout.data_type_size() {
            return Err(PluginError::Config(format!(
                "{}x{} image needs {} bytes but a data type region holds {}",
                self.height,
                self.width,
                self.image_bytes(),
                self.layout.data_type_size()
            )));
        }
        Ok(())
    }
}

/// Reads the frame header written by the receiver and builds one Raw16
/// `[height, width]` frame per data type from the buffer regions behind it.
pub struct PercivalProcessPlugin {
    pools: Arc<PoolRegistry>,
    config: Mutex<PercivalConfig>,
}

impl PercivalProcessPlugin {
    /// Registered class name.
    pub const NAME: &'static str = "PercivalProcessPlugin";

    /// Plugin taking output frames from `pools`.
    #[must_use]
    pub fn new(pools: Arc<PoolRegistry>) -> Self {
        Self {
            pools,
            config: Mutex::new(PercivalConfig {
                layout: PacketLayout::default(),
                height: DEFAULT_HEIGHT,
                width: DEFAULT_WIDTH,
            }),
        }
    }
}

impl FrameProcessorPlugin for PercivalProcessPlugin {
    fn process_frame(&self, frame: FramePtr, ctx: &PluginContext) -> PluginResult<()> {
        let config = self.config.lock().clone();
        let data = frame.data();
        let header = FrameHeader::new(data, &config.layout).ok_or_else(|| {
            PluginError::Processing(format!(
                "Buffer of {} bytes is smaller than the {} byte frame header",
                data.len(),
                config.layout.frame_header_size()
            ))
        })?;

        let frame_number = header.frame_number();
        let packets_received = header.packets_received();
        let state = header.frame_state();
        if state != Some(FrameState::Complete) {
            warn!(
                frame = frame_number,
                state = state.map_or("unknown", FrameState::as_str),
                packets_received,
                "Processing frame that is not complete"
            );
        }
        trace!(frame = frame_number, "Splitting raw frame");

        let image_bytes = config.image_bytes();
        for type_index in 0..config.layout.num_data_types {
            let Some(packet_type) = PacketType::from_index(type_index) else {
                continue;
            };
            let start = config.layout.data_type_offset(type_index);
            let region = data.get(start..start + image_bytes).ok_or(
                FrameError::ImageOutOfRange {
                    offset: start,
                    size: image_bytes,
                    len: data.len(),
                },
            )?;

            let mut meta = FrameMetaData::new(
                i64::from(frame_number),
                packet_type.dataset_name(),
                DataType::Raw16,
                frame.acquisition_id(),
                vec![config.height, config.width],
                CompressionType::None,
            );
            meta.set_parameter("packets_received", packets_received);
            meta.set_parameter("frame_state", state.map_or("unknown", FrameState::as_str));
            meta.set_parameter("subframe_count", config.layout.num_subframes as u64);
            meta.set_parameter("subframe_size", config.layout.subframe_size() as u64);

            let image = Frame::from_bytes(&self.pools, POOL_ID, meta, region)?;
            ctx.push(Arc::new(image));
        }
        Ok(())
    }

    fn configure(&self, config: &IpcMessage, _reply: &mut IpcMessage) -> PluginResult<()> {
        let mut current = self.config.lock();
        let mut updated = current.clone();
        if config.has_param("layout") {
            updated.layout = config.get_param("layout")?;
        }
        updated.height = config.get_param_or("height", updated.height)?;
        updated.width = config.get_param_or("width", updated.width)?;
        updated.validate()?;
        *current = updated;
        Ok(())
    }

    fn request_configuration(&self, prefix: &str, reply: &mut IpcMessage) {
        let config = self.config.lock();
        reply.set_param(&format!("{prefix}height"), config.height);
        reply.set_param(&format!("{prefix}width"), config.width);
        if let Ok(serde_json::Value::Object(layout)) = serde_json::to_value(&config.layout) {
            reply.merge_params(&format!("{prefix}layout"), &layout);
        }
    }
}
