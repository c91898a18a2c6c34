//! Publishes a subsample of frames for live display.

use crate::error::PluginResult;
use crate::frame::FramePtr;
use crate::plugin::{FrameProcessorPlugin, PluginContext};
use odin_common::{ChannelType, IpcChannel, IpcMessage};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info};

/// Address the publisher binds when none is configured.
pub const DEFAULT_LIVE_VIEW_ADDR: &str = "tcp://127.0.0.1:5020";
const DEFAULT_FRAME_FREQUENCY: u64 = 2;

struct LiveViewState {
    publisher: Option<IpcChannel>,
    bound_endpoint: Option<String>,
    address: String,
    frame_frequency: u64,
    frames_sent: u64,
}

impl LiveViewState {
    /// Bind the publisher to the configured address if it is not already.
    fn ensure_bound(&mut self) -> PluginResult<&IpcChannel> {
        let publisher = match self.publisher.take() {
            Some(publisher) => publisher,
            None => IpcChannel::new(ChannelType::Pub)?,
        };
        let publisher = self.publisher.insert(publisher);
        if self.bound_endpoint.is_none() {
            let endpoint = publisher.bind(&self.address)?;
            info!(endpoint = %endpoint, "Live view publisher bound");
            self.bound_endpoint = Some(endpoint);
        }
        Ok(publisher)
    }

    fn rebind(&mut self, address: String) -> PluginResult<()> {
        if let (Some(publisher), Some(endpoint)) = (self.publisher.as_mut(), self.bound_endpoint.take()) {
            publisher.unbind(&endpoint)?;
            debug!(endpoint = %endpoint, "Live view publisher unbound");
        }
        self.address = address;
        self.ensure_bound().map(|_| ())
    }
}

/// Sends every `frame_frequency`-th frame on a PUB socket as a JSON header
/// part followed by the image bytes. A frequency of 0 disables publishing.
/// Frames are always passed on.
pub struct LiveViewPlugin {
    state: Mutex<LiveViewState>,
}

impl Default for LiveViewPlugin {
    fn default() -> Self {
        Self {
            state: Mutex::new(LiveViewState {
                publisher: None,
                bound_endpoint: None,
                address: DEFAULT_LIVE_VIEW_ADDR.to_string(),
                frame_frequency: DEFAULT_FRAME_FREQUENCY,
                frames_sent: 0,
            }),
        }
    }
}

impl LiveViewPlugin {
    /// Registered class name.
    pub const NAME: &'static str = "LiveViewPlugin";

    /// Resolved endpoint the publisher is bound to, once bound.
    #[must_use]
    pub fn bound_endpoint(&self) -> Option<String> {
        self.state.lock().bound_endpoint.clone()
    }

    fn publish(&self, frame: &FramePtr) -> PluginResult<()> {
        let image = frame.image()?;
        let shape: Vec<String> = frame.dimensions().iter().map(u64::to_string).collect();
        let header = json!({
            "frame_num": frame.frame_number(),
            "acquisition_id": frame.acquisition_id(),
            "dtype": frame.data_type().as_str(),
            "dsize": image.len(),
            "compression": frame.compression().as_str(),
            "shape": shape,
        })
        .to_string();

        let mut state = self.state.lock();
        state
            .ensure_bound()?
            .send_multipart(&[header.as_bytes(), image])?;
        state.frames_sent += 1;
        Ok(())
    }
}

impl FrameProcessorPlugin for LiveViewPlugin {
    fn process_frame(&self, frame: FramePtr, ctx: &PluginContext) -> PluginResult<()> {
        let frequency = self.state.lock().frame_frequency;
        let selected = frequency > 0
            && u64::try_from(frame.frame_number()).is_ok_and(|n| n % frequency == 0);
        if selected {
            if let Err(e) = self.publish(&frame) {
                ctx.set_error(format!("Live view publish failed: {e}"));
            }
        }
        ctx.push(frame);
        Ok(())
    }

    fn configure(&self, config: &IpcMessage, _reply: &mut IpcMessage) -> PluginResult<()> {
        let mut state = self.state.lock();
        state.frame_frequency = config.get_param_or("frame_frequency", state.frame_frequency)?;
        if config.has_param("live_view_socket_addr") {
            let address: String = config.get_param("live_view_socket_addr")?;
            if address != state.address || state.bound_endpoint.is_none() {
                state.rebind(address)?;
            }
        } else {
            state.ensure_bound()?;
        }
        Ok(())
    }

    fn request_configuration(&self, prefix: &str, reply: &mut IpcMessage) {
        let state = self.state.lock();
        reply.set_param(&format!("{prefix}frame_frequency"), state.frame_frequency);
        reply.set_param(&format!("{prefix}live_view_socket_addr"), state.address.clone());
    }

    fn status(&self, prefix: &str, status: &mut IpcMessage) {
        status.set_param(&format!("{prefix}frames_sent"), self.state.lock().frames_sent);
    }

    fn reset_statistics(&self) -> bool {
        self.state.lock().frames_sent = 0;
        true
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
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_publishes_selected_frames() {
        let address = format!("inproc://live-view-{}", rand::random::<u32>());
        let plugin = LiveViewPlugin::default();
        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        config.set_param("live_view_socket_addr", address.clone());
        config.set_param("frame_frequency", 2u64);
        plugin
            .configure(&config, &mut IpcMessage::reply_to(&config, MsgType::Ack))
            .unwrap();

        let mut subscriber = IpcChannel::new(ChannelType::Sub).unwrap();
        subscriber.connect(&address).unwrap();
        subscriber.subscribe("").unwrap();
        thread::sleep(Duration::from_millis(100));

        let pools = PoolRegistry::new();
        let ctx = PluginContext::new("live");
        for number in 0..4 {
            let meta = FrameMetaData::new(number, "data", DataType::Raw16, "acq", vec![1, 2], CompressionType::None);
            let frame = Frame::from_bytes(&pools, "live", meta, &[1, 0, 2, 0]).unwrap();
            plugin.process_frame(Arc::new(frame), &ctx).unwrap();
        }

        let mut received = Vec::new();
        while subscriber.poll(200).unwrap() {
            let parts = subscriber.recv_multipart().unwrap();
            assert_eq!(parts.len(), 2);
            let header: serde_json::Value = serde_json::from_slice(&parts[0]).unwrap();
            assert_eq!(header["dtype"], "uint16");
            assert_eq!(header["shape"], json!(["1", "2"]));
            assert_eq!(parts[1], vec![1, 0, 2, 0]);
            received.push(header["frame_num"].as_i64().unwrap());
        }
        assert_eq!(received, vec![0, 2]);
    }

    #[test]
    fn test_zero_frequency_disables() {
        let plugin = LiveViewPlugin::default();
        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        config.set_param("live_view_socket_addr", format!("inproc://live-off-{}", rand::random::<u32>()));
        config.set_param("frame_frequency", 0u64);
        plugin
            .configure(&config, &mut IpcMessage::reply_to(&config, MsgType::Ack))
            .unwrap();

        let pools = PoolRegistry::new();
        let meta = FrameMetaData::new(0, "data", DataType::Raw8, "", vec![1], CompressionType::None);
        let frame = Frame::from_bytes(&pools, "live", meta, &[1]).unwrap();
        plugin
            .process_frame(Arc::new(frame), &PluginContext::new("live"))
            .unwrap();
        assert_eq!(plugin.state.lock().frames_sent, 0);
    }

    #[test]
    fn test_reconfigure_rebinds() {
        let plugin = LiveViewPlugin::default();
        let first = format!("inproc://live-a-{}", rand::random::<u32>());
        let second = format!("inproc://live-b-{}", rand::random::<u32>());
        for address in [&first, &second] {
            let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
            config.set_param("live_view_socket_addr", address.clone());
            plugin
                .configure(&config, &mut IpcMessage::reply_to(&config, MsgType::Ack))
                .unwrap();
        }
        assert_eq!(plugin.bound_endpoint(), Some(second));
    }
}
