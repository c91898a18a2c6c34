//! Frame receiver configuration.
//!
//! The same struct is filled from the TOML settings at startup and updated
//! by `configure` messages at runtime. Keys in a `configure` message use the
//! field names below; absent keys leave the current value unchanged.

use odin_common::{IpcError, IpcMessage, IpcResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::decoder::PercivalDecoder;

/// Default control endpoint.
pub const DEFAULT_CTRL_ENDPOINT: &str = "tcp://127.0.0.1:5000";
/// Default endpoint between the controller and its RX thread.
pub const DEFAULT_RX_ENDPOINT: &str = "inproc://rx_channel";
/// Default frame-ready publish endpoint.
pub const DEFAULT_FRAME_READY_ENDPOINT: &str = "tcp://127.0.0.1:5001";
/// Default frame-release subscribe endpoint.
pub const DEFAULT_FRAME_RELEASE_ENDPOINT: &str = "tcp://127.0.0.1:5002";
/// Default shared buffer name.
pub const DEFAULT_SHARED_BUFFER_NAME: &str = "OdinDataBuffer";

/// Complete receiver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Control channel endpoint (ROUTER, bound)
    pub ctrl_endpoint: String,
    /// RX thread channel endpoint (ROUTER, bound)
    pub rx_endpoint: String,
    /// Frame-ready notification endpoint (PUB, bound)
    pub frame_ready_endpoint: String,
    /// Frame-release notification endpoint (SUB, bound)
    pub frame_release_endpoint: String,
    /// Registered decoder type
    pub decoder_type: String,
    /// Decoder specific configuration, passed to `FrameDecoder::init`
    pub decoder_config: Map<String, Value>,
    /// Shared buffer region name
    pub shared_buffer_name: String,
    /// Total bytes of shared buffer memory
    pub max_buffer_mem: usize,
    /// UDP ports to receive on
    pub rx_ports: Vec<u16>,
    /// Address the UDP sockets bind to
    pub rx_address: String,
    /// Stop after this many released frames; 0 runs forever
    pub frame_count: u64,
    /// RX thread control service period
    pub tick_period_ms: u64,
    /// Delay before the unsolicited buffer configuration notification
    pub deferred_action_delay_ms: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            ctrl_endpoint: DEFAULT_CTRL_ENDPOINT.to_string(),
            rx_endpoint: DEFAULT_RX_ENDPOINT.to_string(),
            frame_ready_endpoint: DEFAULT_FRAME_READY_ENDPOINT.to_string(),
            frame_release_endpoint: DEFAULT_FRAME_RELEASE_ENDPOINT.to_string(),
            decoder_type: PercivalDecoder::NAME.to_string(),
            decoder_config: Map::new(),
            shared_buffer_name: DEFAULT_SHARED_BUFFER_NAME.to_string(),
            max_buffer_mem: 1_048_576,
            rx_ports: vec![8989, 8990],
            rx_address: "0.0.0.0".to_string(),
            frame_count: 0,
            tick_period_ms: 100,
            deferred_action_delay_ms: 1000,
        }
    }
}

/// Which parts of the receiver a configuration update touches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigChanges {
    /// Any channel endpoint changed
    pub ipc: bool,
    /// Decoder type or decoder configuration changed
    pub decoder: bool,
    /// Shared buffer name or size changed
    pub buffer_manager: bool,
    /// UDP ports or address changed
    pub rx_thread: bool,
}

impl ConfigChanges {
    /// True when nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !(self.ipc || self.decoder || self.buffer_manager || self.rx_thread)
    }
}

fn update<T: PartialEq>(slot: &mut T, value: Option<T>) -> bool {
    match value {
        Some(value) if *slot != value => {
            *slot = value;
            true
        }
        _ => false,
    }
}

impl ReceiverConfig {
    /// Apply the keys present in `msg`. Returns what changed; on error the
    /// configuration is left untouched.
    pub fn apply(&mut self, msg: &IpcMessage) -> IpcResult<ConfigChanges> {
        let mut next = self.clone();
        let mut changes = ConfigChanges::default();

        fn opt<T: serde::de::DeserializeOwned>(msg: &IpcMessage, key: &str) -> IpcResult<Option<T>> {
            if msg.has_param(key) {
                msg.get_param(key).map(Some)
            } else {
                Ok(None)
            }
        }

        changes.ipc |= update(&mut next.ctrl_endpoint, opt(msg, "ctrl_endpoint")?);
        changes.ipc |= update(&mut next.rx_endpoint, opt(msg, "rx_endpoint")?);
        changes.ipc |= update(&mut next.frame_ready_endpoint, opt(msg, "frame_ready_endpoint")?);
        changes.ipc |= update(
            &mut next.frame_release_endpoint,
            opt(msg, "frame_release_endpoint")?,
        );

        changes.decoder |= update(&mut next.decoder_type, opt(msg, "decoder_type")?);
        if let Some(params) = opt::<Map<String, Value>>(msg, "decoder_config")? {
            let mut merged = next.decoder_config.clone();
            merged.extend(params);
            changes.decoder |= update(&mut next.decoder_config, Some(merged));
        }

        changes.buffer_manager |=
            update(&mut next.shared_buffer_name, opt(msg, "shared_buffer_name")?);
        changes.buffer_manager |= update(&mut next.max_buffer_mem, opt(msg, "max_buffer_mem")?);

        changes.rx_thread |= update(&mut next.rx_ports, rx_ports(msg)?);
        changes.rx_thread |= update(&mut next.rx_address, opt(msg, "rx_address")?);
        changes.rx_thread |= update(&mut next.tick_period_ms, opt(msg, "tick_period_ms")?);
        update(
            &mut next.deferred_action_delay_ms,
            opt(msg, "deferred_action_delay_ms")?,
        );

        if let Some(frames) = opt::<u64>(msg, "frames")? {
            if frames != 0 {
                next.frame_count = frames;
            }
        }
        update(&mut next.frame_count, opt(msg, "frame_count")?);

        if msg.get_param_or("force_reconfig", false)? {
            changes = ConfigChanges {
                ipc: true,
                decoder: true,
                buffer_manager: true,
                rx_thread: true,
            };
        }

        *self = next;
        Ok(changes)
    }

    /// Write the configuration into `reply`.
    pub fn write_to(&self, reply: &mut IpcMessage) {
        reply.set_param("ctrl_endpoint", self.ctrl_endpoint.clone());
        reply.set_param("rx_endpoint", self.rx_endpoint.clone());
        reply.set_param("frame_ready_endpoint", self.frame_ready_endpoint.clone());
        reply.set_param("frame_release_endpoint", self.frame_release_endpoint.clone());
        reply.set_param("decoder_type", self.decoder_type.clone());
        reply.set_param("shared_buffer_name", self.shared_buffer_name.clone());
        reply.set_param("max_buffer_mem", self.max_buffer_mem);
        reply.set_param("rx_type", "udp");
        reply.set_param("rx_ports", self.rx_port_list());
        reply.set_param("rx_address", self.rx_address.clone());
        reply.set_param("frame_count", self.frame_count);
        reply.set_param("tick_period_ms", self.tick_period_ms);
        reply.set_param("deferred_action_delay_ms", self.deferred_action_delay_ms);
    }

    /// Ports as a comma separated list.
    #[must_use]
    pub fn rx_port_list(&self) -> String {
        self.rx_ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Decoder configuration as a message for `FrameDecoder::init`.
    #[must_use]
    pub fn decoder_message(&self) -> IpcMessage {
        IpcMessage::with_params(
            odin_common::MsgType::Cmd,
            odin_common::MsgVal::Configure,
            self.decoder_config.clone(),
        )
    }
}

/// `rx_ports` as either a list of numbers or a comma separated string.
fn rx_ports(msg: &IpcMessage) -> IpcResult<Option<Vec<u16>>> {
    match msg.param_value("rx_ports") {
        None => Ok(None),
        Some(Value::String(list)) => parse_port_list(list)
            .map(Some)
            .map_err(|e| IpcError::ParamType {
                path: "rx_ports".to_string(),
                reason: e.to_string(),
            }),
        Some(_) => msg.get_param("rx_ports").map(Some),
    }
}

/// Parse a comma separated port list such as `"8989,8990"`.
pub fn parse_port_list(list: &str) -> Result<Vec<u16>, std::num::ParseIntError> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use odin_common::{MsgType, MsgVal};

    #[test]
    fn test_defaults() {
        let config = ReceiverConfig::default();
        assert_eq!(config.rx_endpoint, "inproc://rx_channel");
        assert_eq!(config.ctrl_endpoint, "tcp://127.0.0.1:5000");
        assert_eq!(config.max_buffer_mem, 1_048_576);
        assert_eq!(config.rx_port_list(), "8989,8990");
    }

    #[test]
    fn test_apply_reports_changes() {
        let mut config = ReceiverConfig::default();
        let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        msg.set_param("rx_ports", vec![9000u16]);
        msg.set_param("decoder_config/frame_timeout_ms", 200u64);
        msg.set_param("frames", 10u64);

        let changes = config.apply(&msg).unwrap();
        assert!(changes.rx_thread);
        assert!(changes.decoder);
        assert!(!changes.ipc);
        assert!(!changes.buffer_manager);
        assert_eq!(config.rx_ports, vec![9000]);
        assert_eq!(config.frame_count, 10);
        assert_eq!(
            config
                .decoder_message()
                .get_param::<u64>("frame_timeout_ms")
                .unwrap(),
            200
        );

        assert!(config.apply(&msg).unwrap().is_empty());
    }

    #[test]
    fn test_apply_is_atomic_on_error() {
        let mut config = ReceiverConfig::default();
        let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        msg.set_param("rx_address", "127.0.0.1");
        msg.set_param("max_buffer_mem", "lots");

        assert!(config.apply(&msg).is_err());
        assert_eq!(config, ReceiverConfig::default());
    }

    #[test]
    fn test_port_list_string_and_force_reconfig() {
        let mut config = ReceiverConfig::default();
        let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        msg.set_param("rx_ports", "8989,8990");
        msg.set_param("force_reconfig", true);

        let changes = config.apply(&msg).unwrap();
        assert_eq!(config.rx_ports, vec![8989, 8990]);
        assert!(changes.ipc && changes.decoder && changes.buffer_manager && changes.rx_thread);

        msg.set_param("rx_ports", "8989,port");
        assert!(matches!(
            config.apply(&msg),
            Err(IpcError::ParamType { path, .. }) if path == "rx_ports"
        ));
    }

    #[test]
    fn test_parse_port_list() {
        assert_eq!(parse_port_list("8989, 8990").unwrap(), vec![8989, 8990]);
        assert!(parse_port_list("8989,abc").is_err());
    }
}
