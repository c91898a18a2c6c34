//! Startup configuration using Figment.
//!
//! Settings are loaded from:
//! 1. a TOML file (`config/odin-data.toml` unless another is given)
//! 2. environment variables prefixed with `ODIN_DATA_`, nested keys split on
//!    `__` (`ODIN_DATA_RECEIVER__RX_ADDRESS=10.0.0.2`)
//!
//! The binary turns the settings into `configure` messages and hands them to
//! a controller exactly as a remote client would.
//!
//! # Example
//! ```no_run
//! use odin_data::config::Settings;
//!
//! let settings = Settings::load_from("config/odin-data.toml")?;
//! settings.validate()?;
//! for msg in settings.processor.configure_messages() {
//!     println!("{msg}");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::logging::OutputFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use odin_common::{IpcMessage, MsgType, MsgVal};
use odin_processor::{CONTROLLER, FRAME_RECEIVER};
use odin_receiver::config::{DEFAULT_FRAME_READY_ENDPOINT, DEFAULT_FRAME_RELEASE_ENDPOINT};
use odin_receiver::ReceiverConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::Path;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/odin-data.toml";
/// Default processor control endpoint.
pub const DEFAULT_PROCESSOR_CTRL_ENDPOINT: &str = "tcp://127.0.0.1:5004";

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Logging settings
    pub log: LogSettings,
    /// Frame receiver settings
    pub receiver: ReceiverSettings,
    /// Frame processor settings
    pub processor: ProcessorSettings,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// trace, debug, info, warn or error
    pub level: String,
    /// Output format
    pub format: OutputFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
        }
    }
}

/// Frame receiver settings. Field names match the receiver's `configure`
/// keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverSettings {
    /// Receiver configuration
    #[serde(flatten)]
    pub config: ReceiverConfig,
}

impl ReceiverSettings {
    /// Check the settings describe a receiver that can start.
    pub fn validate(&self) -> Result<(), String> {
        let config = &self.config;
        for (key, endpoint) in [
            ("ctrl_endpoint", &config.ctrl_endpoint),
            ("rx_endpoint", &config.rx_endpoint),
            ("frame_ready_endpoint", &config.frame_ready_endpoint),
            ("frame_release_endpoint", &config.frame_release_endpoint),
        ] {
            if endpoint.is_empty() {
                return Err(format!("receiver.{key} must not be empty"));
            }
        }
        if config.rx_ports.is_empty() {
            return Err("receiver.rx_ports must list at least one port".to_string());
        }
        if config.max_buffer_mem == 0 {
            return Err("receiver.max_buffer_mem must be nonzero".to_string());
        }
        if config.tick_period_ms == 0 {
            return Err("receiver.tick_period_ms must be nonzero".to_string());
        }
        if config.decoder_type.is_empty() {
            return Err("receiver.decoder_type must not be empty".to_string());
        }
        Ok(())
    }

    /// The initial `configure` message.
    #[must_use]
    pub fn configure_message(&self) -> IpcMessage {
        let params = match serde_json::to_value(&self.config) {
            Ok(Value::Object(params)) => params,
            _ => Map::new(),
        };
        IpcMessage::with_params(MsgType::Cmd, MsgVal::Configure, params)
    }
}

/// One plugin of a processing chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Instance name frames and configuration are routed by
    pub index: String,
    /// Registered plugin class
    pub name: String,
    /// Producer this plugin takes frames from: another plugin's index or
    /// `frame_receiver`
    #[serde(default)]
    pub connection: Option<String>,
    /// Count frames leaving this plugin and stop once `frames` are seen
    #[serde(default)]
    pub end_of_chain: bool,
    /// Plugin specific configuration
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Frame processor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorSettings {
    /// Control channel endpoint
    pub ctrl_endpoint: String,
    /// Receiver frame-ready endpoint to subscribe to
    pub fr_ready_cnxn: String,
    /// Receiver frame-release endpoint to publish to
    pub fr_release_cnxn: String,
    /// Stop after this many frames reach an end of chain; 0 runs forever
    pub frames: u64,
    /// Plugin chain, loaded in order
    pub plugins: Vec<PluginSettings>,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            ctrl_endpoint: DEFAULT_PROCESSOR_CTRL_ENDPOINT.to_string(),
            fr_ready_cnxn: DEFAULT_FRAME_READY_ENDPOINT.to_string(),
            fr_release_cnxn: DEFAULT_FRAME_RELEASE_ENDPOINT.to_string(),
            frames: 0,
            plugins: Vec::new(),
        }
    }
}

impl ProcessorSettings {
    /// Check endpoints are set, plugin indexes are unique and every
    /// connection names an earlier plugin or the frame receiver.
    pub fn validate(&self) -> Result<(), String> {
        if self.ctrl_endpoint.is_empty() {
            return Err("processor.ctrl_endpoint must not be empty".to_string());
        }
        if self.fr_ready_cnxn.is_empty() || self.fr_release_cnxn.is_empty() {
            return Err("processor.fr_ready_cnxn and fr_release_cnxn must be set".to_string());
        }

        let mut seen = HashSet::new();
        for plugin in &self.plugins {
            if plugin.index.is_empty() || plugin.name.is_empty() {
                return Err("processor.plugins entries need an index and a name".to_string());
            }
            if plugin.index == FRAME_RECEIVER || plugin.index == CONTROLLER {
                return Err(format!("Plugin index '{}' is reserved", plugin.index));
            }
            if let Some(connection) = &plugin.connection {
                if connection != FRAME_RECEIVER && !seen.contains(connection.as_str()) {
                    return Err(format!(
                        "Plugin '{}' connects to '{connection}', which is not declared before it",
                        plugin.index
                    ));
                }
            }
            if !seen.insert(plugin.index.as_str()) {
                return Err(format!("Duplicate plugin index: {}", plugin.index));
            }
        }
        Ok(())
    }

    /// The initial `configure` messages: endpoints, then one load per
    /// plugin, plugin configuration, and finally the connections.
    #[must_use]
    pub fn configure_messages(&self) -> Vec<IpcMessage> {
        let mut messages = vec![configure(json!({
            "ctrl_endpoint": self.ctrl_endpoint,
            "fr_setup": {
                "fr_ready_cnxn": self.fr_ready_cnxn,
                "fr_release_cnxn": self.fr_release_cnxn,
            },
            "frames": self.frames,
        }))];

        for plugin in &self.plugins {
            messages.push(configure(json!({
                "plugin": {"load": {"index": plugin.index, "name": plugin.name}}
            })));
        }
        for plugin in self.plugins.iter().filter(|p| !p.config.is_empty()) {
            let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
            msg.merge_params(&plugin.index, &plugin.config);
            messages.push(msg);
        }
        for plugin in &self.plugins {
            if let Some(connection) = &plugin.connection {
                messages.push(connect(&plugin.index, connection));
            }
            if plugin.end_of_chain {
                messages.push(connect(CONTROLLER, &plugin.index));
            }
        }
        messages
    }
}

fn configure(params: Value) -> IpcMessage {
    let params = match params {
        Value::Object(params) => params,
        _ => Map::new(),
    };
    IpcMessage::with_params(MsgType::Cmd, MsgVal::Configure, params)
}

fn connect(index: &str, connection: &str) -> IpcMessage {
    configure(json!({
        "plugin": {"connect": {"index": index, "connection": connection}}
    }))
}

impl Settings {
    /// Load settings from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load settings from `path` and the environment. A missing file leaves
    /// the defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ODIN_DATA_").split("__"))
            .extract()
    }

    /// Validate the logging and both process sections.
    pub fn validate(&self) -> Result<(), String> {
        if !VALID_LEVELS.contains(&self.log.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.log.level,
                VALID_LEVELS.join(", ")
            ));
        }
        self.receiver.validate()?;
        self.processor.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[log]
level = "debug"
format = "json"

[receiver]
rx_ports = [9000]
rx_address = "127.0.0.1"
max_buffer_mem = 4096

[receiver.decoder_config]
enable_packet_logging = true

[processor]
ctrl_endpoint = "tcp://127.0.0.1:6004"
frames = 10

[[processor.plugins]]
index = "percival"
name = "PercivalProcessPlugin"
connection = "frame_receiver"

[[processor.plugins]]
index = "sum"
name = "SumPlugin"
connection = "percival"
end_of_chain = true

[processor.plugins.config.histogram]
bright = 1000
"#;

    fn sample_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_sample() {
        figment::Jail::expect_with(|_| {
            let file = sample_file();
            let settings = Settings::load_from(file.path())?;
            assert_eq!(settings.log.level, "debug");
            assert_eq!(settings.log.format, OutputFormat::Json);
            assert_eq!(settings.receiver.config.rx_ports, vec![9000]);
            assert_eq!(settings.receiver.config.max_buffer_mem, 4096);
            assert_eq!(
                settings.receiver.config.decoder_type,
                ReceiverConfig::default().decoder_type
            );
            assert_eq!(settings.processor.frames, 10);
            assert_eq!(settings.processor.plugins.len(), 2);
            assert!(settings.processor.plugins[1].end_of_chain);
            assert!(settings.validate().is_ok());
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            let file = sample_file();
            jail.set_env("ODIN_DATA_RECEIVER__RX_ADDRESS", "10.0.0.2");
            jail.set_env("ODIN_DATA_LOG__LEVEL", "warn");
            let settings = Settings::load_from(file.path())?;
            assert_eq!(settings.receiver.config.rx_address, "10.0.0.2");
            assert_eq!(settings.log.level, "warn");
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        figment::Jail::expect_with(|_| {
            let settings = Settings::load_from("does/not/exist.toml")?;
            assert_eq!(settings, Settings::default());
            Ok(())
        });
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.log.level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_plugin_connection_must_be_declared_first() {
        let mut settings = ProcessorSettings::default();
        settings.plugins = vec![PluginSettings {
            index: "sum".to_string(),
            name: "SumPlugin".to_string(),
            connection: Some("later".to_string()),
            end_of_chain: false,
            config: Map::new(),
        }];
        let err = settings.validate().unwrap_err();
        assert!(err.contains("not declared before it"));
    }

    #[test]
    fn test_duplicate_and_reserved_indexes() {
        let plugin = |index: &str| PluginSettings {
            index: index.to_string(),
            name: "DummyPlugin".to_string(),
            connection: None,
            end_of_chain: false,
            config: Map::new(),
        };
        let mut settings = ProcessorSettings::default();
        settings.plugins = vec![plugin("a"), plugin("a")];
        assert!(settings.validate().unwrap_err().contains("Duplicate"));
        settings.plugins = vec![plugin(CONTROLLER)];
        assert!(settings.validate().unwrap_err().contains("reserved"));
    }

    #[test]
    fn test_processor_messages_order() {
        figment::Jail::expect_with(|_| {
            let file = sample_file();
            let settings = Settings::load_from(file.path())?;
            let messages = settings.processor.configure_messages();
            // setup, 2 loads, 1 plugin config, 2 connects, 1 end of chain
            assert_eq!(messages.len(), 7);
            assert_eq!(
                messages[0].get_param::<String>("fr_setup/fr_ready_cnxn").unwrap(),
                DEFAULT_FRAME_READY_ENDPOINT
            );
            assert_eq!(
                messages[1].get_param::<String>("plugin/load/name").unwrap(),
                "PercivalProcessPlugin"
            );
            assert_eq!(messages[3].get_param::<u64>("sum/histogram/bright").unwrap(), 1000);
            assert_eq!(
                messages[4].get_param::<String>("plugin/connect/connection").unwrap(),
                FRAME_RECEIVER
            );
            assert_eq!(
                messages[6].get_param::<String>("plugin/connect/index").unwrap(),
                CONTROLLER
            );
            assert!(messages.iter().all(|m| m.msg_val() == MsgVal::Configure));
            Ok(())
        });
    }

    #[test]
    fn test_receiver_message_carries_settings() {
        let mut settings = ReceiverSettings::default();
        settings.config.rx_ports = vec![7000, 7001];
        let msg = settings.configure_message();
        assert_eq!(msg.get_param::<Vec<u16>>("rx_ports").unwrap(), vec![7000, 7001]);

        let mut applied = ReceiverConfig::default();
        applied.apply(&msg).unwrap();
        assert_eq!(applied, settings.config);
    }
}
