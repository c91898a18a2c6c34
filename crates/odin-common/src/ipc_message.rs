//! Self-describing control and notification envelope.
//!
//! Every message exchanged between the receiver, its RX thread, the processor
//! and external control clients is an [`IpcMessage`]: a type, a value, a
//! message id, a timestamp and a tree of named parameters. The text encoding
//! is JSON:
//!
//! ```text
//! {"msg_type":"cmd","msg_val":"status","id":3,"timestamp":"2024-05-01T10:00:00Z","params":{"count":3}}
//! ```
//!
//! Parameter paths use `/` to address nested objects, so `rx_thread/empty_buffers`
//! reads `params["rx_thread"]["empty_buffers"]`. Typed getters fail on a missing
//! path or a type mismatch instead of returning a default.

use crate::error::{IpcError, IpcResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Message category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    /// Request that expects an ack or nack
    Cmd,
    /// Positive reply
    Ack,
    /// Negative reply, carries `params.error`
    Nack,
    /// Unsolicited notification
    Notify,
}

impl MsgType {
    /// Wire name of the type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MsgType::Cmd => "cmd",
            MsgType::Ack => "ack",
            MsgType::Nack => "nack",
            MsgType::Notify => "notify",
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message value: the command or notification carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgVal {
    /// Reset request
    Reset,
    /// Status request or status report
    Status,
    /// Apply configuration parameters
    Configure,
    /// Report the current configuration
    RequestConfiguration,
    /// Report version information
    RequestVersion,
    /// List supported commands
    RequestCommands,
    /// Execute a named command
    Execute,
    /// Ask the receiver for its shared buffer configuration
    RequestBufferConfig,
    /// Ask the controller to hand over all empty buffers
    RequestBufferPrecharge,
    /// Reset counters and timing statistics
    ResetStatistics,
    /// Stop the application
    Shutdown,
    /// RX thread identity announcement
    Identity,
    /// A frame buffer is complete
    FrameReady,
    /// A frame buffer may be reused
    FrameRelease,
    /// Shared buffer configuration announcement
    BufferConfig,
    /// Hand a range of empty buffers to the RX thread
    BufferPrecharge,
}

impl MsgVal {
    /// Wire name of the value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MsgVal::Reset => "reset",
            MsgVal::Status => "status",
            MsgVal::Configure => "configure",
            MsgVal::RequestConfiguration => "request_configuration",
            MsgVal::RequestVersion => "request_version",
            MsgVal::RequestCommands => "request_commands",
            MsgVal::Execute => "execute",
            MsgVal::RequestBufferConfig => "request_buffer_config",
            MsgVal::RequestBufferPrecharge => "request_buffer_precharge",
            MsgVal::ResetStatistics => "reset_statistics",
            MsgVal::Shutdown => "shutdown",
            MsgVal::Identity => "identity",
            MsgVal::FrameReady => "frame_ready",
            MsgVal::FrameRelease => "frame_release",
            MsgVal::BufferConfig => "buffer_config",
            MsgVal::BufferPrecharge => "buffer_precharge",
        }
    }
}

impl fmt::Display for MsgVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IPC envelope with typed, path-addressed parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcMessage {
    msg_type: MsgType,
    msg_val: MsgVal,
    #[serde(default)]
    id: u32,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    params: Map<String, Value>,
}

impl IpcMessage {
    /// Create an empty message stamped with the current time.
    #[must_use]
    pub fn new(msg_type: MsgType, msg_val: MsgVal) -> Self {
        Self {
            msg_type,
            msg_val,
            id: 0,
            timestamp: Utc::now(),
            params: Map::new(),
        }
    }

    /// Create a message whose parameters are `params`.
    #[must_use]
    pub fn with_params(msg_type: MsgType, msg_val: MsgVal, params: Map<String, Value>) -> Self {
        Self {
            params,
            ..Self::new(msg_type, msg_val)
        }
    }

    /// Start a reply to `request`: same value and id, given type, no params.
    #[must_use]
    pub fn reply_to(request: &IpcMessage, msg_type: MsgType) -> Self {
        let mut reply = Self::new(msg_type, request.msg_val);
        reply.id = request.id;
        reply
    }

    /// Decode a message from its text encoding.
    pub fn parse(text: &str) -> IpcResult<Self> {
        serde_json::from_str(text).map_err(|e| IpcError::Malformed(e.to_string()))
    }

    /// Encode the message as JSON text.
    #[must_use]
    pub fn encode(&self) -> String {
        json!({
            "msg_type": self.msg_type.as_str(),
            "msg_val": self.msg_val.as_str(),
            "id": self.id,
            "timestamp": self.timestamp.to_rfc3339(),
            "params": Value::Object(self.params.clone()),
        })
        .to_string()
    }

    /// Message type.
    #[must_use]
    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    /// Message value.
    #[must_use]
    pub fn msg_val(&self) -> MsgVal {
        self.msg_val
    }

    /// Message id, echoed in replies.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Creation time of the message.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Set the message type.
    pub fn set_msg_type(&mut self, msg_type: MsgType) {
        self.msg_type = msg_type;
    }

    /// Set the message value.
    pub fn set_msg_val(&mut self, msg_val: MsgVal) {
        self.msg_val = msg_val;
    }

    /// Set the message id.
    pub fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    /// Turn the message into a nack carrying `reason` as `params.error`.
    pub fn set_nack(&mut self, reason: impl Into<String>) {
        self.msg_type = MsgType::Nack;
        self.set_param("error", reason.into());
    }

    /// True when `path` resolves to a value.
    #[must_use]
    pub fn has_param(&self, path: &str) -> bool {
        lookup(&self.params, path).is_some()
    }

    /// Raw value at `path`.
    #[must_use]
    pub fn param_value(&self, path: &str) -> Option<&Value> {
        lookup(&self.params, path)
    }

    /// Typed value at `path`; fails if absent or of another type.
    pub fn get_param<T: DeserializeOwned>(&self, path: &str) -> IpcResult<T> {
        let value =
            lookup(&self.params, path).ok_or_else(|| IpcError::MissingParam(path.to_string()))?;
        T::deserialize(value).map_err(|e| IpcError::ParamType {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    /// Typed value at `path`, or `default` if absent. A value of the wrong
    /// type is still an error.
    pub fn get_param_or<T: DeserializeOwned>(&self, path: &str, default: T) -> IpcResult<T> {
        if self.has_param(path) {
            self.get_param(path)
        } else {
            Ok(default)
        }
    }

    /// Set the value at `path`, creating intermediate objects as needed.
    pub fn set_param(&mut self, path: &str, value: impl Into<Value>) {
        insert(&mut self.params, path, value.into());
    }

    /// All parameters.
    #[must_use]
    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Top-level parameter names.
    #[must_use]
    pub fn param_names(&self) -> Vec<String> {
        self.params.keys().cloned().collect()
    }

    /// Parameter object at `path`, if it is an object.
    #[must_use]
    pub fn params_at(&self, path: &str) -> Option<&Map<String, Value>> {
        lookup(&self.params, path).and_then(Value::as_object)
    }

    /// A message of the same type and value whose parameters are the object
    /// at `path`.
    pub fn sub_message(&self, path: &str) -> IpcResult<IpcMessage> {
        let value =
            lookup(&self.params, path).ok_or_else(|| IpcError::MissingParam(path.to_string()))?;
        match value {
            Value::Object(map) => {
                let mut sub = Self::with_params(self.msg_type, self.msg_val, map.clone());
                sub.id = self.id;
                Ok(sub)
            }
            other => Err(IpcError::ParamType {
                path: path.to_string(),
                reason: format!("expected an object, found {other}"),
            }),
        }
    }

    /// Copy every parameter of `other` under `prefix` (or at the top level
    /// when `prefix` is empty).
    pub fn merge_params(&mut self, prefix: &str, other: &Map<String, Value>) {
        for (key, value) in other {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}/{key}")
            };
            insert(&mut self.params, &path, value.clone());
        }
    }
}

impl PartialEq for IpcMessage {
    fn eq(&self, other: &Self) -> bool {
        self.msg_type == other.msg_type
            && self.msg_val == other.msg_val
            && self.id == other.id
            && self.params == other.params
    }
}

impl fmt::Display for IpcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn path_parts(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|p| !p.is_empty())
}

fn lookup<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path_parts(path);
    let mut current = root.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn insert(root: &mut Map<String, Value>, path: &str, value: Value) {
    let parts: Vec<&str> = path_parts(path).collect();
    let Some((last, parents)) = parts.split_last() else {
        return;
    };

    let mut current = root;
    for part in parents {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Some(map) = entry.as_object_mut() else {
            return;
        };
        current = map;
    }
    current.insert(last.to_string(), value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_parse_preserves_fields() {
        let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Status);
        msg.set_id(42);
        msg.set_param("count", 7);
        msg.set_param("decoder/frame_timeout_ms", 500u64);

        let decoded = IpcMessage::parse(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.get_param::<i32>("count").unwrap(), 7);
        assert_eq!(decoded.get_param::<u64>("decoder/frame_timeout_ms").unwrap(), 500);
    }

    #[test]
    fn test_wire_names() {
        let msg = IpcMessage::new(MsgType::Notify, MsgVal::RequestBufferPrecharge);
        let text = msg.encode();
        assert!(text.contains("\"msg_type\":\"notify\""));
        assert!(text.contains("\"msg_val\":\"request_buffer_precharge\""));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(IpcMessage::parse("{not json"), Err(IpcError::Malformed(_))));
        assert!(matches!(
            IpcMessage::parse(r#"{"msg_type":"bogus","msg_val":"status"}"#),
            Err(IpcError::Malformed(_))
        ));
        assert!(matches!(
            IpcMessage::parse(r#"{"msg_type":"cmd","msg_val":"unknown_value"}"#),
            Err(IpcError::Malformed(_))
        ));
        assert!(matches!(
            IpcMessage::parse(r#"{"msg_val":"status"}"#),
            Err(IpcError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_minimal_message() {
        let msg = IpcMessage::parse(r#"{"msg_type":"cmd","msg_val":"configure"}"#).unwrap();
        assert_eq!(msg.msg_type(), MsgType::Cmd);
        assert_eq!(msg.msg_val(), MsgVal::Configure);
        assert_eq!(msg.id(), 0);
        assert!(msg.params().is_empty());
    }

    #[test]
    fn test_typed_getters_fail_loudly() {
        let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        msg.set_param("name", "sum");
        msg.set_param("enabled", true);
        msg.set_param("count", -3);

        assert!(matches!(msg.get_param::<i64>("missing"), Err(IpcError::MissingParam(_))));
        assert!(matches!(msg.get_param::<i64>("name"), Err(IpcError::ParamType { .. })));
        assert!(matches!(msg.get_param::<bool>("count"), Err(IpcError::ParamType { .. })));
        assert!(matches!(msg.get_param::<String>("enabled"), Err(IpcError::ParamType { .. })));
        assert!(matches!(msg.get_param::<u32>("count"), Err(IpcError::ParamType { .. })));

        assert!(msg.get_param::<bool>("enabled").unwrap());
        assert_eq!(msg.get_param::<String>("name").unwrap(), "sum");
    }

    #[test]
    fn test_get_param_or_only_defaults_when_absent() {
        let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        msg.set_param("timeout", "soon");

        assert_eq!(msg.get_param_or("absent", 10u32).unwrap(), 10);
        assert!(msg.get_param_or("timeout", 10u32).is_err());
    }

    #[test]
    fn test_nested_paths() {
        let mut msg = IpcMessage::new(MsgType::Ack, MsgVal::Status);
        msg.set_param("rx_thread/empty_buffers", 4u32);
        msg.set_param("rx_thread/mapped_buffers", 1u32);

        assert!(msg.has_param("rx_thread"));
        assert!(!msg.has_param("rx_thread/frames_dropped"));
        assert_eq!(msg.params_at("rx_thread").map(Map::len), Some(2));

        // Overwriting a scalar with a nested path replaces it with an object.
        msg.set_param("status", 1);
        msg.set_param("status/ok", true);
        assert!(msg.get_param::<bool>("status/ok").unwrap());
    }

    #[test]
    fn test_sub_message() {
        let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        msg.set_param("sum/histogram/high", 100);
        msg.set_param("plain", 1);

        let sub = msg.sub_message("sum").unwrap();
        assert_eq!(sub.msg_val(), MsgVal::Configure);
        assert_eq!(sub.get_param::<i64>("histogram/high").unwrap(), 100);
        assert!(msg.sub_message("plain").is_err());
        assert!(msg.sub_message("none").is_err());
    }

    #[test]
    fn test_set_nack() {
        let request = IpcMessage::new(MsgType::Cmd, MsgVal::Reset);
        let mut reply = IpcMessage::reply_to(&request, MsgType::Ack);
        reply.set_nack("Unexpected message");

        assert_eq!(reply.msg_type(), MsgType::Nack);
        assert_eq!(reply.msg_val(), MsgVal::Reset);
        assert_eq!(reply.get_param::<String>("error").unwrap(), "Unexpected message");
    }

    #[test]
    fn test_merge_params_under_prefix() {
        let mut source = IpcMessage::new(MsgType::Ack, MsgVal::Status);
        source.set_param("empty_buffers", 3);
        let mut target = IpcMessage::new(MsgType::Ack, MsgVal::Status);

        target.merge_params("rx_thread", source.params());
        assert_eq!(target.get_param::<u32>("rx_thread/empty_buffers").unwrap(), 3);
    }
}
