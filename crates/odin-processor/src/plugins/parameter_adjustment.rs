//! Derived frame parameters: an input value plus a fixed adjustment.

use crate::error::PluginResult;
use crate::frame::FramePtr;
use crate::meta_data::FrameMetaData;
use crate::plugin::{FrameProcessorPlugin, PluginContext};
use odin_common::IpcMessage;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize)]
struct Adjustment {
    adjustment: i64,
    #[serde(default)]
    input: Option<String>,
}

/// Sets `name = input + adjustment` on every frame, where `input` is another
/// frame parameter or, when none is named, the frame number.
///
/// Configured as `parameter: {name: {adjustment, input?}}`. An empty
/// `parameter` object removes every adjustment.
#[derive(Debug, Default)]
pub struct ParameterAdjustmentPlugin {
    adjustments: Mutex<BTreeMap<String, Adjustment>>,
}

impl ParameterAdjustmentPlugin {
    /// Registered class name.
    pub const NAME: &'static str = "ParameterAdjustmentPlugin";
}

fn input_value(meta: &FrameMetaData, input: Option<&str>) -> Option<i64> {
    let Some(name) = input else {
        return Some(meta.frame_number());
    };
    meta.get_parameter::<u64>(name)
        .ok()
        .and_then(|v| i64::try_from(v).ok())
        .or_else(|| meta.get_parameter::<i64>(name).ok())
}

impl FrameProcessorPlugin for ParameterAdjustmentPlugin {
    fn process_frame(&self, frame: FramePtr, ctx: &PluginContext) -> PluginResult<()> {
        let adjustments = self.adjustments.lock().clone();
        {
            let frame_number = frame.frame_number();
            let mut meta = frame.meta_mut();
            for (name, adj) in &adjustments {
                let Some(input) = input_value(&meta, adj.input.as_deref()) else {
                    ctx.set_error(format!(
                        "Input parameter '{}' for '{name}' missing on frame {frame_number}",
                        adj.input.as_deref().unwrap_or_default()
                    ));
                    continue;
                };
                match u64::try_from(input + adj.adjustment) {
                    Ok(value) => meta.set_parameter(name, value),
                    Err(_) => ctx.set_error(format!(
                        "Adjusted '{name}' is negative on frame {frame_number}"
                    )),
                }
            }
        }
        ctx.push(frame);
        Ok(())
    }

    fn configure(&self, config: &IpcMessage, _reply: &mut IpcMessage) -> PluginResult<()> {
        if config.has_param("parameter") {
            let update: BTreeMap<String, Adjustment> = config.get_param("parameter")?;
            let mut adjustments = self.adjustments.lock();
            if update.is_empty() {
                adjustments.clear();
            } else {
                adjustments.extend(update);
            }
        }
        Ok(())
    }

    fn request_configuration(&self, prefix: &str, reply: &mut IpcMessage) {
        let adjustments = self.adjustments.lock();
        if adjustments.is_empty() {
            reply.set_param(&format!("{prefix}parameter"), serde_json::Map::new());
        }
        for (name, adj) in adjustments.iter() {
            reply.set_param(&format!("{prefix}parameter/{name}/adjustment"), adj.adjustment);
            if let Some(input) = &adj.input {
                reply.set_param(&format!("{prefix}parameter/{name}/input"), input.clone());
            }
        }
    }
}
