//! Pixel sum and threshold histogram.

use crate::error::{PluginError, PluginResult};
use crate::frame::FramePtr;
use crate::meta_data::DataType;
use crate::plugin::{FrameProcessorPlugin, PluginContext};
use odin_common::IpcMessage;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Frame parameter holding the pixel sum.
pub const SUM_PARAM: &str = "sum";

/// Sums the pixels of raw integer frames into the `sum` parameter.
///
/// With thresholds configured under `histogram`, each named threshold also
/// gets a parameter counting the pixels at or above it.
#[derive(Debug, Default)]
pub struct SumPlugin {
    histogram: Mutex<BTreeMap<String, u64>>,
    frames_summed: AtomicU64,
}

impl SumPlugin {
    /// Registered class name.
    pub const NAME: &'static str = "SumPlugin";
}

/// Call `f` with every pixel of `image` widened to u64. Returns false for
/// data types that are not raw integers.
fn for_each_pixel(image: &[u8], data_type: DataType, mut f: impl FnMut(u64)) -> bool {
    match data_type {
        DataType::Raw8 => image.iter().for_each(|&p| f(u64::from(p))),
        DataType::Raw16 => image
            .chunks_exact(2)
            .for_each(|c| f(u64::from(u16::from_ne_bytes([c[0], c[1]])))),
        DataType::Raw32 => image.chunks_exact(4).for_each(|c| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(c);
            f(u64::from(u32::from_ne_bytes(bytes)));
        }),
        DataType::Raw64 => image.chunks_exact(8).for_each(|c| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(c);
            f(u64::from_ne_bytes(bytes));
        }),
        DataType::Float32 | DataType::Unknown => return false,
    }
    true
}

impl FrameProcessorPlugin for SumPlugin {
    fn process_frame(&self, frame: FramePtr, ctx: &PluginContext) -> PluginResult<()> {
        let data_type = frame.data_type();
        let thresholds: Vec<(String, u64)> = self
            .histogram
            .lock()
            .iter()
            .map(|(name, threshold)| (name.clone(), *threshold))
            .collect();
        let mut counts = vec![0u64; thresholds.len()];
        let mut sum = 0u64;

        let supported = for_each_pixel(frame.image()?, data_type, |pixel| {
            sum = sum.wrapping_add(pixel);
            for (count, (_, threshold)) in counts.iter_mut().zip(&thresholds) {
                if pixel >= *threshold {
                    *count += 1;
                }
            }
        });

        if supported {
            let mut meta = frame.meta_mut();
            meta.set_parameter(SUM_PARAM, sum);
            for ((name, _), count) in thresholds.iter().zip(counts) {
                meta.set_parameter(name, count);
            }
            drop(meta);
            self.frames_summed.fetch_add(1, Ordering::Relaxed);
            debug!(frame = frame.frame_number(), sum, "Summed frame");
        } else {
            ctx.set_warning(PluginError::UnsupportedDataType(data_type).to_string());
        }
        ctx.push(frame);
        Ok(())
    }

    fn configure(&self, config: &IpcMessage, _reply: &mut IpcMessage) -> PluginResult<()> {
        if config.has_param("histogram") {
            let thresholds: BTreeMap<String, u64> = config.get_param("histogram")?;
            if thresholds.contains_key(SUM_PARAM) {
                return Err(PluginError::Config(format!(
                    "histogram threshold cannot be named '{SUM_PARAM}'"
                )));
            }
            *self.histogram.lock() = thresholds;
        }
        Ok(())
    }

    fn request_configuration(&self, prefix: &str, reply: &mut IpcMessage) {
        let histogram = self.histogram.lock();
        if histogram.is_empty() {
            reply.set_param(&format!("{prefix}histogram"), serde_json::Map::new());
        }
        for (name, threshold) in histogram.iter() {
            reply.set_param(&format!("{prefix}histogram/{name}"), *threshold);
        }
    }

    fn status(&self, prefix: &str, status: &mut IpcMessage) {
        status.set_param(
            &format!("{prefix}frames_summed"),
            self.frames_summed.load(Ordering::Relaxed),
        );
    }

    fn reset_statistics(&self) -> bool {
        self.frames_summed.store(0, Ordering::Relaxed);
        true
    }
}
