//! Writes frame images to flat binary files, one per dataset, with a JSON
//! sidecar describing the acquisition.
//!
//! Frame `n` of a dataset lands at byte `(n + frame_offset) * image_size`
//! of `<file_path>/<file_prefix>_<dataset>.raw`, so frames arriving out of
//! order or with gaps still end up at their own position.

use crate::error::{PluginError, PluginResult};
use crate::frame::FramePtr;
use crate::meta_data::DataType;
use crate::plugin::{FrameProcessorPlugin, PluginContext};
use odin_common::IpcMessage;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_FILE_PREFIX: &str = "odin_data";

struct DatasetFile {
    file: File,
    dims: Vec<u64>,
    data_type: DataType,
    frames: u64,
}

#[derive(Serialize)]
struct DatasetSummary {
    dims: Vec<u64>,
    dtype: &'static str,
    frames: u64,
}

#[derive(Serialize)]
struct AcquisitionSummary {
    acquisition_id: String,
    frames_written: u64,
    datasets: BTreeMap<String, DatasetSummary>,
}

struct WriterState {
    file_path: PathBuf,
    file_prefix: String,
    writing: bool,
    acquisition_id: String,
    frames_written: u64,
    datasets: BTreeMap<String, DatasetFile>,
}

impl WriterState {
    fn start(&mut self) {
        self.acquisition_id = Uuid::new_v4().to_string();
        self.frames_written = 0;
        self.datasets.clear();
        self.writing = true;
        info!(
            path = %self.file_path.display(),
            prefix = %self.file_prefix,
            acquisition = %self.acquisition_id,
            "Starting acquisition"
        );
    }

    fn stop(&mut self) -> PluginResult<()> {
        if !self.writing {
            return Ok(());
        }
        self.writing = false;

        let mut datasets = BTreeMap::new();
        for (name, dataset) in std::mem::take(&mut self.datasets) {
            dataset.file.sync_all()?;
            datasets.insert(
                name,
                DatasetSummary {
                    dims: dataset.dims,
                    dtype: dataset.data_type.as_str(),
                    frames: dataset.frames,
                },
            );
        }
        let summary = AcquisitionSummary {
            acquisition_id: self.acquisition_id.clone(),
            frames_written: self.frames_written,
            datasets,
        };
        let sidecar = self.file_path.join(format!("{}.json", self.file_prefix));
        let mut writer = BufWriter::new(File::create(&sidecar)?);
        serde_json::to_writer_pretty(&mut writer, &summary)
            .map_err(|e| PluginError::Processing(format!("Failed to write sidecar: {e}")))?;
        writer.flush()?;
        info!(
            sidecar = %sidecar.display(),
            frames = self.frames_written,
            "Acquisition closed"
        );
        Ok(())
    }

    fn write_frame(&mut self, frame: &FramePtr) -> PluginResult<()> {
        let dataset = frame.dataset_name();
        let image = frame.image()?;
        let position = frame.frame_number() + frame.frame_offset();
        let position = u64::try_from(position).map_err(|_| {
            PluginError::Processing(format!(
                "Frame {} has negative file position {position}",
                frame.frame_number()
            ))
        })?;

        if !self.datasets.contains_key(&dataset) {
            let path = self
                .file_path
                .join(format!("{}_{dataset}.raw", self.file_prefix));
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)?;
            debug!(path = %path.display(), "Opened dataset file");
            self.datasets.insert(
                dataset.clone(),
                DatasetFile {
                    file,
                    dims: frame.dimensions(),
                    data_type: frame.data_type(),
                    frames: 0,
                },
            );
        }
        let Some(target) = self.datasets.get_mut(&dataset) else {
            return Ok(());
        };
        let image_len = u64::try_from(image.len()).unwrap_or(u64::MAX);
        target.file.seek(SeekFrom::Start(position * image_len))?;
        target.file.write_all(image)?;
        target.frames += 1;
        self.frames_written += 1;
        Ok(())
    }
}

/// Writes every frame it sees while an acquisition is running, then passes
/// the frame on.
///
/// `write = true` starts an acquisition with a fresh acquisition id;
/// `write = false` or an end of acquisition closes it and writes
/// `<file_prefix>.json`.
pub struct RawFileWriterPlugin {
    state: Mutex<WriterState>,
}

impl Default for RawFileWriterPlugin {
    fn default() -> Self {
        Self {
            state: Mutex::new(WriterState {
                file_path: std::env::temp_dir(),
                file_prefix: DEFAULT_FILE_PREFIX.to_string(),
                writing: false,
                acquisition_id: String::new(),
                frames_written: 0,
                datasets: BTreeMap::new(),
            }),
        }
    }
}

impl RawFileWriterPlugin {
    /// Registered class name.
    pub const NAME: &'static str = "RawFileWriterPlugin";
}

impl FrameProcessorPlugin for RawFileWriterPlugin {
    fn process_frame(&self, frame: FramePtr, ctx: &PluginContext) -> PluginResult<()> {
        {
            let mut state = self.state.lock();
            if state.writing {
                state.write_frame(&frame)?;
            }
        }
        ctx.push(frame);
        Ok(())
    }

    fn process_end_of_acquisition(&self, ctx: &PluginContext) {
        if let Err(e) = self.state.lock().stop() {
            ctx.set_error(format!("Closing acquisition failed: {e}"));
        }
    }

    fn configure(&self, config: &IpcMessage, _reply: &mut IpcMessage) -> PluginResult<()> {
        let mut state = self.state.lock();
        let file_path: Option<PathBuf> = config.get_param_or("file_path", None)?;
        let file_prefix: Option<String> = config.get_param_or("file_prefix", None)?;
        if state.writing && (file_path.is_some() || file_prefix.is_some()) {
            return Err(PluginError::Config(
                "file_path and file_prefix cannot change while writing".to_string(),
            ));
        }
        if let Some(file_path) = file_path {
            if !file_path.is_dir() {
                return Err(PluginError::Config(format!(
                    "file_path {} is not a directory",
                    file_path.display()
                )));
            }
            state.file_path = file_path;
        }
        if let Some(file_prefix) = file_prefix {
            state.file_prefix = file_prefix;
        }
        if config.has_param("write") {
            let write: bool = config.get_param("write")?;
            if write && !state.writing {
                state.start();
            } else if !write {
                state.stop()?;
            }
        }
        Ok(())
    }

    fn request_configuration(&self, prefix: &str, reply: &mut IpcMessage) {
        let state = self.state.lock();
        reply.set_param(
            &format!("{prefix}file_path"),
            state.file_path.display().to_string(),
        );
        reply.set_param(&format!("{prefix}file_prefix"), state.file_prefix.clone());
        reply.set_param(&format!("{prefix}write"), state.writing);
    }

    fn status(&self, prefix: &str, status: &mut IpcMessage) {
        let state = self.state.lock();
        status.set_param(&format!("{prefix}writing"), state.writing);
        status.set_param(&format!("{prefix}frames_written"), state.frames_written);
        status.set_param(
            &format!("{prefix}file_path"),
            state.file_path.display().to_string(),
        );
        status.set_param(&format!("{prefix}acquisition_id"), state.acquisition_id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::meta_data::{CompressionType, FrameMetaData};
    use odin_common::{MsgType, MsgVal};
    use odin_pool::PoolRegistry;
    use std::sync::Arc;

    fn configure(plugin: &RawFileWriterPlugin, params: serde_json::Value) -> PluginResult<()> {
        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        if let serde_json::Value::Object(map) = params {
            config.merge_params("", &map);
        }
        plugin.configure(&config, &mut IpcMessage::reply_to(&config, MsgType::Ack))
    }

    fn frame(pools: &PoolRegistry, number: i64, fill: u8) -> FramePtr {
        let meta = FrameMetaData::new(number, "data", DataType::Raw16, "", vec![1, 2], CompressionType::None);
        Arc::new(Frame::from_bytes(pools, "writer", meta, &[fill; 4]).unwrap())
    }

    #[test]
    fn test_writes_frames_at_position_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let pools = PoolRegistry::new();
        let plugin = RawFileWriterPlugin::default();
        configure(
            &plugin,
            serde_json::json!({
                "file_path": dir.path().display().to_string(),
                "file_prefix": "run",
                "write": true
            }),
        )
        .unwrap();

        let ctx = PluginContext::new("writer");
        plugin.process_frame(frame(&pools, 1, 0xBB), &ctx).unwrap();
        plugin.process_frame(frame(&pools, 0, 0xAA), &ctx).unwrap();
        plugin.process_end_of_acquisition(&ctx);

        let data = std::fs::read(dir.path().join("run_data.raw")).unwrap();
        assert_eq!(data, vec![0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB, 0xBB, 0xBB]);

        let sidecar: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("run.json")).unwrap()).unwrap();
        assert_eq!(sidecar["frames_written"], 2);
        assert_eq!(sidecar["datasets"]["data"]["dtype"], "uint16");
        assert_eq!(sidecar["datasets"]["data"]["dims"], serde_json::json!([1, 2]));
        assert!(ctx.errors().is_empty());
    }

    #[test]
    fn test_path_locked_while_writing() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = RawFileWriterPlugin::default();
        configure(
            &plugin,
            serde_json::json!({"file_path": dir.path().display().to_string(), "write": true}),
        )
        .unwrap();

        assert!(matches!(
            configure(&plugin, serde_json::json!({"file_prefix": "other"})),
            Err(PluginError::Config(_))
        ));
        configure(&plugin, serde_json::json!({"write": false})).unwrap();
        assert!(dir.path().join(format!("{DEFAULT_FILE_PREFIX}.json")).exists());
    }

    #[test]
    fn test_frames_ignored_when_not_writing() {
        let pools = PoolRegistry::new();
        let plugin = RawFileWriterPlugin::default();
        plugin
            .process_frame(frame(&pools, 0, 1), &PluginContext::new("writer"))
            .unwrap();

        let mut status = IpcMessage::new(MsgType::Ack, MsgVal::Status);
        plugin.status("writer/", &mut status);
        assert_eq!(status.get_param::<u64>("writer/frames_written").unwrap(), 0);
        assert!(!status.get_param::<bool>("writer/writing").unwrap());
    }
}
