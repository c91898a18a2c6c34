//! Frames: a data body plus metadata, passed between plugins as [`FramePtr`].
//!
//! A frame body is one of:
//!
//! - **Pooled**: owns a [`DataBlock`]; dropping the frame returns the block
//! - **Shared**: a view of a receiver slot; dropping the frame tells the
//!   receiver the slot may be reused
//! - **End of acquisition**: a marker without data
//!
//! The body is fixed at construction. Metadata sits behind a lock so every
//! consumer of a fanned-out frame sees the same parameters.

use crate::error::FrameError;
use crate::meta_data::{CompressionType, DataType, FrameMetaData};
use odin_common::{IpcChannel, IpcMessage, IpcResult, MsgType, MsgVal, SharedBufferManager};
use odin_pool::{DataBlock, PoolRegistry};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Frames travel through the pipeline behind an `Arc`.
pub type FramePtr = Arc<Frame>;

/// Result alias for frame operations.
pub type Result<T> = std::result::Result<T, FrameError>;

// =============================================================================
// Release notification
// =============================================================================

/// Told when a shared frame is dropped.
pub trait ReleaseNotifier: Send + Sync {
    /// The slot `buffer_id` holding `frame_number` may be reused.
    fn release(&self, frame_number: u32, buffer_id: usize);
}

/// Sends `frame_release` notifications over an IPC channel.
pub struct ChannelReleaseNotifier {
    channel: Mutex<IpcChannel>,
}

impl ChannelReleaseNotifier {
    /// Notifier publishing on `channel`.
    #[must_use]
    pub fn new(channel: IpcChannel) -> Self {
        Self {
            channel: Mutex::new(channel),
        }
    }

    /// Send any message on the release channel.
    pub fn send(&self, message: &IpcMessage) -> IpcResult<()> {
        self.channel.lock().send(&message.encode())
    }
}

impl ReleaseNotifier for ChannelReleaseNotifier {
    fn release(&self, frame_number: u32, buffer_id: usize) {
        let mut msg = IpcMessage::new(MsgType::Notify, MsgVal::FrameRelease);
        msg.set_param("frame", frame_number);
        msg.set_param("buffer_id", buffer_id);
        if let Err(e) = self.send(&msg) {
            warn!(frame = frame_number, buffer_id, error = %e, "Failed to send frame release");
        }
    }
}

impl fmt::Debug for ChannelReleaseNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelReleaseNotifier").finish_non_exhaustive()
    }
}

/// A receiver slot held by a frame. Dropping it releases the slot.
pub struct SharedBufferFrame {
    manager: Arc<SharedBufferManager>,
    buffer_id: usize,
    frame_number: u32,
    notifier: Arc<dyn ReleaseNotifier>,
}

impl SharedBufferFrame {
    fn data(&self) -> &[u8] {
        // The id was validated at construction and the region outlives `self`.
        self.manager.buffer(self.buffer_id).unwrap_or(&[])
    }
}

impl Drop for SharedBufferFrame {
    fn drop(&mut self) {
        debug!(frame = self.frame_number, buffer_id = self.buffer_id, "Releasing shared buffer");
        self.notifier.release(self.frame_number, self.buffer_id);
    }
}

enum FrameBody {
    Pooled(DataBlock),
    Shared(SharedBufferFrame),
    EndOfAcquisition,
}

// =============================================================================
// Frame
// =============================================================================

/// A frame of detector data.
pub struct Frame {
    body: FrameBody,
    image_offset: usize,
    image_size: usize,
    meta: RwLock<FrameMetaData>,
}

impl Frame {
    /// Copy `data` into a block taken from `pool_id`.
    pub fn from_bytes(
        pools: &PoolRegistry,
        pool_id: &str,
        meta: FrameMetaData,
        data: &[u8],
    ) -> Result<Self> {
        let mut block = pools.take(pool_id, data.len());
        block.copy_from(data)?;
        Ok(Self::with_body(FrameBody::Pooled(block), data.len(), meta))
    }

    /// A zeroed block of `size` bytes from `pool_id`, to be filled through
    /// [`data_mut`](Self::data_mut).
    #[must_use]
    pub fn pooled(pools: &PoolRegistry, pool_id: &str, meta: FrameMetaData, size: usize) -> Self {
        let mut block = pools.take(pool_id, size);
        block.data_mut().fill(0);
        Self::with_body(FrameBody::Pooled(block), size, meta)
    }

    /// Wrap receiver slot `buffer_id` without copying. The image covers the
    /// whole slot.
    pub fn shared(
        manager: Arc<SharedBufferManager>,
        buffer_id: usize,
        frame_number: u32,
        notifier: Arc<dyn ReleaseNotifier>,
        meta: FrameMetaData,
    ) -> Result<Self> {
        manager.buffer(buffer_id)?;
        let size = manager.buffer_size();
        let body = FrameBody::Shared(SharedBufferFrame {
            manager,
            buffer_id,
            frame_number,
            notifier,
        });
        Ok(Self::with_body(body, size, meta))
    }

    /// End of acquisition marker.
    #[must_use]
    pub fn end_of_acquisition() -> Self {
        Self::with_body(FrameBody::EndOfAcquisition, 0, FrameMetaData::default())
    }

    fn with_body(body: FrameBody, image_size: usize, meta: FrameMetaData) -> Self {
        Self {
            body,
            image_offset: 0,
            image_size,
            meta: RwLock::new(meta),
        }
    }

    /// Set the image window within the body.
    #[must_use]
    pub fn with_image(mut self, offset: usize, size: usize) -> Self {
        self.image_offset = offset;
        self.image_size = size;
        self
    }

    /// True for the end of acquisition marker.
    #[must_use]
    pub fn is_end_of_acquisition(&self) -> bool {
        matches!(self.body, FrameBody::EndOfAcquisition)
    }

    /// True when the body is a receiver slot.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        matches!(self.body, FrameBody::Shared(_))
    }

    /// Receiver slot id of a shared frame.
    #[must_use]
    pub fn buffer_id(&self) -> Option<usize> {
        match &self.body {
            FrameBody::Shared(shared) => Some(shared.buffer_id),
            _ => None,
        }
    }

    /// The whole body.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match &self.body {
            FrameBody::Pooled(block) => block.data(),
            FrameBody::Shared(shared) => shared.data(),
            FrameBody::EndOfAcquisition => &[],
        }
    }

    /// Body length in bytes.
    #[must_use]
    pub fn data_size(&self) -> usize {
        self.data().len()
    }

    /// Writable body. Only pooled frames are writable, and reaching `&mut`
    /// through a [`FramePtr`] requires `Arc::get_mut`, so the frame cannot be
    /// shared with another consumer.
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        let frame = self.frame_number();
        match &mut self.body {
            FrameBody::Pooled(block) => Ok(block.data_mut()),
            _ => Err(FrameError::NotWritable { frame }),
        }
    }

    /// The image window of the body.
    pub fn image(&self) -> Result<&[u8]> {
        let data = self.data();
        let end = self.image_offset.checked_add(self.image_size);
        match end {
            Some(end) if end <= data.len() => Ok(&data[self.image_offset..end]),
            _ => Err(FrameError::ImageOutOfRange {
                offset: self.image_offset,
                size: self.image_size,
                len: data.len(),
            }),
        }
    }

    /// Offset of the image within the body.
    #[must_use]
    pub fn image_offset(&self) -> usize {
        self.image_offset
    }

    /// Size of the image in bytes.
    #[must_use]
    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// Read access to the metadata.
    pub fn meta(&self) -> RwLockReadGuard<'_, FrameMetaData> {
        self.meta.read()
    }

    /// Write access to the metadata.
    pub fn meta_mut(&self) -> RwLockWriteGuard<'_, FrameMetaData> {
        self.meta.write()
    }

    /// Frame number.
    #[must_use]
    pub fn frame_number(&self) -> i64 {
        self.meta.read().frame_number()
    }

    /// Dataset name.
    #[must_use]
    pub fn dataset_name(&self) -> String {
        self.meta.read().dataset_name().to_string()
    }

    /// Pixel type.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        self.meta.read().data_type()
    }

    /// Image dimensions.
    #[must_use]
    pub fn dimensions(&self) -> Vec<u64> {
        self.meta.read().dimensions().to_vec()
    }

    /// Compression type.
    #[must_use]
    pub fn compression(&self) -> CompressionType {
        self.meta.read().compression()
    }

    /// Acquisition id.
    #[must_use]
    pub fn acquisition_id(&self) -> String {
        self.meta.read().acquisition_id().to_string()
    }

    /// Frame offset.
    #[must_use]
    pub fn frame_offset(&self) -> i64 {
        self.meta.read().frame_offset()
    }

    /// A pooled copy of this frame with the same image window and metadata.
    /// Pooled bodies copy into their own pool; shared bodies into `pool_id`.
    pub fn deep_copy(&self, pools: &PoolRegistry, pool_id: &str) -> Result<Self> {
        let body = match &self.body {
            FrameBody::Pooled(block) => FrameBody::Pooled(block.clone()),
            FrameBody::Shared(shared) => {
                let data = shared.data();
                let mut block = pools.take(pool_id, data.len());
                block.copy_from(data)?;
                FrameBody::Pooled(block)
            }
            FrameBody::EndOfAcquisition => FrameBody::EndOfAcquisition,
        };
        Ok(Self {
            body,
            image_offset: self.image_offset,
            image_size: self.image_size,
            meta: RwLock::new(self.meta.read().clone()),
        })
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.body {
            FrameBody::Pooled(_) => "pooled",
            FrameBody::Shared(_) => "shared",
            FrameBody::EndOfAcquisition => "end_of_acquisition",
        };
        f.debug_struct("Frame")
            .field("kind", &kind)
            .field("frame_number", &self.frame_number())
            .field("data_size", &self.data_size())
            .field("image_offset", &self.image_offset)
            .field("image_size", &self.image_size)
            .finish()
    }
}
